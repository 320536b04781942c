use nalgebra::{Point3, Vector3};

use crate::errors::PeakqError;
use crate::geom::{line_intersects_sphere, Aabb, Face};
use crate::intersect::RegionProbe;
use crate::settings::{parse_vertex, SurfaceConfig};
use crate::settings::{COPLANAR_TOLERANCE, SIDE_LENGTH_TOLERANCE};


/// A finite planar quadrilateral, probed as a single face plus its boundary.
///
/// Vertices follow the zigzag convention: vertex2 and vertex3 are both
/// adjacent to vertex1, and vertex4 is opposite it. Construction checks that
/// the four points are coplanar and that the opposite sides |v1 - v2| and
/// |v4 - v2| match, which catches the common mis-ordering where the four
/// corners are given as a walk around the perimeter.
#[derive(Debug)]
pub struct QuadSurface {
    vertices: [Point3<f64>; 4],
    /// Boundary segments, cyclically: v1->v2, v2->v3, v3->v4, v4->v1.
    lines: [Vector3<f64>; 4],
    extents: Aabb,
    peak_radius: f64,
}

impl QuadSurface {
    pub fn new(
        vertex1: Point3<f64>,
        vertex2: Point3<f64>,
        vertex3: Point3<f64>,
        vertex4: Point3<f64>,
        peak_radius: f64,
    ) -> Result<Self, PeakqError> {
        let triple = (vertex2 - vertex1)
            .cross(&(vertex3 - vertex1))
            .dot(&(vertex4 - vertex1));
        if triple.abs() > COPLANAR_TOLERANCE {
            return Err(PeakqError::invalid(format!(
                "surface vertices are not coplanar (scalar triple product {:+e})",
                triple
            )));
        }

        let side_a = (vertex1 - vertex2).norm_squared();
        let side_b = (vertex4 - vertex2).norm_squared();
        if (side_a - side_b).abs() > SIDE_LENGTH_TOLERANCE {
            return Err(PeakqError::invalid(
                "opposite surface sides differ; vertex4 must be opposite vertex1",
            ));
        }

        let vertices = [vertex1, vertex2, vertex3, vertex4];
        let lines = [
            vertex2 - vertex1,
            vertex3 - vertex2,
            vertex4 - vertex3,
            vertex1 - vertex4,
        ];
        let extents = Aabb::from_points(&vertices);

        Ok(Self {
            vertices,
            lines,
            extents,
            peak_radius,
        })
    }

    pub fn from_config(config: &SurfaceConfig) -> Result<Self, PeakqError> {
        Self::new(
            parse_vertex(&config.vertex1)?,
            parse_vertex(&config.vertex2)?,
            parse_vertex(&config.vertex3)?,
            parse_vertex(&config.vertex4)?,
            config.peak_radius,
        )
    }
}

impl RegionProbe for QuadSurface {
    fn number_of_faces(&self) -> usize {
        1
    }

    fn faces(&self) -> Vec<Face> {
        vec![Face::new(self.vertices[0], self.vertices[1], self.vertices[2])]
    }

    /// A surface has no interior, so every center takes the face walk.
    fn point_outside_any_extents(&self, _point: &Point3<f64>) -> bool {
        true
    }

    /// The touch point counts when the peak sphere crosses one of the
    /// boundary segments, or when the touch point itself falls inside the
    /// loose bounding box of the vertices.
    fn point_inside_all_extents(&self, touch: &Point3<f64>, peak_center: &Point3<f64>) -> bool {
        self.lines
            .iter()
            .zip(self.vertices.iter())
            .any(|(line, start)| line_intersects_sphere(line, start, peak_center, self.peak_radius))
            || self.extents.contains(touch)
    }
}
