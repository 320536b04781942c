use nalgebra::{Point3, Vector3};

use crate::settings::DEGENERATE_LENGTH_SQ;


/// A plane-defining face given by three ordered points.
#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    pub p0: Point3<f64>,
    pub p1: Point3<f64>,
    pub p2: Point3<f64>,
}

impl Face {
    pub fn new(p0: Point3<f64>, p1: Point3<f64>, p2: Point3<f64>) -> Self {
        Self { p0, p1, p2 }
    }

    /// Unit normal of the face plane from `cross(p1-p0, p2-p0)`.
    ///
    /// Degenerate defining points (collinear or repeated) yield a zero cross
    /// product; a unit direction perpendicular to the first edge is
    /// substituted so the caller always receives a usable normal.
    pub fn normal(&self) -> Vector3<f64> {
        let u = self.p1 - self.p0;
        let v = self.p2 - self.p0;
        let cross = u.cross(&v);

        if cross.norm_squared() > DEGENERATE_LENGTH_SQ {
            cross.normalize()
        } else if u.norm_squared() > DEGENERATE_LENGTH_SQ {
            perpendicular_to(&u)
        } else {
            Vector3::new(0.0, 0.0, 1.0)
        }
    }
}

/// Some unit vector perpendicular to `v`.
///
/// Crosses `v` with the coordinate axis it is least aligned with, which is
/// never parallel to a nonzero `v`.
pub fn perpendicular_to(v: &Vector3<f64>) -> Vector3<f64> {
    let abs = Vector3::new(v.x.abs(), v.y.abs(), v.z.abs());
    let axis = if abs.x <= abs.y && abs.x <= abs.z {
        Vector3::new(1.0, 0.0, 0.0)
    } else if abs.y <= abs.z {
        Vector3::new(0.0, 1.0, 0.0)
    } else {
        Vector3::new(0.0, 0.0, 1.0)
    };
    v.cross(&axis).normalize()
}

/// Signed distance from `point` to the plane through `plane_point` with unit
/// normal `normal`. The sign tells which side of the plane the point is on.
pub fn distance_to_plane(
    point: &Point3<f64>,
    normal: &Vector3<f64>,
    plane_point: &Point3<f64>,
) -> f64 {
    normal.dot(&(plane_point - point))
}

/// Whether a sphere intersects a finite segment from `start` to `start + line`.
///
/// The sphere center is projected onto the segment's supporting line and the
/// projection is clamped to the segment before the distance test, so a hit on
/// the infinite line beyond either endpoint does not count.
pub fn line_intersects_sphere(
    line: &Vector3<f64>,
    start: &Point3<f64>,
    center: &Point3<f64>,
    radius: f64,
) -> bool {
    let length_sq = line.norm_squared();
    let closest = if length_sq > DEGENERATE_LENGTH_SQ {
        let t = (center - start).dot(line) / length_sq;
        start + line * t.clamp(0.0, 1.0)
    } else {
        *start
    };
    (center - closest).norm_squared() <= radius * radius
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Smallest box containing all given points. An empty iterator yields a
    /// degenerate box at the origin.
    pub fn from_points<'a, I>(points: I) -> Self
    where
        I: IntoIterator<Item = &'a Point3<f64>>,
    {
        let mut iter = points.into_iter();
        let first = match iter.next() {
            Some(p) => *p,
            None => Point3::origin(),
        };
        let mut min = first;
        let mut max = first;
        for p in iter {
            min = Point3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Point3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }
        Self { min, max }
    }

    pub fn contains(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn center(&self) -> Point3<f64> {
        Point3::new(
            0.5 * (self.min.x + self.max.x),
            0.5 * (self.min.y + self.max.y),
            0.5 * (self.min.z + self.max.z),
        )
    }

    pub fn volume(&self) -> f64 {
        (self.max.x - self.min.x) * (self.max.y - self.min.y) * (self.max.z - self.min.z)
    }

    /// Squared distance from `p` to the nearest point of the box; 0 inside.
    pub fn min_distance_sq(&self, p: &Point3<f64>) -> f64 {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        let dz = (self.min.z - p.z).max(0.0).max(p.z - self.max.z);
        dx * dx + dy * dy + dz * dz
    }

    /// Squared distance from `p` to the farthest corner of the box.
    pub fn max_distance_sq(&self, p: &Point3<f64>) -> f64 {
        let dx = (p.x - self.min.x).abs().max((p.x - self.max.x).abs());
        let dy = (p.y - self.min.y).abs().max((p.y - self.max.y).abs());
        let dz = (p.z - self.min.z).abs().max((p.z - self.max.z).abs());
        dx * dx + dy * dy + dz * dz
    }
}
