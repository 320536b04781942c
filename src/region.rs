use nalgebra::Point3;

use crate::errors::PeakqError;
use crate::geom::Face;
use crate::intersect::RegionProbe;
use crate::settings::RegionConfig;

#[cfg(test)]
mod tests {

    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::intersect::classify;
    use crate::peak::{CoordFrame, Peak, PeakSet};

    const UNIT_BOX: [f64; 6] = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0];

    #[test]
    fn extents_are_validated() {
        assert!(BoxRegion::new(&[0.0, 1.0, 0.0], true).is_err());
        assert!(BoxRegion::new(&[0.0, 1.0, 2.0, 1.0, 0.0, 1.0], true).is_err());
        assert!(BoxRegion::new(&UNIT_BOX, true).is_ok());
    }

    #[test]
    fn center_inside_box_has_zero_distance() {
        let region = BoxRegion::new(&UNIT_BOX, true).unwrap();
        let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(0.5, 0.5, 0.5))]);
        let cancel = AtomicBool::new(false);
        let table = classify(&region, &peaks, CoordFrame::QLab, 0.2, &cancel).unwrap();

        assert!(table.rows[0].intersecting);
        assert_eq!(table.rows[0].distance, 0.0);
    }

    #[test]
    fn sphere_reaches_face_from_outside() {
        let region = BoxRegion::new(&UNIT_BOX, true).unwrap();
        let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(1.5, 0.5, 0.5))]);
        let cancel = AtomicBool::new(false);

        let table = classify(&region, &peaks, CoordFrame::QLab, 0.6, &cancel).unwrap();
        assert!(table.rows[0].intersecting);
        // Touch lands on the x = 1 face, half a unit behind the center.
        assert!((table.rows[0].distance + 0.5).abs() < 1e-12);

        let table = classify(&region, &peaks, CoordFrame::QLab, 0.4, &cancel).unwrap();
        assert!(!table.rows[0].intersecting);
    }

    #[test]
    fn sphere_past_a_corner_misses() {
        // Within plane reach of two faces, but every touch point falls
        // outside the box footprint.
        let region = BoxRegion::new(&UNIT_BOX, true).unwrap();
        let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(1.3, 1.3, 0.5))]);
        let cancel = AtomicBool::new(false);
        let table = classify(&region, &peaks, CoordFrame::QLab, 0.35, &cancel).unwrap();
        assert!(!table.rows[0].intersecting);
    }

    #[test]
    fn face_walk_can_be_disabled() {
        let region = BoxRegion::new(&UNIT_BOX, false).unwrap();
        let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(1.5, 0.5, 0.5))]);
        let cancel = AtomicBool::new(false);
        let table = classify(&region, &peaks, CoordFrame::QLab, 0.6, &cancel).unwrap();
        assert!(!table.rows[0].intersecting);
    }
}

/// An axis-aligned box in a momentum or HKL frame, probed face by face.
pub struct BoxRegion {
    /// Extents as [xmin, xmax, ymin, ymax, zmin, zmax].
    extents: [f64; 6],
    check_peak_extents: bool,
}

impl BoxRegion {
    pub fn new(extents: &[f64], check_peak_extents: bool) -> Result<Self, PeakqError> {
        if extents.len() != 6 {
            return Err(PeakqError::invalid(format!(
                "box region needs 6 extents, got {}",
                extents.len()
            )));
        }
        for axis in 0..3 {
            let (min, max) = (extents[2 * axis], extents[2 * axis + 1]);
            if min > max {
                return Err(PeakqError::invalid(format!(
                    "box region axis {} has min {} > max {}",
                    axis, min, max
                )));
            }
        }
        let mut fixed = [0.0; 6];
        fixed.copy_from_slice(extents);
        Ok(Self {
            extents: fixed,
            check_peak_extents,
        })
    }

    pub fn from_config(config: &RegionConfig) -> Result<Self, PeakqError> {
        Self::new(&config.extents, config.check_peak_extents)
    }

    /// Corner of the box, selecting min (0) or max (1) on each axis.
    fn corner(&self, x: usize, y: usize, z: usize) -> Point3<f64> {
        Point3::new(self.extents[x], self.extents[2 + y], self.extents[4 + z])
    }
}

impl RegionProbe for BoxRegion {
    fn number_of_faces(&self) -> usize {
        6
    }

    /// Face order is xmin, xmax, ymin, ymax, zmin, zmax.
    fn faces(&self) -> Vec<Face> {
        vec![
            Face::new(self.corner(0, 0, 0), self.corner(0, 1, 0), self.corner(0, 0, 1)),
            Face::new(self.corner(1, 0, 0), self.corner(1, 1, 0), self.corner(1, 0, 1)),
            Face::new(self.corner(0, 0, 0), self.corner(1, 0, 0), self.corner(0, 0, 1)),
            Face::new(self.corner(0, 1, 0), self.corner(1, 1, 0), self.corner(0, 1, 1)),
            Face::new(self.corner(0, 0, 0), self.corner(1, 0, 0), self.corner(0, 1, 0)),
            Face::new(self.corner(0, 0, 1), self.corner(1, 0, 1), self.corner(0, 1, 1)),
        ]
    }

    fn point_outside_any_extents(&self, point: &Point3<f64>) -> bool {
        (0..3).any(|axis| {
            point[axis] < self.extents[2 * axis] || point[axis] > self.extents[2 * axis + 1]
        })
    }

    fn point_inside_all_extents(&self, touch: &Point3<f64>, _peak_center: &Point3<f64>) -> bool {
        !self.point_outside_any_extents(touch)
    }

    fn check_peak_extents(&self) -> bool {
        self.check_peak_extents
    }
}
