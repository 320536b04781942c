use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use nalgebra::Point3;
use rayon::prelude::*;

use crate::errors::PeakqError;
use crate::geom::{distance_to_plane, Face};
use crate::peak::{CoordFrame, Peak, PeakSet};
use crate::result::IntersectionTable;

#[cfg(test)]
mod tests {

    use super::*;

    /// Two parallel planes at z=1 and z=-1, both reachable from the origin.
    struct TwoPlanes;

    impl RegionProbe for TwoPlanes {
        fn number_of_faces(&self) -> usize {
            2
        }

        fn faces(&self) -> Vec<Face> {
            vec![
                Face::new(
                    Point3::new(0.0, 0.0, 1.0),
                    Point3::new(1.0, 0.0, 1.0),
                    Point3::new(0.0, 1.0, 1.0),
                ),
                Face::new(
                    Point3::new(0.0, 0.0, -1.0),
                    Point3::new(1.0, 0.0, -1.0),
                    Point3::new(0.0, 1.0, -1.0),
                ),
            ]
        }

        fn point_outside_any_extents(&self, _point: &Point3<f64>) -> bool {
            true
        }

        fn point_inside_all_extents(
            &self,
            _touch: &Point3<f64>,
            _peak_center: &Point3<f64>,
        ) -> bool {
            true
        }
    }

    fn one_peak_at(p: Point3<f64>) -> PeakSet {
        PeakSet::new(vec![Peak::from_q_lab(p)])
    }

    #[test]
    fn first_matching_face_wins() {
        // Both planes are within reach; the face listed first must supply
        // the recorded distance even though the second is no farther.
        let peaks = one_peak_at(Point3::new(0.0, 0.0, 0.0));
        let cancel = AtomicBool::new(false);
        let table = classify(&TwoPlanes, &peaks, CoordFrame::QLab, 1.5, &cancel).unwrap();

        assert!(table.rows[0].intersecting);
        // Face 1 normal points +z, so distance = dot(n, p0 - center) = 1.
        assert!((table.rows[0].distance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_radius_disables_face_walk() {
        let peaks = one_peak_at(Point3::new(0.0, 0.0, 0.0));
        let cancel = AtomicBool::new(false);
        let table = classify(&TwoPlanes, &peaks, CoordFrame::QLab, 0.0, &cancel).unwrap();
        assert!(!table.rows[0].intersecting);
        assert_eq!(table.rows[0].distance, 0.0);
    }

    #[test]
    fn cancelled_run_fails_fast() {
        let peaks = one_peak_at(Point3::new(0.0, 0.0, 0.0));
        let cancel = AtomicBool::new(true);
        let err = classify(&TwoPlanes, &peaks, CoordFrame::QLab, 1.0, &cancel).unwrap_err();
        assert!(matches!(err, PeakqError::Cancelled));
    }

    #[test]
    fn rerun_is_bit_identical() {
        let peaks = PeakSet::new(vec![
            Peak::from_q_lab(Point3::new(0.0, 0.0, 0.3)),
            Peak::from_q_lab(Point3::new(0.2, -0.4, -0.9)),
            Peak::from_q_lab(Point3::new(5.0, 5.0, 5.0)),
        ]);
        let cancel = AtomicBool::new(false);
        let first = classify(&TwoPlanes, &peaks, CoordFrame::QLab, 0.7, &cancel).unwrap();
        let second = classify(&TwoPlanes, &peaks, CoordFrame::QLab, 0.7, &cancel).unwrap();
        assert_eq!(first, second);
    }
}

/// A region that can be probed for peak-sphere intersections.
///
/// Implementations validate their geometry at construction; once built they
/// are immutable and shared read-only across the parallel peak loop.
pub trait RegionProbe: Sync {
    fn number_of_faces(&self) -> usize;

    /// The plane-defining faces in the documented face order. The face walk
    /// stops at the first face whose touch point validates.
    fn faces(&self) -> Vec<Face>;

    /// True when the point lies outside the region's defining extents, so the
    /// cheap inside-accept path does not apply.
    fn point_outside_any_extents(&self, point: &Point3<f64>) -> bool;

    /// True when a plane touch point counts as within the region boundary.
    /// The peak center is available for probes whose test involves the peak
    /// sphere rather than the touch point alone.
    fn point_inside_all_extents(&self, touch: &Point3<f64>, peak_center: &Point3<f64>) -> bool;

    /// Whether centers outside the extents get the radius-aware face walk.
    fn check_peak_extents(&self) -> bool {
        true
    }
}

/// Classifies every peak against the probe region.
///
/// Each row is computed independently from shared immutable inputs, so peaks
/// run in parallel with each result written to its pre-sized row. The
/// cancellation flag is checked once per peak; a cancelled run aborts with
/// `PeakqError::Cancelled` and no table is produced.
///
/// The recorded distance is the signed plane distance at the first face whose
/// touch point validates, in face order. It is not necessarily the minimum
/// over all faces; this mirrors the long-standing observable behavior of the
/// table consumers.
pub fn classify(
    probe: &dyn RegionProbe,
    peaks: &PeakSet,
    frame: CoordFrame,
    peak_radius: f64,
    cancel: &AtomicBool,
) -> Result<IntersectionTable, PeakqError> {
    let faces = probe.faces();
    let mut table = IntersectionTable::new_empty(peaks.len());

    let m = MultiProgress::new();
    let pb = m.add(ProgressBar::new(peaks.len() as u64));
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
        )
        .unwrap()
        .progress_chars("█▇▆▅▄▃▂▁"),
    );
    pb.set_message("peak".to_string());

    table.rows.par_iter_mut().enumerate().for_each(|(i, row)| {
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        let center = peaks[i].position(frame);

        if !probe.point_outside_any_extents(&center) {
            row.intersecting = true;
            row.distance = 0.0;
        } else if probe.check_peak_extents() && peak_radius > 0.0 {
            for face in &faces {
                let normal = face.normal();
                let distance = distance_to_plane(&center, &normal, &face.p0);
                if distance.abs() <= peak_radius {
                    let touch = center + normal * distance;
                    if probe.point_inside_all_extents(&touch, &center) {
                        row.intersecting = true;
                        row.distance = distance;
                        break;
                    }
                }
            }
        }

        pb.inc(1);
    });

    pb.finish_and_clear();

    if cancel.load(Ordering::Relaxed) {
        return Err(PeakqError::Cancelled);
    }

    Ok(table)
}
