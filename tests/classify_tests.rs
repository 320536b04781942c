use std::sync::atomic::AtomicBool;

use nalgebra::Point3;

use peakq::intersect::classify;
use peakq::peak::{CoordFrame, Peak, PeakSet};
use peakq::region::BoxRegion;
use peakq::settings::SurfaceConfig;
use peakq::surface::QuadSurface;

// Tolerance for comparing face distances.
const TOL: f64 = 1e-12;

/// 27 peaks on a 3x3x3 grid with coordinates in {-1, 0, 1}.
fn grid_peaks() -> PeakSet {
    let mut peaks = Vec::new();
    for i in 0..3 {
        for j in 0..3 {
            for k in 0..3 {
                peaks.push(Peak::from_q_lab(Point3::new(
                    i as f64 - 1.0,
                    j as f64 - 1.0,
                    k as f64 - 1.0,
                )));
            }
        }
    }
    PeakSet::new(peaks)
}

fn square_surface(peak_radius: f64) -> QuadSurface {
    let config = SurfaceConfig {
        frame: "Q (lab frame)".to_string(),
        vertex1: "0,0,0".to_string(),
        vertex2: "0,1,0".to_string(),
        vertex3: "1,0,0".to_string(),
        vertex4: "1,1,0".to_string(),
        peak_radius,
    };
    QuadSurface::from_config(&config).unwrap()
}

#[test]
fn every_peak_gets_one_row_in_input_order() {
    let peaks = grid_peaks();
    let region = BoxRegion::new(&[-0.5, 0.5, -0.5, 0.5, -0.5, 0.5], true).unwrap();
    let cancel = AtomicBool::new(false);

    let table = classify(&region, &peaks, CoordFrame::QLab, 0.6, &cancel).unwrap();
    assert_eq!(table.len(), peaks.len());
    for (i, row) in table.rows.iter().enumerate() {
        assert_eq!(row.peak_index, i);
    }

    // The grid center plus its six face neighbors reach the half-unit box;
    // edge and corner neighbors touch the face planes only outside the
    // box footprint.
    assert_eq!(table.num_intersecting(), 7);
    assert!(table.rows[13].intersecting);
    assert_eq!(table.rows[13].distance, 0.0);
    for row in &table.rows {
        if row.intersecting && row.peak_index != 13 {
            assert!((row.distance.abs() - 0.5).abs() < TOL, "row: {:?}", row);
        }
    }
}

#[test]
fn center_inside_the_box_short_circuits_the_face_walk() {
    let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(0.2, -0.3, 0.4))]);
    let region = BoxRegion::new(&[-1.0, 1.0, -1.0, 1.0, -1.0, 1.0], true).unwrap();
    let cancel = AtomicBool::new(false);

    // The radius does not matter for a center that is already inside.
    for radius in [0.0, 0.5, 10.0] {
        let table = classify(&region, &peaks, CoordFrame::QLab, radius, &cancel).unwrap();
        assert!(table.rows[0].intersecting);
        assert_eq!(table.rows[0].distance, 0.0);
    }
}

#[test]
fn classification_reads_the_configured_frame() {
    let mut peak = Peak::from_q_lab(Point3::new(10.0, 10.0, 10.0));
    peak.hkl = Point3::new(0.0, 0.0, 0.0);
    let peaks = PeakSet::new(vec![peak]);
    let region = BoxRegion::new(&[-1.0, 1.0, -1.0, 1.0, -1.0, 1.0], true).unwrap();
    let cancel = AtomicBool::new(false);

    let table = classify(&region, &peaks, CoordFrame::Hkl, 0.0, &cancel).unwrap();
    assert!(table.rows[0].intersecting);

    let table = classify(&region, &peaks, CoordFrame::QLab, 0.0, &cancel).unwrap();
    assert!(!table.rows[0].intersecting);
}

#[test]
fn surface_touch_tracks_the_radius_tightly() {
    // Peak center one unit above the square's plane.
    let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(0.5, 0.5, 1.0))]);
    let cancel = AtomicBool::new(false);

    let surface = square_surface(1.0 + 1e-4);
    let table = classify(&surface, &peaks, CoordFrame::QLab, 1.0 + 1e-4, &cancel).unwrap();
    assert!(table.rows[0].intersecting);
    assert!((table.rows[0].distance - 1.0).abs() < 1e-9);

    let surface = square_surface(1.0 - 1e-4);
    let table = classify(&surface, &peaks, CoordFrame::QLab, 1.0 - 1e-4, &cancel).unwrap();
    assert!(!table.rows[0].intersecting);
    assert_eq!(table.rows[0].distance, 0.0);
}

#[test]
fn in_plane_peak_needs_to_reach_the_boundary() {
    // The center lies in the surface plane beyond the square; only a radius
    // that spans the gap to the nearest boundary point (1, 0, 0) connects.
    let peaks = PeakSet::new(vec![Peak::from_q_lab(Point3::new(2.0, 0.0, 0.0))]);
    let cancel = AtomicBool::new(false);

    let surface = square_surface(0.9);
    let table = classify(&surface, &peaks, CoordFrame::QLab, 0.9, &cancel).unwrap();
    assert!(!table.rows[0].intersecting);

    let surface = square_surface(1.0);
    let table = classify(&surface, &peaks, CoordFrame::QLab, 1.0, &cancel).unwrap();
    assert!(table.rows[0].intersecting);
}

#[test]
fn classification_reruns_are_bit_identical() {
    // Awkward deterministic coordinates around both probes.
    let mut peaks = Vec::new();
    for i in 0..64 {
        let t = i as f64;
        peaks.push(Peak::from_q_lab(Point3::new(
            (t * 0.37).sin() * 1.4,
            (t * 0.73).cos() * 1.4,
            t * 0.11 - 1.3,
        )));
    }
    let peaks = PeakSet::new(peaks);
    let cancel = AtomicBool::new(false);

    let region = BoxRegion::new(&[-0.8, 0.8, -0.8, 0.8, -0.8, 0.8], true).unwrap();
    let first = classify(&region, &peaks, CoordFrame::QLab, 0.4, &cancel).unwrap();
    let second = classify(&region, &peaks, CoordFrame::QLab, 0.4, &cancel).unwrap();
    assert_eq!(first, second);
    assert!(first.num_intersecting() > 0);

    let surface = square_surface(0.7);
    let first = classify(&surface, &peaks, CoordFrame::QLab, 0.7, &cancel).unwrap();
    let second = classify(&surface, &peaks, CoordFrame::QLab, 0.7, &cancel).unwrap();
    assert_eq!(first, second);
}
