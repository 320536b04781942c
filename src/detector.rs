use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use libm::erfc;
use nalgebra::{Point3, Vector3};

use crate::errors::PeakqError;
use crate::settings::{DEGENERATE_LENGTH_SQ, EDGE_SIGMA_RADIUS_FRACTION};

#[cfg(test)]
mod tests {

    use super::*;

    const TOL: f64 = 1e-12;

    #[test]
    fn trajectory_formula_matches_hand_computed() {
        let edges = DetectorEdges::from_angles(&[(PI / 2.0, 0.0)]);
        assert_eq!(edges.len(), 1);

        // E1 = normalize(-1, 0, 1); q = (0, 0, 1) is 1/sqrt(2) off the line.
        let d = edges.distance_to_edge(&Point3::new(0.0, 0.0, 1.0));
        assert!((d - 1.0 / 2.0_f64.sqrt()).abs() < TOL);
    }

    #[test]
    fn distance_is_the_minimum_over_trajectories() {
        let edges = DetectorEdges::from_directions(vec![Vector3::x(), Vector3::z()]);
        let d = edges.distance_to_edge(&Point3::new(0.3, 0.0, 5.0));
        assert!((d - 0.3).abs() < TOL);
    }

    #[test]
    fn no_edges_puts_every_peak_infinitely_far() {
        let edges = DetectorEdges::none();
        assert!(edges.is_empty());
        assert_eq!(
            edges.distance_to_edge(&Point3::new(1.0, 2.0, 3.0)),
            f64::INFINITY
        );
    }

    #[test]
    fn degenerate_directions_are_dropped() {
        let edges =
            DetectorEdges::from_directions(vec![Vector3::zeros(), Vector3::new(0.0, 0.0, 2.0)]);
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn half_sphere_cap_volume() {
        let v = cap_volume(1.0, 1.0);
        assert!((v - 2.0 * PI / 3.0).abs() < TOL);
    }

    #[test]
    fn background_multiplier_compensates_the_missing_cap() {
        // r = 1, d = 0.5: cap height 0.5, multiplier 4 / 3.375.
        let m = edge_background_multiplier(1.0, 0.5);
        assert!((m - 4.0 / 3.375).abs() < TOL);

        assert_eq!(edge_background_multiplier(1.0, 1.0), 1.0);
        assert_eq!(edge_background_multiplier(1.0, 2.0), 1.0);
    }

    #[test]
    fn peak_multiplier_doubles_on_the_edge() {
        assert!((edge_peak_multiplier(1.0, 0.0) - 2.0).abs() < TOL);
        assert_eq!(edge_peak_multiplier(1.0, 1.5), 1.0);
        assert!(edge_peak_multiplier(1.0, 0.2) > edge_peak_multiplier(1.0, 0.8));
    }
}

/// Unit Q-trajectories of the detector-edge pixels, fixed for a whole run.
/// A peak close to one of these lines sits against detector dead-space.
#[derive(Debug, Clone, Default)]
pub struct DetectorEdges {
    trajectories: Vec<Vector3<f64>>,
}

impl DetectorEdges {
    pub fn none() -> Self {
        Self::default()
    }

    /// Normalizes the given directions, dropping degenerate ones.
    pub fn from_directions(directions: Vec<Vector3<f64>>) -> Self {
        let trajectories = directions
            .into_iter()
            .filter(|d| d.norm_squared() > DEGENERATE_LENGTH_SQ)
            .map(|d| d.normalize())
            .collect();
        Self { trajectories }
    }

    /// Builds trajectories from `(two_theta, phi)` pixel angles:
    /// `E1 = normalize(-sin(tt) cos(phi), -sin(tt) sin(phi), 1 - cos(tt))`.
    pub fn from_angles(angles: &[(f64, f64)]) -> Self {
        let directions = angles
            .iter()
            .map(|&(two_theta, phi)| {
                Vector3::new(
                    -two_theta.sin() * phi.cos(),
                    -two_theta.sin() * phi.sin(),
                    1.0 - two_theta.cos(),
                )
            })
            .collect();
        Self::from_directions(directions)
    }

    /// Reads whitespace-separated `qx qy qz` direction lines. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PeakqError> {
        let reader = BufReader::new(File::open(path)?);
        let mut directions = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<f64> = trimmed
                .split_whitespace()
                .map(|f| {
                    f.parse::<f64>().map_err(|_| {
                        PeakqError::invalid(format!(
                            "edges file line {}: '{}' is not a number",
                            number + 1,
                            f
                        ))
                    })
                })
                .collect::<Result<_, _>>()?;
            if fields.len() != 3 {
                return Err(PeakqError::invalid(format!(
                    "edges file line {}: expected 3 fields, got {}",
                    number + 1,
                    fields.len()
                )));
            }
            directions.push(Vector3::new(fields[0], fields[1], fields[2]));
        }
        Ok(Self::from_directions(directions))
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    /// Minimum perpendicular distance from `q` to any trajectory line
    /// through the origin; infinite when no edges are known.
    pub fn distance_to_edge(&self, q: &Point3<f64>) -> f64 {
        self.trajectories
            .iter()
            .map(|e1| (q.coords - e1 * q.coords.dot(e1)).norm())
            .fold(f64::INFINITY, f64::min)
    }
}

/// Volume of a spherical cap of height `h` cut from a sphere of radius `r`.
pub fn cap_volume(radius: f64, height: f64) -> f64 {
    PI * height * height * (3.0 * radius - height) / 3.0
}

/// Compensates a background sphere truncated by the detector edge at
/// perpendicular distance `distance`: total volume over remaining volume.
/// 1.0 when the sphere clears the edge.
pub fn edge_background_multiplier(radius: f64, distance: f64) -> f64 {
    if distance >= radius {
        return 1.0;
    }
    let height = radius - distance;
    let volume = 4.0 * PI * radius.powi(3) / 3.0;
    volume / (volume - cap_volume(radius, height))
}

/// Compensates a Gaussian peak truncated by the detector edge. The peak is
/// modeled with `sigma = radius * EDGE_SIGMA_RADIUS_FRACTION`; the truncated
/// fraction along the edge normal is `erfc(d / (sigma sqrt(2))) / 2`.
/// 1.0 when the peak clears the edge.
pub fn edge_peak_multiplier(radius: f64, distance: f64) -> f64 {
    if distance >= radius {
        return 1.0;
    }
    let sigma = radius * EDGE_SIGMA_RADIUS_FRACTION;
    let truncated = 0.5 * erfc(distance / (sigma * 2.0_f64.sqrt()));
    1.0 / (1.0 - truncated)
}
