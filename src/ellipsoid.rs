//! Streaming covariance estimation for ellipsoidal peak shapes.
//!
//! **Context**: the ellipsoid integration mode does not get a second pass
//! over the data. Events inside the peak-radius sphere are visited exactly
//! once, and everything the shape needs — the signal-weighted mean and
//! covariance, and the positional moments used to strip a flat background —
//! is accumulated on the fly. Diagonalizing the corrected covariance then
//! gives the ellipsoid's principal directions and relative axis lengths.

use nalgebra::{Matrix2, Matrix3, Point3, SymmetricEigen, Vector2, Vector3};

use crate::geom::perpendicular_to;
use crate::settings::EIGENVALUE_FLOOR;

#[cfg(test)]
mod tests {

    use super::*;

    const TOL: f64 = 1e-9;

    #[test]
    fn accumulator_recovers_known_moments() {
        let mut acc = ShapeAccumulator::new();
        acc.push(&Point3::new(1.0, 0.0, 0.0), 1.0);
        acc.push(&Point3::new(-1.0, 0.0, 0.0), 1.0);
        acc.push(&Point3::new(0.0, 2.0, 0.0), 1.0);
        acc.push(&Point3::new(0.0, -2.0, 0.0), 1.0);

        let mean = acc.mean();
        assert!(mean.norm() < TOL);
        let cov = acc.covariance().unwrap();
        assert!((cov[(0, 0)] - 0.5).abs() < TOL);
        assert!((cov[(1, 1)] - 2.0).abs() < TOL);
        assert!(cov[(2, 2)].abs() < TOL);
        assert!(cov[(0, 1)].abs() < TOL);
    }

    #[test]
    fn weights_shift_the_moments() {
        let mut acc = ShapeAccumulator::new();
        acc.push(&Point3::new(0.0, 0.0, 0.0), 1.0);
        acc.push(&Point3::new(1.0, 0.0, 0.0), 3.0);

        assert!((acc.mean().x - 0.75).abs() < TOL);
        let cov = acc.covariance().unwrap();
        assert!((cov[(0, 0)] - 0.1875).abs() < TOL);
    }

    #[test]
    fn background_share_is_subtracted_in_moment_space() {
        // Two events; a flat background of 2 per event. What remains after
        // subtraction is all at the origin, so the mean and covariance
        // collapse there.
        let mut signal = ShapeAccumulator::new();
        let mut position = ShapeAccumulator::new();
        for (p, s) in [
            (Point3::new(0.0, 0.0, 0.0), 4.0),
            (Point3::new(1.0, 0.0, 0.0), 2.0),
        ] {
            signal.push(&p, s);
            position.push(&p, 1.0);
        }

        let (mean, cov) = background_corrected(&signal, &position, 4.0).unwrap();
        assert!(mean.norm() < TOL);
        assert!(cov[(0, 0)].abs() < TOL);

        // Background exceeding the signal cannot be corrected for.
        assert!(background_corrected(&signal, &position, 7.0).is_none());
    }

    #[test]
    fn eigenvalues_are_floored_and_sorted() {
        // Perfectly planar scatter: the third eigenvalue would be zero.
        let cov = Matrix3::from_diagonal(&Vector3::new(2.0, 1.0, 0.0));
        let (axes, values) = estimate_axes(&cov);

        assert_eq!(values[2], EIGENVALUE_FLOOR);
        assert!(values[0] >= values[1] && values[1] >= values[2]);
        assert!((values[0] - 2.0).abs() < TOL);
        assert!((axes[0].dot(&Vector3::x()).abs() - 1.0).abs() < TOL);
    }

    #[test]
    fn rotated_covariance_is_recovered() {
        let angle: f64 = 0.5;
        let (sin, cos) = angle.sin_cos();
        let r = Matrix3::new(cos, -sin, 0.0, sin, cos, 0.0, 0.0, 0.0, 1.0);
        let d = Matrix3::from_diagonal(&Vector3::new(4.0, 1.0, 0.25));
        let cov = r * d * r.transpose();

        let (axes, values) = estimate_axes(&cov);
        assert!((values[0] - 4.0).abs() < 1e-9);
        assert!((values[1] - 1.0).abs() < 1e-9);
        assert!((values[2] - 0.25).abs() < 1e-9);

        let expected = Vector3::new(cos, sin, 0.0);
        assert!((axes[0].dot(&expected).abs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_q_mode_keeps_the_q_direction() {
        let cov = Matrix3::from_diagonal(&Vector3::new(1.0, 2.0, 3.0));
        let (axes, values) = estimate_axes_fixed_q(&cov, &Vector3::new(2.0, 0.0, 0.0));

        assert!((axes[0] - Vector3::x()).norm() < TOL);
        assert!((values[0] - 1.0).abs() < TOL);
        // In the plane orthogonal to Q the variances are 2 and 3, descending.
        assert!((values[1] - 3.0).abs() < TOL);
        assert!((values[2] - 2.0).abs() < TOL);
        assert!((axes[1].dot(&Vector3::z()).abs() - 1.0).abs() < TOL);
        assert!((axes[2].dot(&Vector3::y()).abs() - 1.0).abs() < TOL);
    }

    #[test]
    fn scaled_radii_preserve_the_sphere_volume() {
        let values = [4.0, 1.0, 0.25];
        let radius = 1.3;
        let radii = scale_radii(&values, radius);

        let volume_product: f64 = radii.iter().product();
        assert!((volume_product - radius.powi(3)).abs() < TOL);
        assert!((radii[0] / radii[1] - 2.0).abs() < TOL);
    }
}

/// One-pass weighted mean and scatter accumulator (Welford update).
#[derive(Debug, Clone)]
pub struct ShapeAccumulator {
    weight: f64,
    mean: Vector3<f64>,
    /// Weighted scatter about the running mean.
    m2: Matrix3<f64>,
}

impl Default for ShapeAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeAccumulator {
    pub fn new() -> Self {
        Self {
            weight: 0.0,
            mean: Vector3::zeros(),
            m2: Matrix3::zeros(),
        }
    }

    pub fn push(&mut self, position: &Point3<f64>, weight: f64) {
        if weight == 0.0 {
            return;
        }
        self.weight += weight;
        let delta = position.coords - self.mean;
        self.mean += delta * (weight / self.weight);
        let delta2 = position.coords - self.mean;
        self.m2 += (delta * delta2.transpose()) * weight;
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn mean(&self) -> Vector3<f64> {
        self.mean
    }

    /// Population covariance; `None` until positive weight has been seen.
    pub fn covariance(&self) -> Option<Matrix3<f64>> {
        if self.weight <= 0.0 {
            return None;
        }
        let cov = self.m2 / self.weight;
        Some(symmetrized(&cov))
    }
}

/// Removes a flat background of total weight `bg_total`, spread evenly over
/// the visited events, from the signal-weighted moments. `signal` is the
/// signal-weighted accumulator, `position` the unweighted one filled from
/// the same events. Returns the corrected (mean, covariance), or `None` when
/// the corrected weight is not positive and no shape can be estimated.
pub fn background_corrected(
    signal: &ShapeAccumulator,
    position: &ShapeAccumulator,
    bg_total: f64,
) -> Option<(Vector3<f64>, Matrix3<f64>)> {
    let n = position.weight;
    if n <= 0.0 {
        return None;
    }
    let corrected_weight = signal.weight - bg_total;
    if corrected_weight <= 0.0 {
        return None;
    }

    // Raw moments of both accumulators, then the subtraction.
    let s = signal.mean * signal.weight - position.mean * bg_total;
    let q_signal = signal.m2 + (signal.mean * signal.mean.transpose()) * signal.weight;
    let q_background =
        (position.m2 / n + position.mean * position.mean.transpose()) * bg_total;
    let q = q_signal - q_background;

    let mean = s / corrected_weight;
    let cov = q / corrected_weight - mean * mean.transpose();
    Some((mean, symmetrized(&cov)))
}

fn symmetrized(m: &Matrix3<f64>) -> Matrix3<f64> {
    (m + m.transpose()) * 0.5
}

/// Principal directions and variances of a covariance matrix, sorted by
/// descending eigenvalue. Eigenvalues are floored at `EIGENVALUE_FLOOR` so a
/// degenerate (planar or linear) scatter still yields three usable axes.
pub fn estimate_axes(covariance: &Matrix3<f64>) -> ([Vector3<f64>; 3], [f64; 3]) {
    let eigen = SymmetricEigen::new(*covariance);
    let mut pairs: Vec<(f64, Vector3<f64>)> = (0..3)
        .map(|i| {
            (
                eigen.eigenvalues[i].max(EIGENVALUE_FLOOR),
                eigen.eigenvectors.column(i).into_owned(),
            )
        })
        .collect();
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("NaN encountered"));

    (
        [pairs[0].1, pairs[1].1, pairs[2].1],
        [pairs[0].0, pairs[1].0, pairs[2].0],
    )
}

/// Like `estimate_axes`, but the first axis is pinned to the (normalized) Q
/// direction: its variance is the projection `q^T C q`, and only the 2x2
/// block in the plane orthogonal to Q is diagonalized.
pub fn estimate_axes_fixed_q(
    covariance: &Matrix3<f64>,
    q_dir: &Vector3<f64>,
) -> ([Vector3<f64>; 3], [f64; 3]) {
    let q = q_dir.normalize();
    let u = perpendicular_to(&q);
    let v = q.cross(&u);

    let q_variance = (q.transpose() * covariance * q)[(0, 0)].max(EIGENVALUE_FLOOR);

    let cu = covariance * u;
    let cv = covariance * v;
    let b_uu = u.dot(&cu);
    let b_vv = v.dot(&cv);
    let b_uv = 0.5 * (u.dot(&cv) + v.dot(&cu));
    let block = Matrix2::new(b_uu, b_uv, b_uv, b_vv);

    let eigen = SymmetricEigen::new(block);
    let mut pairs: Vec<(f64, Vector2<f64>)> = (0..2)
        .map(|i| {
            (
                eigen.eigenvalues[i].max(EIGENVALUE_FLOOR),
                eigen.eigenvectors.column(i).into_owned(),
            )
        })
        .collect();
    pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("NaN encountered"));

    let lift = |w: &Vector2<f64>| u * w.x + v * w.y;
    (
        [q, lift(&pairs[0].1), lift(&pairs[1].1)],
        [q_variance, pairs[0].0, pairs[1].0],
    )
}

/// Turns eigenvalues into semi-axis lengths that keep the volume of a sphere
/// of the given radius: `r_i = radius * s_i / g` with `s_i = sqrt(lambda_i)`
/// and `g` their geometric mean, so the product of the radii is `radius^3`.
pub fn scale_radii(eigenvalues: &[f64; 3], radius: f64) -> [f64; 3] {
    let s = [
        eigenvalues[0].sqrt(),
        eigenvalues[1].sqrt(),
        eigenvalues[2].sqrt(),
    ];
    let g = (s[0] * s[1] * s[2]).cbrt();
    [
        radius * s[0] / g,
        radius * s[1] / g,
        radius * s[2] / g,
    ]
}
