//! Cylinder-mode integration: 1D signal profiles along the peak's
//! instrument trajectory, summed directly or reduced by a moment-based
//! Gaussian estimate.

use std::f64::consts::PI;
use std::str::FromStr;

use nalgebra::Vector3;
use ndarray::Array1;
use ndarray_stats::QuantileExt;

use crate::errors::PeakqError;
use crate::peak::Peak;
use crate::settings::DEGENERATE_LENGTH_SQ;

#[cfg(test)]
mod tests {

    use super::*;
    use nalgebra::Point3;
    use crate::shape::PeakShape;

    const TOL: f64 = 1e-12;

    #[test]
    fn option_names_parse() {
        assert_eq!(
            "NoFit".parse::<ProfileFunction>().unwrap(),
            ProfileFunction::NoFit
        );
        assert_eq!(
            "Gaussian".parse::<ProfileFunction>().unwrap(),
            ProfileFunction::Gaussian
        );
        assert!("Lorentzian".parse::<ProfileFunction>().is_err());

        assert_eq!(
            "Sum".parse::<IntegrationOption>().unwrap(),
            IntegrationOption::Sum
        );
        assert_eq!(
            "GaussFit".parse::<IntegrationOption>().unwrap(),
            IntegrationOption::GaussFit
        );
        assert!("Lorentz".parse::<IntegrationOption>().is_err());
    }

    fn stepped_profile() -> (Array1<f64>, Array1<f64>) {
        let profile = Array1::from(vec![2.0, 2.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 2.0, 2.0]);
        let err_sq = Array1::from_elem(10, 1.0);
        (profile, err_sq)
    }

    #[test]
    fn background_level_comes_from_both_ends() {
        let (profile, _) = stepped_profile();
        let (level, bins) = background_level(&profile, 40.0);
        assert_eq!(bins, 4);
        assert!((level - 2.0).abs() < TOL);

        let (level, bins) = background_level(&profile, 0.0);
        assert_eq!(bins, 0);
        assert_eq!(level, 0.0);
    }

    #[test]
    fn summed_profile_subtracts_the_flat_level() {
        let (profile, err_sq) = stepped_profile();
        let (intensity, sigma) = sum_profile(&profile, &err_sq, 40.0);

        // 6 central bins of 10 minus the level of 2.
        assert!((intensity - 48.0).abs() < TOL);
        // 6 central variances plus (6/4)^2 times 4 background variances.
        assert!((sigma - 15.0_f64.sqrt()).abs() < TOL);
    }

    #[test]
    fn gaussian_moments_recover_a_symmetric_profile() {
        let profile = Array1::from(vec![0.0, 0.0, 0.0, 1.0, 2.0, 4.0, 2.0, 1.0, 0.0, 0.0]);
        let err_sq = Array1::from_elem(10, 1.0);
        let (intensity, sigma) = gauss_fit_profile(&profile, &err_sq, 0.0);

        // mean 5, variance 1.2, amplitude 4.
        let expected = 4.0 * 1.2_f64.sqrt() * (2.0 * PI).sqrt();
        assert!((intensity - expected).abs() < TOL);
        // +-3 sigma covers bins 2..=8.
        assert!((sigma - 7.0_f64.sqrt()).abs() < TOL);
    }

    #[test]
    fn empty_profile_yields_zero_fit() {
        let profile = Array1::zeros(10);
        let err_sq = Array1::zeros(10);
        assert_eq!(gauss_fit_profile(&profile, &err_sq, 0.0), (0.0, 0.0));
    }

    #[test]
    fn no_fit_forces_the_plain_sum() {
        let (profile, err_sq) = stepped_profile();
        let summed = sum_profile(&profile, &err_sq, 20.0);
        let dispatched = integrate_profile(
            &profile,
            &err_sq,
            20.0,
            ProfileFunction::NoFit,
            IntegrationOption::GaussFit,
        );
        assert_eq!(summed, dispatched);
    }

    #[test]
    fn axis_falls_back_to_the_q_direction() {
        let peak = Peak {
            detector_pos: Point3::origin(),
            q_lab: Point3::new(0.0, 0.0, 2.0),
            q_sample: Point3::origin(),
            hkl: Point3::origin(),
            intensity: 0.0,
            sigma_intensity: 0.0,
            shape: PeakShape::None,
        };
        let (axis, fell_back) = profile_axis(&peak);
        assert!(fell_back);
        assert!((axis - Vector3::z()).norm() < TOL);

        let peak = Peak::from_q_lab(Point3::new(3.0, 0.0, 0.0));
        let (axis, fell_back) = profile_axis(&peak);
        assert!(!fell_back);
        assert!((axis - Vector3::x()).norm() < TOL);
    }
}

/// Shape assumed for the 1D profile. `NoFit` skips fitting entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFunction {
    NoFit,
    Gaussian,
}

impl FromStr for ProfileFunction {
    type Err = PeakqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoFit" => Ok(Self::NoFit),
            "Gaussian" => Ok(Self::Gaussian),
            other => Err(PeakqError::invalid(format!(
                "unknown profile function '{}'; expected 'NoFit' or 'Gaussian'",
                other
            ))),
        }
    }
}

/// How the profile is reduced to an intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationOption {
    Sum,
    GaussFit,
}

impl FromStr for IntegrationOption {
    type Err = PeakqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sum" => Ok(Self::Sum),
            "GaussFit" => Ok(Self::GaussFit),
            other => Err(PeakqError::invalid(format!(
                "unknown integration option '{}'; expected 'Sum' or 'GaussFit'",
                other
            ))),
        }
    }
}

/// The cylinder axis for a peak: the unit vector toward its detector-space
/// position. Falls back to the Q-lab direction (flagged, so the caller can
/// warn) when the detector position is degenerate, and to +z when both are.
pub fn profile_axis(peak: &Peak) -> (Vector3<f64>, bool) {
    let detector = peak.detector_pos.coords;
    if detector.norm_squared() > DEGENERATE_LENGTH_SQ {
        return (detector.normalize(), false);
    }
    let q = peak.q_lab.coords;
    if q.norm_squared() > DEGENERATE_LENGTH_SQ {
        return (q.normalize(), true);
    }
    (Vector3::z(), true)
}

/// Flat background level per bin, estimated from `percent`% of the bins
/// split between the two cylinder ends (the extra bin goes to the far end
/// when the count is odd). Returns the level and the number of bins used.
pub fn background_level(profile: &Array1<f64>, percent: f64) -> (f64, usize) {
    let n = profile.len();
    let k = ((n as f64) * percent / 100.0).round() as usize;
    let k = k.min(n);
    if k == 0 {
        return (0.0, 0);
    }
    let front = k / 2;
    let back = k - front;
    let mut total = 0.0;
    for i in 0..front {
        total += profile[i];
    }
    for i in n - back..n {
        total += profile[i];
    }
    (total / k as f64, k)
}

/// Sums the central bins with the flat background level subtracted from
/// each. The background variance enters scaled by the squared ratio of
/// central to background bins. Returns (intensity, sigma).
pub fn sum_profile(profile: &Array1<f64>, err_sq: &Array1<f64>, percent: f64) -> (f64, f64) {
    let n = profile.len();
    let (level, k) = background_level(profile, percent);
    let front = k / 2;
    let back = k - front;

    let mut intensity = 0.0;
    let mut variance = 0.0;
    for i in front..n - back {
        intensity += profile[i] - level;
        variance += err_sq[i];
    }
    if k > 0 {
        let ratio = (n - k) as f64 / k as f64;
        let mut bg_variance = 0.0;
        for i in 0..front {
            bg_variance += err_sq[i];
        }
        for i in n - back..n {
            bg_variance += err_sq[i];
        }
        variance += ratio * ratio * bg_variance;
    }
    (intensity, variance.sqrt())
}

/// Moment-based Gaussian estimate of the profile: amplitude at the argmax
/// bin, mean and sigma from the background-subtracted weighted moments
/// (negative bins clamped to zero), analytic integral
/// `amplitude * sigma * sqrt(2 pi)` in bin units. The returned sigma comes
/// from counting statistics over the +-3 sigma window.
pub fn gauss_fit_profile(profile: &Array1<f64>, err_sq: &Array1<f64>, percent: f64) -> (f64, f64) {
    let n = profile.len();
    let (level, _) = background_level(profile, percent);
    let subtracted = profile.mapv(|y| (y - level).max(0.0));
    let total = subtracted.sum();
    if total <= 0.0 {
        return (0.0, 0.0);
    }

    let peak_bin = subtracted.argmax().unwrap_or(0);
    let amplitude = subtracted[peak_bin];

    let mut mean = 0.0;
    for (i, y) in subtracted.iter().enumerate() {
        mean += i as f64 * y;
    }
    mean /= total;

    let mut variance = 0.0;
    for (i, y) in subtracted.iter().enumerate() {
        let d = i as f64 - mean;
        variance += d * d * y;
    }
    variance /= total;
    let sigma_bins = variance.sqrt();

    let intensity = amplitude * sigma_bins * (2.0 * PI).sqrt();

    let lo = (mean - 3.0 * sigma_bins).ceil().max(0.0) as usize;
    let hi = (mean + 3.0 * sigma_bins).floor().min((n - 1) as f64) as usize;
    let mut window_variance = 0.0;
    for i in lo..=hi {
        window_variance += err_sq[i];
    }
    (intensity, window_variance.sqrt())
}

/// Reduces a profile per the configured function and option. `NoFit`
/// forces a plain sum whatever the integration option says.
pub fn integrate_profile(
    profile: &Array1<f64>,
    err_sq: &Array1<f64>,
    percent: f64,
    function: ProfileFunction,
    option: IntegrationOption,
) -> (f64, f64) {
    match (function, option) {
        (ProfileFunction::Gaussian, IntegrationOption::GaussFit) => {
            gauss_fit_profile(profile, err_sq, percent)
        }
        _ => sum_profile(profile, err_sq, percent),
    }
}
