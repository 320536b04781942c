//! Peak intensity integration: spherical, ellipsoidal and cylindrical.
//!
//! **Context**: every peak is measured independently against the shared
//! event index. The foreground volume is a sphere around the nominal center
//! (or a fitted ellipsoid of equal volume); the local background is taken
//! from a concentric shell, scaled into the foreground volume and
//! subtracted. Peaks run in parallel and their results are applied to the
//! peak set in input order, so repeated runs produce identical output.

use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use nalgebra::Point3;
use ndarray::Array1;
use rayon::prelude::*;

use crate::cylinder::{integrate_profile, profile_axis, IntegrationOption, ProfileFunction};
use crate::detector::{edge_background_multiplier, edge_peak_multiplier, DetectorEdges};
use crate::ellipsoid::{
    background_corrected, estimate_axes, estimate_axes_fixed_q, scale_radii, ShapeAccumulator,
};
use crate::errors::PeakqError;
use crate::events::{Event, EventIndex, RadialTransform};
use crate::peak::{CoordFrame, Peak, PeakSet};
use crate::result::{IntegrationReport, PeakProfile};
use crate::settings::{IntegrateConfig, CYLINDER_PROFILE_BINS, DEGENERATE_LENGTH_SQ};
use crate::shape::PeakShape;


/// Per-peak integration radii after adaptive scaling, one entry per
/// ellipsoid axis (all equal in sphere mode).
struct Radii {
    peak: [f64; 3],
    inner: [f64; 3],
    outer: [f64; 3],
}

/// Expands a 1- or 3-component configured radius to per-axis values.
fn expand3(radii: &[f64]) -> [f64; 3] {
    if radii.len() == 1 {
        [radii[0]; 3]
    } else {
        [radii[0], radii[1], radii[2]]
    }
}

fn max3(r: &[f64; 3]) -> f64 {
    r[0].max(r[1]).max(r[2])
}

fn min3(r: &[f64; 3]) -> f64 {
    r[0].min(r[1]).min(r[2])
}

/// Adaptive radii for one peak: `configured + multiplier * |Q|` per
/// component. The background multiplier is zero unless
/// `adaptive_q_background` is set, and the configured inner radius is first
/// raised to the peak radius so a static shell never starts inside the
/// foreground volume.
fn effective_radii(config: &IntegrateConfig, q_norm: f64) -> Radii {
    let peak = expand3(&config.peak_radius);
    let inner = expand3(&config.background_inner_radius);
    let outer = expand3(&config.background_outer_radius);

    let m_peak = config.adaptive_q_multiplier;
    let m_background = if config.adaptive_q_background { m_peak } else { 0.0 };

    let mut r = Radii {
        peak: [0.0; 3],
        inner: [0.0; 3],
        outer: [0.0; 3],
    };
    for i in 0..3 {
        r.peak[i] = peak[i] + m_peak * q_norm;
        r.inner[i] = inner[i].max(peak[i]) + m_background * q_norm;
        r.outer[i] = outer[i] + m_background * q_norm;
    }
    r
}

/// Everything integration decided about one peak. Computed from immutable
/// inputs (in parallel for sphere and ellipsoid modes), then applied to the
/// peak set sequentially.
#[derive(Debug, Default)]
struct PeakOutcome {
    intensity: f64,
    sigma: f64,
    /// Shape to attach; `None` leaves the peak's existing shape untouched.
    shape: Option<PeakShape>,
    on_edge: bool,
    skipped: bool,
    /// Largest effective peak radius component, for the overlap scan.
    radius_max: f64,
    warnings: Vec<String>,
    profile: Option<Array1<f64>>,
}

/// Raw foreground totals and volume-scaled background of one pass.
struct PassTotals {
    signal: f64,
    error_sq: f64,
    scaled_bg: f64,
    scaled_bg_err_sq: f64,
    shape: PeakShape,
}

/// Runs a shell query and scales the result into the foreground volume
/// (squared scale for the error term).
fn scaled_shell(
    tree: &dyn EventIndex,
    transform: &RadialTransform,
    radius_sq: f64,
    inner_radius_sq: f64,
    scale: f64,
    use_one_percent: bool,
) -> (f64, f64) {
    let (bg, bg_err_sq) =
        tree.integrate_sphere(transform, radius_sq, inner_radius_sq, use_one_percent);
    (bg * scale, bg_err_sq * scale * scale)
}

fn sphere_pass(
    tree: &dyn EventIndex,
    config: &IntegrateConfig,
    frame: CoordFrame,
    center: &Point3<f64>,
    r: &Radii,
) -> PassTotals {
    let sphere = RadialTransform::sphere(*center);
    let r_peak = r.peak[0];
    let (signal, error_sq) = tree.integrate_sphere(&sphere, r_peak * r_peak, 0.0, false);

    let (inner, outer) = (r.inner[0], r.outer[0]);
    let shell = outer.powi(3) - inner.powi(3);
    let (scaled_bg, scaled_bg_err_sq) = if outer > 0.0 && shell > 0.0 {
        scaled_shell(
            tree,
            &sphere,
            outer * outer,
            inner * inner,
            r_peak.powi(3) / shell,
            config.use_one_percent_background_correction,
        )
    } else {
        (0.0, 0.0)
    };

    PassTotals {
        signal,
        error_sq,
        scaled_bg,
        scaled_bg_err_sq,
        shape: PeakShape::Spherical {
            frame,
            peak_radius: r_peak,
            background_inner_radius: inner,
            background_outer_radius: outer,
        },
    }
}

/// Semi-axes along the fitted directions: a configured triple passes through
/// unchanged, a scalar is spread by the eigenvalue ratios at equal volume.
fn axis_radii(configured: &[f64], effective: &[f64; 3], values: &[f64; 3]) -> [f64; 3] {
    if configured.len() == 3 {
        *effective
    } else {
        scale_radii(values, effective[0])
    }
}

/// Fits principal axes to the events around the peak and re-integrates both
/// the foreground and the background shell in that basis. Returns `None`
/// (with `outcome` zeroed and warned) when no usable moments exist.
fn ellipsoid_pass(
    peak: &Peak,
    tree: &dyn EventIndex,
    config: &IntegrateConfig,
    frame: CoordFrame,
    center: &Point3<f64>,
    r: &Radii,
    outcome: &mut PeakOutcome,
) -> Option<PassTotals> {
    let sphere = RadialTransform::sphere(*center);
    let r_collect = max3(&r.peak);
    let inner_s = max3(&r.inner);
    let outer_s = max3(&r.outer);

    // Flat-background estimate inside the collection sphere, taken from the
    // spherical shell. It feeds the moment correction only; the shell itself
    // is redone in the fitted basis below.
    let shell = outer_s.powi(3) - inner_s.powi(3);
    let (bg_in_peak, _) = if outer_s > 0.0 && shell > 0.0 {
        scaled_shell(
            tree,
            &sphere,
            outer_s * outer_s,
            inner_s * inner_s,
            r_collect.powi(3) / shell,
            config.use_one_percent_background_correction,
        )
    } else {
        (0.0, 0.0)
    };

    let mut signal_acc = ShapeAccumulator::new();
    let mut position_acc = ShapeAccumulator::new();
    tree.visit_events_within(&sphere, r_collect * r_collect, &mut |event: &Event| {
        signal_acc.push(&event.center, event.signal);
        position_acc.push(&event.center, 1.0);
    });

    if position_acc.weight() == 0.0 {
        outcome
            .warnings
            .push(format!("no events within radius {:.6}; peak zeroed", r_collect));
        outcome.skipped = true;
        return None;
    }

    let covariance = match background_corrected(&signal_acc, &position_acc, bg_in_peak) {
        Some((_mean, cov)) => cov,
        None => {
            outcome.warnings.push(
                "background-corrected weight is not positive; \
                 shape estimated from uncorrected moments"
                    .to_string(),
            );
            match signal_acc.covariance() {
                Some(cov) => cov,
                None => {
                    outcome
                        .warnings
                        .push("no positive signal within the peak radius; peak zeroed".to_string());
                    outcome.skipped = true;
                    return None;
                }
            }
        }
    };

    let (axes, values) = if config.fix_q_axis {
        if peak.q_lab.coords.norm_squared() < DEGENERATE_LENGTH_SQ {
            outcome.warnings.push(
                "Q vector too short to fix the first axis; using free principal axes".to_string(),
            );
            estimate_axes(&covariance)
        } else {
            estimate_axes_fixed_q(&covariance, &peak.q_lab.coords)
        }
    } else {
        estimate_axes(&covariance)
    };

    let radii_peak = axis_radii(&config.peak_radius, &r.peak, &values);
    let radii_inner = axis_radii(&config.background_inner_radius, &r.inner, &values);
    let radii_outer = axis_radii(&config.background_outer_radius, &r.outer, &values);

    let peak_transform = RadialTransform::ellipsoid(*center, axes, radii_peak);
    let (signal, error_sq) = tree.integrate_sphere(&peak_transform, 1.0, 0.0, false);

    let vol_peak = radii_peak[0] * radii_peak[1] * radii_peak[2];
    let vol_inner = radii_inner[0] * radii_inner[1] * radii_inner[2];
    let vol_outer = radii_outer[0] * radii_outer[1] * radii_outer[2];
    let shell_vol = vol_outer - vol_inner;
    let (scaled_bg, scaled_bg_err_sq) = if vol_outer > 0.0 && shell_vol > 0.0 {
        let outer_transform = RadialTransform::ellipsoid(*center, axes, radii_outer);
        // Inner surface as a uniform fraction of the outer one; exact when
        // both shells share the per-axis ratios.
        let c = (vol_inner / vol_outer).cbrt();
        scaled_shell(
            tree,
            &outer_transform,
            1.0,
            c * c,
            vol_peak / shell_vol,
            config.use_one_percent_background_correction,
        )
    } else {
        (0.0, 0.0)
    };

    Some(PassTotals {
        signal,
        error_sq,
        scaled_bg,
        scaled_bg_err_sq,
        shape: PeakShape::Ellipsoid {
            frame,
            directions: [axes[0].into(), axes[1].into(), axes[2].into()],
            radii: radii_peak,
            background_inner_radii: radii_inner,
            background_outer_radii: radii_outer,
        },
    })
}

/// Integrates one peak in sphere or ellipsoid mode.
fn integrate_one(
    peak: &Peak,
    tree: &dyn EventIndex,
    edges: &DetectorEdges,
    config: &IntegrateConfig,
    frame: CoordFrame,
) -> PeakOutcome {
    let mut outcome = PeakOutcome::default();
    let center = peak.position(frame);
    let r = effective_radii(config, peak.q_lab.coords.norm());
    outcome.radius_max = max3(&r.peak);

    if min3(&r.peak) <= 0.0 {
        outcome.warnings.push(format!(
            "adaptive peak radius is not positive ({:.6}); peak zeroed",
            min3(&r.peak)
        ));
        outcome.skipped = true;
        return outcome;
    }

    let edge_distance = edges.distance_to_edge(&peak.q_lab);
    if edge_distance < outcome.radius_max.max(max3(&r.outer)) {
        outcome.on_edge = true;
        if !config.integrate_if_on_edge {
            outcome
                .warnings
                .push("integration volume reaches a detector edge; peak zeroed".to_string());
            outcome.skipped = true;
            return outcome;
        }
    }

    let totals = if config.ellipsoid {
        match ellipsoid_pass(peak, tree, config, frame, &center, &r, &mut outcome) {
            Some(totals) => totals,
            None => return outcome,
        }
    } else {
        sphere_pass(tree, config, frame, &center, &r)
    };
    outcome.shape = Some(totals.shape);

    let (mut peak_multiplier, mut bg_multiplier) = (1.0, 1.0);
    if config.correct_if_on_edge {
        peak_multiplier = edge_peak_multiplier(max3(&r.peak), edge_distance);
        bg_multiplier = edge_background_multiplier(max3(&r.outer), edge_distance);
    }

    outcome.intensity = peak_multiplier * totals.signal - bg_multiplier * totals.scaled_bg;
    outcome.sigma = (peak_multiplier * peak_multiplier * totals.error_sq
        + bg_multiplier * bg_multiplier * totals.scaled_bg_err_sq)
        .sqrt();
    outcome
}

/// Integrates one peak in cylinder mode. The axis follows the detector
/// direction, the total cylinder signal is binned along it and the profile
/// reduced per the configured function and option.
fn cylinder_peak(
    peak: &Peak,
    tree: &dyn EventIndex,
    edges: &DetectorEdges,
    config: &IntegrateConfig,
    frame: CoordFrame,
    function: ProfileFunction,
    option: IntegrationOption,
) -> PeakOutcome {
    let mut outcome = PeakOutcome::default();
    let center = peak.position(frame);
    let r = effective_radii(config, peak.q_lab.coords.norm());
    outcome.radius_max = max3(&r.peak);

    if min3(&r.peak) <= 0.0 {
        outcome.warnings.push(format!(
            "adaptive peak radius is not positive ({:.6}); peak zeroed",
            min3(&r.peak)
        ));
        outcome.skipped = true;
        return outcome;
    }

    let edge_distance = edges.distance_to_edge(&peak.q_lab);
    if edge_distance < outcome.radius_max.max(max3(&r.outer)) {
        outcome.on_edge = true;
        if !config.integrate_if_on_edge {
            outcome
                .warnings
                .push("integration volume reaches a detector edge; peak zeroed".to_string());
            outcome.skipped = true;
            return outcome;
        }
    }

    let (axis, fell_back) = profile_axis(peak);
    if fell_back {
        outcome
            .warnings
            .push("detector direction unavailable; profiling along the fallback axis".to_string());
    }

    let (_, _, profile, profile_err_sq) = tree.integrate_cylinder(
        &center,
        &axis,
        r.peak[0],
        config.cylinder_length,
        CYLINDER_PROFILE_BINS,
    );
    let (intensity, sigma) =
        integrate_profile(&profile, &profile_err_sq, config.percent_background, function, option);

    outcome.intensity = intensity;
    outcome.sigma = sigma;
    outcome.profile = Some(profile);
    outcome
}

/// Integrates every peak against the event index and writes intensities,
/// sigmas and shape records back onto the peak set.
///
/// Sphere and ellipsoid peaks are processed in parallel; results are applied
/// in input order afterwards, so warnings, counters and the mutated peaks do
/// not depend on thread scheduling. Cylinder mode runs sequentially. A
/// cancelled run aborts with `PeakqError::Cancelled` without touching the
/// peaks.
///
/// A peak is zeroed and counted as skipped when its adaptive radius is not
/// positive, or when it reaches a detector edge while `integrate_if_on_edge`
/// is off. With `replace_intensity` off a zeroed result keeps the peak's
/// previous intensity.
pub fn integrate_peaks(
    peaks: &mut PeakSet,
    tree: &dyn EventIndex,
    edges: &DetectorEdges,
    config: &IntegrateConfig,
    cancel: &AtomicBool,
) -> Result<IntegrationReport, PeakqError> {
    config.validate()?;
    let frame: CoordFrame = config.frame.parse()?;

    let mut report = IntegrationReport::new(
        peaks.len(),
        config.peak_radius.clone(),
        config.background_inner_radius.clone(),
        config.background_outer_radius.clone(),
    );
    let mut outcomes: Vec<PeakOutcome> =
        (0..peaks.len()).map(|_| PeakOutcome::default()).collect();

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

    let shared: &PeakSet = peaks;
    if config.cylinder {
        let function: ProfileFunction = config.profile_function.parse()?;
        let option: IntegrationOption = config.integration_option.parse()?;
        for (i, outcome) in outcomes.iter_mut().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            *outcome = cylinder_peak(&shared[i], tree, edges, config, frame, function, option);
            pb.inc(1);
        }
    } else {
        outcomes.par_iter_mut().enumerate().for_each(|(i, outcome)| {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            *outcome = integrate_one(&shared[i], tree, edges, config, frame);
            pb.inc(1);
        });
    }

    pb.finish_and_clear();

    if cancel.load(Ordering::Relaxed) {
        return Err(PeakqError::Cancelled);
    }

    for (i, outcome) in outcomes.iter_mut().enumerate() {
        for warning in &outcome.warnings {
            eprintln!("Warning: peak {}: {}", i, warning);
        }

        let peak = &mut peaks[i];
        if outcome.intensity != 0.0 || config.replace_intensity {
            peak.intensity = outcome.intensity;
            peak.sigma_intensity = outcome.sigma;
        }
        if let Some(shape) = outcome.shape.take() {
            peak.shape = shape;
        }
        if outcome.on_edge {
            report.peaks_on_edge += 1;
        }
        if outcome.skipped {
            report.peaks_skipped += 1;
        } else {
            report.peaks_integrated += 1;
        }
        if let Some(profile) = outcome.profile.take() {
            report.profiles.push(PeakProfile {
                peak_index: i,
                bins: profile,
            });
        }
    }

    // Advisory scan for integration volumes that reach into each other.
    for i in 0..peaks.len() {
        for j in (i + 1)..peaks.len() {
            let d = (peaks[i].position(frame) - peaks[j].position(frame)).norm();
            let reach = 2.0 * outcomes[i].radius_max.max(outcomes[j].radius_max);
            if d < reach {
                eprintln!(
                    "Warning: peaks {} and {} are {:.6} apart; their integration radii reach {:.6}",
                    i, j, d, reach
                );
                report.overlaps.push((i, j));
            }
        }
    }

    Ok(report)
}
