//! Deterministic synthetic event generation for demo runs and tests.

use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::errors::PeakqError;
use crate::events::Event;
use crate::peak::{CoordFrame, PeakSet};
use crate::settings::SyntheticConfig;


/// Events drawn from an isotropic Gaussian around `center`, each carrying
/// the given signal.
pub fn gaussian_cluster(
    center: &Point3<f64>,
    sigma: f64,
    count: usize,
    signal: f64,
    rng: &mut StdRng,
) -> Result<Vec<Event>, PeakqError> {
    let normal = Normal::new(0.0, sigma)
        .map_err(|_| PeakqError::invalid("cluster sigma must be a non-negative number"))?;
    Ok((0..count)
        .map(|_| Event {
            center: Point3::new(
                center.x + normal.sample(rng),
                center.y + normal.sample(rng),
                center.z + normal.sample(rng),
            ),
            signal,
            error_sq: signal,
        })
        .collect())
}

/// Uniform background events over the cube `[-extent, extent]^3`.
pub fn uniform_background(
    extent: f64,
    count: usize,
    signal: f64,
    rng: &mut StdRng,
) -> Result<Vec<Event>, PeakqError> {
    if extent <= 0.0 {
        return Err(PeakqError::invalid("background extent must be positive"));
    }
    Ok((0..count)
        .map(|_| Event {
            center: Point3::new(
                rng.random_range(-extent..extent),
                rng.random_range(-extent..extent),
                rng.random_range(-extent..extent),
            ),
            signal,
            error_sq: signal,
        })
        .collect())
}

/// The demo measurement: a uniform background box with one Gaussian cluster
/// per peak. The same seed always produces the same events.
pub fn demo_events(
    config: &SyntheticConfig,
    peaks: &PeakSet,
    frame: CoordFrame,
    seed: u64,
) -> Result<Vec<Event>, PeakqError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut events = uniform_background(config.extent, config.background_events, 1.0, &mut rng)?;
    for peak in peaks.iter() {
        let center = peak.position(frame);
        events.extend(gaussian_cluster(
            &center,
            config.cluster_sigma,
            config.cluster_events,
            1.0,
            &mut rng,
        )?);
    }
    Ok(events)
}
