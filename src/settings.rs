use anyhow::Result;
use clap::Parser;
use config::{Config, Environment, File};
use nalgebra::Point3;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::str::FromStr;

use crate::cylinder::{IntegrationOption, ProfileFunction};
use crate::errors::PeakqError;
use crate::peak::CoordFrame;

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn vertex_literal_parses() {
        let p = parse_vertex("0.5,-1,2e-1").unwrap();
        assert_eq!(p, Point3::new(0.5, -1.0, 0.2));
    }

    #[test]
    fn vertex_literal_arity_is_checked() {
        for bad in ["0,0", "0,0,0,0", "", "1,2,x"] {
            let err = parse_vertex(bad).unwrap_err();
            assert!(matches!(err, PeakqError::InvalidArgument(_)), "input: {}", bad);
        }
    }

    #[test]
    fn radius_arity_is_checked() {
        let mut cfg = IntegrateConfig::for_tests();
        cfg.peak_radius = vec![1.0, 2.0];
        assert!(cfg.validate().is_err());

        cfg.peak_radius = vec![1.0, 2.0, 3.0];
        // Three components demand ellipsoid mode.
        assert!(cfg.validate().is_err());
        cfg.ellipsoid = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn integrate_frame_must_be_momentum_like() {
        let mut cfg = IntegrateConfig::for_tests();
        cfg.frame = "Detector space".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cylinder_parameters_are_checked() {
        let mut cfg = IntegrateConfig::for_tests();
        cfg.cylinder = true;
        cfg.cylinder_length = 0.0;
        assert!(cfg.validate().is_err());

        cfg.cylinder_length = 4.0;
        cfg.percent_background = 120.0;
        assert!(cfg.validate().is_err());

        cfg.percent_background = 20.0;
        cfg.profile_function = "Lorentzian".to_string();
        assert!(cfg.validate().is_err());

        cfg.profile_function = "Gaussian".to_string();
        cfg.integration_option = "GaussFit".to_string();
        assert!(cfg.validate().is_ok());
    }
}

/// Absolute tolerance for the quadrilateral coplanarity check.
pub const COPLANAR_TOLERANCE: f64 = 1e-9;
/// Absolute tolerance when comparing squared side lengths of the quadrilateral.
pub const SIDE_LENGTH_TOLERANCE: f64 = 1e-9;
/// Squared length below which a vector is treated as degenerate.
pub const DEGENERATE_LENGTH_SQ: f64 = 1e-24;
/// Smallest eigenvalue admitted when estimating ellipsoid axes.
pub const EIGENVALUE_FLOOR: f64 = 1e-6;
/// Events per box above which the event tree splits a node.
pub const MAX_EVENTS_PER_LEAF: usize = 64;
/// Maximum depth of the event tree.
pub const MAX_TREE_DEPTH: usize = 16;
/// Number of profile bins along the cylinder axis.
pub const CYLINDER_PROFILE_BINS: usize = 100;
/// Fraction of ranked background contributions kept by the one-percent cut.
pub const BACKGROUND_KEEP_FRACTION: f64 = 0.99;
/// Gaussian sigma of a peak profile as a fraction of its integration radius.
pub const EDGE_SIGMA_RADIUS_FRACTION: f64 = 1.0 / 3.0;

/// Runtime configuration for the application.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    pub task: Task,
    pub peaks_file: String,
    #[serde(default = "default_directory")]
    pub directory: String,
    pub seed: Option<u64>,
    pub region: Option<RegionConfig>,
    pub surface: Option<SurfaceConfig>,
    pub integrate: Option<IntegrateConfig>,
}

fn default_directory() -> String {
    "out".to_string()
}

fn default_true() -> bool {
    true
}

fn default_frame() -> String {
    "Q (lab frame)".to_string()
}

fn default_zero_radius() -> Vec<f64> {
    vec![0.0]
}

fn default_profile_function() -> String {
    "NoFit".to_string()
}

fn default_integration_option() -> String {
    "GaussFit".to_string()
}

/// Which engine a run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Region,
    Surface,
    Integrate,
}

/// Box-region classification parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RegionConfig {
    #[serde(default = "default_frame")]
    pub frame: String,
    /// [xmin, xmax, ymin, ymax, zmin, zmax]
    pub extents: Vec<f64>,
    #[serde(default)]
    pub peak_radius: f64,
    #[serde(default = "default_true")]
    pub check_peak_extents: bool,
}

impl RegionConfig {
    pub fn validate(&self) -> Result<(), PeakqError> {
        CoordFrame::from_str(&self.frame)?;
        if self.extents.len() != 6 {
            return Err(PeakqError::invalid(format!(
                "extents must have 6 components [xmin, xmax, ymin, ymax, zmin, zmax], got {}",
                self.extents.len()
            )));
        }
        if self.peak_radius < 0.0 {
            return Err(PeakqError::invalid("peak_radius must not be negative"));
        }
        Ok(())
    }
}

/// Quadrilateral-surface classification parameters. Vertices are literal
/// "x,y,z" strings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SurfaceConfig {
    #[serde(default = "default_frame")]
    pub frame: String,
    pub vertex1: String,
    pub vertex2: String,
    pub vertex3: String,
    pub vertex4: String,
    #[serde(default)]
    pub peak_radius: f64,
}

impl SurfaceConfig {
    pub fn validate(&self) -> Result<(), PeakqError> {
        CoordFrame::from_str(&self.frame)?;
        for v in [&self.vertex1, &self.vertex2, &self.vertex3, &self.vertex4] {
            parse_vertex(v)?;
        }
        if self.peak_radius < 0.0 {
            return Err(PeakqError::invalid("peak_radius must not be negative"));
        }
        Ok(())
    }
}

/// Sphere/ellipsoid (or cylinder) integration parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IntegrateConfig {
    #[serde(default = "default_frame")]
    pub frame: String,
    pub events_file: Option<String>,
    pub synthetic: Option<SyntheticConfig>,
    /// 1 component for a sphere, 3 for fixed ellipsoid semi-axes.
    pub peak_radius: Vec<f64>,
    #[serde(default = "default_zero_radius")]
    pub background_inner_radius: Vec<f64>,
    #[serde(default = "default_zero_radius")]
    pub background_outer_radius: Vec<f64>,
    #[serde(default)]
    pub ellipsoid: bool,
    #[serde(default)]
    pub fix_q_axis: bool,
    #[serde(default)]
    pub adaptive_q_multiplier: f64,
    #[serde(default)]
    pub adaptive_q_background: bool,
    #[serde(default = "default_true")]
    pub integrate_if_on_edge: bool,
    #[serde(default)]
    pub correct_if_on_edge: bool,
    #[serde(default = "default_true")]
    pub use_one_percent_background_correction: bool,
    #[serde(default = "default_true")]
    pub replace_intensity: bool,
    pub edges_file: Option<String>,
    #[serde(default)]
    pub cylinder: bool,
    #[serde(default)]
    pub cylinder_length: f64,
    /// Percentage of profile bins (split between both cylinder ends) used to
    /// estimate a flat background level.
    #[serde(default)]
    pub percent_background: f64,
    /// "NoFit" or "Gaussian".
    #[serde(default = "default_profile_function")]
    pub profile_function: String,
    /// "Sum" or "GaussFit".
    #[serde(default = "default_integration_option")]
    pub integration_option: String,
}

impl IntegrateConfig {
    pub fn validate(&self) -> Result<(), PeakqError> {
        let frame = CoordFrame::from_str(&self.frame)?;
        if frame == CoordFrame::DetectorSpace {
            return Err(PeakqError::invalid(
                "integration requires a momentum frame: 'Q (lab frame)', 'Q (sample frame)' or 'HKL'",
            ));
        }

        for (name, radii) in [
            ("peak_radius", &self.peak_radius),
            ("background_inner_radius", &self.background_inner_radius),
            ("background_outer_radius", &self.background_outer_radius),
        ] {
            if radii.len() != 1 && radii.len() != 3 {
                return Err(PeakqError::invalid(format!(
                    "{} must have 1 or 3 components, got {}",
                    name,
                    radii.len()
                )));
            }
            if radii.len() == 3 && !self.ellipsoid {
                return Err(PeakqError::invalid(format!(
                    "{} has 3 components, which requires ellipsoid = true",
                    name
                )));
            }
            if radii.iter().any(|r| *r < 0.0) {
                return Err(PeakqError::invalid(format!("{} must not be negative", name)));
            }
        }

        if self.events_file.is_none() && self.synthetic.is_none() {
            return Err(PeakqError::invalid(
                "integration needs an event source: set events_file or [integrate.synthetic]",
            ));
        }
        if self.events_file.is_some() && self.synthetic.is_some() {
            return Err(PeakqError::invalid(
                "events_file and [integrate.synthetic] are mutually exclusive",
            ));
        }
        if let Some(synthetic) = &self.synthetic {
            if synthetic.cluster_sigma <= 0.0 {
                return Err(PeakqError::invalid("cluster_sigma must be positive"));
            }
            if synthetic.extent <= 0.0 {
                return Err(PeakqError::invalid("extent must be positive"));
            }
        }

        if self.cylinder {
            if self.cylinder_length <= 0.0 {
                return Err(PeakqError::invalid(
                    "cylinder_length must be positive in cylinder mode",
                ));
            }
            if !(0.0..=100.0).contains(&self.percent_background) {
                return Err(PeakqError::invalid(
                    "percent_background must lie in [0, 100]",
                ));
            }
            self.profile_function.parse::<ProfileFunction>()?;
            self.integration_option.parse::<IntegrationOption>()?;
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            frame: default_frame(),
            events_file: Some("events.txt".to_string()),
            synthetic: None,
            peak_radius: vec![1.0],
            background_inner_radius: default_zero_radius(),
            background_outer_radius: default_zero_radius(),
            ellipsoid: false,
            fix_q_axis: false,
            adaptive_q_multiplier: 0.0,
            adaptive_q_background: false,
            integrate_if_on_edge: true,
            correct_if_on_edge: false,
            use_one_percent_background_correction: true,
            replace_intensity: true,
            edges_file: None,
            cylinder: false,
            cylinder_length: 0.0,
            percent_background: 0.0,
            profile_function: default_profile_function(),
            integration_option: default_integration_option(),
        }
    }
}

/// Synthetic event generation: one Gaussian cluster per peak over a uniform
/// background box.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SyntheticConfig {
    pub background_events: usize,
    pub cluster_events: usize,
    pub cluster_sigma: f64,
    /// Half-width of the background box around the origin.
    pub extent: f64,
}

/// Parse a vertex literal of the form "x,y,z".
pub fn parse_vertex(s: &str) -> Result<Point3<f64>, PeakqError> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(PeakqError::invalid(format!(
            "vertex '{}' must have exactly 3 comma-separated components",
            s
        )));
    }
    let mut coords = [0.0; 3];
    for (i, part) in parts.iter().enumerate() {
        coords[i] = part.trim().parse::<f64>().map_err(|_| {
            PeakqError::invalid(format!("failed to parse vertex component '{}'", part))
        })?;
    }
    Ok(Point3::from(coords))
}

pub fn load_default_config() -> Result<Settings> {
    let peakq_dir = retrieve_project_root();
    let default_config_file = peakq_dir.join("config/default.toml");

    let settings: Config = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Error loading configuration: {}", err);
            std::process::exit(1);
        });

    let config: Settings = settings.try_deserialize().unwrap_or_else(|err| {
        eprintln!("Error deserializing configuration: {}", err);
        std::process::exit(1);
    });

    validate_config(&config)?;

    Ok(config)
}

pub fn load_config() -> Result<Settings> {
    // Try to find the project directory in different ways
    let peakq_dir = retrieve_project_root();

    let default_config_file = peakq_dir.join("config/default.toml");
    let local_config = peakq_dir.join("config/local.toml");

    // Check if local config exists, if not use default
    let config_file = if local_config.exists() {
        println!("Using local configuration: {:?}", local_config);
        local_config
    } else {
        println!("Using default configuration: {:?}", default_config_file);
        default_config_file
    };

    let settings: Config = Config::builder()
        .add_source(File::from(config_file).required(true))
        .add_source(Environment::with_prefix("peakq"))
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Error loading configuration: {}", err);
            std::process::exit(1);
        });

    let mut config: Settings = settings.try_deserialize().unwrap_or_else(|err| {
        eprintln!("Error deserializing configuration: {}", err);
        std::process::exit(1);
    });

    // Parse command-line arguments and override values
    let args = CliArgs::parse();

    if let Some(task) = args.task {
        config.task = task;
    }
    if let Some(peaks) = args.peaks {
        config.peaks_file = peaks;
    }
    if let Some(directory) = args.directory {
        config.directory = directory;
    }
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    if let Some(frame) = args.frame {
        match config.task {
            Task::Region => {
                if let Some(region) = config.region.as_mut() {
                    region.frame = frame;
                }
            }
            Task::Surface => {
                if let Some(surface) = config.surface.as_mut() {
                    surface.frame = frame;
                }
            }
            Task::Integrate => {
                if let Some(integrate) = config.integrate.as_mut() {
                    integrate.frame = frame;
                }
            }
        }
    }
    if let Some(radius) = args.radius {
        match config.task {
            Task::Region => {
                if let Some(region) = config.region.as_mut() {
                    region.peak_radius = radius;
                }
            }
            Task::Surface => {
                if let Some(surface) = config.surface.as_mut() {
                    surface.peak_radius = radius;
                }
            }
            Task::Integrate => {
                if let Some(integrate) = config.integrate.as_mut() {
                    integrate.peak_radius = vec![radius];
                }
            }
        }
    }
    if let Some(extents) = args.extents {
        if let Some(region) = config.region.as_mut() {
            region.extents = extents;
        } else {
            eprintln!("Warning: --extents ignored, no [region] section configured.");
        }
    }
    if let Some(events) = args.events {
        if let Some(integrate) = config.integrate.as_mut() {
            integrate.events_file = Some(events);
            integrate.synthetic = None;
        } else {
            eprintln!("Warning: --events ignored, no [integrate] section configured.");
        }
    }

    validate_config(&config)?;

    println!("{}", config);

    Ok(config)
}

/// Retrieve the project root directory.
/// This function tries to find the project root directory in different ways:
/// 1. If the CARGO_MANIFEST_DIR environment variable is set, use it.
/// 2. If the PEAKQ_ROOT_DIR environment variable is set, use it.
/// 3. If the "config" subdirectory is found in the executable directory or any of its parents, use it.
/// If none of these methods work, the function will panic.
fn retrieve_project_root() -> std::path::PathBuf {
    let peakq_dir = if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        // When running through cargo (e.g. cargo run, cargo test)
        std::path::PathBuf::from(manifest_dir)
    } else if let Ok(path) = env::var("PEAKQ_ROOT_DIR") {
        // Allow explicit configuration via environment variable
        std::path::PathBuf::from(path)
    } else {
        // Fallback: try to find the nearest directory containing a "config" subdirectory
        // Start from the executable directory and walk upward
        let exe_path = env::current_exe().expect("Failed to get current executable path");
        let mut current_dir = exe_path
            .parent()
            .expect("Failed to get executable directory")
            .to_path_buf();
        let mut found = false;

        while !found && current_dir.parent().is_some() {
            if current_dir.join("config").is_dir() {
                found = true;
            } else {
                current_dir = current_dir.parent().unwrap().to_path_buf();
            }
        }

        if found {
            current_dir
        } else {
            panic!("Could not find project root directory");
        }
    };
    peakq_dir
}

pub fn validate_config(config: &Settings) -> Result<(), PeakqError> {
    match config.task {
        Task::Region => match &config.region {
            Some(region) => region.validate(),
            None => Err(PeakqError::invalid(
                "task = \"region\" requires a [region] section",
            )),
        },
        Task::Surface => match &config.surface {
            Some(surface) => surface.validate(),
            None => Err(PeakqError::invalid(
                "task = \"surface\" requires a [surface] section",
            )),
        },
        Task::Integrate => match &config.integrate {
            Some(integrate) => integrate.validate(),
            None => Err(PeakqError::invalid(
                "task = \"integrate\" requires an [integrate] section",
            )),
        },
    }
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "peakq - classify and integrate Bragg peaks in momentum space"
)]
pub struct CliArgs {
    /// Task to run.
    #[arg(short, long, value_enum)]
    task: Option<Task>,

    /// File path to the input peaks JSON document.
    #[arg(short, long)]
    peaks: Option<String>,

    /// Directory for output files.
    #[arg(short, long)]
    directory: Option<String>,

    /// Random seed for synthetic event generation.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Peak radius override for the active task. For integration this
    /// replaces the radius list with a single sphere radius.
    #[arg(short, long)]
    radius: Option<f64>,

    /// Coordinate frame override, e.g. "Q (lab frame)".
    #[arg(short, long)]
    frame: Option<String>,

    /// Box extents override: xmin xmax ymin ymax zmin zmax.
    #[arg(long, num_args = 6, value_delimiter = ' ')]
    extents: Option<Vec<f64>>,

    /// File path to the input events table (integration only).
    #[arg(short, long)]
    events: Option<String>,
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings:
  - Task: {:?}
  - Peaks File: {}
  - Output Directory: {}
  - Seed: {:?}
  ",
            self.task, self.peaks_file, self.directory, self.seed,
        )
    }
}
