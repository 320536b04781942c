//! Run orchestration: loads what the configured task needs, drives the
//! engine and writes the artifacts.

use std::sync::atomic::AtomicBool;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};

use crate::detector::DetectorEdges;
use crate::events::EventTree;
use crate::integrate::integrate_peaks;
use crate::intersect::classify;
use crate::output;
use crate::peak::{CoordFrame, PeakSet};
use crate::region::BoxRegion;
use crate::result::{IntegrationReport, IntersectionTable};
use crate::settings::{validate_config, Settings, Task};
use crate::surface::QuadSurface;
use crate::synthetic;


/// What a finished run produced.
#[derive(Debug)]
pub enum JobOutcome {
    Classification(IntersectionTable),
    Integration(IntegrationReport),
}

/// One configured run: the peak set, the task and its outputs.
pub struct Job {
    pub settings: Settings,
    pub peaks: PeakSet,
    pub outcome: Option<JobOutcome>,
    pub cancel: AtomicBool,
}

impl Job {
    /// Loads the peak set and validates the configuration for the requested
    /// task. Event and edge data are loaded by `run`, since only integration
    /// needs them.
    pub fn new(settings: Settings) -> Result<Self> {
        validate_config(&settings)?;
        let peaks = PeakSet::from_file(&settings.peaks_file)
            .with_context(|| format!("failed to load peaks from '{}'", settings.peaks_file))?;
        println!("Loaded {} peaks from {}", peaks.len(), settings.peaks_file);

        Ok(Self {
            settings,
            peaks,
            outcome: None,
            cancel: AtomicBool::new(false),
        })
    }

    /// Runs the configured task and prints its summary.
    pub fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        println!("Running {:?} task...", self.settings.task);

        let outcome = match self.settings.task {
            Task::Region => self.run_region()?,
            Task::Surface => self.run_surface()?,
            Task::Integrate => self.run_integrate()?,
        };

        println!("Time taken: {:.2?}", start.elapsed());
        match &outcome {
            JobOutcome::Classification(table) => print!("{}", table),
            JobOutcome::Integration(report) => print!("{}", report),
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    fn run_region(&self) -> Result<JobOutcome> {
        let config = self
            .settings
            .region
            .as_ref()
            .ok_or_else(|| anyhow!("missing [region] section"))?;
        let frame: CoordFrame = config.frame.parse()?;
        let probe = BoxRegion::from_config(config)?;
        let table = classify(&probe, &self.peaks, frame, config.peak_radius, &self.cancel)?;
        Ok(JobOutcome::Classification(table))
    }

    fn run_surface(&self) -> Result<JobOutcome> {
        let config = self
            .settings
            .surface
            .as_ref()
            .ok_or_else(|| anyhow!("missing [surface] section"))?;
        let frame: CoordFrame = config.frame.parse()?;
        let probe = QuadSurface::from_config(config)?;
        let table = classify(&probe, &self.peaks, frame, config.peak_radius, &self.cancel)?;
        Ok(JobOutcome::Classification(table))
    }

    fn run_integrate(&mut self) -> Result<JobOutcome> {
        let config = self
            .settings
            .integrate
            .as_ref()
            .ok_or_else(|| anyhow!("missing [integrate] section"))?;
        let frame: CoordFrame = config.frame.parse()?;

        let tree = match (&config.events_file, &config.synthetic) {
            (Some(path), _) => {
                let tree = EventTree::from_file(path)
                    .with_context(|| format!("failed to load events from '{}'", path))?;
                println!("Loaded {} events from {}", tree.len(), path);
                tree
            }
            (None, Some(synthetic)) => {
                let seed = self.settings.seed.unwrap_or(0);
                let events = synthetic::demo_events(synthetic, &self.peaks, frame, seed)?;
                println!("Generated {} synthetic events (seed {})", events.len(), seed);
                EventTree::from_events(events)
            }
            (None, None) => return Err(anyhow!("integration needs an event source")),
        };

        let edges = match &config.edges_file {
            Some(path) => {
                let edges = DetectorEdges::from_file(path)
                    .with_context(|| format!("failed to load detector edges from '{}'", path))?;
                println!("Loaded {} detector edge directions from {}", edges.len(), path);
                edges
            }
            None => DetectorEdges::none(),
        };

        let report = integrate_peaks(&mut self.peaks, &tree, &edges, config, &self.cancel)?;
        Ok(JobOutcome::Integration(report))
    }

    /// Writes the artifacts of the last run under the output directory.
    pub fn writeup(&self) {
        match &self.outcome {
            Some(JobOutcome::Classification(table)) => {
                let _ = output::write_table(table, &self.settings.directory);
            }
            Some(JobOutcome::Integration(report)) => {
                let _ = output::write_peaks(&self.peaks, &self.settings.directory);
                let _ = output::write_report(report, &self.settings.directory);
                if !report.profiles.is_empty() {
                    let _ = output::write_profiles(report, &self.settings.directory);
                }
            }
            None => {}
        }
    }
}
