//! Result containers for classification and integration runs.
//!
//! Classification produces one `IntersectionRow` per input peak, in input
//! order, collected in an `IntersectionTable` that is pre-sized before the
//! parallel loop starts. Integration produces an `IntegrationReport` with
//! run-level counters next to the mutated peak set.
//!
//! The result system provides:
//! - Order-preserving row storage (row i describes peak i)
//! - Run-level accounting of skipped and edge-affected peaks
//! - Overlap advisories between integration volumes
//! - Formatted summaries for terminal output and the summary file

use std::fmt;

use itertools::Itertools;
use ndarray::Array1;

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn table_is_presized_in_input_order() {
        let table = IntersectionTable::new_empty(4);
        assert_eq!(table.len(), 4);
        for (i, row) in table.rows.iter().enumerate() {
            assert_eq!(row.peak_index, i);
            assert!(!row.intersecting);
            assert_eq!(row.distance, 0.0);
        }
    }

    #[test]
    fn report_display_lists_counts() {
        let report = IntegrationReport {
            peaks_total: 3,
            peaks_integrated: 2,
            peaks_on_edge: 1,
            peaks_skipped: 1,
            overlaps: vec![(0, 2)],
            profiles: Vec::new(),
            peak_radius: vec![1.0],
            background_inner_radius: vec![1.0],
            background_outer_radius: vec![1.5],
        };
        let text = report.to_string();
        assert!(text.contains("Integrated"), "text: {}", text);
        assert!(text.contains("(0, 2)"), "text: {}", text);
    }
}

/// One classification outcome: whether peak `peak_index` intersects the
/// region, and the signed face distance recorded at the matching face
/// (0 when the center was inside or nothing matched).
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionRow {
    pub peak_index: usize,
    pub intersecting: bool,
    pub distance: f64,
}

/// The classification output table. Row `i` always refers to peak `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionTable {
    pub rows: Vec<IntersectionRow>,
}

impl IntersectionTable {
    /// Creates a table with one default row per peak. Rows left untouched by
    /// the engine keep `intersecting = false, distance = 0`.
    pub fn new_empty(num_peaks: usize) -> Self {
        let rows = (0..num_peaks)
            .map(|peak_index| IntersectionRow {
                peak_index,
                intersecting: false,
                distance: 0.0,
            })
            .collect();
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_intersecting(&self) -> usize {
        self.rows.iter().filter(|r| r.intersecting).count()
    }
}

impl fmt::Display for IntersectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Intersection table:")?;
        writeln!(f, "  Peaks:            {}", self.len())?;
        writeln!(f, "  Intersecting:     {}", self.num_intersecting())?;
        writeln!(
            f,
            "  Not intersecting: {}",
            self.len() - self.num_intersecting()
        )
    }
}

/// Signal binned along the cylinder axis for one peak.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakProfile {
    pub peak_index: usize,
    pub bins: Array1<f64>,
}

/// Run-level accounting for an integration pass.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationReport {
    pub peaks_total: usize,
    /// Peaks that received a freshly measured intensity.
    pub peaks_integrated: usize,
    /// Peaks whose integration volume reaches detector-edge dead space.
    pub peaks_on_edge: usize,
    /// Peaks zeroed by a degenerate adaptive radius or the edge policy.
    pub peaks_skipped: usize,
    /// Pairs of peak indices whose integration spheres overlap. Advisory only.
    pub overlaps: Vec<(usize, usize)>,
    /// Axis profiles recorded in cylinder mode, in peak order.
    pub profiles: Vec<PeakProfile>,
    pub peak_radius: Vec<f64>,
    pub background_inner_radius: Vec<f64>,
    pub background_outer_radius: Vec<f64>,
}

impl IntegrationReport {
    pub fn new(
        peaks_total: usize,
        peak_radius: Vec<f64>,
        background_inner_radius: Vec<f64>,
        background_outer_radius: Vec<f64>,
    ) -> Self {
        Self {
            peaks_total,
            peaks_integrated: 0,
            peaks_on_edge: 0,
            peaks_skipped: 0,
            overlaps: Vec::new(),
            profiles: Vec::new(),
            peak_radius,
            background_inner_radius,
            background_outer_radius,
        }
    }
}

impl fmt::Display for IntegrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Integration report:")?;
        writeln!(f, "  Peaks:            {}", self.peaks_total)?;
        writeln!(f, "  Integrated:       {}", self.peaks_integrated)?;
        writeln!(f, "  On edge:          {}", self.peaks_on_edge)?;
        writeln!(f, "  Skipped:          {}", self.peaks_skipped)?;
        writeln!(f, "  Overlapping:      {}", self.overlaps.len())?;
        if !self.overlaps.is_empty() {
            let pairs = self
                .overlaps
                .iter()
                .map(|(i, j)| format!("({}, {})", i, j))
                .join(", ");
            writeln!(f, "  Overlap pairs:    {}", pairs)?;
        }
        if !self.profiles.is_empty() {
            writeln!(f, "  Axis profiles:    {}", self.profiles.len())?;
        }
        writeln!(
            f,
            "  Peak radius:      [{}]",
            self.peak_radius.iter().map(|r| format!("{:.6}", r)).join(", ")
        )?;
        writeln!(
            f,
            "  Bg inner radius:  [{}]",
            self.background_inner_radius
                .iter()
                .map(|r| format!("{:.6}", r))
                .join(", ")
        )?;
        writeln!(
            f,
            "  Bg outer radius:  [{}]",
            self.background_outer_radius
                .iter()
                .map(|r| format!("{:.6}", r))
                .join(", ")
        )
    }
}
