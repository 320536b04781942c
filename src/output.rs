//! Writers for run artifacts under the configured output directory.

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::PeakqError;
use crate::peak::PeakSet;
use crate::result::{IntegrationReport, IntersectionTable};


fn prepared(directory: &str, file_name: &str) -> Result<PathBuf, PeakqError> {
    create_dir_all(directory)?;
    Ok(Path::new(directory).join(file_name))
}

/// Writes the classification table as `peak intersecting distance` rows.
pub fn write_table(table: &IntersectionTable, directory: &str) -> Result<(), PeakqError> {
    let file = File::create(prepared(directory, "intersections.txt")?)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# peak intersecting distance")?;
    for row in &table.rows {
        writeln!(
            writer,
            "{} {} {}",
            row.peak_index, row.intersecting, row.distance
        )?;
    }
    Ok(())
}

/// Writes the full peak set, including any attached shapes, as JSON.
pub fn write_peaks(peaks: &PeakSet, directory: &str) -> Result<(), PeakqError> {
    let path = prepared(directory, "peaks.json")?;
    std::fs::write(path, peaks.to_json()?)?;
    Ok(())
}

/// Writes one line of axis-profile bins per cylinder-integrated peak.
pub fn write_profiles(report: &IntegrationReport, directory: &str) -> Result<(), PeakqError> {
    let file = File::create(prepared(directory, "profiles.txt")?)?;
    let mut writer = BufWriter::new(file);

    for profile in &report.profiles {
        write!(writer, "{}", profile.peak_index)?;
        for value in profile.bins.iter() {
            write!(writer, " {}", value)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Writes the integration summary, stamped with the wall-clock time.
pub fn write_report(report: &IntegrationReport, directory: &str) -> Result<(), PeakqError> {
    let file = File::create(prepared(directory, "report.txt")?)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "# {}", chrono::Utc::now().to_rfc3339())?;
    write!(writer, "{}", report)?;
    Ok(())
}
