use std::fmt;
use std::path::Path;
use std::str::FromStr;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::errors::PeakqError;
use crate::shape::PeakShape;

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn frame_names_round_trip() {
        for name in [
            "Detector space",
            "Q (lab frame)",
            "Q (sample frame)",
            "HKL",
        ] {
            let frame: CoordFrame = name.parse().unwrap();
            assert_eq!(frame.to_string(), name);
        }
    }

    #[test]
    fn unknown_frame_name_is_invalid() {
        let err = "Q lab".parse::<CoordFrame>().unwrap_err();
        assert!(matches!(err, PeakqError::InvalidArgument(_)));
    }

    #[test]
    fn position_resolves_per_frame() {
        let mut peak = Peak::from_q_lab(Point3::new(1.0, 2.0, 3.0));
        peak.hkl = Point3::new(1.0, 0.0, 0.0);

        assert_eq!(peak.position(CoordFrame::QLab), Point3::new(1.0, 2.0, 3.0));
        assert_eq!(peak.position(CoordFrame::Hkl), Point3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn peaks_parse_from_json() {
        let json = r#"{
            "peaks": [
                {
                    "detector_pos": [0.1, 0.2, 1.0],
                    "q_lab": [1.0, 2.0, 3.0],
                    "q_sample": [1.0, 2.0, 3.0],
                    "hkl": [1.0, 0.0, 0.0],
                    "intensity": 0.0,
                    "sigma_intensity": 0.0
                }
            ]
        }"#;
        let peaks = PeakSet::from_json(json).unwrap();
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].q_lab, Point3::new(1.0, 2.0, 3.0));
        // A record without a shape entry carries no shape.
        assert!(peaks[0].shape.is_none());
    }
}

/// The coordinate frame a peak position is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordFrame {
    #[serde(rename = "Detector space")]
    DetectorSpace,
    #[serde(rename = "Q (lab frame)")]
    QLab,
    #[serde(rename = "Q (sample frame)")]
    QSample,
    #[serde(rename = "HKL")]
    Hkl,
}

impl FromStr for CoordFrame {
    type Err = PeakqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Detector space" => Ok(CoordFrame::DetectorSpace),
            "Q (lab frame)" => Ok(CoordFrame::QLab),
            "Q (sample frame)" => Ok(CoordFrame::QSample),
            "HKL" => Ok(CoordFrame::Hkl),
            other => Err(PeakqError::invalid(format!(
                "unknown coordinate frame '{}'; expected one of \
                 'Detector space', 'Q (lab frame)', 'Q (sample frame)', 'HKL'",
                other
            ))),
        }
    }
}

impl fmt::Display for CoordFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordFrame::DetectorSpace => "Detector space",
            CoordFrame::QLab => "Q (lab frame)",
            CoordFrame::QSample => "Q (sample frame)",
            CoordFrame::Hkl => "HKL",
        };
        write!(f, "{}", name)
    }
}

/// A single Bragg peak with its position in all supported frames.
///
/// Classification reads positions only; integration writes intensity,
/// sigma and the fitted shape back onto the peak.
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub detector_pos: Point3<f64>,
    pub q_lab: Point3<f64>,
    pub q_sample: Point3<f64>,
    pub hkl: Point3<f64>,
    pub intensity: f64,
    pub sigma_intensity: f64,
    pub shape: PeakShape,
}

impl Peak {
    /// Peak with the same nominal position in every frame. Convenient for
    /// synthetic data where no instrument geometry exists.
    pub fn from_q_lab(q: Point3<f64>) -> Self {
        Self {
            detector_pos: q,
            q_lab: q,
            q_sample: q,
            hkl: q,
            intensity: 0.0,
            sigma_intensity: 0.0,
            shape: PeakShape::None,
        }
    }

    /// The peak center in the requested frame.
    pub fn position(&self, frame: CoordFrame) -> Point3<f64> {
        match frame {
            CoordFrame::DetectorSpace => self.detector_pos,
            CoordFrame::QLab => self.q_lab,
            CoordFrame::QSample => self.q_sample,
            CoordFrame::Hkl => self.hkl,
        }
    }
}

/// JSON wire record for a peak. Positions are 3-component arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeakRecord {
    detector_pos: [f64; 3],
    q_lab: [f64; 3],
    q_sample: [f64; 3],
    hkl: [f64; 3],
    intensity: f64,
    sigma_intensity: f64,
    #[serde(default, skip_serializing_if = "PeakShape::is_none")]
    shape: PeakShape,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeaksFile {
    peaks: Vec<PeakRecord>,
}

/// An ordered collection of peaks. Row `i` of every output table refers to
/// the peak at index `i` here.
#[derive(Debug, Clone, Default)]
pub struct PeakSet {
    pub peaks: Vec<Peak>,
}

impl PeakSet {
    pub fn new(peaks: Vec<Peak>) -> Self {
        Self { peaks }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PeakqError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> Result<Self, PeakqError> {
        let file: PeaksFile = serde_json::from_str(json)?;
        let peaks = file
            .peaks
            .into_iter()
            .map(|r| Peak {
                detector_pos: Point3::from(r.detector_pos),
                q_lab: Point3::from(r.q_lab),
                q_sample: Point3::from(r.q_sample),
                hkl: Point3::from(r.hkl),
                intensity: r.intensity,
                sigma_intensity: r.sigma_intensity,
                shape: r.shape,
            })
            .collect();
        Ok(Self { peaks })
    }

    pub fn to_json(&self) -> Result<String, PeakqError> {
        let records = self
            .peaks
            .iter()
            .map(|p| PeakRecord {
                detector_pos: p.detector_pos.coords.into(),
                q_lab: p.q_lab.coords.into(),
                q_sample: p.q_sample.coords.into(),
                hkl: p.hkl.coords.into(),
                intensity: p.intensity,
                sigma_intensity: p.sigma_intensity,
                shape: p.shape.clone(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&PeaksFile { peaks: records })?)
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Peak> {
        self.peaks.iter()
    }
}

impl std::ops::Index<usize> for PeakSet {
    type Output = Peak;

    fn index(&self, index: usize) -> &Peak {
        &self.peaks[index]
    }
}

impl std::ops::IndexMut<usize> for PeakSet {
    fn index_mut(&mut self, index: usize) -> &mut Peak {
        &mut self.peaks[index]
    }
}
