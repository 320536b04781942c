use serde::{Deserialize, Serialize};

use crate::errors::PeakqError;
use crate::peak::CoordFrame;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_json_tagging() {
        let shape = PeakShape::Spherical {
            frame: CoordFrame::QLab,
            peak_radius: 1.0,
            background_inner_radius: 1.0,
            background_outer_radius: 1.5,
        };
        let json = shape.to_json().unwrap();
        assert!(json.contains("\"shape\":\"spherical\""), "json: {}", json);
        assert!(json.contains("Q (lab frame)"), "json: {}", json);

        let back: PeakShape = serde_json::from_str(&json).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn missing_shape_defaults_to_none() {
        let shape: PeakShape = serde_json::from_str("{\"shape\":\"none\"}").unwrap();
        assert_eq!(shape, PeakShape::None);
        assert_eq!(PeakShape::default(), PeakShape::None);
    }
}

/// Persisted integration-region descriptor attached to a peak.
///
/// Written once at the end of a peak's integration and treated as immutable
/// afterwards. Directions and radii are stored as plain arrays so the JSON
/// record stays a flat, self-describing document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum PeakShape {
    None,
    Spherical {
        frame: CoordFrame,
        peak_radius: f64,
        background_inner_radius: f64,
        background_outer_radius: f64,
    },
    Ellipsoid {
        frame: CoordFrame,
        directions: [[f64; 3]; 3],
        radii: [f64; 3],
        background_inner_radii: [f64; 3],
        background_outer_radii: [f64; 3],
    },
}

impl Default for PeakShape {
    fn default() -> Self {
        PeakShape::None
    }
}

impl PeakShape {
    pub fn to_json(&self) -> Result<String, PeakqError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, PeakShape::None)
    }
}
