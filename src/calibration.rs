//! Mile-mark calibration.
//!
//! The route's own distance scale and the organizer's aid-station mile marks
//! rarely agree. Configured mile marks are ground truth: each resolved station
//! contributes an anchor `(raw projected mile, configured mile)` and raw mile
//! marks are remapped piecewise-linearly between consecutive anchors. Outside
//! the first and last anchor the nearest interval's scale is extrapolated.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// A (raw projected mile mark, configured mile mark) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationAnchor {
    pub raw: f64,
    pub configured: f64,
}

impl CalibrationAnchor {
    pub fn new(raw: f64, configured: f64) -> Self {
        Self { raw, configured }
    }
}

/// Ordered anchor table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    anchors: Vec<CalibrationAnchor>,
}

impl CalibrationTable {
    /// Build a table. Anchors must be strictly increasing in both coordinates.
    pub fn new(anchors: Vec<CalibrationAnchor>) -> Result<Self> {
        if anchors.len() < 2 {
            return Err(TrackerError::InvalidMileMarks {
                message: format!("need at least 2 calibration anchors, got {}", anchors.len()),
            });
        }
        for (i, pair) in anchors.windows(2).enumerate() {
            let (a, b) = (pair[0], pair[1]);
            if !(a.raw.is_finite() && a.configured.is_finite() && b.raw.is_finite() && b.configured.is_finite()) {
                return Err(TrackerError::InvalidMileMarks {
                    message: format!("anchor {} is not finite", i),
                });
            }
            if b.raw <= a.raw {
                return Err(TrackerError::InvalidMileMarks {
                    message: format!(
                        "surveyed positions out of order: {:.3} mi follows {:.3} mi",
                        b.raw, a.raw
                    ),
                });
            }
            if b.configured <= a.configured {
                return Err(TrackerError::InvalidMileMarks {
                    message: format!(
                        "configured mile marks out of order: {} follows {}",
                        b.configured, a.configured
                    ),
                });
            }
        }
        Ok(Self { anchors })
    }

    pub fn anchors(&self) -> &[CalibrationAnchor] {
        &self.anchors
    }

    /// Remap a raw route mile mark into configured space.
    pub fn to_configured(&self, raw: f64) -> f64 {
        remap(&self.anchors, raw, |a| a.raw, |a| a.configured)
    }

    /// Inverse of [`to_configured`](Self::to_configured).
    pub fn to_raw(&self, configured: f64) -> f64 {
        remap(&self.anchors, configured, |a| a.configured, |a| a.raw)
    }
}

/// Index of the interval used for `value`: the one containing it, or the
/// nearest one when outside the anchors.
fn interval(anchors: &[CalibrationAnchor], value: f64, from: impl Fn(&CalibrationAnchor) -> f64) -> usize {
    let upper = anchors.partition_point(|a| from(a) <= value);
    upper.saturating_sub(1).min(anchors.len() - 2)
}

fn remap(
    anchors: &[CalibrationAnchor],
    value: f64,
    from: impl Fn(&CalibrationAnchor) -> f64,
    to: impl Fn(&CalibrationAnchor) -> f64,
) -> f64 {
    let i = interval(anchors, value, &from);
    let (a, b) = (&anchors[i], &anchors[i + 1]);
    // Anchors map exactly
    if from(a) == value {
        return to(a);
    }
    if from(b) == value {
        return to(b);
    }
    to(a) + (value - from(a)) * (to(b) - to(a)) / (from(b) - from(a))
}
