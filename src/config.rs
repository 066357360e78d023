//! Race configuration and tracker tuning.
//!
//! [`RaceConfig`] describes one race and is read-only input to course
//! construction. [`TrackerConfig`] holds the engine's thresholds.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::GpsPoint;

/// One configured aid station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AidStationConfig {
    pub name: String,
    /// Organizer's mile mark, treated as ground truth
    pub mile_mark: f64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub comments: String,
}

impl AidStationConfig {
    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Race definition supplied by the config-loading collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceConfig {
    pub race_name: String,
    pub start_time: DateTime<Utc>,
    pub runner_name: String,
    pub route_name: String,
    /// Configured finish mile mark. Defaults to the route length rounded to 0.1 mi.
    #[serde(default)]
    pub route_distance: Option<f64>,
    /// Aid stations in course order, excluding start and finish
    pub aid_stations: Vec<AidStationConfig>,
}

impl RaceConfig {
    /// Load a race configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| TrackerError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(TrackerError::config)
    }
}

/// On-disk encoding of runner snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    MessagePack,
}

/// Engine thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Route vertices closer than this to their predecessor are dropped.
    /// Default: 10 ft
    pub min_point_spacing_ft: f64,

    /// Gaps wider than this are filled by interpolation.
    /// Default: 25 ft
    pub max_point_spacing_ft: f64,

    /// Maximum distance between an aid station and the route, and between a ping
    /// and the route for the ping to count as "at" a station.
    /// Default: 75 ft
    pub max_station_deviation_ft: f64,

    /// Route passes within this distance of the closest one are treated as
    /// ambiguous and resolved by the runner's expected progress.
    /// Default: 100 ft
    pub pass_ambiguity_ft: f64,

    /// Half-width of the band around a station's mile mark that counts as "at" it.
    /// Default: 0.11 mi (about 200 yards)
    pub passage_tolerance_miles: f64,

    /// Distance before a station at which the runner is considered approaching.
    /// Default: 1.0 mi
    pub approach_window_miles: f64,

    /// Consecutive qualifying pings needed to confirm an arrival.
    /// Default: 2
    pub arrival_confirmations: u32,

    /// Largest movement between pings that still confirms an arrival.
    /// Default: 0.03 mi (about 160 ft)
    pub stationary_miles: f64,

    /// Mile mark past which the runner has started.
    /// Default: 0.11 mi
    pub started_threshold_miles: f64,

    /// Pace assumed before any moving time has accrued (min/mi).
    /// Default: 10.0
    pub default_pace_min_per_mile: f64,

    /// Deviation at or above which the runner is shown as slightly off course.
    /// Default: 100 ft
    pub minor_deviation_ft: f64,

    /// Deviation above which the runner is shown as far off course.
    /// Default: 200 ft
    pub major_deviation_ft: f64,

    /// Backward movement beyond this is logged as suspicious.
    /// Default: 0.1 mi
    pub backward_warning_miles: f64,

    /// How far ahead (minutes) the map marker estimate is projected.
    /// Default: 5.0
    pub marker_lookahead_minutes: f64,

    pub snapshot_format: SnapshotFormat,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_point_spacing_ft: 10.0,
            max_point_spacing_ft: 25.0,
            max_station_deviation_ft: 75.0,
            pass_ambiguity_ft: 100.0,
            passage_tolerance_miles: 0.11,
            approach_window_miles: 1.0,
            arrival_confirmations: 2,
            stationary_miles: 0.03,
            started_threshold_miles: 0.11,
            default_pace_min_per_mile: 10.0,
            minor_deviation_ft: 100.0,
            major_deviation_ft: 200.0,
            backward_warning_miles: 0.1,
            marker_lookahead_minutes: 5.0,
            snapshot_format: SnapshotFormat::Json,
        }
    }
}

impl TrackerConfig {
    /// Reject threshold combinations the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_point_spacing_ft > 0.0
            && self.max_point_spacing_ft >= 2.0 * self.min_point_spacing_ft)
        {
            return Err(TrackerError::Config {
                message: format!(
                    "point spacing must satisfy 0 < min ({}) and 2*min <= max ({})",
                    self.min_point_spacing_ft, self.max_point_spacing_ft
                ),
            });
        }
        if self.arrival_confirmations == 0 {
            return Err(TrackerError::config("arrival_confirmations must be at least 1"));
        }
        if !(self.stationary_miles > 0.0 && self.stationary_miles <= 2.0 * self.passage_tolerance_miles) {
            return Err(TrackerError::config(
                "stationary threshold must be positive and fit inside the passage band",
            ));
        }
        if self.passage_tolerance_miles <= 0.0 || self.approach_window_miles < self.passage_tolerance_miles {
            return Err(TrackerError::config(
                "approach window must be at least as wide as the passage tolerance",
            ));
        }
        if self.minor_deviation_ft > self.major_deviation_ft {
            return Err(TrackerError::config(
                "minor deviation threshold exceeds major deviation threshold",
            ));
        }
        Ok(())
    }
}
