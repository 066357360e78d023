//! # Race Tracker
//!
//! Live GPS tracking engine for a single runner on a fixed course.
//!
//! This library provides:
//! - Route densification and projection of GPS pings onto the route
//! - Calibration of route distance against the organizer's aid-station mile marks
//! - Aid-station arrival/departure detection
//! - Moving/stoppage time accounting, paces and arrival estimates
//! - Atomic runner-state snapshots for restart without replay
//!
//! ## Features
//!
//! - **`parallel`** - Resolve aid stations in parallel with rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use race_tracker::{PingInput, RaceConfig, RaceEngine, RouteSurvey, SurveyPoint, TrackerConfig};
//!
//! let survey = RouteSurvey {
//!     name: "Hill Climb".to_string(),
//!     points: vec![
//!         SurveyPoint::new(40.0, -105.0, 5000.0),
//!         SurveyPoint::new(40.05, -105.0, 5200.0),
//!     ],
//! };
//! let race = RaceConfig::from_json(r#"{
//!     "race_name": "Hill Climb",
//!     "start_time": "2024-06-01T11:00:00Z",
//!     "runner_name": "Runner",
//!     "route_name": "Hill Climb",
//!     "aid_stations": []
//! }"#)?;
//!
//! let mut engine = RaceEngine::from_config(&race, &survey, TrackerConfig::default())?;
//! let accepted = engine
//!     .ingest(PingInput {
//!         timestamp: "2024-06-01T11:30:00Z".parse().unwrap(),
//!         latitude: 40.02,
//!         longitude: -105.0,
//!         elevation_meters: 1550.0,
//!     })
//!     .unwrap();
//! println!("mile {:.2}", accepted.ping.mile_mark);
//! # Ok::<(), race_tracker::TrackerError>(())
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{IngestError, OptionExt, PingRejection, Result, TrackerError};

// Geographic utilities (distance, unit conversion, local frame)
pub mod geo_utils;

// Race and engine configuration
pub mod config;
pub use config::{AidStationConfig, RaceConfig, SnapshotFormat, TrackerConfig};

// Densified route polyline and projection
pub mod route;
pub use route::{Projection, Route, RoutePoint, RouteSurvey, SurveyPoint};

// Raw route distance to configured mile marks
pub mod calibration;
pub use calibration::{CalibrationAnchor, CalibrationTable};

// Aid stations and legs resolved onto the route
pub mod course;
pub use course::{AidStation, Course, CourseElement, CourseProjection, Leg, StationKind};

// Per-station arrival/departure state machines
pub mod passage;
pub use passage::{PassageDetector, PassageEvent, PassageState, StationPassage};

// Runner aggregate
pub mod state;
pub use state::{LegTiming, Ping, RunnerState};

// Paces, arrival estimates and deviation bands
pub mod pace;
pub use pace::{DeviationBand, PaceEstimator};

// Dashboard and map-marker views
pub mod view;
pub use view::{
    format_distance, format_duration, format_pace, CourseElementView, DashboardView, LegView,
    MarkerUpdate, StationView,
};

// Versioned runner-state snapshots
pub mod persistence;
pub use persistence::{Snapshot, SnapshotStore, SNAPSHOT_VERSION};

// Tracking engine and shared handle
pub mod engine;
pub use engine::{Accepted, PingInput, RaceEngine, SharedEngine, StationEvent};

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use race_tracker::GpsPoint;
/// let point = GpsPoint::new(39.7392, -104.9903); // Denver
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}
