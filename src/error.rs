//! Unified error handling for the race-tracker library.
//!
//! Configuration problems (bad route geometry, misplaced aid stations, a snapshot
//! that belongs to a different course) are fatal and surface as [`TrackerError`].
//! Problems with a single ping are recoverable and surface as [`PingRejection`],
//! leaving the runner state untouched.

use thiserror::Error;

/// Unified error type for race-tracker operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// Route has insufficient points for processing
    #[error("Route '{route_name}' has {point_count} points, minimum {minimum_required} required")]
    InsufficientPoints {
        route_name: String,
        point_count: usize,
        minimum_required: usize,
    },

    /// Route is too short to be densified
    #[error("Route '{route_name}' is {length_ft:.1}ft, minimum {minimum_ft:.1}ft required")]
    RouteTooShort {
        route_name: String,
        length_ft: f64,
        minimum_ft: f64,
    },

    /// Survey or configuration point has invalid GPS coordinates
    #[error("Invalid coordinates for '{name}': {message}")]
    InvalidCoordinates { name: String, message: String },

    /// Aid station does not lie on the route
    #[error(
        "Aid station '{name}' is {deviation_ft:.1}ft from the route, maximum {maximum_ft:.1}ft allowed"
    )]
    StationOffRoute {
        name: String,
        deviation_ft: f64,
        maximum_ft: f64,
    },

    /// Two aid stations share a name
    #[error("Aid station '{name}' is configured more than once")]
    DuplicateStation { name: String },

    /// Configured or surveyed mile marks are not strictly increasing
    #[error("Invalid mile marks: {message}")]
    InvalidMileMarks { message: String },

    /// Snapshot was written for a different course configuration
    #[error("Snapshot course fingerprint {found} does not match loaded course {expected}")]
    FingerprintMismatch { expected: String, found: String },

    /// Snapshot document version is not understood by this build
    #[error("Snapshot version {found} is not supported (expected {expected})")]
    UnsupportedSnapshotVersion { found: u32, expected: u32 },

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl TrackerError {
    /// True for errors that must stop the engine from serving.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(self, TrackerError::Persistence { .. })
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        TrackerError::Persistence {
            message: err.to_string(),
        }
    }

    pub(crate) fn config(err: impl std::fmt::Display) -> Self {
        TrackerError::Config {
            message: err.to_string(),
        }
    }
}

/// Result type alias for race-tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Reason a ping was not applied to the runner state.
///
/// The `Display` strings are stable; the webhook collaborator logs them verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PingRejection {
    #[error("out-of-order timestamp")]
    OutOfOrder,
    #[error("duplicate timestamp")]
    DuplicateTimestamp,
    #[error("malformed coordinates")]
    InvalidCoordinates,
    #[error("timestamp before race start")]
    BeforeRaceStart,
    #[error("runner already finished")]
    RaceFinished,
}

/// Failed ingestion result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    /// The ping was discarded and the runner state is unchanged
    #[error("ping rejected: {0}")]
    Rejected(#[from] PingRejection),

    /// The ping was applied in memory but the snapshot write failed; the
    /// next successful write carries it forward
    #[error("ping applied but not persisted: {0}")]
    NotPersisted(TrackerError),
}

impl IngestError {
    pub fn rejection(&self) -> Option<PingRejection> {
        match self {
            IngestError::Rejected(reason) => Some(*reason),
            IngestError::NotPersisted(_) => None,
        }
    }
}

/// Extension trait for converting Option to TrackerError.
pub trait OptionExt<T> {
    /// Convert Option to Result with insufficient points error.
    fn ok_or_insufficient_points(
        self,
        route_name: &str,
        point_count: usize,
        minimum: usize,
    ) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_insufficient_points(
        self,
        route_name: &str,
        point_count: usize,
        minimum: usize,
    ) -> Result<T> {
        self.ok_or_else(|| TrackerError::InsufficientPoints {
            route_name: route_name.to_string(),
            point_count,
            minimum_required: minimum,
        })
    }
}
