//! # Race Engine
//!
//! Stateful tracking engine that owns the course and the runner state.
//!
//! ## Architecture
//!
//! Each accepted ping runs through one pipeline:
//! projection onto the route, calibration to configured mile marks, passage
//! detection, the moving/stoppage split and a snapshot write. The engine is an
//! explicitly owned value; [`SharedEngine`] wraps it for one writer (ping
//! ingestion) and any number of readers (dashboard and map collaborators),
//! holding the write lock for the whole pipeline so readers see either the
//! state before a ping or after it.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RaceConfig, TrackerConfig};
use crate::course::Course;
use crate::error::{IngestError, PingRejection, Result};
use crate::geo_utils::meters_to_feet;
use crate::pace::PaceEstimator;
use crate::passage::{PassageDetector, PassageEvent};
use crate::persistence::{Snapshot, SnapshotStore};
use crate::route::{Route, RouteSurvey};
use crate::state::{Ping, RunnerState};
use crate::view::{format_duration, DashboardView, MarkerUpdate};
use crate::GpsPoint;

// ============================================================================
// Core Types
// ============================================================================

/// One parsed tracker reading, as handed over by the webhook collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingInput {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_meters: f64,
}

impl PingInput {
    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// A passage transition, named for logging and display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationEvent {
    pub station: String,
    pub event: PassageEvent,
}

/// Result of an accepted ping.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub ping: Ping,
    pub events: Vec<StationEvent>,
    pub marker: Option<MarkerUpdate>,
}

// ============================================================================
// Race Engine
// ============================================================================

/// The tracking engine for one runner on one course.
pub struct RaceEngine {
    course: Course,
    config: TrackerConfig,
    detector: PassageDetector,
    state: RunnerState,
    store: Option<SnapshotStore>,
}

impl RaceEngine {
    /// Engine with a fresh runner state and no persistence.
    pub fn new(course: Course, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let detector = PassageDetector::new(&config);
        let state = RunnerState::new(&course, &detector);
        Ok(Self {
            course,
            config,
            detector,
            state,
            store: None,
        })
    }

    /// Build the route and course from configuration.
    pub fn from_config(race: &RaceConfig, survey: &RouteSurvey, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let route = Route::from_survey(survey, &config)?;
        let course = Course::build(route, race, &config)?;
        Self::new(course, config)
    }

    /// Attach a snapshot store, restoring the runner state it holds.
    ///
    /// A snapshot written for another course configuration is a fatal error.
    pub fn open(course: Course, config: TrackerConfig, store: SnapshotStore) -> Result<Self> {
        let mut engine = Self::new(course, config)?;
        match store.restore(&engine.course)? {
            Some(state) => engine.state = state,
            None => log::info!(
                "[Engine] no snapshot at {}, starting '{}' fresh",
                store.path().display(),
                engine.course.race_name()
            ),
        }
        engine.store = Some(store);
        Ok(engine)
    }

    pub fn course(&self) -> &Course {
        &self.course
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    pub fn store(&self) -> Option<&SnapshotStore> {
        self.store.as_ref()
    }

    pub fn estimator(&self) -> PaceEstimator<'_> {
        PaceEstimator::new(&self.course, &self.state, &self.config)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.course, &self.state)
    }

    pub fn dashboard(&self) -> DashboardView {
        DashboardView::build(&self.course, &self.state, &self.config)
    }

    pub fn marker(&self) -> Option<MarkerUpdate> {
        MarkerUpdate::build(&self.course, &self.state, &self.config)
    }

    /// Discard all runner progress, e.g. after the race configuration changed.
    pub fn reset(&mut self) -> Result<()> {
        self.state = RunnerState::new(&self.course, &self.detector);
        log::info!("[Engine] runner state reset for '{}'", self.course.race_name());
        self.persist()
    }

    /// Write the current state to the snapshot store, if any.
    pub fn persist(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.snapshot()),
            None => Ok(()),
        }
    }

    fn check(&self, input: &PingInput) -> std::result::Result<(), PingRejection> {
        if !input.position().is_valid() || !input.elevation_meters.is_finite() {
            return Err(PingRejection::InvalidCoordinates);
        }
        if self.state.finished() {
            return Err(PingRejection::RaceFinished);
        }
        if input.timestamp < self.state.start_time() {
            return Err(PingRejection::BeforeRaceStart);
        }
        if let Some(last) = self.state.last_ping() {
            if input.timestamp < last.timestamp {
                return Err(PingRejection::OutOfOrder);
            }
            if input.timestamp == last.timestamp {
                return Err(PingRejection::DuplicateTimestamp);
            }
        }
        Ok(())
    }

    /// Apply one ping.
    ///
    /// A rejected ping leaves the state untouched. A persistence failure is
    /// reported after the ping has been applied in memory.
    pub fn ingest(&mut self, input: PingInput) -> std::result::Result<Accepted, IngestError> {
        if let Err(reason) = self.check(&input) {
            log::warn!(
                "[Engine] rejected ping at {} ({:.5}, {:.5}): {}",
                input.timestamp,
                input.latitude,
                input.longitude,
                reason
            );
            return Err(reason.into());
        }

        let position = input.position();
        let expected = self.estimator().expected_mile_mark(input.timestamp);
        let located = self.course.locate(&position, Some(expected));

        let previous_mile = self.state.mile_mark();
        if previous_mile - located.mile_mark > self.config.backward_warning_miles {
            log::warn!(
                "[Engine] runner moved backward from mile {:.2} to {:.2}",
                previous_mile,
                located.mile_mark
            );
        }
        log::debug!(
            "[Engine] ping at {}: raw mile {:.3}, mile {:.3}, {:.1}ft off route",
            input.timestamp,
            located.raw_mile_mark,
            located.mile_mark,
            located.deviation_ft
        );

        let ping = Ping {
            timestamp: input.timestamp,
            latitude: input.latitude,
            longitude: input.longitude,
            elevation: meters_to_feet(input.elevation_meters),
            raw_mile_mark: located.raw_mile_mark,
            mile_mark: located.mile_mark,
            deviation_ft: located.deviation_ft,
        };

        let events = self
            .state
            .record(ping, &self.course, &self.detector)
            .into_iter()
            .map(|(i, event)| StationEvent {
                station: self.course.stations()[i].name.clone(),
                event,
            })
            .collect();

        if let Err(e) = self.persist() {
            log::error!("[Engine] snapshot write failed after ping at {}: {}", input.timestamp, e);
            return Err(IngestError::NotPersisted(e));
        }

        log::info!(
            "[Engine] runner at mile {:.2} ({} pings, {} elapsed)",
            ping.mile_mark,
            self.state.ping_count(),
            format_duration(self.state.elapsed_time())
        );

        Ok(Accepted {
            ping,
            events,
            marker: self.marker(),
        })
    }
}

// ============================================================================
// Shared Handle
// ============================================================================

/// Cloneable single-writer / multi-reader handle to a [`RaceEngine`].
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<RwLock<RaceEngine>>,
}

impl SharedEngine {
    pub fn new(engine: RaceEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, RaceEngine> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, RaceEngine> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a read-only closure against the engine.
    pub fn with_engine<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&RaceEngine) -> R,
    {
        f(&self.read_guard())
    }

    /// Run a closure with exclusive access to the engine.
    pub fn with_engine_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut RaceEngine) -> R,
    {
        f(&mut self.write_guard())
    }

    pub fn ingest(&self, input: PingInput) -> std::result::Result<Accepted, IngestError> {
        self.with_engine_mut(|engine| engine.ingest(input))
    }

    pub fn dashboard(&self) -> DashboardView {
        self.with_engine(|engine| engine.dashboard())
    }

    pub fn marker(&self) -> Option<MarkerUpdate> {
        self.with_engine(|engine| engine.marker())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::tests::marathon_course;
    use crate::route::tests::degrees_per_mile;
    use chrono::TimeDelta;

    fn engine() -> RaceEngine {
        RaceEngine::new(marathon_course(), TrackerConfig::default()).unwrap()
    }

    /// Ping on the straight test route at a raw distance from the start.
    fn ping_at(minute: i64, raw_mile: f64) -> PingInput {
        PingInput {
            timestamp: "2024-06-01T11:00:00Z".parse::<DateTime<Utc>>().unwrap()
                + TimeDelta::minutes(minute),
            latitude: 40.0 + raw_mile * degrees_per_mile(),
            longitude: -105.0,
            elevation_meters: 1524.0,
        }
    }

    #[test]
    fn test_ingest_calibrates_mile_mark() {
        let mut engine = engine();
        let accepted = engine.ingest(ping_at(100, 10.4)).unwrap();
        assert!((accepted.ping.mile_mark - 10.0).abs() < 1e-6);
        assert!(accepted.ping.deviation_ft < 1.0);
        assert!((accepted.ping.elevation - 5000.0).abs() < 0.1);
        assert!(accepted.marker.is_some());
    }

    #[test]
    fn test_rejections_leave_state_unchanged() {
        let mut engine = engine();
        engine.ingest(ping_at(30, 3.0)).unwrap();
        let before = engine.state().clone();

        let err = engine.ingest(ping_at(20, 2.0)).unwrap_err();
        assert_eq!(err.rejection(), Some(PingRejection::OutOfOrder));
        assert_eq!(err.rejection().map(|r| r.to_string()).as_deref(), Some("out-of-order timestamp"));

        let err = engine.ingest(ping_at(30, 3.0)).unwrap_err();
        assert_eq!(err.rejection(), Some(PingRejection::DuplicateTimestamp));

        let mut bad = ping_at(40, 4.0);
        bad.latitude = f64::NAN;
        assert_eq!(
            engine.ingest(bad).unwrap_err().rejection(),
            Some(PingRejection::InvalidCoordinates)
        );

        assert_eq!(
            engine.ingest(ping_at(-5, 0.0)).unwrap_err().rejection(),
            Some(PingRejection::BeforeRaceStart)
        );

        assert_eq!(engine.state(), &before);
    }

    #[test]
    fn test_finished_runner_rejects_pings() {
        let mut engine = engine();
        engine.ingest(ping_at(280, 26.5)).unwrap();
        engine.ingest(ping_at(290, 27.0)).unwrap();
        assert!(engine.state().finished());
        assert_eq!(
            engine.ingest(ping_at(300, 27.0)).unwrap_err().rejection(),
            Some(PingRejection::RaceFinished)
        );
    }

    #[test]
    fn test_events_are_named() {
        let mut engine = engine();
        let accepted = engine.ingest(ping_at(20, 2.0)).unwrap();
        assert_eq!(accepted.events.len(), 1);
        assert_eq!(accepted.events[0].station, "Start");
    }

    #[test]
    fn test_shared_engine_readers_see_complete_updates() {
        let shared = SharedEngine::new(engine());
        let reader = shared.clone();
        shared.ingest(ping_at(30, 3.0)).unwrap();

        let handle = std::thread::spawn(move || reader.with_engine(|e| e.state().ping_count()));
        assert_eq!(handle.join().unwrap(), 1);

        let view = shared.dashboard();
        assert_eq!(view.ping_count, 1);
        assert!(shared.marker().is_some());
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut engine = engine();
        engine.ingest(ping_at(30, 3.0)).unwrap();
        engine.reset().unwrap();
        assert_eq!(engine.state().ping_count(), 0);
        assert!(engine.ingest(ping_at(10, 1.0)).is_ok());
    }
}
