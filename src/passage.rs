//! # Passage Detection
//!
//! One forward-only state machine per station:
//!
//! ```text
//! NotReached -> Approaching -> AtStation -> Departed
//!                   \________________________/  (bypassed)
//! ```
//!
//! An arrival needs `arrival_confirmations` consecutive qualifying pings (on
//! route and within the tolerance band of the station's mile mark); the
//! arrival time is the first of them. The departure time is the last ping
//! that still held the runner at the station. Start and Finish are handled
//! separately: Start is occupied from the race start until the runner has
//! started, and Finish records an arrival on its first qualifying ping.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::course::{AidStation, StationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassageState {
    NotReached,
    Approaching,
    AtStation,
    Departed,
}

/// Observed passage of the runner through one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationPassage {
    pub state: PassageState,
    pub arrival_time: Option<DateTime<Utc>>,
    /// For a bypassed station, the interpolated time the runner went past it
    pub departure_time: Option<DateTime<Utc>>,
    /// Last ping that left the runner at the station
    pub last_seen: Option<DateTime<Utc>>,
    /// First ping of an unconfirmed arrival
    pub pending_since: Option<DateTime<Utc>>,
    /// Mile mark of that first ping
    #[serde(default)]
    pub pending_mile_mark: Option<f64>,
    pub pending_count: u32,
    /// Passed without ever qualifying as at the station
    pub bypassed: bool,
}

impl StationPassage {
    pub fn new() -> Self {
        Self {
            state: PassageState::NotReached,
            arrival_time: None,
            departure_time: None,
            last_seen: None,
            pending_since: None,
            pending_mile_mark: None,
            pending_count: 0,
            bypassed: false,
        }
    }

    /// Start is occupied from the gun.
    pub fn at_start(start_time: DateTime<Utc>) -> Self {
        Self {
            state: PassageState::AtStation,
            arrival_time: Some(start_time),
            ..Self::new()
        }
    }

    /// Time spent at the station so far.
    pub fn stoppage_time(&self) -> TimeDelta {
        match (self.arrival_time, self.last_seen) {
            (Some(arrival), Some(seen)) => seen - arrival,
            _ => TimeDelta::zero(),
        }
    }

    pub fn is_departed(&self) -> bool {
        self.state == PassageState::Departed
    }

    pub fn is_at_station(&self) -> bool {
        self.state == PassageState::AtStation
    }

    /// Whether the runner has reached or gone past the station.
    pub fn is_reached(&self) -> bool {
        self.state >= PassageState::AtStation
    }

    /// When the runner reached the station, or went past it.
    pub fn reached_at(&self) -> Option<DateTime<Utc>> {
        self.arrival_time.or(self.departure_time)
    }

    fn clear_pending(&mut self) {
        self.pending_since = None;
        self.pending_mile_mark = None;
        self.pending_count = 0;
    }
}

impl Default for StationPassage {
    fn default() -> Self {
        Self::new()
    }
}

/// One accepted ping, as seen by the passage detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassageSample {
    pub timestamp: DateTime<Utc>,
    /// Calibrated mile mark
    pub mile_mark: f64,
    pub deviation_ft: f64,
    /// Previous ping, or the race start for the first ping
    pub previous_timestamp: DateTime<Utc>,
    pub previous_mile_mark: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassageEvent {
    Approaching,
    Arrived(DateTime<Utc>),
    Departed(DateTime<Utc>),
    Bypassed(DateTime<Utc>),
}

/// Thresholds for the station state machines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassageDetector {
    tolerance_miles: f64,
    approach_window_miles: f64,
    max_deviation_ft: f64,
    confirmations: u32,
    stationary_miles: f64,
    started_threshold_miles: f64,
}

impl PassageDetector {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            tolerance_miles: config.passage_tolerance_miles,
            approach_window_miles: config.approach_window_miles,
            max_deviation_ft: config.max_station_deviation_ft,
            confirmations: config.arrival_confirmations.max(1),
            stationary_miles: config.stationary_miles,
            started_threshold_miles: config.started_threshold_miles,
        }
    }

    /// Initial passage for a station.
    pub fn initial(&self, station: &AidStation, start_time: DateTime<Utc>) -> StationPassage {
        match station.kind {
            StationKind::Start => StationPassage::at_start(start_time),
            _ => StationPassage::new(),
        }
    }

    /// Advance one station's state machine by one sample.
    pub fn advance(
        &self,
        station: &AidStation,
        passage: &mut StationPassage,
        sample: &PassageSample,
    ) -> Vec<PassageEvent> {
        let events = match station.kind {
            StationKind::Start => self.advance_start(passage, sample),
            StationKind::Aid => self.advance_aid(station.configured_mile_mark, passage, sample),
            StationKind::Finish => self.advance_finish(station.configured_mile_mark, passage, sample),
        };
        for event in &events {
            match event {
                PassageEvent::Approaching => log::debug!(
                    "[Passage] approaching {} at mile {:.2}",
                    station.display_name(),
                    sample.mile_mark
                ),
                PassageEvent::Arrived(at) => {
                    log::info!("[Passage] arrived at {} at {}", station.display_name(), at)
                }
                PassageEvent::Departed(at) => {
                    log::info!("[Passage] departed {} at {}", station.display_name(), at)
                }
                PassageEvent::Bypassed(at) => log::info!(
                    "[Passage] passed {} without stopping around {}",
                    station.display_name(),
                    at
                ),
            }
        }
        events
    }

    fn qualifies(&self, station_mile: f64, sample: &PassageSample) -> bool {
        sample.deviation_ft <= self.max_deviation_ft
            && (sample.mile_mark - station_mile).abs() <= self.tolerance_miles
    }

    fn advance_start(&self, passage: &mut StationPassage, sample: &PassageSample) -> Vec<PassageEvent> {
        if passage.state == PassageState::AtStation && sample.mile_mark > self.started_threshold_miles {
            passage.state = PassageState::Departed;
            passage.departure_time = passage.arrival_time;
            return passage.departure_time.map(PassageEvent::Departed).into_iter().collect();
        }
        Vec::new()
    }

    fn advance_finish(
        &self,
        finish_mile: f64,
        passage: &mut StationPassage,
        sample: &PassageSample,
    ) -> Vec<PassageEvent> {
        let mut events = Vec::new();
        if passage.state == PassageState::NotReached
            && sample.mile_mark >= finish_mile - self.approach_window_miles
        {
            passage.state = PassageState::Approaching;
            events.push(PassageEvent::Approaching);
        }
        if passage.state == PassageState::Approaching
            && sample.deviation_ft <= self.max_deviation_ft
            && sample.mile_mark >= finish_mile - self.tolerance_miles
        {
            passage.state = PassageState::AtStation;
            passage.arrival_time = Some(sample.timestamp);
            passage.last_seen = Some(sample.timestamp);
            events.push(PassageEvent::Arrived(sample.timestamp));
        }
        events
    }

    fn advance_aid(
        &self,
        station_mile: f64,
        passage: &mut StationPassage,
        sample: &PassageSample,
    ) -> Vec<PassageEvent> {
        let mut events = Vec::new();
        let mile = sample.mile_mark;

        if passage.state == PassageState::NotReached && mile >= station_mile - self.approach_window_miles {
            passage.state = PassageState::Approaching;
            events.push(PassageEvent::Approaching);
        }

        match passage.state {
            PassageState::Approaching => {
                if self.qualifies(station_mile, sample) {
                    // Confirmations only count while the runner stays put
                    let drifted = passage
                        .pending_mile_mark
                        .map(|m| (mile - m).abs() > self.stationary_miles)
                        .unwrap_or(false);
                    if drifted {
                        passage.clear_pending();
                    }
                    if passage.pending_count == 0 {
                        passage.pending_since = Some(sample.timestamp);
                        passage.pending_mile_mark = Some(mile);
                    }
                    passage.pending_count += 1;
                    if passage.pending_count >= self.confirmations {
                        let arrival = passage.pending_since.unwrap_or(sample.timestamp);
                        passage.state = PassageState::AtStation;
                        passage.arrival_time = Some(arrival);
                        passage.last_seen = Some(sample.timestamp);
                        passage.clear_pending();
                        events.push(PassageEvent::Arrived(arrival));
                    }
                } else {
                    passage.clear_pending();
                    if mile > station_mile + self.tolerance_miles {
                        let passed_at = interpolate_passing_time(station_mile, sample);
                        passage.state = PassageState::Departed;
                        passage.departure_time = Some(passed_at);
                        passage.bypassed = true;
                        events.push(PassageEvent::Bypassed(passed_at));
                    }
                }
            }
            PassageState::AtStation => {
                let moved_on = mile > station_mile + self.tolerance_miles
                    || (sample.deviation_ft > self.max_deviation_ft && mile > station_mile);
                if moved_on {
                    passage.state = PassageState::Departed;
                    passage.departure_time = passage.last_seen;
                    if let Some(departure) = passage.departure_time {
                        events.push(PassageEvent::Departed(departure));
                    }
                } else {
                    passage.last_seen = Some(sample.timestamp);
                }
            }
            PassageState::NotReached | PassageState::Departed => {}
        }
        events
    }
}

/// Time at which the runner crossed `station_mile`, interpolated between the
/// previous sample and this one.
fn interpolate_passing_time(station_mile: f64, sample: &PassageSample) -> DateTime<Utc> {
    let covered = sample.mile_mark - sample.previous_mile_mark;
    if covered <= 0.0 {
        return sample.timestamp;
    }
    let fraction = ((station_mile - sample.previous_mile_mark) / covered).clamp(0.0, 1.0);
    let interval = sample.timestamp - sample.previous_timestamp;
    let offset_ns = interval.num_nanoseconds().unwrap_or(0) as f64 * fraction;
    sample.previous_timestamp + TimeDelta::nanoseconds(offset_ns.round() as i64)
}
