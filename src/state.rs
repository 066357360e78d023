//! # Runner State
//!
//! The mutable aggregate owned by the engine: accepted pings, per-station
//! passages and the moving/stoppage split of elapsed time.
//!
//! Elapsed time is divided ping interval by ping interval. An interval counts
//! as stoppage when, after the ping that closes it, the runner is held at an
//! aid station they had already reached by the ping that opened it; every
//! other interval is moving. Durations are integer nanoseconds, so moving plus
//! stoppage always equals elapsed.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::course::{Course, Leg};
use crate::passage::{PassageDetector, PassageEvent, PassageSample, StationPassage};

/// An accepted ping with its derived course position. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in feet
    pub elevation: f64,
    /// Raw route distance of the projection
    pub raw_mile_mark: f64,
    /// Calibrated mile mark
    pub mile_mark: f64,
    pub deviation_ft: f64,
}

/// Observed timing of one leg, derived from the bounding stations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegTiming {
    /// Departure from the leg's first station
    pub arrival_time: Option<DateTime<Utc>>,
    /// Arrival at the leg's last station
    pub departure_time: Option<DateTime<Utc>>,
}

impl LegTiming {
    pub fn transit_time(&self) -> Option<TimeDelta> {
        match (self.arrival_time, self.departure_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Serde adapter storing a `TimeDelta` as integer nanoseconds.
pub(crate) mod nanos {
    use chrono::TimeDelta;
    use serde::{de, ser, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = value
            .num_nanoseconds()
            .ok_or_else(|| ser::Error::custom("duration out of range"))?;
        serializer.serialize_i64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        if nanos < 0 {
            return Err(de::Error::custom("negative duration"));
        }
        Ok(TimeDelta::nanoseconds(nanos))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerState {
    start_time: DateTime<Utc>,
    pings: Vec<Ping>,
    /// One per course station, in course order
    passages: Vec<StationPassage>,
    #[serde(with = "nanos")]
    moving_time: TimeDelta,
    #[serde(with = "nanos")]
    stoppage_time: TimeDelta,
}

impl RunnerState {
    /// Empty state at race start.
    pub fn new(course: &Course, detector: &PassageDetector) -> Self {
        let start_time = course.start_time();
        Self {
            start_time,
            pings: Vec::new(),
            passages: course
                .stations()
                .iter()
                .map(|s| detector.initial(s, start_time))
                .collect(),
            moving_time: TimeDelta::zero(),
            stoppage_time: TimeDelta::zero(),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn pings(&self) -> &[Ping] {
        &self.pings
    }

    pub fn ping_count(&self) -> usize {
        self.pings.len()
    }

    pub fn last_ping(&self) -> Option<&Ping> {
        self.pings.last()
    }

    /// The ping before the last one.
    pub fn previous_ping(&self) -> Option<&Ping> {
        self.pings.len().checked_sub(2).map(|i| &self.pings[i])
    }

    /// Timestamp of the last accepted ping.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_ping().map(|p| p.timestamp)
    }

    /// Last ping time, or the race start before any ping.
    pub fn clock(&self) -> DateTime<Utc> {
        self.last_update().unwrap_or(self.start_time)
    }

    pub fn mile_mark(&self) -> f64 {
        self.last_ping().map(|p| p.mile_mark).unwrap_or(0.0)
    }

    pub fn deviation_ft(&self) -> f64 {
        self.last_ping().map(|p| p.deviation_ft).unwrap_or(0.0)
    }

    pub fn passages(&self) -> &[StationPassage] {
        &self.passages
    }

    pub fn passage(&self, station: usize) -> Option<&StationPassage> {
        self.passages.get(station)
    }

    pub fn elapsed_time(&self) -> TimeDelta {
        self.clock() - self.start_time
    }

    pub fn moving_time(&self) -> TimeDelta {
        self.moving_time
    }

    pub fn stoppage_time(&self) -> TimeDelta {
        self.stoppage_time
    }

    /// The finish line has been reached.
    pub fn finished(&self) -> bool {
        self.passages.last().map(|p| p.is_reached()).unwrap_or(false)
    }

    /// Whether the state was built for a course with this many stations.
    pub(crate) fn matches_station_count(&self, count: usize) -> bool {
        self.passages.len() == count
    }

    /// Observed timing of a leg.
    pub fn leg_timing(&self, leg: &Leg) -> LegTiming {
        LegTiming {
            arrival_time: self.passages.get(leg.from).and_then(|p| p.departure_time),
            departure_time: self.passages.get(leg.to()).and_then(|p| p.reached_at()),
        }
    }

    /// Apply one accepted ping. The caller has already validated ordering.
    pub fn record(
        &mut self,
        ping: Ping,
        course: &Course,
        detector: &PassageDetector,
    ) -> Vec<(usize, PassageEvent)> {
        let (previous_timestamp, previous_mile_mark) = self
            .last_ping()
            .map(|p| (p.timestamp, p.mile_mark))
            .unwrap_or((self.start_time, 0.0));
        let sample = PassageSample {
            timestamp: ping.timestamp,
            mile_mark: ping.mile_mark,
            deviation_ft: ping.deviation_ft,
            previous_timestamp,
            previous_mile_mark,
        };

        let mut events = Vec::new();
        for (i, (station, passage)) in course.stations().iter().zip(self.passages.iter_mut()).enumerate() {
            events.extend(
                detector
                    .advance(station, passage, &sample)
                    .into_iter()
                    .map(|e| (i, e)),
            );
        }

        // A confirmed arrival reaches back to its first pending ping; those
        // intervals were counted as moving when they were recorded.
        for (i, event) in &events {
            if let PassageEvent::Arrived(at) = event {
                if course.stations()[*i].is_intermediate() && *at < previous_timestamp {
                    let backdated = (previous_timestamp - *at).min(self.moving_time);
                    self.moving_time -= backdated;
                    self.stoppage_time += backdated;
                }
            }
        }

        let held = course
            .stations()
            .iter()
            .zip(&self.passages)
            .any(|(station, passage)| {
                station.is_intermediate()
                    && passage.is_at_station()
                    && passage.arrival_time.map(|a| a <= previous_timestamp).unwrap_or(false)
            });
        let interval = ping.timestamp - previous_timestamp;
        if held {
            self.stoppage_time += interval;
        } else {
            self.moving_time += interval;
        }

        self.pings.push(ping);
        events
    }
}
