//! # Pace & ETA Estimation
//!
//! Paces are minutes per mile over calibrated distance. Arrival estimates
//! extrapolate the average moving pace from the last ping and add an average
//! stop for every aid station still ahead of the runner.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::course::{Course, Leg, StationKind};
use crate::state::RunnerState;

/// Presentation band for the runner's distance from the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationBand {
    OnCourse,
    MinorDeviation,
    MajorDeviation,
}

impl DeviationBand {
    pub fn classify(deviation_ft: f64, config: &TrackerConfig) -> Self {
        if deviation_ft < config.minor_deviation_ft {
            DeviationBand::OnCourse
        } else if deviation_ft <= config.major_deviation_ft {
            DeviationBand::MinorDeviation
        } else {
            DeviationBand::MajorDeviation
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviationBand::OnCourse => "on course",
            DeviationBand::MinorDeviation => "minor deviation",
            DeviationBand::MajorDeviation => "major deviation",
        }
    }
}

/// Convert fractional minutes to a duration.
pub fn minutes(value: f64) -> TimeDelta {
    if !value.is_finite() || value <= 0.0 {
        return TimeDelta::zero();
    }
    TimeDelta::nanoseconds((value * 60e9).round() as i64)
}

fn as_minutes(delta: TimeDelta) -> f64 {
    delta.num_nanoseconds().map(|n| n as f64 / 60e9).unwrap_or(0.0)
}

/// Derived timing over a course and a runner state.
pub struct PaceEstimator<'a> {
    course: &'a Course,
    state: &'a RunnerState,
    config: &'a TrackerConfig,
}

impl<'a> PaceEstimator<'a> {
    pub fn new(course: &'a Course, state: &'a RunnerState, config: &'a TrackerConfig) -> Self {
        Self {
            course,
            state,
            config,
        }
    }

    /// The runner is past the start area.
    pub fn started(&self) -> bool {
        self.state.mile_mark() > self.config.started_threshold_miles
    }

    pub fn finished(&self) -> bool {
        self.state.finished()
    }

    pub fn in_progress(&self) -> bool {
        self.started() && !self.finished()
    }

    /// Moving time per calibrated mile.
    pub fn average_moving_pace(&self) -> f64 {
        self.pace_over(self.state.moving_time())
    }

    /// Elapsed time per calibrated mile.
    pub fn average_overall_pace(&self) -> f64 {
        self.pace_over(self.state.elapsed_time())
    }

    fn pace_over(&self, duration: TimeDelta) -> f64 {
        let mile = self.state.mile_mark();
        let pace = as_minutes(duration) / mile;
        if !self.started() || !pace.is_finite() || pace <= 0.0 {
            return self.config.default_pace_min_per_mile;
        }
        pace
    }

    /// Pace between the last two pings, when the runner moved forward.
    pub fn current_pace(&self) -> Option<f64> {
        let last = self.state.last_ping()?;
        let previous = self.state.previous_ping()?;
        let miles = last.mile_mark - previous.mile_mark;
        if miles <= 0.0 {
            return None;
        }
        Some(as_minutes(last.timestamp - previous.timestamp) / miles)
    }

    /// Mile mark expected from elapsed time at the overall pace.
    pub fn expected_mile_mark(&self, at: DateTime<Utc>) -> f64 {
        let elapsed = as_minutes(at - self.state.start_time()).max(0.0);
        elapsed / self.average_overall_pace()
    }

    /// Mean stop at the intermediate stations the runner has left.
    pub fn average_stoppage_time(&self) -> TimeDelta {
        let departed: Vec<_> = self
            .course
            .stations()
            .iter()
            .zip(self.state.passages())
            .filter(|(s, p)| s.is_intermediate() && p.is_departed())
            .map(|(_, p)| p.stoppage_time())
            .collect();
        if departed.is_empty() {
            return TimeDelta::zero();
        }
        departed.iter().fold(TimeDelta::zero(), |acc, d| acc + *d) / departed.len() as i32
    }

    /// Remaining stop expected at one station.
    fn stop_allowance(&self, station: usize, average: TimeDelta) -> TimeDelta {
        let passage = match self.state.passage(station) {
            Some(p) => p,
            None => return TimeDelta::zero(),
        };
        if passage.is_departed() {
            return TimeDelta::zero();
        }
        if passage.is_at_station() {
            return (average - passage.stoppage_time()).max(TimeDelta::zero());
        }
        average
    }

    /// Estimated arrival at a station the runner has not reached yet.
    pub fn estimated_arrival(&self, station: usize) -> Option<DateTime<Utc>> {
        let target = self.course.stations().get(station)?;
        if self.state.passage(station)?.is_reached() {
            return None;
        }
        let current = self.state.mile_mark();
        let average = self.average_stoppage_time();
        let stops = self
            .course
            .stations()
            .iter()
            .enumerate()
            .take(station)
            .filter(|(_, s)| s.is_intermediate() && s.configured_mile_mark > current - self.config.passage_tolerance_miles)
            .fold(TimeDelta::zero(), |acc, (i, _)| acc + self.stop_allowance(i, average));
        let remaining = (target.configured_mile_mark - current).max(0.0);
        Some(self.state.clock() + minutes(remaining * self.average_moving_pace()) + stops)
    }

    /// Estimated departure from a station the runner has not left yet.
    pub fn estimated_departure(&self, station: usize) -> Option<DateTime<Utc>> {
        let target = self.course.stations().get(station)?;
        let passage = self.state.passage(station)?;
        if passage.is_departed() {
            return None;
        }
        let stop = match target.kind {
            StationKind::Aid => self.average_stoppage_time(),
            _ => TimeDelta::zero(),
        };
        if passage.is_at_station() {
            let arrival = passage.arrival_time?;
            return Some((arrival + stop).max(self.state.clock()));
        }
        Some(self.estimated_arrival(station)? + stop)
    }

    pub fn estimated_finish(&self) -> Option<DateTime<Utc>> {
        let finish = self.course.stations().len().checked_sub(1)?;
        match self.state.passage(finish)?.arrival_time {
            Some(arrival) => Some(arrival),
            None => self.estimated_arrival(finish),
        }
    }

    /// Estimated duration of the leg at the average moving pace.
    pub fn estimated_leg_duration(&self, leg: &Leg) -> TimeDelta {
        minutes(leg.distance * self.average_moving_pace())
    }

    pub fn deviation_band(&self) -> DeviationBand {
        DeviationBand::classify(self.state.deviation_ft(), self.config)
    }
}
