//! # Read-only views
//!
//! Serializable snapshots of the race for the dashboard and map-marker
//! collaborators. Views are assembled under the engine's read lock and own
//! all their data.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::course::{AidStation, Course, CourseElement, Leg};
use crate::geo_utils::FEET_PER_MILE;
use crate::pace::{minutes, DeviationBand, PaceEstimator};
use crate::passage::PassageState;
use crate::state::RunnerState;
use crate::GpsPoint;

// ============================================================================
// Formatting
// ============================================================================

/// Format a duration as `H:MM'SS"`.
pub fn format_duration(duration: TimeDelta) -> String {
    let total = duration.num_seconds().max(0);
    format!("{}:{:02}'{:02}\"", total / 3600, (total % 3600) / 60, total % 60)
}

/// Format a pace in minutes per mile as `M'SS"`.
pub fn format_pace(pace_min_per_mile: f64) -> String {
    if !pace_min_per_mile.is_finite() || pace_min_per_mile <= 0.0 {
        return "-'--\"".to_string();
    }
    let total = (pace_min_per_mile * 60.0) as i64;
    format!("{}'{:02}\"", total / 60, total % 60)
}

/// Format a distance in feet, switching to miles from one mile up.
pub fn format_distance(distance_ft: f64) -> String {
    if distance_ft >= FEET_PER_MILE {
        format!("{:.1} mi", distance_ft / FEET_PER_MILE)
    } else {
        format!("{:.1} ft", distance_ft)
    }
}

// ============================================================================
// Dashboard
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationView {
    pub name: String,
    pub display_name: String,
    pub mile_mark: f64,
    pub elevation: f64,
    pub comments: String,
    pub gmaps_url: String,
    pub state: PassageState,
    pub bypassed: bool,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub estimated_arrival_time: Option<DateTime<Utc>>,
    pub estimated_departure_time: Option<DateTime<Utc>>,
    pub stoppage_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegView {
    pub name: String,
    pub start_mile_mark: f64,
    pub end_mile_mark: f64,
    pub distance: f64,
    pub gain: f64,
    pub loss: f64,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub estimated_arrival_time: Option<DateTime<Utc>>,
    pub estimated_departure_time: Option<DateTime<Utc>>,
    /// Observed transit time once the leg is done, estimate otherwise
    pub duration: String,
    pub duration_is_estimate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CourseElementView {
    AidStation(StationView),
    Leg(LegView),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardView {
    pub race_name: String,
    pub runner_name: String,
    pub start_time: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub ping_count: usize,
    pub started: bool,
    pub finished: bool,
    pub in_progress: bool,
    pub mile_mark: f64,
    pub elevation: f64,
    pub elapsed_time: String,
    pub moving_time: String,
    pub stoppage_time: String,
    pub average_moving_pace: String,
    pub average_overall_pace: String,
    pub current_pace: Option<String>,
    pub estimated_finish_date: Option<DateTime<Utc>>,
    pub estimated_finish_time: Option<String>,
    pub course_deviation: String,
    pub deviation_band: DeviationBand,
    pub course_distance: f64,
    pub course_gain: f64,
    pub course_loss: f64,
    pub elements: Vec<CourseElementView>,
}

impl DashboardView {
    pub fn build(course: &Course, state: &RunnerState, config: &TrackerConfig) -> Self {
        let estimator = PaceEstimator::new(course, state, config);
        let estimated_finish_date = estimator.estimated_finish();

        // Stations appear in course order among the elements
        let mut station_index = 0;
        let elements = course
            .elements()
            .into_iter()
            .map(|element| match element {
                CourseElement::AidStation(station) => {
                    let view = station_view(station_index, station, state, &estimator);
                    station_index += 1;
                    CourseElementView::AidStation(view)
                }
                CourseElement::Leg(leg) => CourseElementView::Leg(leg_view(leg, state, &estimator)),
            })
            .collect();

        Self {
            race_name: course.race_name().to_string(),
            runner_name: course.runner_name().to_string(),
            start_time: course.start_time(),
            last_update: state.last_update(),
            ping_count: state.ping_count(),
            started: estimator.started(),
            finished: estimator.finished(),
            in_progress: estimator.in_progress(),
            mile_mark: (state.mile_mark() * 100.0).round() / 100.0,
            elevation: state.last_ping().map(|p| p.elevation).unwrap_or(0.0),
            elapsed_time: format_duration(state.elapsed_time()),
            moving_time: format_duration(state.moving_time()),
            stoppage_time: format_duration(state.stoppage_time()),
            average_moving_pace: format_pace(estimator.average_moving_pace()),
            average_overall_pace: format_pace(estimator.average_overall_pace()),
            current_pace: estimator.current_pace().map(format_pace),
            estimated_finish_date,
            estimated_finish_time: estimated_finish_date
                .map(|at| format_duration(at - course.start_time())),
            course_deviation: format_distance(state.deviation_ft()),
            deviation_band: estimator.deviation_band(),
            course_distance: course.finish_mile_mark(),
            course_gain: course.route().gain(),
            course_loss: course.route().loss(),
            elements,
        }
    }
}

fn station_view(
    index: usize,
    station: &AidStation,
    state: &RunnerState,
    estimator: &PaceEstimator<'_>,
) -> StationView {
    let passage = state.passage(index).cloned().unwrap_or_default();
    StationView {
        name: station.name.clone(),
        display_name: station.display_name(),
        mile_mark: station.configured_mile_mark,
        elevation: station.elevation,
        comments: station.comments.clone(),
        gmaps_url: station.gmaps_url(),
        state: passage.state,
        bypassed: passage.bypassed,
        arrival_time: passage.arrival_time,
        departure_time: passage.departure_time,
        estimated_arrival_time: estimator.estimated_arrival(index),
        estimated_departure_time: estimator.estimated_departure(index),
        stoppage_time: format_duration(passage.stoppage_time()),
    }
}

fn leg_view(leg: &Leg, state: &RunnerState, estimator: &PaceEstimator<'_>) -> LegView {
    let timing = state.leg_timing(leg);
    let (duration, duration_is_estimate) = match timing.transit_time() {
        Some(observed) => (observed, false),
        None => (estimator.estimated_leg_duration(leg), true),
    };
    LegView {
        name: leg.name.clone(),
        start_mile_mark: leg.start_mile_mark,
        end_mile_mark: leg.end_mile_mark,
        distance: leg.distance,
        gain: leg.gain.round(),
        loss: leg.loss.round(),
        arrival_time: timing.arrival_time,
        departure_time: timing.departure_time,
        estimated_arrival_time: estimator.estimated_departure(leg.from),
        estimated_departure_time: estimator.estimated_arrival(leg.to()),
        duration: format_duration(duration),
        duration_is_estimate,
    }
}

// ============================================================================
// Map marker
// ============================================================================

/// Positions for the map collaborator after an accepted ping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerUpdate {
    pub timestamp: DateTime<Utc>,
    pub mile_mark: f64,
    /// Raw ping position
    pub position: GpsPoint,
    /// On-course position at the calibrated mile mark
    pub snapped: GpsPoint,
    /// Where the runner should be after the look-ahead at the moving pace
    pub estimated: GpsPoint,
    pub estimated_mile_mark: f64,
    pub estimated_at: DateTime<Utc>,
}

impl MarkerUpdate {
    /// `None` before the first ping.
    pub fn build(course: &Course, state: &RunnerState, config: &TrackerConfig) -> Option<Self> {
        let ping = state.last_ping()?;
        let estimator = PaceEstimator::new(course, state, config);

        let lookahead = config.marker_lookahead_minutes.max(0.0);
        let estimated_mile_mark = if state.finished() {
            course.finish_mile_mark()
        } else {
            (ping.mile_mark + lookahead / estimator.average_moving_pace())
                .min(course.finish_mile_mark())
        };

        Some(Self {
            timestamp: ping.timestamp,
            mile_mark: ping.mile_mark,
            position: GpsPoint::new(ping.latitude, ping.longitude),
            snapped: course.point_at(ping.mile_mark).position(),
            estimated: course.point_at(estimated_mile_mark).position(),
            estimated_mile_mark,
            estimated_at: ping.timestamp + minutes(lookahead),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(TimeDelta::seconds(0)), "0:00'00\"");
        assert_eq!(format_duration(TimeDelta::seconds(3 * 3600 + 5 * 60 + 9)), "3:05'09\"");
        assert_eq!(format_duration(TimeDelta::hours(27)), "27:00'00\"");
    }

    #[test]
    fn test_format_pace() {
        assert_eq!(format_pace(10.0), "10'00\"");
        assert_eq!(format_pace(9.5), "9'30\"");
        assert_eq!(format_pace(f64::INFINITY), "-'--\"");
    }

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance(42.0), "42.0 ft");
        assert_eq!(format_distance(7920.0), "1.5 mi");
    }

    #[test]
    fn test_element_view_is_tagged() {
        let view = CourseElementView::Leg(LegView {
            name: "Start ➤ AidA".to_string(),
            start_mile_mark: 0.0,
            end_mile_mark: 10.0,
            distance: 10.0,
            gain: 100.0,
            loss: 0.0,
            arrival_time: None,
            departure_time: None,
            estimated_arrival_time: None,
            estimated_departure_time: None,
            duration: "1:40'00\"".to_string(),
            duration_is_estimate: true,
        });
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["type"], "leg");
        assert_eq!(json["name"], "Start ➤ AidA");
    }
}
