//! # Course Structure
//!
//! The course is the route split into legs by aid stations. Every configured
//! station is resolved onto the route once, at load time, and the resolved
//! positions become the calibration anchors that map raw route distance onto
//! the organizer's mile marks.
//!
//! Start and Finish are virtual stations at the first and last route vertex.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::calibration::{CalibrationAnchor, CalibrationTable};
use crate::config::{AidStationConfig, RaceConfig, TrackerConfig};
use crate::error::{Result, TrackerError};
use crate::geo_utils::gmaps_url;
use crate::route::{Projection, Route, RoutePoint};
use crate::GpsPoint;

pub const START_NAME: &str = "Start";
pub const FINISH_NAME: &str = "Finish";

// ============================================================================
// Course Elements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationKind {
    Start,
    Aid,
    Finish,
}

/// An aid station resolved onto the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AidStation {
    pub name: String,
    pub kind: StationKind,
    /// Organizer's mile mark
    pub configured_mile_mark: f64,
    /// Surveyed position
    pub position: GpsPoint,
    pub comments: String,
    /// Raw route distance of the closest route point
    pub projected_mile_mark: f64,
    /// Distance between the surveyed position and the route (feet)
    pub projection_deviation_ft: f64,
    /// Route elevation at the station (feet)
    pub elevation: f64,
}

impl AidStation {
    pub fn display_name(&self) -> String {
        format!("{} (mile {})", self.name, self.configured_mile_mark)
    }

    pub fn gmaps_url(&self) -> String {
        gmaps_url(&self.position)
    }

    pub fn is_intermediate(&self) -> bool {
        self.kind == StationKind::Aid
    }
}

/// The stretch of course between two consecutive stations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    /// Index of the station the leg starts at
    pub from: usize,
    pub name: String,
    pub start_mile_mark: f64,
    pub end_mile_mark: f64,
    /// Configured distance in miles
    pub distance: f64,
    /// Elevation gain over the leg (feet)
    pub gain: f64,
    /// Elevation loss over the leg (feet)
    pub loss: f64,
}

impl Leg {
    /// Index of the station the leg ends at.
    pub fn to(&self) -> usize {
        self.from + 1
    }
}

/// A station or a leg, in course order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CourseElement<'a> {
    AidStation(&'a AidStation),
    Leg(&'a Leg),
}

impl CourseElement<'_> {
    /// Mile mark at which the element begins.
    pub fn mile_mark(&self) -> f64 {
        match self {
            CourseElement::AidStation(s) => s.configured_mile_mark,
            CourseElement::Leg(l) => l.start_mile_mark,
        }
    }

    pub fn end_mile_mark(&self) -> f64 {
        match self {
            CourseElement::AidStation(s) => s.configured_mile_mark,
            CourseElement::Leg(l) => l.end_mile_mark,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            CourseElement::AidStation(s) => s.display_name(),
            CourseElement::Leg(l) => l.name.clone(),
        }
    }
}

/// A position located on the course.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CourseProjection {
    /// Raw route distance
    pub raw_mile_mark: f64,
    /// Calibrated mile mark
    pub mile_mark: f64,
    pub deviation_ft: f64,
    /// Closest route point
    pub point: GpsPoint,
}

// ============================================================================
// Course
// ============================================================================

/// Immutable course: route, resolved stations, legs and calibration.
#[derive(Debug)]
pub struct Course {
    race_name: String,
    runner_name: String,
    start_time: DateTime<Utc>,
    route: Route,
    stations: Vec<AidStation>,
    legs: Vec<Leg>,
    calibration: CalibrationTable,
    fingerprint: String,
    pass_ambiguity_ft: f64,
}

impl Course {
    /// Resolve the configured aid stations onto the route and build legs and
    /// calibration anchors.
    pub fn build(route: Route, race: &RaceConfig, config: &TrackerConfig) -> Result<Self> {
        let length = route.length();
        let finish_mile = race
            .route_distance
            .unwrap_or_else(|| (length * 10.0).round() / 10.0);
        if !(finish_mile.is_finite() && finish_mile > 0.0) {
            return Err(TrackerError::InvalidMileMarks {
                message: format!("route distance must be positive, got {}", finish_mile),
            });
        }

        check_station_list(&race.aid_stations, finish_mile)?;

        let mut stations = Vec::with_capacity(race.aid_stations.len() + 2);
        stations.push(virtual_station(START_NAME, StationKind::Start, 0.0, route.start(), 0.0));
        stations.extend(resolve_stations(&route, &race.aid_stations, finish_mile, config)?);
        stations.push(virtual_station(
            FINISH_NAME,
            StationKind::Finish,
            finish_mile,
            route.finish(),
            length,
        ));

        let anchors = stations
            .iter()
            .map(|s| CalibrationAnchor::new(s.projected_mile_mark, s.configured_mile_mark))
            .collect();
        let calibration = CalibrationTable::new(anchors)?;

        let legs = build_legs(&route, &stations);
        let fingerprint = fingerprint(&stations);

        log::info!(
            "[Course] '{}' on '{}': {} stations, {} legs, {:.2} mi raw / {} mi configured, fingerprint {}",
            race.race_name,
            route.name(),
            stations.len(),
            legs.len(),
            length,
            finish_mile,
            &fingerprint[..12]
        );

        Ok(Self {
            race_name: race.race_name.clone(),
            runner_name: race.runner_name.clone(),
            start_time: race.start_time,
            route,
            stations,
            legs,
            calibration,
            fingerprint,
            pass_ambiguity_ft: config.pass_ambiguity_ft,
        })
    }

    pub fn race_name(&self) -> &str {
        &self.race_name
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Stations in course order, Start first and Finish last.
    pub fn stations(&self) -> &[AidStation] {
        &self.stations
    }

    pub fn station(&self, name: &str) -> Option<&AidStation> {
        self.stations.iter().find(|s| s.name == name)
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    /// SHA-256 of the ordered station names and configured mile marks.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Configured mile mark of the finish.
    pub fn finish_mile_mark(&self) -> f64 {
        self.stations[self.stations.len() - 1].configured_mile_mark
    }

    /// Stations and legs interleaved: each station precedes the leg starting at it.
    pub fn elements(&self) -> Vec<CourseElement<'_>> {
        let mut elements = Vec::with_capacity(self.stations.len() + self.legs.len());
        for (i, station) in self.stations.iter().enumerate() {
            elements.push(CourseElement::AidStation(station));
            if let Some(leg) = self.legs.get(i) {
                elements.push(CourseElement::Leg(leg));
            }
        }
        elements
    }

    /// Locate a position on the course.
    ///
    /// When the route passes near the position more than once, the pass whose
    /// calibrated mile mark is closest to `expected_mile_mark` wins; equal
    /// candidates go to the later pass.
    pub fn locate(&self, position: &GpsPoint, expected_mile_mark: Option<f64>) -> CourseProjection {
        let passes = self.route.project_passes(position, self.pass_ambiguity_ft);
        let chosen = match expected_mile_mark {
            Some(expected) if passes.len() > 1 => {
                log::debug!(
                    "[Course] {} passes near ({:.5}, {:.5}), expecting mile {:.2}",
                    passes.len(),
                    position.latitude,
                    position.longitude,
                    expected
                );
                passes.iter().fold(None::<&Projection>, |best, p| match best {
                    Some(b) if self.gap(b, expected) < self.gap(p, expected) => Some(b),
                    _ => Some(p),
                })
            }
            _ => passes
                .iter()
                .fold(None::<&Projection>, |best, p| match best {
                    Some(b) if b.deviation_ft < p.deviation_ft => Some(b),
                    _ => Some(p),
                }),
        };
        let projection = match chosen {
            Some(p) => *p,
            None => self.route.project(position),
        };
        CourseProjection {
            raw_mile_mark: projection.mile_mark,
            mile_mark: self.calibration.to_configured(projection.mile_mark),
            deviation_ft: projection.deviation_ft,
            point: projection.point,
        }
    }

    fn gap(&self, projection: &Projection, expected: f64) -> f64 {
        (self.calibration.to_configured(projection.mile_mark) - expected).abs()
    }

    /// Route point at a calibrated mile mark, clamped to the route.
    pub fn point_at(&self, mile_mark: f64) -> RoutePoint {
        self.route.point_at(self.calibration.to_raw(mile_mark))
    }
}

// ============================================================================
// Construction helpers
// ============================================================================

fn check_station_list(stations: &[AidStationConfig], finish_mile: f64) -> Result<()> {
    let mut seen: HashSet<&str> = [START_NAME, FINISH_NAME].into_iter().collect();
    for station in stations {
        if !seen.insert(station.name.as_str()) {
            return Err(TrackerError::DuplicateStation {
                name: station.name.clone(),
            });
        }
    }

    let mut previous = 0.0;
    for station in stations {
        let mile = station.mile_mark;
        if !(mile.is_finite() && mile > previous && mile < finish_mile) {
            return Err(TrackerError::InvalidMileMarks {
                message: format!(
                    "'{}' at mile {} must lie after mile {} and before the finish at {}",
                    station.name, mile, previous, finish_mile
                ),
            });
        }
        previous = mile;
    }
    Ok(())
}

fn virtual_station(
    name: &str,
    kind: StationKind,
    configured_mile_mark: f64,
    point: &RoutePoint,
    raw_mile: f64,
) -> AidStation {
    AidStation {
        name: name.to_string(),
        kind,
        configured_mile_mark,
        position: point.position(),
        comments: String::new(),
        projected_mile_mark: raw_mile,
        projection_deviation_ft: 0.0,
        elevation: point.elevation,
    }
}

#[cfg(feature = "parallel")]
fn resolve_stations(
    route: &Route,
    stations: &[AidStationConfig],
    finish_mile: f64,
    config: &TrackerConfig,
) -> Result<Vec<AidStation>> {
    stations
        .par_iter()
        .map(|s| resolve_station(route, s, finish_mile, config))
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn resolve_stations(
    route: &Route,
    stations: &[AidStationConfig],
    finish_mile: f64,
    config: &TrackerConfig,
) -> Result<Vec<AidStation>> {
    stations
        .iter()
        .map(|s| resolve_station(route, s, finish_mile, config))
        .collect()
}

/// Project one station onto the route.
///
/// The search is first restricted to a window around the raw distance implied
/// by the configured mile mark, so a station on a section the route covers
/// twice resolves to the right pass.
fn resolve_station(
    route: &Route,
    station: &AidStationConfig,
    finish_mile: f64,
    config: &TrackerConfig,
) -> Result<AidStation> {
    let position = station.position();
    if !position.is_valid() {
        return Err(TrackerError::InvalidCoordinates {
            name: station.name.clone(),
            message: format!("({}, {})", station.latitude, station.longitude),
        });
    }

    let length = route.length();
    let expected_raw = station.mile_mark * length / finish_mile;
    let window = (0.25 * length).max(1.0);
    let projection = match route.project_in_range(&position, expected_raw - window, expected_raw + window) {
        Some(p) if p.deviation_ft <= config.max_station_deviation_ft => p,
        _ => route.project(&position),
    };

    if projection.deviation_ft > config.max_station_deviation_ft {
        return Err(TrackerError::StationOffRoute {
            name: station.name.clone(),
            deviation_ft: projection.deviation_ft,
            maximum_ft: config.max_station_deviation_ft,
        });
    }

    log::debug!(
        "[Course] '{}' (mile {}) resolved at raw mile {:.3}, {:.1}ft off route",
        station.name,
        station.mile_mark,
        projection.mile_mark,
        projection.deviation_ft
    );

    Ok(AidStation {
        name: station.name.clone(),
        kind: StationKind::Aid,
        configured_mile_mark: station.mile_mark,
        position,
        comments: station.comments.clone(),
        projected_mile_mark: projection.mile_mark,
        projection_deviation_ft: projection.deviation_ft,
        elevation: route.point_at(projection.mile_mark).elevation,
    })
}

fn build_legs(route: &Route, stations: &[AidStation]) -> Vec<Leg> {
    stations
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let (a, b) = (&pair[0], &pair[1]);
            let (gain_a, loss_a) = route.elevation_change_at(a.projected_mile_mark);
            let (gain_b, loss_b) = route.elevation_change_at(b.projected_mile_mark);
            Leg {
                from: i,
                name: format!("{} ➤ {}", a.name, b.name),
                start_mile_mark: a.configured_mile_mark,
                end_mile_mark: b.configured_mile_mark,
                distance: b.configured_mile_mark - a.configured_mile_mark,
                gain: gain_b - gain_a,
                loss: loss_b - loss_a,
            }
        })
        .collect()
}

fn fingerprint(stations: &[AidStation]) -> String {
    let mut hasher = Sha256::new();
    for station in stations {
        hasher.update(format!("{}@{}\n", station.name, station.configured_mile_mark).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::route::tests::{degrees_per_mile, straight_survey};
    use crate::route::SurveyPoint;

    pub(crate) fn race_config(stations: Vec<AidStationConfig>, route_distance: Option<f64>) -> RaceConfig {
        RaceConfig {
            race_name: "Test 50".to_string(),
            start_time: "2024-06-01T11:00:00Z".parse().unwrap(),
            runner_name: "Runner".to_string(),
            route_name: "Route".to_string(),
            route_distance,
            aid_stations: stations,
        }
    }

    /// Station on the straight test route at a raw distance from the start.
    pub(crate) fn station_at(name: &str, configured: f64, raw_mile: f64) -> AidStationConfig {
        AidStationConfig {
            name: name.to_string(),
            mile_mark: configured,
            latitude: 40.0 + raw_mile * degrees_per_mile(),
            longitude: -105.0,
            comments: String::new(),
        }
    }

    /// The marathon course: AidA configured at 10 mi but surveyed at raw 10.4 mi
    /// on a 27 mi route, finish configured at 26.2 mi.
    pub(crate) fn marathon_course() -> Course {
        let config = TrackerConfig::default();
        let route = Route::from_points("Route", &straight_survey(27.0, 0.5), &config).unwrap();
        let race = race_config(vec![station_at("AidA", 10.0, 10.4)], Some(26.2));
        Course::build(route, &race, &config).unwrap()
    }

    #[test]
    fn test_build_marathon_course() {
        let course = marathon_course();
        let names: Vec<&str> = course.stations().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Start", "AidA", "Finish"]);
        assert!((course.stations()[1].projected_mile_mark - 10.4).abs() < 1e-6);
        assert!(course.stations()[1].projection_deviation_ft < 1.0);
        assert_eq!(course.finish_mile_mark(), 26.2);

        let legs = course.legs();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].name, "Start ➤ AidA");
        assert_eq!(legs[1].distance, 26.2 - 10.0);
        // Straight survey climbs 10 ft per raw mile
        assert!((legs[0].gain - 104.0).abs() < 0.5);
        assert!(legs[0].loss.abs() < 1e-9);
    }

    #[test]
    fn test_station_position_calibrates_to_configured_mile() {
        let course = marathon_course();
        let aid = &course.stations()[1];
        let located = course.locate(&aid.position, None);
        assert!((located.mile_mark - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_elements_interleave() {
        let course = marathon_course();
        let elements = course.elements();
        assert_eq!(elements.len(), 5);
        assert!(matches!(elements[0], CourseElement::AidStation(_)));
        assert!(matches!(elements[1], CourseElement::Leg(_)));
        assert_eq!(elements[2].display_name(), "AidA (mile 10)");
        assert_eq!(elements[3].mile_mark(), 10.0);
        assert_eq!(elements[3].end_mile_mark(), 26.2);
    }

    #[test]
    fn test_station_off_route_is_rejected() {
        let config = TrackerConfig::default();
        let route = Route::from_points("Route", &straight_survey(5.0, 0.5), &config).unwrap();
        let mut station = station_at("Far", 2.0, 2.0);
        station.longitude += 0.001; // roughly 280 ft east
        let err = Course::build(route, &race_config(vec![station], None), &config).unwrap_err();
        assert!(matches!(err, TrackerError::StationOffRoute { .. }));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_mile_mark_validation() {
        let config = TrackerConfig::default();
        let build = |stations| {
            let route = Route::from_points("Route", &straight_survey(5.0, 0.5), &config).unwrap();
            Course::build(route, &race_config(stations, None), &config)
        };

        let unordered = vec![station_at("A", 3.0, 3.0), station_at("B", 2.0, 2.0)];
        assert!(matches!(build(unordered), Err(TrackerError::InvalidMileMarks { .. })));

        let past_finish = vec![station_at("A", 6.0, 4.0)];
        assert!(matches!(build(past_finish), Err(TrackerError::InvalidMileMarks { .. })));

        let duplicate = vec![station_at("A", 1.0, 1.0), station_at("A", 2.0, 2.0)];
        assert!(matches!(build(duplicate), Err(TrackerError::DuplicateStation { .. })));

        // Configured order disagrees with surveyed order
        let crossed = vec![station_at("A", 1.0, 3.0), station_at("B", 2.0, 1.0)];
        assert!(build(crossed).is_err());
    }

    #[test]
    fn test_default_finish_is_rounded_length() {
        let config = TrackerConfig::default();
        let route = Route::from_points("Route", &straight_survey(5.04, 0.12), &config).unwrap();
        let course = Course::build(route, &race_config(vec![], None), &config).unwrap();
        assert_eq!(course.finish_mile_mark(), 5.0);
        assert_eq!(course.legs().len(), 1);
    }

    #[test]
    fn test_fingerprint_tracks_configuration() {
        let a = marathon_course();
        let b = marathon_course();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let config = TrackerConfig::default();
        let route = Route::from_points("Route", &straight_survey(27.0, 0.5), &config).unwrap();
        let race = race_config(vec![station_at("AidA", 10.5, 10.4)], Some(26.2));
        let moved = Course::build(route, &race, &config).unwrap();
        assert_ne!(a.fingerprint(), moved.fingerprint());
    }

    #[test]
    fn test_out_and_back_station_resolves_to_configured_pass() {
        let config = TrackerConfig::default();
        let mut raw = straight_survey(3.0, 0.25);
        let back: Vec<SurveyPoint> = raw.iter().rev().skip(1).copied().collect();
        raw.extend(back);
        let route = Route::from_points("Route", &raw, &config).unwrap();
        // Same spot, visited outbound at mile 1 and inbound at mile 5
        let stations = vec![station_at("Out", 1.0, 1.0), station_at("Back", 5.0, 1.0)];
        let course = Course::build(route, &race_config(stations, Some(6.0)), &config).unwrap();
        assert!((course.stations()[1].projected_mile_mark - 1.0).abs() < 1e-3);
        assert!((course.stations()[2].projected_mile_mark - 5.0).abs() < 1e-3);

        let spot = course.stations()[1].position;
        assert!((course.locate(&spot, Some(0.8)).mile_mark - 1.0).abs() < 1e-3);
        assert!((course.locate(&spot, Some(4.5)).mile_mark - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_point_at_inverts_calibration() {
        let course = marathon_course();
        let p = course.point_at(10.0);
        assert!((p.cumulative_distance - course.stations()[1].projected_mile_mark).abs() < 1e-9);
        assert!((course.point_at(5.0).cumulative_distance - 5.2).abs() < 1e-6);
    }
}
