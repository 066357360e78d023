//! End-to-end race scenarios through the public engine API.

use chrono::{DateTime, TimeDelta, Utc};
use race_tracker::{
    AidStationConfig, Course, IngestError, PassageState, PingInput, PingRejection, RaceConfig,
    RaceEngine, Route, SharedEngine, SnapshotFormat, SnapshotStore, SurveyPoint, TrackerConfig,
    TrackerError,
};
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Degrees of latitude per mile along a meridian.
fn degrees_per_mile() -> f64 {
    (5280.0 / 3.280839895 / 6_371_000.0_f64).to_degrees()
}

fn latitude_at(raw_mile: f64) -> f64 {
    40.0 + raw_mile * degrees_per_mile()
}

fn t(minutes: i64) -> DateTime<Utc> {
    "2024-06-01T11:00:00Z".parse::<DateTime<Utc>>().unwrap() + TimeDelta::minutes(minutes)
}

fn ping(minute: i64, raw_mile: f64) -> PingInput {
    PingInput {
        timestamp: t(minute),
        latitude: latitude_at(raw_mile),
        longitude: -105.0,
        elevation_meters: 1524.0,
    }
}

fn station(name: &str, configured: f64, raw_mile: f64) -> AidStationConfig {
    AidStationConfig {
        name: name.to_string(),
        mile_mark: configured,
        latitude: latitude_at(raw_mile),
        longitude: -105.0,
        comments: String::new(),
    }
}

fn race(stations: Vec<AidStationConfig>, route_distance: f64) -> RaceConfig {
    RaceConfig {
        race_name: "Valley Marathon".to_string(),
        start_time: t(0),
        runner_name: "Runner".to_string(),
        route_name: "Valley".to_string(),
        route_distance: Some(route_distance),
        aid_stations: stations,
    }
}

fn survey(raw_miles: impl IntoIterator<Item = f64>) -> Vec<SurveyPoint> {
    raw_miles
        .into_iter()
        .map(|m| SurveyPoint::new(latitude_at(m), -105.0, 5000.0 + 10.0 * m))
        .collect()
}

/// 27 mi straight route north; AidA at raw 10.4 mi is configured at mile 10.
fn marathon(aid_mile: f64) -> Course {
    let config = TrackerConfig::default();
    let points = survey((0..=54).map(|i| i as f64 * 0.5));
    let route = Route::from_points("Valley", &points, &config).unwrap();
    Course::build(route, &race(vec![station("AidA", aid_mile, 10.4)], 26.2), &config).unwrap()
}

fn engine() -> RaceEngine {
    RaceEngine::new(marathon(10.0), TrackerConfig::default()).unwrap()
}

#[test]
fn test_stop_at_aid_station_counts_as_stoppage() {
    init_logging();
    let mut engine = engine();

    engine.ingest(ping(60, 6.24)).unwrap();
    engine.ingest(ping(100, 10.4)).unwrap();
    let accepted = engine.ingest(ping(105, 10.4)).unwrap();
    assert!(accepted.events.iter().any(|e| e.station == "AidA"));
    assert_eq!(engine.state().passage(1).unwrap().state, PassageState::AtStation);
    assert_eq!(engine.state().passage(1).unwrap().arrival_time, Some(t(100)));

    engine.ingest(ping(112, 11.0)).unwrap();
    let aid = engine.state().passage(1).unwrap();
    assert_eq!(aid.state, PassageState::Departed);
    assert_eq!(aid.departure_time, Some(t(105)));
    assert_eq!(aid.stoppage_time(), TimeDelta::minutes(5));

    assert_eq!(engine.state().stoppage_time(), TimeDelta::minutes(5));
    assert_eq!(engine.state().moving_time(), TimeDelta::minutes(107));
    assert_eq!(engine.estimator().average_stoppage_time(), TimeDelta::minutes(5));
    assert_eq!(engine.course().station("AidA").unwrap().display_name(), "AidA (mile 10)");
}

#[test]
fn test_time_split_always_adds_up() {
    init_logging();
    let mut engine = engine();
    let samples = [
        (10, 1.0),
        (50, 5.0),
        (98, 10.2),
        (101, 10.4),
        (104, 10.41),
        (109, 10.39),
        (118, 11.5),
        (200, 19.0),
        (280, 27.0),
    ];
    for (minute, raw) in samples {
        engine.ingest(ping(minute, raw)).unwrap();
        let state = engine.state();
        assert_eq!(state.moving_time() + state.stoppage_time(), state.elapsed_time());
    }
    assert!(engine.state().finished());
    assert_eq!(engine.state().stoppage_time(), TimeDelta::minutes(8));
}

#[test]
fn test_bad_pings_leave_state_untouched() {
    init_logging();
    let mut engine = engine();
    engine.ingest(ping(30, 3.0)).unwrap();
    let before = engine.state().clone();

    let err = engine.ingest(ping(25, 2.5)).unwrap_err();
    assert_eq!(err.rejection(), Some(PingRejection::OutOfOrder));
    assert_eq!(err.to_string(), "ping rejected: out-of-order timestamp");

    let err = engine.ingest(ping(30, 3.0)).unwrap_err();
    assert_eq!(err.rejection(), Some(PingRejection::DuplicateTimestamp));

    assert_eq!(engine.state(), &before);
    assert!(engine.ingest(ping(31, 3.1)).is_ok());
}

#[test]
fn test_bypassed_station_gets_interpolated_times() {
    init_logging();
    let mut engine = engine();
    engine.ingest(ping(90, 9.36)).unwrap();
    engine.ingest(ping(110, 11.44)).unwrap();

    let aid = engine.state().passage(1).unwrap();
    assert_eq!(aid.state, PassageState::Departed);
    assert!(aid.bypassed);
    assert_eq!(aid.arrival_time, None);
    let passed = aid.departure_time.unwrap();
    assert!((passed - t(100)).num_seconds().abs() <= 30);
    assert_eq!(engine.state().stoppage_time(), TimeDelta::zero());
}

#[test]
fn test_out_and_back_uses_expected_progress() {
    init_logging();
    let config = TrackerConfig::default();
    let mut points = survey((0..=10).map(|i| i as f64 * 0.5));
    points.extend(survey((0..10).rev().map(|i| i as f64 * 0.5)));
    let route = Route::from_points("Out and back", &points, &config).unwrap();
    let stations = vec![station("Out", 2.0, 2.0), station("Back", 8.0, 2.0)];
    let course = Course::build(route, &race(stations, 10.0), &config).unwrap();
    assert!((course.stations()[2].projected_mile_mark - 8.0).abs() < 0.01);

    let mut engine = RaceEngine::new(course, config).unwrap();
    // Positions are given as raw distance along the outbound leg
    let first = engine.ingest(ping(20, 2.0)).unwrap();
    assert!((first.ping.mile_mark - 2.0).abs() < 0.01);
    engine.ingest(ping(22, 2.0)).unwrap();
    engine.ingest(ping(40, 4.0)).unwrap();
    engine.ingest(ping(50, 5.0)).unwrap();

    // Same spot as mile 4 on the way out
    let returning = engine.ingest(ping(60, 4.0)).unwrap();
    assert!((returning.ping.mile_mark - 6.0).abs() < 0.01);

    engine.ingest(ping(80, 2.0)).unwrap();
    engine.ingest(ping(82, 2.0)).unwrap();
    let back = engine.state().passage(2).unwrap();
    assert_eq!(back.state, PassageState::AtStation);
    assert_eq!(back.arrival_time, Some(t(80)));
    assert_eq!(engine.state().passage(1).unwrap().departure_time, Some(t(22)));
}

#[test]
fn test_restart_restores_without_replay() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = TrackerConfig {
        snapshot_format: SnapshotFormat::MessagePack,
        ..TrackerConfig::default()
    };
    let store = SnapshotStore::in_dir(dir.path(), "Valley Marathon", config.snapshot_format);

    let saved = {
        let mut engine = RaceEngine::open(marathon(10.0), config.clone(), store.clone()).unwrap();
        engine.ingest(ping(100, 10.4)).unwrap();
        engine.ingest(ping(104, 10.4)).unwrap();
        engine.state().clone()
    };
    assert!(store.exists());

    let mut engine = RaceEngine::open(marathon(10.0), config, store).unwrap();
    assert_eq!(engine.state(), &saved);
    assert_eq!(engine.state().passage(1).unwrap().state, PassageState::AtStation);

    assert_eq!(
        engine.ingest(ping(102, 10.4)).unwrap_err().rejection(),
        Some(PingRejection::OutOfOrder)
    );
    engine.ingest(ping(110, 11.0)).unwrap();
    assert_eq!(engine.state().stoppage_time(), TimeDelta::minutes(4));
}

#[test]
fn test_changed_course_refuses_old_snapshot() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = TrackerConfig::default();
    let store = SnapshotStore::in_dir(dir.path(), "Valley Marathon", config.snapshot_format);

    let mut engine = RaceEngine::open(marathon(10.0), config.clone(), store.clone()).unwrap();
    engine.ingest(ping(30, 3.0)).unwrap();

    let err = RaceEngine::open(marathon(10.1), config, store).err().unwrap();
    assert!(matches!(err, TrackerError::FingerprintMismatch { .. }));
    assert!(err.is_configuration_error());
}

#[test]
fn test_failed_snapshot_write_keeps_ping() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = TrackerConfig::default();
    let store = SnapshotStore::new(dir.path().join("gone").join("race.json"), SnapshotFormat::Json);
    let mut engine = RaceEngine::open(marathon(10.0), config, store).unwrap();

    let err = engine.ingest(ping(30, 3.0)).unwrap_err();
    assert!(matches!(err, IngestError::NotPersisted(TrackerError::Persistence { .. })));
    assert_eq!(err.rejection(), None);
    assert_eq!(engine.state().ping_count(), 1);

    std::fs::create_dir(dir.path().join("gone")).unwrap();
    engine.ingest(ping(40, 4.0)).unwrap();
    assert_eq!(engine.store().unwrap().load().unwrap().unwrap().state.ping_count(), 2);
}

#[test]
fn test_dashboard_reads_during_ingestion() {
    init_logging();
    let shared = SharedEngine::new(engine());
    let writer = shared.clone();

    let handle = std::thread::spawn(move || {
        for i in 1..=50 {
            writer.ingest(ping(i * 2, i as f64 * 0.2)).unwrap();
        }
    });

    let mut seen = 0;
    while seen < 50 {
        let view = shared.dashboard();
        assert!(view.ping_count >= seen);
        assert_eq!(view.elements.len(), 5);
        seen = view.ping_count;
        std::thread::yield_now();
    }
    handle.join().unwrap();

    let view = shared.dashboard();
    assert!(view.started);
    assert!(view.in_progress);
    assert_eq!(view.ping_count, 50);
    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["elements"][0]["type"], "aid_station");
    assert_eq!(json["elements"][0]["state"], "departed");
}
