//! Replay a recorded ping stream through the tracking engine.
//!
//! ```text
//! race-replay <race.json> <route.json> <pings.jsonl> [snapshot_dir]
//! ```
//!
//! Pings are read one JSON object per line. With a snapshot directory the
//! runner state is restored first and saved after every accepted ping. The
//! final dashboard is printed as JSON.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::process::ExitCode;

use race_tracker::{
    Course, IngestError, PingInput, RaceConfig, RaceEngine, Route, RouteSurvey, SnapshotStore, TrackerConfig,
    TrackerError,
};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 || args.len() > 5 {
        eprintln!("usage: race-replay <race.json> <route.json> <pings.jsonl> [snapshot_dir]");
        return ExitCode::from(2);
    }

    match run(&args[1], &args[2], &args[3], args.get(4).map(String::as_str)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[Replay] {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(race_path: &str, route_path: &str, pings_path: &str, snapshot_dir: Option<&str>) -> Result<(), TrackerError> {
    let config = TrackerConfig::default();
    let race = RaceConfig::load(race_path)?;
    let survey = load_survey(route_path)?;

    let mut engine = match snapshot_dir {
        Some(dir) => {
            let route = Route::from_survey(&survey, &config)?;
            let course = Course::build(route, &race, &config)?;
            let store = SnapshotStore::in_dir(dir, &race.race_name, config.snapshot_format);
            RaceEngine::open(course, config, store)?
        }
        None => RaceEngine::from_config(&race, &survey, config)?,
    };

    let file = File::open(pings_path).map_err(|e| TrackerError::Config {
        message: format!("cannot read {}: {}", pings_path, e),
    })?;

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| TrackerError::Config {
            message: format!("{}:{}: {}", pings_path, line_no + 1, e),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let input: PingInput = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                log::warn!("[Replay] skipping {}:{}: {}", pings_path, line_no + 1, e);
                rejected += 1;
                continue;
            }
        };
        match engine.ingest(input) {
            Ok(result) => {
                accepted += 1;
                for event in result.events {
                    log::info!("[Replay] {}: {:?}", event.station, event.event);
                }
            }
            Err(IngestError::Rejected(_)) => rejected += 1,
            Err(IngestError::NotPersisted(e)) => return Err(e),
        }
    }
    log::info!("[Replay] {} pings accepted, {} rejected", accepted, rejected);

    let dashboard = serde_json::to_string_pretty(&engine.dashboard()).map_err(|e| TrackerError::Persistence {
        message: format!("cannot encode dashboard: {}", e),
    })?;
    println!("{}", dashboard);
    Ok(())
}

fn load_survey(path: &str) -> Result<RouteSurvey, TrackerError> {
    let data = std::fs::read_to_string(path).map_err(|e| TrackerError::Config {
        message: format!("cannot read {}: {}", path, e),
    })?;
    serde_json::from_str(&data).map_err(|e| TrackerError::Config {
        message: format!("invalid route {}: {}", path, e),
    })
}
