//! Test utilities & fixtures.
//! Builds an engine over an in-memory backend and a manual clock, with the Freiburg
//! old-town points from `tests/fixtures/points.json`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use grenzwanderer::progression::{
    parse_point_seed, Coordinates, EngineSettings, Identity, InMemoryBackend, ManualClock,
    MapPoint, ProgressionEngine, SharedClock, Timestamp,
};

pub const DEVICE_ID: &str = "5d1e2a0c-7f43-4b8e-9a61-2c3d4e5f6a7b";

pub const CATHEDRAL: Coordinates = Coordinates::new(47.9955, 7.8522);
pub const SCHWABENTOR: Coordinates = Coordinates::new(47.9929, 7.8546);

pub fn fixture_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

pub fn freiburg_points() -> Vec<MapPoint> {
    let raw = std::fs::read_to_string(fixture_root().join("points.json")).expect("points fixture");
    parse_point_seed(&raw).expect("valid points fixture")
}

pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 9, 14, 10, 0, 0).unwrap()
}

pub struct Harness {
    pub clock: ManualClock,
    pub backend: InMemoryBackend,
    pub engine: ProgressionEngine,
}

pub fn harness() -> Harness {
    harness_with(EngineSettings::default())
}

pub fn harness_with(settings: EngineSettings) -> Harness {
    let clock = ManualClock::new(t0());
    let shared: SharedClock = Arc::new(clock.clone());
    let backend = InMemoryBackend::new(shared.clone()).with_points(freiburg_points());
    let engine = ProgressionEngine::new(
        Identity::anonymous(DEVICE_ID),
        Arc::new(backend.clone()),
        shared,
        settings,
    )
    .with_points(freiburg_points());
    Harness {
        clock,
        backend,
        engine,
    }
}
