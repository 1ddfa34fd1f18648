//! Shared test utilities for paddock-ingest integration tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use paddock_common::db::init_database;
use paddock_common::SourceKind;
use paddock_ingest::archive::RawArchive;
use paddock_ingest::clients::{FetchParams, RaceSelector, SourceClient};
use paddock_ingest::coordinator::{RunCoordinator, RunRequest};
use paddock_ingest::error::FetchError;
use paddock_ingest::upsert::UpsertWriter;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, SqlitePool};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Create a temporary database file with the schema applied
///
/// The TempDir must outlive the pool.
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let pool = init_database(&temp_dir.path().join("paddock.db"), Duration::from_secs(5)).await?;
    Ok((temp_dir, pool))
}

/// Like [`create_test_db`] but with a short busy timeout, for lock tests
pub async fn create_test_db_with_busy_timeout(timeout: Duration) -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let pool = init_database(&temp_dir.path().join("paddock.db"), timeout).await?;
    Ok((temp_dir, pool))
}

/// Take the write lock of the test database on a separate connection
///
/// Writers on other connections get busy errors until `COMMIT` is executed
/// on the returned connection.
pub async fn lock_database(dir: &TempDir) -> Result<SqliteConnection> {
    let mut conn = SqliteConnectOptions::new()
        .filename(dir.path().join("paddock.db"))
        .connect()
        .await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await?;
    Ok(conn)
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> Bytes {
    let path = fixture_path(name);
    Bytes::from(
        std::fs::read(&path).unwrap_or_else(|e| panic!("read fixture {}: {}", path.display(), e)),
    )
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn round(season: i32, round: i32) -> RaceSelector {
    RaceSelector::Round { season, round }
}

pub fn request(day: &str, sources: &[SourceKind], races: &[RaceSelector]) -> RunRequest {
    RunRequest {
        target_date: date(day),
        sources: sources.to_vec(),
        races: races.to_vec(),
        replay: false,
    }
}

type Responder = dyn Fn(SourceKind, &FetchParams) -> Result<Bytes, FetchError> + Send + Sync;

/// Source client whose answers are decided by a closure
///
/// Counts calls so tests can assert on how often the network was used.
pub struct ScriptedClient {
    responder: Box<Responder>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(SourceKind, RaceSelector)>>,
}

impl ScriptedClient {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(SourceKind, &FetchParams) -> Result<Bytes, FetchError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Serve the results fixture and the telemetry fixture
    pub fn fixtures() -> Arc<Self> {
        let results = fixture("results_2024_1.json");
        let telemetry = fixture("telemetry_2024_1.json");
        Self::new(move |kind, _| match kind {
            SourceKind::Results => Ok(results.clone()),
            SourceKind::Telemetry => Ok(telemetry.clone()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(SourceKind, RaceSelector)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceClient for ScriptedClient {
    async fn fetch(&self, kind: SourceKind, params: &FetchParams) -> Result<Bytes, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((kind, params.race));
        (self.responder)(kind, params)
    }
}

pub fn transient(message: &str) -> FetchError {
    FetchError::Transient {
        attempts: 3,
        message: message.to_string(),
    }
}

pub fn coordinator(
    client: Arc<dyn SourceClient>,
    archive: RawArchive,
    pool: &SqlitePool,
    workers: usize,
) -> RunCoordinator {
    RunCoordinator::new(client, archive, UpsertWriter::new(pool.clone()), workers)
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

/// (driver_ref, lap_number, lap_time_ms) of every stored lap, ordered
pub async fn lap_rows(pool: &SqlitePool) -> Vec<(String, i64, Option<i64>)> {
    sqlx::query_as(
        r#"
        SELECT d.driver_ref, l.lap_number, l.lap_time_ms
        FROM lap_times l JOIN drivers d ON d.id = l.driver_id
        ORDER BY d.driver_ref, l.lap_number
        "#,
    )
    .fetch_all(pool)
    .await
    .unwrap()
}

/// (fastest_lap_ms, fastest_lap_number, pit_stops) for one driver
pub async fn aggregation_for(pool: &SqlitePool, driver_ref: &str) -> Option<(Option<i64>, Option<i64>, i64)> {
    sqlx::query_as(
        r#"
        SELECT a.fastest_lap_ms, a.fastest_lap_number, a.pit_stops
        FROM aggregations a JOIN drivers d ON d.id = a.driver_id
        WHERE d.driver_ref = ?
        "#,
    )
    .bind(driver_ref)
    .fetch_optional(pool)
    .await
    .unwrap()
}
