//! Idempotent writes of canonical rows
//!
//! Every entity is written by natural key with `INSERT .. ON CONFLICT DO
//! UPDATE`, so applying the same batch any number of times leaves the same
//! rows behind. Descriptive columns are refined with `COALESCE`: a later
//! non-null value wins, a later null never erases. Lap times and positions
//! are replaced outright on their (race, driver, lap) key; a pit flag only
//! changes when the new row carries one.

use paddock_common::db::{begin_monitored, MonitoredTransaction};
use paddock_common::model::{Aggregation, Driver, DriverRaceKey, LapTime, Race, RaceKey, Team};
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::error::PersistenceError;
use crate::normalize::CanonicalBatch;

/// Rows written by one [`UpsertWriter::apply`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub teams: usize,
    pub races: usize,
    pub drivers: usize,
    pub lap_times: usize,
    /// (race, driver) pairs whose lap times changed or were confirmed
    pub touched: BTreeSet<DriverRaceKey>,
}

impl WriteSummary {
    pub fn rows(&self) -> usize {
        self.teams + self.races + self.drivers + self.lap_times
    }
}

/// Writes canonical batches and aggregations to the relational store
#[derive(Clone)]
pub struct UpsertWriter {
    pool: SqlitePool,
}

impl UpsertWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write a batch in one transaction: all rows or none
    pub async fn apply(&self, batch: &CanonicalBatch) -> Result<WriteSummary, PersistenceError> {
        let mut tx = begin_monitored(&self.pool, "upsert::apply").await?;

        match write_batch(&mut tx, batch).await {
            Ok(summary) => {
                tx.commit().await?;
                info!(
                    fingerprint = %batch.fingerprint,
                    teams = summary.teams,
                    races = summary.races,
                    drivers = summary.drivers,
                    lap_times = summary.lap_times,
                    "Batch committed"
                );
                Ok(summary)
            }
            Err(e) => {
                // Rollback failure is secondary; report the original error
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Replace the aggregation row for its (race, driver) key
    pub async fn upsert_aggregation(&self, agg: &Aggregation) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO aggregations (
                race_id, driver_id, lap_count, valid_lap_count, avg_lap_ms,
                fastest_lap_ms, fastest_lap_number, pit_stops
            )
            SELECT r.id, d.id, ?, ?, ?, ?, ?, ?
            FROM races r, drivers d
            WHERE r.season = ? AND r.round = ? AND d.driver_ref = ?
            ON CONFLICT(race_id, driver_id) DO UPDATE SET
                lap_count = excluded.lap_count,
                valid_lap_count = excluded.valid_lap_count,
                avg_lap_ms = excluded.avg_lap_ms,
                fastest_lap_ms = excluded.fastest_lap_ms,
                fastest_lap_number = excluded.fastest_lap_number,
                pit_stops = excluded.pit_stops
            "#,
        )
        .bind(agg.lap_count)
        .bind(agg.valid_lap_count)
        .bind(agg.avg_lap_ms)
        .bind(agg.fastest_lap_ms)
        .bind(agg.fastest_lap_number)
        .bind(agg.pit_stops)
        .bind(agg.race.season)
        .bind(agg.race.round)
        .bind(&agg.driver_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::MissingReference(format!(
                "aggregation for driver '{}' in race {} has no race or driver row",
                agg.driver_ref, agg.race
            )));
        }
        Ok(())
    }
}

async fn write_batch(
    tx: &mut MonitoredTransaction<'_>,
    batch: &CanonicalBatch,
) -> Result<WriteSummary, PersistenceError> {
    let mut summary = WriteSummary::default();

    let mut team_ids: HashMap<&str, i64> = HashMap::new();
    for team in &batch.teams {
        team_ids.insert(&team.team_ref, upsert_team(tx, team).await?);
        summary.teams += 1;
    }

    let mut race_ids: HashMap<RaceKey, i64> = HashMap::new();
    for race in &batch.races {
        race_ids.insert(race.key, upsert_race(tx, race).await?);
        summary.races += 1;
    }

    let mut driver_ids: HashMap<&str, i64> = HashMap::new();
    for driver in &batch.drivers {
        let team_id = match driver.team_ref.as_deref() {
            Some(team_ref) => Some(match team_ids.get(team_ref) {
                Some(id) => *id,
                None => lookup_team(tx, team_ref).await?,
            }),
            None => None,
        };
        driver_ids.insert(&driver.driver_ref, upsert_driver(tx, driver, team_id).await?);
        summary.drivers += 1;
    }

    for lap in &batch.lap_times {
        let race_id = match race_ids.get(&lap.race) {
            Some(id) => *id,
            None => {
                let id = lookup_race(tx, lap.race).await?;
                race_ids.insert(lap.race, id);
                id
            }
        };
        let driver_id = match driver_ids.get(lap.driver_ref.as_str()) {
            Some(id) => *id,
            None => {
                let id = lookup_driver(tx, &lap.driver_ref).await?;
                driver_ids.insert(&lap.driver_ref, id);
                id
            }
        };

        upsert_lap_time(tx, lap, race_id, driver_id).await?;
        summary.lap_times += 1;
        summary.touched.insert(DriverRaceKey {
            race: lap.race,
            driver_ref: lap.driver_ref.clone(),
        });
    }

    Ok(summary)
}

async fn upsert_team(tx: &mut MonitoredTransaction<'_>, team: &Team) -> Result<i64, PersistenceError> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO teams (team_ref, name, nationality)
        VALUES (?, ?, ?)
        ON CONFLICT(team_ref) DO UPDATE SET
            name = COALESCE(excluded.name, teams.name),
            nationality = COALESCE(excluded.nationality, teams.nationality)
        RETURNING id
        "#,
    )
    .bind(&team.team_ref)
    .bind(&team.name)
    .bind(&team.nationality)
    .fetch_one(tx.conn())
    .await?;

    Ok(id)
}

async fn upsert_race(tx: &mut MonitoredTransaction<'_>, race: &Race) -> Result<i64, PersistenceError> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO races (season, round, race_name, circuit_name, date, locality, country)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(season, round) DO UPDATE SET
            race_name = COALESCE(excluded.race_name, races.race_name),
            circuit_name = COALESCE(excluded.circuit_name, races.circuit_name),
            date = COALESCE(excluded.date, races.date),
            locality = COALESCE(excluded.locality, races.locality),
            country = COALESCE(excluded.country, races.country)
        RETURNING id
        "#,
    )
    .bind(race.key.season)
    .bind(race.key.round)
    .bind(&race.race_name)
    .bind(&race.circuit_name)
    .bind(&race.date)
    .bind(&race.locality)
    .bind(&race.country)
    .fetch_one(tx.conn())
    .await?;

    Ok(id)
}

async fn upsert_driver(
    tx: &mut MonitoredTransaction<'_>,
    driver: &Driver,
    team_id: Option<i64>,
) -> Result<i64, PersistenceError> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO drivers (
            driver_ref, given_name, family_name, code, permanent_number,
            nationality, date_of_birth, team_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(driver_ref) DO UPDATE SET
            given_name = COALESCE(excluded.given_name, drivers.given_name),
            family_name = COALESCE(excluded.family_name, drivers.family_name),
            code = COALESCE(excluded.code, drivers.code),
            permanent_number = COALESCE(excluded.permanent_number, drivers.permanent_number),
            nationality = COALESCE(excluded.nationality, drivers.nationality),
            date_of_birth = COALESCE(excluded.date_of_birth, drivers.date_of_birth),
            team_id = COALESCE(excluded.team_id, drivers.team_id)
        RETURNING id
        "#,
    )
    .bind(&driver.driver_ref)
    .bind(&driver.given_name)
    .bind(&driver.family_name)
    .bind(&driver.code)
    .bind(driver.permanent_number)
    .bind(&driver.nationality)
    .bind(&driver.date_of_birth)
    .bind(team_id)
    .fetch_one(tx.conn())
    .await?;

    Ok(id)
}

async fn upsert_lap_time(
    tx: &mut MonitoredTransaction<'_>,
    lap: &LapTime,
    race_id: i64,
    driver_id: i64,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO lap_times (
            race_id, driver_id, lap_number, position, lap_time_ms, pit_flag, source_fingerprint
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(race_id, driver_id, lap_number) DO UPDATE SET
            position = excluded.position,
            lap_time_ms = excluded.lap_time_ms,
            pit_flag = COALESCE(excluded.pit_flag, lap_times.pit_flag),
            source_fingerprint = excluded.source_fingerprint
        "#,
    )
    .bind(race_id)
    .bind(driver_id)
    .bind(lap.lap_number)
    .bind(lap.position)
    .bind(lap.lap_time_ms)
    .bind(lap.pit_flag)
    .bind(&lap.source_fingerprint)
    .execute(tx.conn())
    .await?;

    Ok(())
}

async fn lookup_team(tx: &mut MonitoredTransaction<'_>, team_ref: &str) -> Result<i64, PersistenceError> {
    sqlx::query_scalar("SELECT id FROM teams WHERE team_ref = ?")
        .bind(team_ref)
        .fetch_optional(tx.conn())
        .await?
        .ok_or_else(|| PersistenceError::MissingReference(format!("team '{}'", team_ref)))
}

async fn lookup_race(tx: &mut MonitoredTransaction<'_>, key: RaceKey) -> Result<i64, PersistenceError> {
    sqlx::query_scalar("SELECT id FROM races WHERE season = ? AND round = ?")
        .bind(key.season)
        .bind(key.round)
        .fetch_optional(tx.conn())
        .await?
        .ok_or_else(|| PersistenceError::MissingReference(format!("race {}", key)))
}

async fn lookup_driver(
    tx: &mut MonitoredTransaction<'_>,
    driver_ref: &str,
) -> Result<i64, PersistenceError> {
    sqlx::query_scalar("SELECT id FROM drivers WHERE driver_ref = ?")
        .bind(driver_ref)
        .fetch_optional(tx.conn())
        .await?
        .ok_or_else(|| PersistenceError::MissingReference(format!("driver '{}'", driver_ref)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use paddock_common::db::init_memory_database;

    fn race_key() -> RaceKey {
        RaceKey { season: 2024, round: 1 }
    }

    fn lap(number: i32, ms: i64, fingerprint: &str) -> LapTime {
        LapTime {
            race: race_key(),
            driver_ref: "hamilton".to_string(),
            lap_number: number,
            position: Some(5),
            lap_time_ms: Some(ms),
            pit_flag: None,
            source_fingerprint: fingerprint.to_string(),
        }
    }

    fn batch(laps: Vec<LapTime>) -> CanonicalBatch {
        let mut driver = Driver::bare("hamilton");
        driver.code = Some("HAM".to_string());
        driver.team_ref = Some("mercedes".to_string());

        CanonicalBatch {
            fingerprint: "fp".to_string(),
            teams: vec![Team {
                team_ref: "mercedes".to_string(),
                name: Some("Mercedes".to_string()),
                nationality: None,
            }],
            drivers: vec![driver],
            races: vec![Race::bare(race_key())],
            lap_times: laps,
            dropped: vec![],
        }
    }

    async fn dump(pool: &SqlitePool) -> Vec<(i64, i64, i64, Option<i64>, Option<i64>, String)> {
        sqlx::query_as(
            "SELECT race_id, driver_id, lap_number, position, lap_time_ms, source_fingerprint
             FROM lap_times ORDER BY lap_number",
        )
        .fetch_all(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_twice_leaves_identical_rows() {
        let pool = init_memory_database().await.unwrap();
        let writer = UpsertWriter::new(pool.clone());
        let b = batch(vec![lap(1, 95_000, "fp"), lap(2, 91_000, "fp")]);

        let first = writer.apply(&b).await.unwrap();
        let rows_after_first = dump(&pool).await;
        let second = writer.apply(&b).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(dump(&pool).await, rows_after_first);
        assert_eq!(rows_after_first.len(), 2);

        let teams: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(teams, 1);
        assert_eq!(
            first.touched.into_iter().collect::<Vec<_>>(),
            vec![DriverRaceKey {
                race: race_key(),
                driver_ref: "hamilton".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_corrected_lap_time_replaces_previous_value() {
        let pool = init_memory_database().await.unwrap();
        let writer = UpsertWriter::new(pool.clone());

        writer.apply(&batch(vec![lap(3, 91_234, "first")])).await.unwrap();
        writer.apply(&batch(vec![lap(3, 90_500, "second")])).await.unwrap();

        let rows = dump(&pool).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].4, Some(90_500));
        assert_eq!(rows[0].5, "second");
    }

    #[tokio::test]
    async fn test_lap_without_pit_flag_keeps_known_flag() {
        let pool = init_memory_database().await.unwrap();
        let writer = UpsertWriter::new(pool.clone());

        let mut from_telemetry = lap(4, 118_402, "telemetry");
        from_telemetry.pit_flag = Some(true);
        writer.apply(&batch(vec![from_telemetry])).await.unwrap();
        writer.apply(&batch(vec![lap(4, 118_400, "results")])).await.unwrap();

        let (ms, pit): (Option<i64>, Option<bool>) =
            sqlx::query_as("SELECT lap_time_ms, pit_flag FROM lap_times WHERE lap_number = 4")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(ms, Some(118_400));
        assert_eq!(pit, Some(true));

        let mut cleared = lap(4, 118_400, "telemetry-v2");
        cleared.pit_flag = Some(false);
        writer.apply(&batch(vec![cleared])).await.unwrap();
        let pit: Option<bool> = sqlx::query_scalar("SELECT pit_flag FROM lap_times")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(pit, Some(false));
    }

    #[tokio::test]
    async fn test_null_attributes_never_erase_known_values() {
        let pool = init_memory_database().await.unwrap();
        let writer = UpsertWriter::new(pool.clone());
        writer.apply(&batch(vec![])).await.unwrap();

        let sparse = CanonicalBatch {
            fingerprint: "fp2".to_string(),
            drivers: vec![Driver::bare("hamilton")],
            ..Default::default()
        };
        writer.apply(&sparse).await.unwrap();

        let (code, team): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT d.code, t.team_ref FROM drivers d LEFT JOIN teams t ON t.id = d.team_id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(code.as_deref(), Some("HAM"));
        assert_eq!(team.as_deref(), Some("mercedes"));
    }

    #[tokio::test]
    async fn test_unknown_reference_rolls_back_whole_batch() {
        let pool = init_memory_database().await.unwrap();
        let writer = UpsertWriter::new(pool.clone());

        let mut stray = lap(1, 90_000, "fp");
        stray.driver_ref = "ghost".to_string();
        let err = writer.apply(&batch(vec![lap(2, 91_000, "fp"), stray])).await.unwrap_err();
        assert!(matches!(err, PersistenceError::MissingReference(_)));
        assert!(!err.is_transient());

        let laps: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lap_times")
            .fetch_one(&pool)
            .await
            .unwrap();
        let teams: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM teams")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((laps, teams), (0, 0));
    }

    #[tokio::test]
    async fn test_upsert_aggregation_replaces_row() {
        let pool = init_memory_database().await.unwrap();
        let writer = UpsertWriter::new(pool.clone());
        writer.apply(&batch(vec![lap(1, 95_000, "fp")])).await.unwrap();

        let mut agg = Aggregation {
            race: race_key(),
            driver_ref: "hamilton".to_string(),
            lap_count: 1,
            valid_lap_count: 1,
            avg_lap_ms: Some(95_000.0),
            fastest_lap_ms: Some(95_000),
            fastest_lap_number: Some(1),
            pit_stops: 0,
        };
        writer.upsert_aggregation(&agg).await.unwrap();
        agg.lap_count = 2;
        writer.upsert_aggregation(&agg).await.unwrap();

        let counts: Vec<i64> = sqlx::query_scalar("SELECT lap_count FROM aggregations")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(counts, vec![2]);

        agg.driver_ref = "nobody".to_string();
        assert!(matches!(
            writer.upsert_aggregation(&agg).await,
            Err(PersistenceError::MissingReference(_))
        ));
    }
}
