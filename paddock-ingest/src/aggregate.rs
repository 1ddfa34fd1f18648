//! Per-driver, per-race statistics
//!
//! Aggregations are always recomputed from the full set of stored lap times
//! for their key and then replace the previous row; nothing is accumulated
//! incrementally.
//!
//! # Pit laps
//!
//! A lap carrying an explicit pit flag uses it. A lap without one counts as a
//! pit lap only when both hold:
//! - its lap time is at least [`PIT_LAP_TIME_FACTOR`] times the driver's
//!   median valid lap time in that race
//! - the driver lost at least [`PIT_POSITIONS_LOST`] places against the
//!   previous lap
//!
//! Lap 1, laps without a valid time and laps with no position on either side
//! are never counted by the heuristic.

use paddock_common::model::{Aggregation, DriverRaceKey, LapTime};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::debug;

use crate::error::PersistenceError;
use crate::upsert::UpsertWriter;

pub const PIT_LAP_TIME_FACTOR: f64 = 1.15;
pub const PIT_POSITIONS_LOST: i32 = 2;

fn valid_time(lap: &LapTime) -> Option<i64> {
    lap.lap_time_ms.filter(|ms| *ms > 0)
}

fn median(sorted: &[i64]) -> Option<f64> {
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[n / 2] as f64),
        n => Some((sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0),
    }
}

/// Compute the aggregation for one driver in one race from its lap times
pub fn compute_aggregation(key: &DriverRaceKey, laps: &[LapTime]) -> Aggregation {
    let mut valid: Vec<(i32, i64)> = laps
        .iter()
        .filter_map(|lap| valid_time(lap).map(|ms| (lap.lap_number, ms)))
        .collect();
    valid.sort_by_key(|(number, ms)| (*ms, *number));

    let fastest = valid.first().copied();
    let avg_lap_ms = if valid.is_empty() {
        None
    } else {
        Some(valid.iter().map(|(_, ms)| *ms as f64).sum::<f64>() / valid.len() as f64)
    };

    let sorted_times: Vec<i64> = valid.iter().map(|(_, ms)| *ms).collect();
    let median_ms = median(&sorted_times);

    let positions: HashMap<i32, i32> = laps
        .iter()
        .filter_map(|lap| lap.position.map(|p| (lap.lap_number, p)))
        .collect();

    let pit_stops = laps
        .iter()
        .filter(|lap| match lap.pit_flag {
            Some(flag) => flag,
            None => is_heuristic_pit_lap(lap, median_ms, &positions),
        })
        .count();

    Aggregation {
        race: key.race,
        driver_ref: key.driver_ref.clone(),
        lap_count: laps.len() as i64,
        valid_lap_count: valid.len() as i64,
        avg_lap_ms,
        fastest_lap_ms: fastest.map(|(_, ms)| ms),
        fastest_lap_number: fastest.map(|(number, _)| number),
        pit_stops: pit_stops as i64,
    }
}

fn is_heuristic_pit_lap(lap: &LapTime, median_ms: Option<f64>, positions: &HashMap<i32, i32>) -> bool {
    if lap.lap_number <= 1 {
        return false;
    }
    let (Some(ms), Some(median_ms)) = (valid_time(lap), median_ms) else {
        return false;
    };
    let (Some(now), Some(before)) = (lap.position, positions.get(&(lap.lap_number - 1))) else {
        return false;
    };

    ms as f64 >= PIT_LAP_TIME_FACTOR * median_ms
        && now.saturating_sub(*before) >= PIT_POSITIONS_LOST
}

/// Recomputes and stores aggregations
#[derive(Clone)]
pub struct Aggregator {
    pool: SqlitePool,
    writer: UpsertWriter,
}

impl Aggregator {
    pub fn new(writer: UpsertWriter) -> Self {
        Self {
            pool: writer.pool().clone(),
            writer,
        }
    }

    /// Rebuild the aggregation for `key` from its stored lap times
    pub async fn recompute(&self, key: &DriverRaceKey) -> Result<Aggregation, PersistenceError> {
        let laps = self.load_laps(key).await?;
        let aggregation = compute_aggregation(key, &laps);
        self.writer.upsert_aggregation(&aggregation).await?;

        debug!(
            race = %key.race,
            driver = %key.driver_ref,
            laps = aggregation.lap_count,
            pit_stops = aggregation.pit_stops,
            "Aggregation recomputed"
        );
        Ok(aggregation)
    }

    async fn load_laps(&self, key: &DriverRaceKey) -> Result<Vec<LapTime>, PersistenceError> {
        let rows: Vec<(i32, Option<i32>, Option<i64>, Option<bool>, String)> = sqlx::query_as(
            r#"
            SELECT l.lap_number, l.position, l.lap_time_ms, l.pit_flag, l.source_fingerprint
            FROM lap_times l
            JOIN races r ON r.id = l.race_id
            JOIN drivers d ON d.id = l.driver_id
            WHERE r.season = ? AND r.round = ? AND d.driver_ref = ?
            ORDER BY l.lap_number
            "#,
        )
        .bind(key.race.season)
        .bind(key.race.round)
        .bind(&key.driver_ref)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(lap_number, position, lap_time_ms, pit_flag, source_fingerprint)| LapTime {
                race: key.race,
                driver_ref: key.driver_ref.clone(),
                lap_number,
                position,
                lap_time_ms,
                pit_flag,
                source_fingerprint,
            })
            .collect())
    }
}
