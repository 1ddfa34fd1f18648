//! Database schema migrations
//!
//! Versioned, idempotent schema migrations tracked in `schema_version`.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - databases in the field already ran them
//! 2. **Always add new migrations** - one function per schema change
//! 3. **Keep them idempotent** - `IF NOT EXISTS` everywhere, safe to re-run
//!
//! The canonical tables deliberately have no wall-clock columns: applying the
//! same batch twice must leave byte-identical rows.

use crate::Result;
use sqlx::SqlitePool;
use tracing::{info, warn};

/// Current schema version
///
/// **IMPORTANT:** Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)")
        .execute(pool)
        .await?;

    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    if current_version < 2 {
        migrate_v2(pool).await?;
        set_schema_version(pool, 2).await?;
        info!("Migration v2 completed");
    }

    Ok(())
}

/// Migration v1: canonical race tables and aggregations
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v1: teams, drivers, races, lap_times, aggregations");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id INTEGER PRIMARY KEY,
            team_ref TEXT NOT NULL UNIQUE,
            name TEXT,
            nationality TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS drivers (
            id INTEGER PRIMARY KEY,
            driver_ref TEXT NOT NULL UNIQUE,
            given_name TEXT,
            family_name TEXT,
            code TEXT,
            permanent_number INTEGER,
            nationality TEXT,
            date_of_birth TEXT,
            team_id INTEGER REFERENCES teams(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS races (
            id INTEGER PRIMARY KEY,
            season INTEGER NOT NULL,
            round INTEGER NOT NULL,
            race_name TEXT,
            circuit_name TEXT,
            date TEXT,
            locality TEXT,
            country TEXT,
            UNIQUE (season, round)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS lap_times (
            id INTEGER PRIMARY KEY,
            race_id INTEGER NOT NULL REFERENCES races(id),
            driver_id INTEGER NOT NULL REFERENCES drivers(id),
            lap_number INTEGER NOT NULL CHECK (lap_number > 0),
            position INTEGER,
            lap_time_ms INTEGER,
            pit_flag INTEGER CHECK (pit_flag IN (0, 1)),
            source_fingerprint TEXT NOT NULL,
            UNIQUE (race_id, driver_id, lap_number)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS aggregations (
            id INTEGER PRIMARY KEY,
            race_id INTEGER NOT NULL REFERENCES races(id),
            driver_id INTEGER NOT NULL REFERENCES drivers(id),
            lap_count INTEGER NOT NULL,
            valid_lap_count INTEGER NOT NULL,
            avg_lap_ms REAL,
            fastest_lap_ms INTEGER,
            fastest_lap_number INTEGER,
            pit_stops INTEGER NOT NULL,
            UNIQUE (race_id, driver_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_lap_times_race_driver ON lap_times (race_id, driver_id)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}

/// Migration v2: telemetry samples table
///
/// Reserved for decoded car telemetry; nothing writes it yet.
async fn migrate_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration v2: telemetry");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry (
            id INTEGER PRIMARY KEY,
            race_id INTEGER NOT NULL REFERENCES races(id),
            driver_id INTEGER NOT NULL REFERENCES drivers(id),
            lap_number INTEGER,
            sample_time_ms INTEGER NOT NULL,
            payload TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
