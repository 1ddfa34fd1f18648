//! Instrumented transactions
//!
//! Logs how long a caller waited for a pooled connection and how long it held
//! the transaction, so lock contention on the SQLite file shows up in logs.

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::Instant;

const SLOW_ACQUIRE_MS: u128 = 1000;
const LONG_HOLD_MS: u128 = 2000;

/// Logs hold time once, on whichever of commit/rollback/drop comes first
struct HoldTimer {
    caller: &'static str,
    acquired_at: Instant,
    released: bool,
}

impl HoldTimer {
    fn release(&mut self, how: &'static str) {
        self.released = true;
        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > LONG_HOLD_MS {
            tracing::warn!(
                caller = self.caller,
                held_ms = held_ms,
                how,
                "Long transaction; connection held for an extended period"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms = held_ms, how, "Connection released");
        }
    }
}

impl Drop for HoldTimer {
    fn drop(&mut self) {
        if !self.released {
            // Dropped without commit: sqlx rolls back
            self.release("drop");
        }
    }
}

/// Transaction wrapper that logs acquisition and hold timing
pub struct MonitoredTransaction<'c> {
    tx: Transaction<'c, Sqlite>,
    timer: HoldTimer,
}

impl<'c> MonitoredTransaction<'c> {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        let Self { tx, mut timer } = self;
        tx.commit().await?;
        timer.release("commit");
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        let Self { tx, mut timer } = self;
        tx.rollback().await?;
        timer.release("rollback");
        Ok(())
    }

    /// Connection to run statements on
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

/// Begin a transaction, logging how long the pool made us wait
pub async fn begin_monitored<'c>(
    pool: &'c SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>, sqlx::Error> {
    let start = Instant::now();
    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > SLOW_ACQUIRE_MS {
        tracing::warn!(
            caller,
            wait_ms = wait_ms,
            "Slow connection acquisition; pool may be saturated"
        );
    } else {
        tracing::debug!(caller, wait_ms = wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx,
        timer: HoldTimer {
            caller,
            acquired_at: Instant::now(),
            released: false,
        },
    })
}
