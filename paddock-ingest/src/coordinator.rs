//! Run coordination
//!
//! One run takes a [`RunRequest`], expands it into independent units of work
//! and drives each unit through fetch → archive → normalize → upsert on a
//! bounded worker pool. Once every unit has finished, aggregations are
//! recomputed for the (race, driver) keys the run touched.
//!
//! A failed unit is recorded and the run carries on. The exception is a
//! configuration-level failure (rejected credentials, unconfigured provider):
//! no other unit can succeed past it, so units not yet started are cancelled
//! and the run ends with [`RunError::Configuration`]. Keys written by units
//! that finished before the abort are still aggregated.

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use paddock_common::model::DriverRaceKey;
use paddock_common::SourceKind;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::Aggregator;
use crate::archive::{RawArchive, RawRecord};
use crate::clients::{FetchParams, RaceSelector, SourceClient};
use crate::error::{ErrorClass, RunError, UnitError};
use crate::normalize::normalize;
use crate::upsert::{UpsertWriter, WriteSummary};

/// Delay before the single retry of a transient persistence failure
const PERSISTENCE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Run-level progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Fetching,
    Archiving,
    Normalizing,
    Aggregating,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Archiving => "archiving",
            RunState::Normalizing => "normalizing",
            RunState::Aggregating => "aggregating",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Recorded state change
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub old_state: RunState,
    pub new_state: RunState,
    pub transitioned_at: DateTime<Utc>,
}

/// What one invocation should do
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Date partition raw payloads are archived under (or replayed from)
    pub target_date: NaiveDate,
    pub sources: Vec<SourceKind>,
    /// Races to fetch; empty means the latest race
    pub races: Vec<RaceSelector>,
    /// Re-normalize archived payloads for `target_date` instead of fetching
    pub replay: bool,
}

/// One independent unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Fetch { kind: SourceKind, race: RaceSelector },
    Replay { kind: SourceKind, location: String },
}

impl Unit {
    pub fn kind(&self) -> SourceKind {
        match self {
            Unit::Fetch { kind, .. } | Unit::Replay { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Fetch { kind, race } => write!(f, "fetch {} {}", kind, race),
            Unit::Replay { location, .. } => write!(f, "replay {}", location),
        }
    }
}

/// Furthest stage a unit reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStage {
    Pending,
    Fetch,
    Archive,
    Normalize,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Succeeded,
    Failed { class: ErrorClass, message: String },
    /// Never started because the run was cancelled or aborted
    Cancelled,
}

/// Result of one unit
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: Unit,
    pub stage: UnitStage,
    pub status: UnitStatus,
    /// Payload came off the network in this run
    pub fetched: bool,
    /// `Some(true)` newly archived, `Some(false)` duplicate of an archived payload
    pub archived_new: Option<bool>,
    pub rows_normalized: usize,
    pub rows_dropped: usize,
    pub touched: BTreeSet<DriverRaceKey>,
}

impl UnitOutcome {
    fn new(unit: Unit) -> Self {
        Self {
            unit,
            stage: UnitStage::Pending,
            status: UnitStatus::Cancelled,
            fetched: false,
            archived_new: None,
            rows_normalized: 0,
            rows_dropped: 0,
            touched: BTreeSet::new(),
        }
    }
}

/// Totals of a finished run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: RunState,
    pub transitions: Vec<StateTransition>,
    pub units_attempted: usize,
    pub units_succeeded: usize,
    pub units_failed: usize,
    pub units_cancelled: usize,
    pub payloads_fetched: usize,
    pub payloads_archived: usize,
    pub payloads_duplicate: usize,
    pub rows_normalized: usize,
    pub rows_dropped: usize,
    pub aggregations_recomputed: usize,
    pub errors_by_class: BTreeMap<ErrorClass, usize>,
    pub elapsed: Duration,
    pub outcomes: Vec<UnitOutcome>,
}

impl RunSummary {
    fn from_outcomes(outcomes: Vec<UnitOutcome>) -> Self {
        let mut summary = Self {
            state: RunState::Idle,
            transitions: Vec::new(),
            units_attempted: 0,
            units_succeeded: 0,
            units_failed: 0,
            units_cancelled: 0,
            payloads_fetched: 0,
            payloads_archived: 0,
            payloads_duplicate: 0,
            rows_normalized: 0,
            rows_dropped: 0,
            aggregations_recomputed: 0,
            errors_by_class: BTreeMap::new(),
            elapsed: Duration::ZERO,
            outcomes: Vec::new(),
        };

        for outcome in &outcomes {
            match &outcome.status {
                UnitStatus::Succeeded => summary.units_succeeded += 1,
                UnitStatus::Failed { class, .. } => {
                    summary.units_failed += 1;
                    *summary.errors_by_class.entry(*class).or_insert(0) += 1;
                }
                UnitStatus::Cancelled => summary.units_cancelled += 1,
            }
            if outcome.fetched {
                summary.payloads_fetched += 1;
            }
            match outcome.archived_new {
                Some(true) => summary.payloads_archived += 1,
                Some(false) => summary.payloads_duplicate += 1,
                None => {}
            }
            summary.rows_normalized += outcome.rows_normalized;
            summary.rows_dropped += outcome.rows_dropped;
        }
        summary.units_attempted = summary.units_succeeded + summary.units_failed;
        summary.outcomes = outcomes;
        summary
    }
}

/// Monotonic run-level state shared by concurrently running units
struct Progress {
    state: RunState,
    transitions: Vec<StateTransition>,
}

impl Progress {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            transitions: Vec::new(),
        }
    }

    /// Move forward to `new_state`; never moves backwards
    fn advance(&mut self, new_state: RunState) {
        if new_state <= self.state || self.state.is_terminal() {
            return;
        }
        info!(from = %self.state, to = %new_state, "Run state changed");
        self.transitions.push(StateTransition {
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        });
        self.state = new_state;
    }

    /// Enter a terminal state, skipping any intermediate ones
    fn finish(&mut self, new_state: RunState) {
        if self.state.is_terminal() {
            return;
        }
        self.advance(new_state);
    }
}

type SharedProgress = Arc<Mutex<Progress>>;

fn advance(progress: &SharedProgress, state: RunState) {
    if let Ok(mut p) = progress.lock() {
        p.advance(state);
    }
}

/// Drives pipeline runs
pub struct RunCoordinator {
    client: Arc<dyn SourceClient>,
    archive: RawArchive,
    writer: UpsertWriter,
    aggregator: Aggregator,
    workers: usize,
}

impl RunCoordinator {
    pub fn new(
        client: Arc<dyn SourceClient>,
        archive: RawArchive,
        writer: UpsertWriter,
        workers: usize,
    ) -> Self {
        Self {
            client,
            archive,
            aggregator: Aggregator::new(writer.clone()),
            writer,
            workers: workers.max(1),
        }
    }

    /// Execute one run
    ///
    /// Cancelling `cancel` stops units that have not started yet; units in
    /// flight finish (their transactions commit or roll back).
    pub async fn run(
        &self,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        let progress: SharedProgress = Arc::new(Mutex::new(Progress::new()));

        if request.sources.is_empty() {
            return Err(RunError::Configuration("no source kinds requested".to_string()));
        }

        let units = self.plan(request).await?;
        info!(
            date = %request.target_date,
            units = units.len(),
            replay = request.replay,
            workers = self.workers,
            "Starting run"
        );

        // Aborting on a configuration failure must not cancel the caller's token
        let abort = cancel.child_token();
        let config_failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let outcomes: Vec<UnitOutcome> = stream::iter(units)
            .map(|unit| {
                let abort = abort.clone();
                let progress = Arc::clone(&progress);
                let config_failure = Arc::clone(&config_failure);
                async move {
                    if abort.is_cancelled() {
                        return UnitOutcome::new(unit);
                    }
                    let outcome = self.process_unit(unit, request.target_date, &progress).await;
                    if let UnitStatus::Failed {
                        class: ErrorClass::Configuration,
                        message,
                    } = &outcome.status
                    {
                        error!(unit = %outcome.unit, error = %message, "Configuration failure; aborting run");
                        if let Ok(mut slot) = config_failure.lock() {
                            slot.get_or_insert_with(|| message.clone());
                        }
                        abort.cancel();
                    }
                    outcome
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut summary = RunSummary::from_outcomes(outcomes);
        let aborted = config_failure.lock().ok().and_then(|slot| slot.clone());

        // Units that committed before an abort still get their aggregations
        advance(&progress, RunState::Aggregating);
        self.aggregate(&mut summary).await;

        let final_state = if aborted.is_some() || cancel.is_cancelled() {
            RunState::Failed
        } else if summary.units_attempted > 0 && summary.units_succeeded == 0 {
            RunState::Failed
        } else {
            RunState::Done
        };

        if let Ok(mut p) = progress.lock() {
            p.finish(final_state);
            summary.state = p.state;
            summary.transitions = p.transitions.clone();
        }
        summary.elapsed = started.elapsed();

        log_summary(&summary);
        crate::metrics::record_run(&summary);

        match aborted {
            Some(message) => Err(RunError::Configuration(message)),
            None => Ok(summary),
        }
    }

    /// Expand a request into units
    async fn plan(&self, request: &RunRequest) -> Result<Vec<Unit>, RunError> {
        let mut units = Vec::new();

        if request.replay {
            for kind in &request.sources {
                for location in self.archive.list(request.target_date, *kind).await? {
                    units.push(Unit::Replay {
                        kind: *kind,
                        location,
                    });
                }
            }
            if units.is_empty() {
                warn!(date = %request.target_date, "Nothing archived for replay date");
            }
        } else {
            let races = if request.races.is_empty() {
                vec![RaceSelector::Latest]
            } else {
                request.races.clone()
            };
            for kind in &request.sources {
                for race in &races {
                    units.push(Unit::Fetch {
                        kind: *kind,
                        race: *race,
                    });
                }
            }
        }

        Ok(units)
    }

    async fn process_unit(
        &self,
        unit: Unit,
        date: NaiveDate,
        progress: &SharedProgress,
    ) -> UnitOutcome {
        let mut outcome = UnitOutcome::new(unit.clone());

        match self.run_unit(&unit, date, progress, &mut outcome).await {
            Ok(written) => {
                outcome.status = UnitStatus::Succeeded;
                outcome.touched = written.touched;
                info!(
                    unit = %unit,
                    source = %unit.kind(),
                    rows = outcome.rows_normalized,
                    dropped = outcome.rows_dropped,
                    "Unit complete"
                );
            }
            Err(e) => {
                let class = e.class();
                match class {
                    ErrorClass::Integrity => error!(unit = %unit, error = %e, "Unit failed integrity check"),
                    _ => warn!(unit = %unit, stage = ?outcome.stage, class = %class, error = %e, "Unit failed"),
                }
                outcome.status = UnitStatus::Failed {
                    class,
                    message: e.to_string(),
                };
            }
        }

        outcome
    }

    async fn run_unit(
        &self,
        unit: &Unit,
        date: NaiveDate,
        progress: &SharedProgress,
        outcome: &mut UnitOutcome,
    ) -> Result<WriteSummary, UnitError> {
        let record: RawRecord = match unit {
            Unit::Fetch { kind, race } => {
                outcome.stage = UnitStage::Fetch;
                advance(progress, RunState::Fetching);
                let params = FetchParams { race: *race };
                let payload = self.client.fetch(*kind, &params).await?;
                outcome.fetched = true;

                outcome.stage = UnitStage::Archive;
                advance(progress, RunState::Archiving);
                let stored = self.archive.store(*kind, date, payload).await?;
                outcome.archived_new = Some(stored.created);
                stored.record
            }
            Unit::Replay { location, .. } => {
                outcome.stage = UnitStage::Archive;
                advance(progress, RunState::Archiving);
                self.archive.load(location).await?
            }
        };

        outcome.stage = UnitStage::Normalize;
        advance(progress, RunState::Normalizing);
        let batch = normalize(&record)?;
        outcome.rows_normalized = batch.row_count();
        outcome.rows_dropped = batch.dropped.len();

        outcome.stage = UnitStage::Persist;
        let written = match self.writer.apply(&batch).await {
            Err(e) if e.is_transient() => {
                warn!(unit = %unit, error = %e, "Transient persistence failure, retrying once");
                tokio::time::sleep(PERSISTENCE_RETRY_DELAY).await;
                self.writer.apply(&batch).await?
            }
            other => other?,
        };

        Ok(written)
    }

    /// Recompute aggregations for every key a successful unit touched
    async fn aggregate(&self, summary: &mut RunSummary) {
        let keys: BTreeSet<DriverRaceKey> = summary
            .outcomes
            .iter()
            .filter(|o| o.status == UnitStatus::Succeeded)
            .flat_map(|o| o.touched.iter().cloned())
            .collect();

        let results: Vec<_> = stream::iter(keys)
            .map(|key| async move {
                let result = self.aggregator.recompute(&key).await;
                (key, result)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(_) => summary.aggregations_recomputed += 1,
                Err(e) => {
                    warn!(race = %key.race, driver = %key.driver_ref, error = %e, "Aggregation failed");
                    *summary
                        .errors_by_class
                        .entry(ErrorClass::Persistence)
                        .or_insert(0) += 1;
                }
            }
        }
    }
}

fn log_summary(summary: &RunSummary) {
    let errors: Vec<String> = summary
        .errors_by_class
        .iter()
        .map(|(class, count)| format!("{}={}", class, count))
        .collect();

    info!(
        state = %summary.state,
        attempted = summary.units_attempted,
        succeeded = summary.units_succeeded,
        failed = summary.units_failed,
        cancelled = summary.units_cancelled,
        fetched = summary.payloads_fetched,
        archived = summary.payloads_archived,
        duplicates = summary.payloads_duplicate,
        rows_normalized = summary.rows_normalized,
        rows_dropped = summary.rows_dropped,
        aggregations = summary.aggregations_recomputed,
        errors = %errors.join(","),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Run finished"
    );
}
