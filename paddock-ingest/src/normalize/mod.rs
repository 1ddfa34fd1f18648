//! Payload normalization
//!
//! Turns an archived payload into provider-independent canonical rows. The
//! top-level shape is checked once when the bytes are parsed into a
//! [`Payload`]; after that every row is validated on its own so a single bad
//! row is dropped (and logged) without losing the rest of the payload.

mod results;
mod telemetry;

use paddock_common::model::{Driver, LapTime, Race, RaceKey, Team};
use paddock_common::SourceKind;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::archive::RawRecord;
use crate::error::{ParseError, ParseErrorKind};

pub use results::ResultsPayload;
pub use telemetry::TelemetryPayload;

/// A payload whose top-level shape has been recognized
#[derive(Debug, Clone)]
pub enum Payload {
    Results(ResultsPayload),
    Telemetry(TelemetryPayload),
}

impl Payload {
    /// Parse raw bytes as the shape `kind` produces
    pub fn parse(kind: SourceKind, bytes: &[u8]) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ParseError::new(ParseErrorKind::InvalidJson, "$", e.to_string()))?;

        match kind {
            SourceKind::Results => ResultsPayload::from_value(value).map(Payload::Results),
            SourceKind::Telemetry => TelemetryPayload::from_value(value).map(Payload::Telemetry),
        }
    }
}

/// Canonical rows derived from one raw payload
#[derive(Debug, Clone, Default)]
pub struct CanonicalBatch {
    /// Fingerprint of the payload the rows came from
    pub fingerprint: String,
    pub teams: Vec<Team>,
    pub drivers: Vec<Driver>,
    pub races: Vec<Race>,
    pub lap_times: Vec<LapTime>,
    /// Rows that were skipped
    pub dropped: Vec<ParseError>,
}

impl CanonicalBatch {
    /// Canonical rows produced (excluding dropped rows)
    pub fn row_count(&self) -> usize {
        self.teams.len() + self.drivers.len() + self.races.len() + self.lap_times.len()
    }
}

/// Normalize an archived record
///
/// Fails only when the payload as a whole is unusable.
pub fn normalize(record: &RawRecord) -> Result<CanonicalBatch, ParseError> {
    let payload = Payload::parse(record.source_kind, &record.payload)?;

    let mut builder = BatchBuilder::new(&record.fingerprint);
    match &payload {
        Payload::Results(p) => p.collect(&mut builder),
        Payload::Telemetry(p) => p.collect(&mut builder),
    }
    let batch = builder.finish();

    debug!(
        fingerprint = %record.fingerprint,
        source = %record.source_kind,
        teams = batch.teams.len(),
        drivers = batch.drivers.len(),
        races = batch.races.len(),
        laps = batch.lap_times.len(),
        dropped = batch.dropped.len(),
        "Normalized payload"
    );
    Ok(batch)
}

/// Accumulates rows, collapsing repeats of the same natural key
///
/// A later sighting fills in attributes; it never blanks one out. Output is
/// ordered by natural key so the same payload always yields the same batch.
pub(crate) struct BatchBuilder {
    fingerprint: String,
    teams: BTreeMap<String, Team>,
    drivers: BTreeMap<String, Driver>,
    races: BTreeMap<RaceKey, Race>,
    laps: BTreeMap<(RaceKey, String, i32), LapTime>,
    dropped: Vec<ParseError>,
}

fn refine<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl BatchBuilder {
    fn new(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            teams: BTreeMap::new(),
            drivers: BTreeMap::new(),
            races: BTreeMap::new(),
            laps: BTreeMap::new(),
            dropped: Vec::new(),
        }
    }

    pub(crate) fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn team(&mut self, team: Team) {
        match self.teams.get_mut(&team.team_ref) {
            Some(existing) => {
                refine(&mut existing.name, team.name);
                refine(&mut existing.nationality, team.nationality);
            }
            None => {
                self.teams.insert(team.team_ref.clone(), team);
            }
        }
    }

    pub(crate) fn driver(&mut self, driver: Driver) {
        match self.drivers.get_mut(&driver.driver_ref) {
            Some(existing) => {
                refine(&mut existing.given_name, driver.given_name);
                refine(&mut existing.family_name, driver.family_name);
                refine(&mut existing.code, driver.code);
                refine(&mut existing.permanent_number, driver.permanent_number);
                refine(&mut existing.nationality, driver.nationality);
                refine(&mut existing.date_of_birth, driver.date_of_birth);
                refine(&mut existing.team_ref, driver.team_ref);
            }
            None => {
                self.drivers.insert(driver.driver_ref.clone(), driver);
            }
        }
    }

    pub(crate) fn race(&mut self, race: Race) {
        match self.races.get_mut(&race.key) {
            Some(existing) => {
                refine(&mut existing.race_name, race.race_name);
                refine(&mut existing.circuit_name, race.circuit_name);
                refine(&mut existing.date, race.date);
                refine(&mut existing.locality, race.locality);
                refine(&mut existing.country, race.country);
            }
            None => {
                self.races.insert(race.key, race);
            }
        }
    }

    pub(crate) fn lap(&mut self, lap: LapTime) {
        let key = (lap.race, lap.driver_ref.clone(), lap.lap_number);
        self.laps.insert(key, lap);
    }

    pub(crate) fn drop_row(&mut self, error: ParseError) {
        warn!(
            fingerprint = %self.fingerprint,
            kind = %error.kind,
            path = %error.path,
            detail = %error.detail,
            "Dropped malformed row"
        );
        self.dropped.push(error);
    }

    fn finish(self) -> CanonicalBatch {
        CanonicalBatch {
            fingerprint: self.fingerprint,
            teams: self.teams.into_values().collect(),
            drivers: self.drivers.into_values().collect(),
            races: self.races.into_values().collect(),
            lap_times: self.laps.into_values().collect(),
            dropped: self.dropped,
        }
    }
}

// Row field accessors. `path` locates the row inside the payload; the field
// name is appended for error reporting. JSON null counts as absent.

fn field_path(path: &str, field: &str) -> String {
    format!("{}.{}", path, field)
}

fn present<'a>(row: &'a Value, field: &str) -> Option<&'a Value> {
    row.get(field).filter(|v| !v.is_null())
}

pub(crate) fn required<'a>(row: &'a Value, field: &str, path: &str) -> Result<&'a Value, ParseError> {
    present(row, field).ok_or_else(|| ParseError::missing(field_path(path, field)))
}

pub(crate) fn req_str(row: &Value, field: &str, path: &str) -> Result<String, ParseError> {
    required(row, field, path)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ParseError::invalid_type(field_path(path, field), "string"))
}

pub(crate) fn opt_str(row: &Value, field: &str, path: &str) -> Result<Option<String>, ParseError> {
    match present(row, field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::invalid_type(field_path(path, field), "string")),
    }
}

/// Integers may arrive as JSON numbers (possibly `3.0`) or numeric strings
fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn req_i32(row: &Value, field: &str, path: &str) -> Result<i32, ParseError> {
    let value = required(row, field, path)?;
    as_int(value)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| ParseError::invalid_type(field_path(path, field), "integer"))
}

pub(crate) fn opt_i32(row: &Value, field: &str, path: &str) -> Result<Option<i32>, ParseError> {
    match present(row, field) {
        None => Ok(None),
        Some(value) => as_int(value)
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| ParseError::invalid_type(field_path(path, field), "integer")),
    }
}

/// Longest lap time accepted, in milliseconds
pub(crate) const MAX_LAP_TIME_MS: i64 = 24 * 60 * 60 * 1000;

/// Round a millisecond lap time, rejecting negative or implausibly long ones
pub(crate) fn lap_time_ms(ms: f64) -> Option<i64> {
    let rounded = ms.round();
    (rounded.is_finite() && rounded >= 0.0 && rounded <= MAX_LAP_TIME_MS as f64)
        .then_some(rounded as i64)
}

pub(crate) fn opt_f64(row: &Value, field: &str, path: &str) -> Result<Option<f64>, ParseError> {
    let parsed = match present(row, field) {
        None => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .map(Some)
        .ok_or_else(|| ParseError::invalid_type(field_path(path, field), "number"))
}

/// Array field that may be absent; present but not an array is an error
pub(crate) fn opt_array<'a>(
    row: &'a Value,
    field: &str,
    path: &str,
) -> Result<&'a [Value], ParseError> {
    match present(row, field) {
        None => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ParseError::invalid_type(field_path(path, field), "array")),
    }
}
