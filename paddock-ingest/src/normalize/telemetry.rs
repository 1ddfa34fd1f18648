//! FastF1-shaped session exports
//!
//! ```text
//! {
//!   "session": { "season", "round", "event_name"?, "date"? },
//!   "results": [ { Abbreviation, DriverId, FirstName, LastName, TeamId,
//!                  TeamName, DriverNumber, CountryCode } ],
//!   "laps":    [ { Driver, LapNumber, Position?, LapTime? (ms), PitInTime? } ],
//!   "weather": [ ... ]
//! }
//! ```
//!
//! Laps name drivers by abbreviation; `results` maps abbreviations to driver
//! references. Weather samples are archived but not normalized.

use paddock_common::model::{Driver, LapTime, Race, RaceKey, Team};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{lap_time_ms, opt_f64, opt_i32, opt_str, req_i32, req_str, BatchBuilder};
use crate::error::{ParseError, ParseErrorKind};

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    session: Value,
    #[serde(default)]
    results: Vec<Value>,
    laps: Vec<Value>,
}

/// Recognized telemetry payload
#[derive(Debug, Clone)]
pub struct TelemetryPayload {
    race: Race,
    results: Vec<Value>,
    laps: Vec<Value>,
}

impl TelemetryPayload {
    pub(crate) fn from_value(value: Value) -> Result<Self, ParseError> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| ParseError::new(ParseErrorKind::UnknownShape, "$", e.to_string()))?;

        if !envelope.session.is_object() {
            return Err(ParseError::invalid_type("session", "object"));
        }

        // Every row hangs off the session's race; without it nothing is usable
        let session = &envelope.session;
        let mut race = Race::bare(RaceKey {
            season: req_i32(session, "season", "session")?,
            round: req_i32(session, "round", "session")?,
        });
        race.race_name = opt_str(session, "event_name", "session")?;
        race.date = opt_str(session, "date", "session")?;

        Ok(Self {
            race,
            results: envelope.results,
            laps: envelope.laps,
        })
    }

    pub(crate) fn collect(&self, builder: &mut BatchBuilder) {
        let key = self.race.key;
        builder.race(self.race.clone());

        let mut by_abbreviation: HashMap<String, String> = HashMap::new();
        for (i, row) in self.results.iter().enumerate() {
            let path = format!("results[{}]", i);
            match parse_result(row, &path) {
                Ok((abbreviation, driver, team)) => {
                    by_abbreviation.insert(abbreviation, driver.driver_ref.clone());
                    if let Some(team) = team {
                        builder.team(team);
                    }
                    builder.driver(driver);
                }
                Err(e) => builder.drop_row(e),
            }
        }

        for (i, row) in self.laps.iter().enumerate() {
            let path = format!("laps[{}]", i);
            match parse_lap(row, key, &path, &by_abbreviation, builder.fingerprint()) {
                Ok(lap) => builder.lap(lap),
                Err(e) => builder.drop_row(e),
            }
        }
    }
}

fn parse_result(row: &Value, path: &str) -> Result<(String, Driver, Option<Team>), ParseError> {
    if !row.is_object() {
        return Err(ParseError::invalid_type(path, "object"));
    }

    let abbreviation = req_str(row, "Abbreviation", path)?;
    let team = match opt_str(row, "TeamId", path)? {
        Some(team_ref) => Some(Team {
            team_ref,
            name: opt_str(row, "TeamName", path)?,
            nationality: None,
        }),
        None => None,
    };

    let driver = Driver {
        driver_ref: req_str(row, "DriverId", path)?,
        given_name: opt_str(row, "FirstName", path)?,
        family_name: opt_str(row, "LastName", path)?,
        code: Some(abbreviation.clone()),
        permanent_number: opt_i32(row, "DriverNumber", path)?,
        nationality: None,
        date_of_birth: None,
        team_ref: team.as_ref().map(|t| t.team_ref.clone()),
    };

    Ok((abbreviation, driver, team))
}

fn parse_lap(
    row: &Value,
    race: RaceKey,
    path: &str,
    drivers: &HashMap<String, String>,
    fingerprint: &str,
) -> Result<LapTime, ParseError> {
    if !row.is_object() {
        return Err(ParseError::invalid_type(path, "object"));
    }

    let abbreviation = req_str(row, "Driver", path)?;
    let lap_number = req_i32(row, "LapNumber", path)?;
    if lap_number <= 0 {
        return Err(ParseError::invalid_type(
            format!("{}.LapNumber", path),
            "positive integer",
        ));
    }
    let position = opt_i32(row, "Position", path)?;
    let lap_time_ms = match opt_f64(row, "LapTime", path)? {
        Some(ms) => Some(lap_time_ms(ms).ok_or_else(|| {
            ParseError::invalid_type(format!("{}.LapTime", path), "lap time in milliseconds")
        })?),
        None => None,
    };

    // Present-but-null PitInTime means the lap did not end in the pits
    let pit_flag = match row.get("PitInTime") {
        None => None,
        Some(Value::Null) => Some(false),
        Some(_) => Some(true),
    };

    let driver_ref = drivers.get(&abbreviation).cloned().ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::UnresolvedReference,
            format!("{}.Driver", path),
            format!("driver '{}' does not appear in results", abbreviation),
        )
    })?;

    Ok(LapTime {
        race,
        driver_ref,
        lap_number,
        position,
        lap_time_ms,
        pit_flag,
        source_fingerprint: fingerprint.to_string(),
    })
}
