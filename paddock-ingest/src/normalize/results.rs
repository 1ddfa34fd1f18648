//! Jolpica/Ergast-shaped race results
//!
//! ```text
//! MRData.RaceTable.Races[] {
//!     season, round, raceName, date,
//!     Circuit { circuitName, Location { locality, country } },
//!     Results[] { Driver {..}, Constructor {..} },
//!     Laps[] { number, Timings[] { driverId, position, time } }
//! }
//! ```

use paddock_common::model::{Driver, LapTime, Race, RaceKey, Team};
use serde_json::Value;

use super::{
    lap_time_ms, opt_array, opt_i32, opt_str, req_i32, req_str, required, BatchBuilder,
    MAX_LAP_TIME_MS,
};
use crate::error::{ParseError, ParseErrorKind};

const RACES_PATH: &str = "MRData.RaceTable.Races";

/// Recognized results payload
#[derive(Debug, Clone)]
pub struct ResultsPayload {
    races: Vec<Value>,
}

impl ResultsPayload {
    pub(crate) fn from_value(value: Value) -> Result<Self, ParseError> {
        let races = value
            .get("MRData")
            .and_then(|m| m.get("RaceTable"))
            .and_then(|t| t.get("Races"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ParseError::new(
                    ParseErrorKind::UnknownShape,
                    RACES_PATH,
                    "expected an array of races",
                )
            })?;

        Ok(Self {
            races: races.clone(),
        })
    }

    pub(crate) fn collect(&self, builder: &mut BatchBuilder) {
        for (i, row) in self.races.iter().enumerate() {
            let path = format!("{}[{}]", RACES_PATH, i);

            let race = match parse_race(row, &path) {
                Ok(race) => race,
                Err(e) => {
                    builder.drop_row(e);
                    continue;
                }
            };
            let key = race.key;
            builder.race(race);

            match opt_array(row, "Results", &path) {
                Ok(results) => {
                    for (j, result) in results.iter().enumerate() {
                        let result_path = format!("{}.Results[{}]", path, j);
                        match parse_result(result, &result_path) {
                            Ok((driver, team)) => {
                                if let Some(team) = team {
                                    builder.team(team);
                                }
                                builder.driver(driver);
                            }
                            Err(e) => builder.drop_row(e),
                        }
                    }
                }
                Err(e) => builder.drop_row(e),
            }

            match opt_array(row, "Laps", &path) {
                Ok(laps) => {
                    for (k, lap) in laps.iter().enumerate() {
                        collect_lap(lap, key, &format!("{}.Laps[{}]", path, k), builder);
                    }
                }
                Err(e) => builder.drop_row(e),
            }
        }
    }
}

fn parse_race(row: &Value, path: &str) -> Result<Race, ParseError> {
    if !row.is_object() {
        return Err(ParseError::invalid_type(path, "object"));
    }

    let key = RaceKey {
        season: req_i32(row, "season", path)?,
        round: req_i32(row, "round", path)?,
    };

    let mut race = Race::bare(key);
    race.race_name = opt_str(row, "raceName", path)?;
    race.date = opt_str(row, "date", path)?;

    if let Some(circuit) = row.get("Circuit").filter(|c| !c.is_null()) {
        let circuit_path = format!("{}.Circuit", path);
        race.circuit_name = opt_str(circuit, "circuitName", &circuit_path)?;
        if let Some(location) = circuit.get("Location").filter(|l| !l.is_null()) {
            let location_path = format!("{}.Location", circuit_path);
            race.locality = opt_str(location, "locality", &location_path)?;
            race.country = opt_str(location, "country", &location_path)?;
        }
    }

    Ok(race)
}

fn parse_result(row: &Value, path: &str) -> Result<(Driver, Option<Team>), ParseError> {
    let team = match row.get("Constructor").filter(|c| !c.is_null()) {
        Some(constructor) => {
            let p = format!("{}.Constructor", path);
            Some(Team {
                team_ref: req_str(constructor, "constructorId", &p)?,
                name: opt_str(constructor, "name", &p)?,
                nationality: opt_str(constructor, "nationality", &p)?,
            })
        }
        None => None,
    };

    let d = required(row, "Driver", path)?;
    let p = format!("{}.Driver", path);
    let driver = Driver {
        driver_ref: req_str(d, "driverId", &p)?,
        given_name: opt_str(d, "givenName", &p)?,
        family_name: opt_str(d, "familyName", &p)?,
        code: opt_str(d, "code", &p)?,
        permanent_number: opt_i32(d, "permanentNumber", &p)?,
        nationality: opt_str(d, "nationality", &p)?,
        date_of_birth: opt_str(d, "dateOfBirth", &p)?,
        team_ref: team.as_ref().map(|t| t.team_ref.clone()),
    };

    Ok((driver, team))
}

fn collect_lap(lap: &Value, race: RaceKey, path: &str, builder: &mut BatchBuilder) {
    let lap_number = match req_i32(lap, "number", path) {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            builder.drop_row(ParseError::invalid_type(
                format!("{}.number", path),
                "positive integer",
            ));
            return;
        }
        Err(e) => {
            builder.drop_row(e);
            return;
        }
    };

    let timings = match opt_array(lap, "Timings", path) {
        Ok(timings) => timings,
        Err(e) => {
            builder.drop_row(e);
            return;
        }
    };

    for (m, timing) in timings.iter().enumerate() {
        let timing_path = format!("{}.Timings[{}]", path, m);
        match parse_timing(timing, race, lap_number, &timing_path, builder.fingerprint()) {
            Ok(row) => {
                builder.driver(Driver::bare(row.driver_ref.clone()));
                builder.lap(row);
            }
            Err(e) => builder.drop_row(e),
        }
    }
}

fn parse_timing(
    row: &Value,
    race: RaceKey,
    lap_number: i32,
    path: &str,
    fingerprint: &str,
) -> Result<LapTime, ParseError> {
    let driver_ref = req_str(row, "driverId", path)?;
    let position = opt_i32(row, "position", path)?;
    let lap_time_ms = match opt_str(row, "time", path)? {
        Some(raw) => Some(parse_lap_time(&raw).ok_or_else(|| {
            ParseError::invalid_type(format!("{}.time", path), "lap time like 1:31.234")
        })?),
        None => None,
    };

    Ok(LapTime {
        race,
        driver_ref,
        lap_number,
        position,
        lap_time_ms,
        pit_flag: None,
        source_fingerprint: fingerprint.to_string(),
    })
}

/// Parse `"1:31.234"`, `"31.234"` or `"1:02:03.456"` into milliseconds
pub(crate) fn parse_lap_time(raw: &str) -> Option<i64> {
    let mut parts: Vec<&str> = raw.trim().split(':').collect();
    let seconds: f64 = parts.pop()?.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 || parts.len() > 2 {
        return None;
    }
    if !parts.is_empty() && seconds >= 60.0 {
        return None;
    }

    let mut whole = 0i64;
    for (i, part) in parts.iter().enumerate() {
        let unit: i64 = part.parse().ok()?;
        // Minutes below an hour field must stay under 60
        if unit < 0 || (i > 0 && unit >= 60) {
            return None;
        }
        whole = whole.checked_mul(60)?.checked_add(unit)?;
    }

    let total = whole
        .checked_mul(60_000)?
        .checked_add(lap_time_ms(seconds * 1000.0)?)?;
    (total <= MAX_LAP_TIME_MS).then_some(total)
}
