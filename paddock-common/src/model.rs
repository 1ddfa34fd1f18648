//! Canonical race data model
//!
//! Provider-independent entities produced by the normalizer and persisted by
//! the upsert writer. Every entity is identified by its natural key; surrogate
//! ids exist only inside the relational store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// External data provider a payload was fetched from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Jolpica/Ergast-compatible race results provider
    Results,
    /// FastF1-shaped session export provider
    Telemetry,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Results, SourceKind::Telemetry];

    /// Stable name used in archive keys and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Results => "results",
            SourceKind::Telemetry => "telemetry",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "results" | "jolpica" | "ergast" => Ok(SourceKind::Results),
            "telemetry" | "fastf1" => Ok(SourceKind::Telemetry),
            other => Err(Error::InvalidInput(format!("unknown source kind: {}", other))),
        }
    }
}

/// Natural key of a race
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RaceKey {
    pub season: i32,
    pub round: i32,
}

impl fmt::Display for RaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.season, self.round)
    }
}

/// Natural key of a per-driver, per-race aggregation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverRaceKey {
    pub race: RaceKey,
    pub driver_ref: String,
}

/// Constructor (team) keyed by provider slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub team_ref: String,
    pub name: Option<String>,
    pub nationality: Option<String>,
}

/// Driver keyed by provider slug
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub driver_ref: String,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    /// Three-letter timing code ("HAM")
    pub code: Option<String>,
    pub permanent_number: Option<i32>,
    pub nationality: Option<String>,
    /// ISO date of birth
    pub date_of_birth: Option<String>,
    pub team_ref: Option<String>,
}

impl Driver {
    /// Driver known only by its reference
    pub fn bare(driver_ref: impl Into<String>) -> Self {
        Self {
            driver_ref: driver_ref.into(),
            given_name: None,
            family_name: None,
            code: None,
            permanent_number: None,
            nationality: None,
            date_of_birth: None,
            team_ref: None,
        }
    }
}

/// Race keyed by (season, round)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Race {
    pub key: RaceKey,
    pub race_name: Option<String>,
    pub circuit_name: Option<String>,
    /// ISO race date
    pub date: Option<String>,
    pub locality: Option<String>,
    pub country: Option<String>,
}

impl Race {
    /// Race known only by its natural key
    pub fn bare(key: RaceKey) -> Self {
        Self {
            key,
            race_name: None,
            circuit_name: None,
            date: None,
            locality: None,
            country: None,
        }
    }
}

/// One lap of one driver in one race
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapTime {
    pub race: RaceKey,
    pub driver_ref: String,
    pub lap_number: i32,
    pub position: Option<i32>,
    pub lap_time_ms: Option<i64>,
    /// `Some(true)` for an in-lap, `Some(false)` when the source says it was
    /// not a pit lap, `None` when the source carries no pit information
    pub pit_flag: Option<bool>,
    /// Fingerprint of the raw payload this row was derived from
    pub source_fingerprint: String,
}

/// Derived per-driver, per-race statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub race: RaceKey,
    pub driver_ref: String,
    pub lap_count: i64,
    pub valid_lap_count: i64,
    pub avg_lap_ms: Option<f64>,
    pub fastest_lap_ms: Option<i64>,
    pub fastest_lap_number: Option<i32>,
    pub pit_stops: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parse_accepts_provider_aliases() {
        assert_eq!("results".parse::<SourceKind>().unwrap(), SourceKind::Results);
        assert_eq!("Jolpica".parse::<SourceKind>().unwrap(), SourceKind::Results);
        assert_eq!("fastf1".parse::<SourceKind>().unwrap(), SourceKind::Telemetry);
        assert!("weather".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_source_kind_display_matches_archive_segment() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.to_string(), kind.as_str());
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_race_key_ordering_is_season_then_round() {
        let a = RaceKey { season: 2023, round: 22 };
        let b = RaceKey { season: 2024, round: 1 };
        assert!(a < b);
        assert_eq!(b.to_string(), "2024/1");
    }
}
