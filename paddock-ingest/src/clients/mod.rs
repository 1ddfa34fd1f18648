//! Source clients
//!
//! Fetch raw payload bytes from the two external providers. Clients never
//! interpret the bytes; shape-specific parsing belongs to the normalizer.

mod file;
mod http;
pub mod retry;

pub use file::FileSourceClient;
pub use http::HttpSourceClient;

use async_trait::async_trait;
use bytes::Bytes;
use paddock_common::{Error, SourceKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FetchError;

/// Which race a fetch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaceSelector {
    /// Most recent completed race known to the provider
    Latest,
    Round { season: i32, round: i32 },
}

impl fmt::Display for RaceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaceSelector::Latest => f.write_str("latest"),
            RaceSelector::Round { season, round } => write!(f, "{}/{}", season, round),
        }
    }
}

impl FromStr for RaceSelector {
    type Err = Error;

    /// Accepts `latest`, `2024/1` or `2024:1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") || s.eq_ignore_ascii_case("last") {
            return Ok(RaceSelector::Latest);
        }
        let (season, round) = s
            .split_once(|c| c == '/' || c == ':')
            .ok_or_else(|| Error::InvalidInput(format!("race selector '{}' is not SEASON/ROUND", s)))?;
        let season: i32 = season
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid season in '{}'", s)))?;
        let round: i32 = round
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid round in '{}'", s)))?;
        if round < 1 {
            return Err(Error::InvalidInput(format!("round must be positive in '{}'", s)));
        }
        Ok(RaceSelector::Round { season, round })
    }
}

/// Parameters of a single fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchParams {
    pub race: RaceSelector,
}

/// Fetches raw payload bytes for a source kind
///
/// Implementations hold no state between calls beyond connection reuse.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch(&self, kind: SourceKind, params: &FetchParams) -> Result<Bytes, FetchError>;
}
