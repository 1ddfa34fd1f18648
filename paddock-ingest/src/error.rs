//! Error types for paddock-ingest
//!
//! Errors are layered by blast radius:
//! - row level: [`ParseError`] on a single row, absorbed and counted
//! - unit level: [`UnitError`] fails one payload, the run continues
//! - run level: [`RunError`] aborts the whole invocation

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Source client failure
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Timeout, connection failure, HTTP 5xx or 429; retried with backoff
    #[error("transient fetch failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },

    /// Not retried. `configuration` marks failures no other unit could
    /// succeed past either (rejected credentials, unconfigured provider).
    #[error("permanent fetch failure{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Permanent {
        status: Option<u16>,
        message: String,
        configuration: bool,
    },
}

impl FetchError {
    pub(crate) fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient {
            attempts: 1,
            message: message.into(),
        }
    }

    pub(crate) fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Permanent {
            status,
            message: message.into(),
            configuration: false,
        }
    }

    pub(crate) fn configuration(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Permanent {
            status,
            message: message.into(),
            configuration: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn is_configuration_level(&self) -> bool {
        matches!(
            self,
            FetchError::Permanent {
                configuration: true,
                ..
            }
        )
    }
}

/// Raw archive failure
#[derive(Debug, Error)]
pub enum StorageError {
    /// Same fingerprint, different bytes. Never overwritten; needs manual review.
    #[error("integrity violation: object {location} has fingerprint {fingerprint} but different content")]
    Integrity {
        location: String,
        fingerprint: String,
    },

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("malformed archive key '{0}'")]
    InvalidKey(String),
}

/// What was wrong with a payload or a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    /// Bytes are not JSON at all
    InvalidJson,
    /// JSON, but not a shape the parser for this source understands
    UnknownShape,
    MissingField,
    InvalidType,
    /// Row refers to an entity the payload never defines
    UnresolvedReference,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParseErrorKind::InvalidJson => "invalid JSON",
            ParseErrorKind::UnknownShape => "unknown shape",
            ParseErrorKind::MissingField => "missing field",
            ParseErrorKind::InvalidType => "invalid type",
            ParseErrorKind::UnresolvedReference => "unresolved reference",
        };
        f.write_str(name)
    }
}

/// Normalizer failure for a whole payload or a single row
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} at {path}: {detail}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    /// Location inside the payload, e.g. `laps[4].LapNumber`
    pub path: String,
    pub detail: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Self::new(ParseErrorKind::MissingField, path, "required field is absent or null")
    }

    pub fn invalid_type(path: impl Into<String>, expected: &str) -> Self {
        Self::new(ParseErrorKind::InvalidType, path, format!("expected {}", expected))
    }
}

/// Relational store failure; the transaction has been rolled back
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Row could not be linked to its parent inside the batch
    #[error("referential integrity: {0}")]
    MissingReference(String),
}

impl PersistenceError {
    /// Busy/locked database, dropped connection or pool timeout
    pub fn is_transient(&self) -> bool {
        match self {
            PersistenceError::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
                sqlx::Error::Database(db_err) => {
                    // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
                    let code_is_busy = db_err
                        .code()
                        .and_then(|c| c.parse::<i32>().ok())
                        .map(|c| matches!(c & 0xff, 5 | 6))
                        .unwrap_or(false);
                    code_is_busy || db_err.message().contains("database is locked")
                }
                _ => false,
            },
            PersistenceError::MissingReference(_) => false,
        }
    }
}

/// Counted error classes reported in the run summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientFetch,
    PermanentFetch,
    Parse,
    Integrity,
    Storage,
    Persistence,
    Configuration,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientFetch => "transient_fetch",
            ErrorClass::PermanentFetch => "permanent_fetch",
            ErrorClass::Parse => "parse",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Storage => "storage",
            ErrorClass::Persistence => "persistence",
            ErrorClass::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one unit of work
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("payload rejected: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl UnitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UnitError::Fetch(e) if e.is_configuration_level() => ErrorClass::Configuration,
            UnitError::Fetch(e) if e.is_transient() => ErrorClass::TransientFetch,
            UnitError::Fetch(_) => ErrorClass::PermanentFetch,
            UnitError::Storage(StorageError::Integrity { .. }) => ErrorClass::Integrity,
            UnitError::Storage(_) => ErrorClass::Storage,
            UnitError::Parse(_) => ErrorClass::Parse,
            UnitError::Persistence(_) => ErrorClass::Persistence,
        }
    }
}

/// Failure that aborts the whole run
#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid or incomplete configuration; detected before or during the run
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Archive could not be enumerated for a replay run
    #[error("archive unavailable: {0}")]
    Archive(#[from] StorageError),

    /// Failure outside any unit (store or archive could not be opened)
    #[error(transparent)]
    Common(#[from] paddock_common::Error),
}
