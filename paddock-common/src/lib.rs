//! # Paddock Common Library
//!
//! Shared code for the paddock pipeline crates:
//! - Error type and result alias
//! - Immutable pipeline configuration and its layered resolution
//! - Canonical race data model (teams, drivers, races, lap times, aggregations)
//! - Database pool initialization and schema migrations

pub mod config;
pub mod db;
pub mod error;
pub mod model;

pub use error::{Error, Result};
pub use model::SourceKind;
