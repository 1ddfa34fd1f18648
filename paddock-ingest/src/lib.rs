//! # paddock-ingest
//!
//! Race-data ingest pipeline: fetch provider payloads, archive them once by
//! content fingerprint, normalize them into canonical rows, upsert those rows
//! by natural key and recompute per-driver race aggregations.
//!
//! Data flow for one unit of work:
//!
//! ```text
//! SourceClient → RawArchive → normalize → UpsertWriter
//!                                              ↓
//!                        Aggregator (keys touched by the run)
//! ```
//!
//! [`coordinator::RunCoordinator`] drives a whole run.

pub mod aggregate;
pub mod archive;
pub mod clients;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod upsert;

use paddock_common::config::PipelineConfig;
use paddock_common::db::init_database;
use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::RawArchive;
use crate::clients::{FileSourceClient, HttpSourceClient, SourceClient};
use crate::coordinator::RunCoordinator;
use crate::error::RunError;
use crate::upsert::UpsertWriter;

/// Open the store, the archive and the source client described by `config`
///
/// With `mock_file` every fetch returns that file's bytes instead of going to
/// the network.
pub async fn open_pipeline(
    config: &PipelineConfig,
    mock_file: Option<PathBuf>,
) -> Result<RunCoordinator, RunError> {
    let pool = init_database(&config.database_path, config.statement_timeout).await?;
    let archive = RawArchive::from_backend(&config.archive)?;

    let client: Arc<dyn SourceClient> = match mock_file {
        Some(path) => Arc::new(FileSourceClient::new(path)),
        None => Arc::new(HttpSourceClient::new(config)?),
    };

    Ok(RunCoordinator::new(
        client,
        archive,
        UpsertWriter::new(pool),
        config.workers,
    ))
}
