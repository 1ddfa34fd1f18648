//! File-backed source client for offline runs

use async_trait::async_trait;
use bytes::Bytes;
use paddock_common::SourceKind;
use std::path::PathBuf;

use super::{FetchParams, SourceClient};
use crate::error::FetchError;

/// Serves the same local file for every fetch
pub struct FileSourceClient {
    path: PathBuf,
}

impl FileSourceClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceClient for FileSourceClient {
    async fn fetch(&self, kind: SourceKind, params: &FetchParams) -> Result<Bytes, FetchError> {
        tracing::info!(
            source = %kind,
            race = %params.race,
            path = %self.path.display(),
            "Using mock file instead of network"
        );

        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::configuration(
                None,
                format!("mock file {} does not exist", self.path.display()),
            )),
            Err(e) => Err(FetchError::permanent(
                None,
                format!("reading mock file {}: {}", self.path.display(), e),
            )),
        }
    }
}
