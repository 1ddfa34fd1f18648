//! Content-addressed raw payload archive
//!
//! Every fetched payload is stored once, immutably, under
//! `raw/<date>/<source>/<fingerprint>` where the fingerprint is the SHA-256
//! of the payload bytes. A per-source index object at
//! `raw/_index/<source>/<fingerprint>` names the canonical location, so the
//! same bytes fetched on a later date collapse onto the first stored copy.
//!
//! Writes are create-only. Nothing in this module overwrites or deletes.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutPayload};
use paddock_common::config::ArchiveBackend;
use paddock_common::{Error, SourceKind};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::StorageError;

const RAW_PREFIX: &str = "raw";
const INDEX_SEGMENT: &str = "_index";

/// An archived payload
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub source_kind: SourceKind,
    /// When the payload was first archived
    pub fetched_at: DateTime<Utc>,
    pub payload: Bytes,
    /// Lowercase hex SHA-256 of `payload`
    pub fingerprint: String,
    pub location: String,
}

/// Result of [`RawArchive::store`]
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub record: RawRecord,
    /// `false` when an identical payload was already archived
    pub created: bool,
}

/// SHA-256 of the payload as lowercase hex
pub fn fingerprint(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

fn record_path(date: NaiveDate, kind: SourceKind, fingerprint: &str) -> Path {
    Path::from(format!(
        "{}/{}/{}/{}",
        RAW_PREFIX,
        date.format("%Y-%m-%d"),
        kind.as_str(),
        fingerprint
    ))
}

fn index_path(kind: SourceKind, fingerprint: &str) -> Path {
    Path::from(format!(
        "{}/{}/{}/{}",
        RAW_PREFIX,
        INDEX_SEGMENT,
        kind.as_str(),
        fingerprint
    ))
}

/// Split `raw/<date>/<source>/<fingerprint>` into its source and fingerprint
fn parse_record_key(location: &str) -> Result<(SourceKind, String), StorageError> {
    let invalid = || StorageError::InvalidKey(location.to_string());

    let parts: Vec<&str> = location.split('/').collect();
    let [prefix, date, kind, fp] = parts.as_slice() else {
        return Err(invalid());
    };
    if *prefix != RAW_PREFIX || NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        return Err(invalid());
    }
    let kind = SourceKind::ALL
        .into_iter()
        .find(|k| k.as_str() == *kind)
        .ok_or_else(invalid)?;
    if fp.len() != 64 || !fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(invalid());
    }
    Ok((kind, fp.to_string()))
}

/// Deduplicating archive over any `object_store` backend
#[derive(Debug, Clone)]
pub struct RawArchive {
    store: Arc<dyn ObjectStore>,
}

impl RawArchive {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Process-local archive
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Open the configured backend
    pub fn from_backend(backend: &ArchiveBackend) -> paddock_common::Result<Self> {
        let store: Arc<dyn ObjectStore> = match backend {
            ArchiveBackend::Memory => Arc::new(InMemory::new()),
            ArchiveBackend::Local { root } => {
                std::fs::create_dir_all(root).map_err(|e| {
                    Error::Config(format!(
                        "Cannot create archive directory {}: {}",
                        root.display(),
                        e
                    ))
                })?;
                let fs = LocalFileSystem::new_with_prefix(root).map_err(|e| {
                    Error::Config(format!("Invalid archive directory {}: {}", root.display(), e))
                })?;
                Arc::new(fs)
            }
            ArchiveBackend::S3 { bucket, region } => {
                // Create-only puts on S3 need conditional requests
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_conditional_put(S3ConditionalPut::ETagMatch);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                let s3 = builder
                    .build()
                    .map_err(|e| Error::Config(format!("Invalid S3 archive config: {}", e)))?;
                Arc::new(s3)
            }
        };

        info!(backend = ?backend, "Raw archive opened");
        Ok(Self::new(store))
    }

    /// Archive a payload, or return the existing record for identical bytes
    pub async fn store(
        &self,
        kind: SourceKind,
        date: NaiveDate,
        payload: Bytes,
    ) -> Result<StoreOutcome, StorageError> {
        let fingerprint = fingerprint(&payload);
        let index = index_path(kind, &fingerprint);

        // Claim the fingerprint first so that concurrent writers, even on
        // different dates, settle on one location.
        let candidate = record_path(date, kind, &fingerprint);
        let claimed = self
            .put_create(&index, Bytes::from(candidate.to_string()))
            .await?;

        let location = if claimed {
            candidate
        } else {
            let existing = self.read_index(&index).await?;
            match self.get(&existing).await {
                Ok((stored, fetched_at)) => {
                    return self.verify_duplicate(kind, &existing, fingerprint, payload, stored, fetched_at);
                }
                // Index written but content missing: the first writer died in
                // between. Finish its write.
                Err(StorageError::ObjectStore(object_store::Error::NotFound { .. })) => existing,
                Err(e) => return Err(e),
            }
        };

        if self.put_create(&location, payload.clone()).await? {
            info!(
                source = %kind,
                fingerprint = %fingerprint,
                location = %location,
                bytes = payload.len(),
                "Archived raw payload"
            );
            return Ok(StoreOutcome {
                record: RawRecord {
                    source_kind: kind,
                    fetched_at: Utc::now(),
                    payload,
                    fingerprint,
                    location: location.to_string(),
                },
                created: true,
            });
        }

        let (stored, fetched_at) = self.get(&location).await?;
        self.verify_duplicate(kind, &location, fingerprint, payload, stored, fetched_at)
    }

    /// Read back an archived record, checking its bytes against its key
    pub async fn load(&self, location: &str) -> Result<RawRecord, StorageError> {
        let (kind, expected) = parse_record_key(location)?;
        let path = Path::from(location);
        let (payload, fetched_at) = self.get(&path).await?;

        if fingerprint(&payload) != expected {
            error!(
                location = %location,
                fingerprint = %expected,
                "Archived object does not match its fingerprint; manual review required"
            );
            return Err(StorageError::Integrity {
                location: location.to_string(),
                fingerprint: expected,
            });
        }

        Ok(RawRecord {
            source_kind: kind,
            fetched_at,
            payload,
            fingerprint: expected,
            location: location.to_string(),
        })
    }

    /// Locations archived under `date` for `kind`, sorted
    pub async fn list(&self, date: NaiveDate, kind: SourceKind) -> Result<Vec<String>, StorageError> {
        let prefix = Path::from(format!(
            "{}/{}/{}",
            RAW_PREFIX,
            date.format("%Y-%m-%d"),
            kind.as_str()
        ));

        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut locations: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|loc| parse_record_key(loc).is_ok())
            .collect();
        locations.sort();

        debug!(date = %date, source = %kind, count = locations.len(), "Listed archived payloads");
        Ok(locations)
    }

    fn verify_duplicate(
        &self,
        kind: SourceKind,
        location: &Path,
        fingerprint: String,
        payload: Bytes,
        stored: Bytes,
        fetched_at: DateTime<Utc>,
    ) -> Result<StoreOutcome, StorageError> {
        if stored != payload {
            error!(
                source = %kind,
                location = %location,
                fingerprint = %fingerprint,
                "Fingerprint matches an archived object with different content; manual review required"
            );
            return Err(StorageError::Integrity {
                location: location.to_string(),
                fingerprint,
            });
        }

        debug!(source = %kind, location = %location, "Payload already archived");
        Ok(StoreOutcome {
            record: RawRecord {
                source_kind: kind,
                fetched_at,
                payload: stored,
                fingerprint,
                location: location.to_string(),
            },
            created: false,
        })
    }

    /// `Ok(false)` when the object already exists
    async fn put_create(&self, path: &Path, bytes: Bytes) -> Result<bool, StorageError> {
        match self
            .store
            .put_opts(path, PutPayload::from(bytes), PutMode::Create.into())
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, path: &Path) -> Result<(Bytes, DateTime<Utc>), StorageError> {
        let result = self.store.get(path).await?;
        let last_modified = result.meta.last_modified;
        let bytes = result.bytes().await?;
        Ok((bytes, last_modified))
    }

    async fn read_index(&self, index: &Path) -> Result<Path, StorageError> {
        let (bytes, _) = self.get(index).await?;
        let location = std::str::from_utf8(&bytes)
            .map_err(|_| StorageError::InvalidKey(index.to_string()))?;
        parse_record_key(location)?;
        Ok(Path::from(location))
    }
}
