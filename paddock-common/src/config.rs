//! Pipeline configuration
//!
//! The pipeline is configured once at process start. Every value is resolved
//! with the following priority order and then frozen into a [`PipelineConfig`]
//! that is handed to each component:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! Components never consult the process environment themselves.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_RESULTS_URL: &str = "https://api.jolpi.ca/ergast/f1";
pub const DEFAULT_USER_AGENT: &str = concat!("paddock-ingest/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_WORKERS: usize = 4;
const MAX_WORKERS: usize = 64;

/// Where raw payloads are archived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveBackend {
    /// Local directory (archive keys become relative paths below it)
    Local { root: PathBuf },
    /// Amazon S3 bucket
    S3 { bucket: String, region: Option<String> },
    /// Process-local memory, lost on exit
    Memory,
}

/// Bounded exponential backoff for transient fetch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Immutable configuration shared by all pipeline components
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub archive: ArchiveBackend,
    pub results_url: String,
    /// Telemetry provider base URL; telemetry units cannot run without it
    pub telemetry_url: Option<String>,
    /// Bearer token sent to providers that require one
    pub api_token: Option<String>,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub statement_timeout: Duration,
    pub retry: RetryPolicy,
    pub workers: usize,
}

impl PipelineConfig {
    /// Configuration suitable for tests: in-memory archive, fast retries
    pub fn for_tests(database_path: PathBuf) -> Self {
        Self {
            database_path,
            archive: ArchiveBackend::Memory,
            results_url: DEFAULT_RESULTS_URL.to_string(),
            telemetry_url: None,
            api_token: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            workers: 2,
        }
    }

    /// Reject values no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(Error::Config(format!(
                "workers must be between 1 and {}, got {}",
                MAX_WORKERS, self.workers
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".to_string()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(
                "retry base delay must not exceed max delay".to_string(),
            ));
        }
        check_url("results_url", &self.results_url)?;
        if let Some(url) = &self.telemetry_url {
            check_url("telemetry_url", url)?;
        }
        if let ArchiveBackend::S3 { bucket, .. } = &self.archive {
            if bucket.trim().is_empty() {
                return Err(Error::Config("S3 bucket name is empty".to_string()));
            }
        }
        if let Some(token) = &self.api_token {
            if token.trim().is_empty() {
                return Err(Error::Config("API token is set but empty".to_string()));
            }
        }
        Ok(())
    }
}

fn check_url(name: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be an http(s) URL, got '{}'", name, url)))
    }
}

/// Retry section of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlRetry {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// Logging section of the TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset ("info", "debug", ...)
    pub level: Option<String>,
}

/// On-disk configuration file (`paddock.toml`)
///
/// Every field is optional; missing fields fall through to compiled defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    pub database: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub results_url: Option<String>,
    pub telemetry_url: Option<String>,
    pub api_token: Option<String>,
    pub workers: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub statement_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: TomlRetry,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Load a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
    }

    /// Load the explicit file, or the default location if it exists
    ///
    /// A missing default file is not an error; an explicit path that cannot
    /// be read is.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                info!("Loading config file {}", path.display());
                Self::load(&path)
            }
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub results_url: Option<String>,
    pub telemetry_url: Option<String>,
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    /// Use a process-local archive (dry runs)
    pub memory_archive: bool,
}

/// `~/.config/paddock/paddock.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("paddock").join("paddock.toml"))
}

/// `~/.local/share/paddock` (or `./paddock_data` when no data dir exists)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("paddock"))
        .unwrap_or_else(|| PathBuf::from("./paddock_data"))
}

/// Resolve the configuration from CLI overrides, the process environment and
/// the TOML file
pub fn resolve(overrides: &ConfigOverrides, toml: &TomlConfig) -> Result<PipelineConfig> {
    resolve_with_env(overrides, toml, |name| std::env::var(name).ok())
}

/// Resolve with an explicit environment lookup
pub fn resolve_with_env<F>(
    overrides: &ConfigOverrides,
    toml: &TomlConfig,
    env: F,
) -> Result<PipelineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env_nonempty = |name: &str| env(name).filter(|v| !v.trim().is_empty());

    let database_path = overrides
        .database
        .clone()
        .or_else(|| env_nonempty("PADDOCK_DATABASE").map(PathBuf::from))
        .or_else(|| toml.database.clone())
        .unwrap_or_else(|| default_data_dir().join("paddock.db"));

    let archive = if overrides.memory_archive {
        warn!("Using in-memory archive; raw payloads will not outlive this run");
        ArchiveBackend::Memory
    } else {
        // The highest tier naming either a bucket or a directory decides;
        // within one tier a bucket wins
        let tiers = [
            (overrides.s3_bucket.clone(), overrides.archive_dir.clone()),
            (
                env_nonempty("PADDOCK_S3_BUCKET"),
                env_nonempty("PADDOCK_ARCHIVE_DIR").map(PathBuf::from),
            ),
            (toml.s3_bucket.clone(), toml.archive_dir.clone()),
        ];

        match tiers
            .into_iter()
            .find(|(bucket, dir)| bucket.is_some() || dir.is_some())
        {
            Some((Some(bucket), _)) => ArchiveBackend::S3 {
                bucket,
                region: overrides
                    .s3_region
                    .clone()
                    .or_else(|| env_nonempty("AWS_REGION"))
                    .or_else(|| toml.s3_region.clone()),
            },
            Some((None, Some(root))) => ArchiveBackend::Local { root },
            _ => ArchiveBackend::Local {
                root: default_data_dir().join("archive"),
            },
        }
    };

    let results_url = overrides
        .results_url
        .clone()
        .or_else(|| env_nonempty("PADDOCK_RESULTS_URL"))
        .or_else(|| toml.results_url.clone())
        .unwrap_or_else(|| DEFAULT_RESULTS_URL.to_string());

    let telemetry_url = overrides
        .telemetry_url
        .clone()
        .or_else(|| env_nonempty("PADDOCK_TELEMETRY_URL"))
        .or_else(|| toml.telemetry_url.clone());

    let api_token = env_nonempty("PADDOCK_API_TOKEN").or_else(|| toml.api_token.clone());

    let workers = match overrides.workers {
        Some(w) => w,
        None => match env_nonempty("PADDOCK_WORKERS") {
            Some(raw) => parse_env_number("PADDOCK_WORKERS", &raw)?,
            None => toml.workers.unwrap_or(DEFAULT_WORKERS),
        },
    };

    let defaults = RetryPolicy::default();
    let max_attempts = match overrides.max_attempts {
        Some(n) => n,
        None => match env_nonempty("PADDOCK_MAX_ATTEMPTS") {
            Some(raw) => parse_env_number("PADDOCK_MAX_ATTEMPTS", &raw)?,
            None => toml.retry.max_attempts.unwrap_or(defaults.max_attempts),
        },
    };
    let retry = RetryPolicy {
        max_attempts,
        base_delay: toml
            .retry
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        max_delay: toml
            .retry
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
    };

    let config = PipelineConfig {
        database_path,
        archive,
        results_url: results_url.trim_end_matches('/').to_string(),
        telemetry_url: telemetry_url.map(|u| u.trim_end_matches('/').to_string()),
        api_token,
        user_agent: DEFAULT_USER_AGENT.to_string(),
        request_timeout: Duration::from_secs(toml.request_timeout_secs.unwrap_or(20)),
        statement_timeout: Duration::from_millis(toml.statement_timeout_ms.unwrap_or(5000)),
        retry,
        workers,
    };

    config.validate()?;
    Ok(config)
}

fn parse_env_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a valid number: '{}'", name, raw)))
}
