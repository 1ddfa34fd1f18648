//! paddock-ingest - command-line entry point
//!
//! Runs one pipeline invocation and exits:
//! - 0: run finished `Done`
//! - 1: run finished `Failed`
//! - 2: configuration or startup error (nothing was processed)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use paddock_common::config::{self, ConfigOverrides, PipelineConfig, TomlConfig};
use paddock_common::SourceKind;
use paddock_ingest::clients::RaceSelector;
use paddock_ingest::coordinator::{RunRequest, RunState};
use paddock_ingest::error::RunError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "paddock_ingest=info,paddock_common=info";

/// Command-line arguments for paddock-ingest
#[derive(Parser, Debug)]
#[command(name = "paddock-ingest")]
#[command(about = "Fetch, archive, normalize and aggregate F1 race data")]
#[command(version)]
struct Args {
    /// Source kinds to process (results, telemetry); defaults to all
    #[arg(short, long = "source", value_delimiter = ',')]
    sources: Vec<SourceKind>,

    /// Target date used as the archive partition (YYYY-MM-DD, default today UTC)
    #[arg(short, long)]
    date: Option<NaiveDate>,

    /// Races to fetch as SEASON/ROUND or `latest`; defaults to latest
    #[arg(short, long = "race", value_delimiter = ',')]
    races: Vec<RaceSelector>,

    /// Re-normalize payloads already archived for --date instead of fetching
    #[arg(long)]
    replay: bool,

    /// Serve every fetch from this local file instead of the network
    #[arg(long)]
    mock_file: Option<PathBuf>,

    /// Config file (default ~/.config/paddock/paddock.toml if present)
    #[arg(short, long, env = "PADDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Archive raw payloads under this directory
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Archive raw payloads in this S3 bucket
    #[arg(long)]
    s3_bucket: Option<String>,

    #[arg(long)]
    s3_region: Option<String>,

    /// Results provider base URL
    #[arg(long)]
    results_url: Option<String>,

    /// Telemetry provider base URL
    #[arg(long)]
    telemetry_url: Option<String>,

    /// Units processed concurrently
    #[arg(short, long)]
    workers: Option<usize>,

    /// Fetch attempts per unit, including the first
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Keep raw payloads in memory only (dry runs)
    #[arg(long)]
    memory_archive: bool,

    /// Expose Prometheus metrics on this address while the run lasts
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database: self.database.clone(),
            archive_dir: self.archive_dir.clone(),
            s3_bucket: self.s3_bucket.clone(),
            s3_region: self.s3_region.clone(),
            results_url: self.results_url.clone(),
            telemetry_url: self.telemetry_url.clone(),
            workers: self.workers,
            max_attempts: self.max_attempts,
            memory_archive: self.memory_archive,
        }
    }

    fn request(&self) -> RunRequest {
        let sources = if self.sources.is_empty() {
            SourceKind::ALL.to_vec()
        } else {
            let mut sources = self.sources.clone();
            sources.sort();
            sources.dedup();
            sources
        };

        RunRequest {
            target_date: self.date.unwrap_or_else(|| Utc::now().date_naive()),
            sources,
            races: self.races.clone(),
            replay: self.replay,
        }
    }
}

fn init_tracing(toml_level: Option<&str>) {
    let fallback = toml_level
        .map(|level| format!("paddock_ingest={0},paddock_common={0}", level))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Reject requests that cannot succeed before any unit runs
fn check_request(config: &PipelineConfig, request: &RunRequest, args: &Args) -> Result<()> {
    let needs_telemetry_url = !request.replay
        && args.mock_file.is_none()
        && request.sources.contains(&SourceKind::Telemetry);
    if needs_telemetry_url && config.telemetry_url.is_none() {
        bail!("telemetry requested but no telemetry provider URL is configured (--telemetry-url or PADDOCK_TELEMETRY_URL)");
    }
    if request.replay && args.mock_file.is_some() {
        bail!("--replay and --mock-file cannot be combined");
    }
    if request.replay && !request.races.is_empty() {
        warn!("--race is ignored in replay mode");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging level may come from the config file, so read it first
    let toml = TomlConfig::load_or_default(args.config.as_deref());
    init_tracing(
        toml.as_ref()
            .ok()
            .and_then(|t| t.logging.level.as_deref()),
    );

    info!("Starting paddock-ingest v{}", env!("CARGO_PKG_VERSION"));

    let toml = match toml {
        Ok(toml) => toml,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let request = args.request();
    let config = match config::resolve(&args.overrides(), &toml)
        .context("Invalid configuration")
        .and_then(|config| check_request(&config, &request, &args).map(|_| config))
    {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    info!(
        database = %config.database_path.display(),
        archive = ?config.archive,
        workers = config.workers,
        "Configuration resolved"
    );

    if let Some(addr) = args.metrics_addr {
        if let Err(e) = paddock_ingest::metrics::install_prometheus(addr) {
            error!("{}", e);
            return ExitCode::from(2);
        }
        info!("Metrics exporter listening on {}", addr);
    }

    let coordinator = match paddock_ingest::open_pipeline(&config, args.mock_file.clone()).await {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("Failed to open pipeline: {}", e);
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C; finishing in-flight units");
            signal_token.cancel();
        }
    });

    match coordinator.run(&request, cancel).await {
        Ok(summary) if summary.state == RunState::Done => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(RunError::Configuration(message)) => {
            error!("Run aborted: {}", message);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("Run failed: {}", e);
            ExitCode::from(1)
        }
    }
}
