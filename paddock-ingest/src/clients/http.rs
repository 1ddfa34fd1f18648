//! HTTP source client for the results and telemetry providers

use async_trait::async_trait;
use bytes::Bytes;
use paddock_common::config::{PipelineConfig, RetryPolicy};
use paddock_common::{Error, SourceKind};
use reqwest::{StatusCode, Url};

use super::retry::retry_with_backoff;
use super::{FetchParams, RaceSelector, SourceClient};
use crate::error::FetchError;

/// Provider client over HTTP
///
/// Results provider (Jolpica/Ergast-compatible):
/// - `<base>/<season>/<round>/results.json`
/// - `<base>/current/last/results.json`
///
/// Telemetry provider (FastF1 session export):
/// - `<base>/<season>/<round>/session.json`
/// - `<base>/latest/session.json`
pub struct HttpSourceClient {
    http_client: reqwest::Client,
    results_url: String,
    telemetry_url: Option<String>,
    api_token: Option<String>,
    retry: RetryPolicy,
}

impl HttpSourceClient {
    pub fn new(config: &PipelineConfig) -> paddock_common::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            results_url: config.results_url.clone(),
            telemetry_url: config.telemetry_url.clone(),
            api_token: config.api_token.clone(),
            retry: config.retry,
        })
    }

    fn url_for(&self, kind: SourceKind, params: &FetchParams) -> Result<Url, FetchError> {
        let raw = match kind {
            SourceKind::Results => match params.race {
                RaceSelector::Latest => format!("{}/current/last/results.json", self.results_url),
                RaceSelector::Round { season, round } => {
                    format!("{}/{}/{}/results.json", self.results_url, season, round)
                }
            },
            SourceKind::Telemetry => {
                let base = self.telemetry_url.as_ref().ok_or_else(|| {
                    FetchError::configuration(None, "telemetry provider URL is not configured")
                })?;
                match params.race {
                    RaceSelector::Latest => format!("{}/latest/session.json", base),
                    RaceSelector::Round { season, round } => {
                        format!("{}/{}/{}/session.json", base, season, round)
                    }
                }
            }
        };

        Url::parse(&raw)
            .map_err(|e| FetchError::permanent(None, format!("malformed URL '{}': {}", raw, e)))
    }

    async fn fetch_once(&self, url: Url) -> Result<Bytes, FetchError> {
        let mut request = self.http_client.get(url.clone());
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| classify_send_error(&url, e))?;
        let status = response.status();

        if status.is_success() {
            return response
                .bytes()
                .await
                .map_err(|e| FetchError::transient(format!("reading body of {}: {}", url, e)));
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(classify_status(status, &url, &snippet))
    }
}

fn classify_send_error(url: &Url, err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::permanent(None, format!("invalid request for {}: {}", url, err))
    } else {
        // Timeouts, refused connections, resets, DNS hiccups
        FetchError::transient(format!("GET {}: {}", url, err))
    }
}

fn classify_status(status: StatusCode, url: &Url, body: &str) -> FetchError {
    let code = status.as_u16();
    let message = format!("GET {} returned {}: {}", url, status, body);

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::transient(message)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        FetchError::configuration(Some(code), message)
    } else {
        FetchError::permanent(Some(code), message)
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(&self, kind: SourceKind, params: &FetchParams) -> Result<Bytes, FetchError> {
        let url = self.url_for(kind, params)?;
        tracing::debug!(source = %kind, url = %url, "Fetching payload");

        let operation = format!("fetch {}", kind);
        let body = retry_with_backoff(&operation, &self.retry, |_| self.fetch_once(url.clone())).await?;

        tracing::info!(source = %kind, race = %params.race, bytes = body.len(), "Fetched payload");
        Ok(body)
    }
}
