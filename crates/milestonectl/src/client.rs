//! HTTP client for the milestoned daemon.
//!
//! Talks to the external-adapter endpoint and the administrative
//! `/resources` routes.

use milestone_core::ResourceStatus;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: milestoned\n  → or set MILESTONED_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unauthorized: check MILESTONED_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("state write outcome unknown: {0}\n  → run `milestonectl status` before checking again")]
    RecheckRequired(String),

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure milestoned is running\n  → check MILESTONED_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Adapter request (POST /).
#[derive(Debug, Serialize)]
pub struct CheckRequest<'a> {
    pub id: &'a str,
    pub data: CheckRequestData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequestData<'a> {
    pub video_id: &'a str,
    pub endpoint: &'a str,
}

/// Adapter response.
#[derive(Debug, Deserialize)]
pub struct CheckResponse {
    #[serde(rename = "jobRunID")]
    pub job_run_id: serde_json::Value,
    pub data: CheckResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub value: u64,
    #[serde(default)]
    pub views: Option<u64>,
    #[serde(default)]
    pub likes: Option<u64>,
    pub should_trigger: bool,
    #[serde(default)]
    pub milestone: Option<u64>,
    #[serde(default)]
    pub source_regressed: bool,
}

/// Response from DELETE /resources/{id}.
#[derive(Debug, Deserialize)]
pub struct DeleteResourceResponse {
    pub removed: bool,
}

/// Error body; adapter errors also carry `recheck`.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub recheck: bool,
}

/// Default total timeout for daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for milestoned.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Check if daemon is healthy by probing /health endpoint.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for daemon to become ready with exponential backoff.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    /// Wait for daemon to become ready with custom timeout.
    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;

                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }

        match response.json::<ErrorResponse>().await {
            Ok(body) if body.recheck => ClientError::RecheckRequired(body.error),
            Ok(body) => ClientError::HttpError {
                status,
                message: body.error,
            },
            Err(_) => ClientError::HttpError {
                status,
                message: "unknown error".to_string(),
            },
        }
    }

    fn resource_url(&self, resource_id: &str) -> String {
        format!(
            "{}/resources/{}",
            self.base_url,
            urlencoding::encode(resource_id)
        )
    }

    /// Fetch a metric and apply it, as an oracle node would.
    /// POST /
    pub async fn check(
        &self,
        job_run_id: &str,
        resource_id: &str,
        metric: &str,
    ) -> Result<CheckResponse, ClientError> {
        let req = CheckRequest {
            id: job_run_id,
            data: CheckRequestData {
                video_id: resource_id,
                endpoint: metric,
            },
        };
        let response = self
            .http
            .post(format!("{}/", self.base_url))
            .headers(self.headers())
            .json(&req)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Stored counters and next triggers.
    /// GET /resources/{id}
    pub async fn status(&self, resource_id: &str) -> Result<ResourceStatus, ClientError> {
        let response = self
            .http
            .get(self.resource_url(resource_id))
            .headers(self.headers())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Delete a resource's stored state.
    /// DELETE /resources/{id}
    pub async fn forget(&self, resource_id: &str) -> Result<bool, ClientError> {
        let response = self
            .http
            .delete(self.resource_url(resource_id))
            .headers(self.headers())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let body: DeleteResourceResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.removed)
    }
}
