//! Metric sources.
//!
//! A source returns the current counters of one resource. The YouTube Data
//! API source maps video statistics onto metric names.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use milestone_core::{Config, ResourceId};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Current counter values of a resource, keyed by metric name.
///
/// A metric the source did not report is absent, never zero.
pub type MetricSnapshot = BTreeMap<String, u64>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("metric source unavailable: {0}")]
    Unavailable(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("invalid response from metric source: {0}")]
    InvalidResponse(String),
    #[error("metric source not configured: {0}")]
    NotConfigured(String),
    #[error("metric source timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::InvalidResponse(e.to_string())
        } else {
            SourceError::Unavailable(e.to_string())
        }
    }
}

/// Something that can report a resource's counters.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(&self, resource_id: &ResourceId) -> Result<MetricSnapshot, SourceError>;
}

/// YouTube Data API v3 `videos?part=statistics` source.
#[derive(Debug, Clone)]
pub struct YouTubeSource {
    api_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl YouTubeSource {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.youtube_api_url.clone(), config.youtube_api_key.clone())
    }
}

#[async_trait]
impl MetricSource for YouTubeSource {
    async fn fetch(&self, resource_id: &ResourceId) -> Result<MetricSnapshot, SourceError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::NotConfigured("youtube_api_key is not set".into()))?;

        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("part", "statistics"),
                ("id", resource_id.as_str()),
                ("key", key),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                api_error_message(&body).unwrap_or(body)
            )));
        }

        let snapshot = parse_statistics(resource_id, &body)?;
        debug!(resource_id = %resource_id, ?snapshot, "fetched video statistics");
        Ok(snapshot)
    }
}

// --- Response parsing ---

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    #[serde(default)]
    statistics: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Statistics fields and the metric names they report.
const STATISTICS_FIELDS: &[(&str, &str)] = &[
    ("viewCount", "views"),
    ("likeCount", "likes"),
    ("commentCount", "comments"),
];

fn api_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<VideoListResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .map(|e| e.message)
}

/// Parse a `videos?part=statistics` response body.
///
/// Counts arrive as decimal strings; plain numbers are accepted too.
pub fn parse_statistics(resource_id: &ResourceId, body: &str) -> Result<MetricSnapshot, SourceError> {
    let response: VideoListResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(SourceError::Unavailable(error.message));
    }
    let item = response
        .items
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::NotFound(resource_id.to_string()))?;

    let mut snapshot = MetricSnapshot::new();
    for (field, metric) in STATISTICS_FIELDS {
        let Some(raw) = item.statistics.get(*field) else {
            continue;
        };
        let value = match raw {
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        }
        .ok_or_else(|| SourceError::InvalidResponse(format!("{field} is not a count: {raw}")))?;
        snapshot.insert((*metric).to_string(), value);
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ResourceId {
        ResourceId::new("LQAFm01IOT0")
    }

    #[test]
    fn parses_string_counts() {
        let body = r#"{
            "kind": "youtube#videoListResponse",
            "items": [{
                "id": "LQAFm01IOT0",
                "statistics": {
                    "viewCount": "531",
                    "likeCount": "27",
                    "favoriteCount": "0",
                    "commentCount": "4"
                }
            }]
        }"#;
        let snapshot = parse_statistics(&id(), body).unwrap();
        assert_eq!(snapshot.get("views"), Some(&531));
        assert_eq!(snapshot.get("likes"), Some(&27));
        assert_eq!(snapshot.get("comments"), Some(&4));
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn hidden_like_count_is_absent_not_zero() {
        let body = r#"{"items": [{"statistics": {"viewCount": 1200}}]}"#;
        let snapshot = parse_statistics(&id(), body).unwrap();
        assert_eq!(snapshot.get("views"), Some(&1200));
        assert!(!snapshot.contains_key("likes"));
    }

    #[test]
    fn empty_items_is_not_found() {
        let body = r#"{"items": []}"#;
        assert!(matches!(
            parse_statistics(&id(), body),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn api_error_body_is_unavailable() {
        let body = r#"{"error": {"code": 403, "message": "quota exceeded"}}"#;
        match parse_statistics(&id(), body) {
            Err(SourceError::Unavailable(msg)) => assert_eq!(msg, "quota exceeded"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(api_error_message(body).as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn malformed_counts_are_rejected() {
        let body = r#"{"items": [{"statistics": {"viewCount": "-3"}}]}"#;
        assert!(matches!(
            parse_statistics(&id(), body),
            Err(SourceError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_statistics(&id(), "<html>"),
            Err(SourceError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn missing_api_key_is_not_configured() {
        let source = YouTubeSource::new("http://127.0.0.1:1/videos", None);
        assert!(matches!(
            source.fetch(&id()).await,
            Err(SourceError::NotConfigured(_))
        ));
    }
}
