//! Configuration parsing for the milestone adapter.
//!
//! `key=value` lines, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > defaults.
//!
//! Metric rules use dotted keys:
//!
//! ```text
//! metric.views.rule=floor_step
//! metric.views.floor=525
//! metric.views.step=5
//! resource.LQAFm01IOT0.metric.likes.step=50
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::catalog::{MetricCatalog, MetricRule};
use crate::rules::CrossingRule;
use crate::types::RuleKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid metric '{metric}': {message}")]
    InvalidMetric { metric: String, message: String },
}

/// Raw, not yet validated settings for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricSettings {
    pub rule: Option<RuleKind>,
    pub floor: Option<u64>,
    pub step: Option<u64>,
    pub initial: Option<u64>,
}

impl MetricSettings {
    fn floor_step(floor: u64, step: u64) -> Self {
        Self {
            rule: Some(RuleKind::FloorStep),
            floor: Some(floor),
            step: Some(step),
            initial: None,
        }
    }

    fn pure_step(step: u64) -> Self {
        Self {
            rule: Some(RuleKind::PureStep),
            floor: None,
            step: Some(step),
            initial: None,
        }
    }

    /// Apply per-resource settings on top of `self`.
    fn overlay(self, other: Self) -> Self {
        Self {
            rule: other.rule.or(self.rule),
            floor: other.floor.or(self.floor),
            step: other.step.or(self.step),
            initial: other.initial.or(self.initial),
        }
    }

    fn build(self, metric: &str) -> Result<MetricRule, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidMetric {
            metric: metric.to_string(),
            message: message.to_string(),
        };
        let step = self.step.ok_or_else(|| invalid("missing step"))?;
        let rule = match self.rule {
            Some(RuleKind::FloorStep) => CrossingRule::FloorStep {
                floor: self.floor.unwrap_or(0),
                step,
            },
            Some(RuleKind::PureStep) => CrossingRule::PureStep { step },
            None => return Err(invalid("missing rule")),
        };
        rule.validate().map_err(|e| invalid(&e))?;
        Ok(MetricRule {
            rule,
            initial: self.initial,
        })
    }
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // HTTP
    pub bind: String,
    pub port: u16,
    pub auth_token: Option<String>,

    // Storage
    pub db_path: PathBuf,
    pub store_timeout_ms: u64,
    /// Keep an in-process state cache (disable when several processes
    /// share one store).
    pub state_cache: bool,

    // Metric source
    pub youtube_api_url: String,
    pub youtube_api_key: Option<String>,
    pub source_timeout_ms: u64,

    // Metric rules
    pub metrics: BTreeMap<String, MetricSettings>,
    pub resources: BTreeMap<String, BTreeMap<String, MetricSettings>>,
}

impl Default for Config {
    fn default() -> Self {
        let mut metrics = BTreeMap::new();
        metrics.insert("views".to_string(), MetricSettings::floor_step(525, 5));
        metrics.insert("likes".to_string(), MetricSettings::pure_step(25));

        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            auth_token: None,
            db_path: dirs::data_local_dir().map_or_else(
                || PathBuf::from("milestoned.db"),
                |d| d.join("milestoned").join("milestoned.db"),
            ),
            store_timeout_ms: 5000,
            state_cache: true,
            youtube_api_url: "https://www.googleapis.com/youtube/v3/videos".to_string(),
            youtube_api_key: None,
            source_timeout_ms: 10_000,
            metrics,
            resources: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if let Some(rest) = key.strip_prefix("metric.") {
            let (metric, field) = Self::split_metric_key(key, rest)?;
            let settings = self.metrics.entry(metric.to_string()).or_default();
            return Self::apply_metric_field(settings, key, field, value);
        }
        if let Some(rest) = key.strip_prefix("resource.") {
            let Some((resource, rest)) = rest.split_once(".metric.") else {
                return Err(ConfigError::InvalidLine(format!(
                    "expected resource.<id>.metric.<name>.<field>, got '{key}'"
                )));
            };
            let (metric, field) = Self::split_metric_key(key, rest)?;
            let settings = self
                .resources
                .entry(resource.to_string())
                .or_default()
                .entry(metric.to_string())
                .or_default();
            return Self::apply_metric_field(settings, key, field, value);
        }

        match key {
            "bind" => self.bind = value.to_string(),
            "port" => {
                self.port = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "auth_token" => {
                self.auth_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "db_path" => self.db_path = PathBuf::from(value),
            "store_timeout_ms" => self.store_timeout_ms = Self::parse_int(key, value)?,
            "state_cache" => self.state_cache = Self::parse_bool(key, value)?,
            "youtube_api_url" => self.youtube_api_url = value.to_string(),
            "youtube_api_key" => {
                self.youtube_api_key = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "source_timeout_ms" => self.source_timeout_ms = Self::parse_int(key, value)?,
            _ => {
                // Warn but don't fail for unknown keys.
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    /// Split `<name>.<field>` from a metric key.
    fn split_metric_key<'a>(key: &str, rest: &'a str) -> Result<(&'a str, &'a str), ConfigError> {
        match rest.rsplit_once('.') {
            Some((metric, field)) if !metric.is_empty() => Ok((metric, field)),
            _ => Err(ConfigError::InvalidLine(format!(
                "expected <metric>.<field> in '{key}'"
            ))),
        }
    }

    fn apply_metric_field(
        settings: &mut MetricSettings,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        match field {
            "rule" => {
                settings.rule = Some(match value {
                    "floor_step" => RuleKind::FloorStep,
                    "pure_step" => RuleKind::PureStep,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "{key} must be 'floor_step' or 'pure_step', got '{value}'"
                        )))
                    }
                });
            }
            "floor" => settings.floor = Some(Self::parse_int(key, value)?),
            "step" => settings.step = Some(Self::parse_int(key, value)?),
            "initial" => settings.initial = Some(Self::parse_int(key, value)?),
            _ => {
                return Err(ConfigError::InvalidLine(format!(
                    "unknown metric field '{field}' in '{key}'"
                )))
            }
        }
        Ok(())
    }

    fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Build the validated metric registry.
    ///
    /// Per-resource settings overlay the default settings of the same metric,
    /// so an override may change just the step.
    pub fn catalog(&self) -> Result<MetricCatalog, ConfigError> {
        let mut catalog = MetricCatalog::new();
        for (name, settings) in &self.metrics {
            catalog = catalog.with_metric(name.clone(), settings.build(name)?);
        }
        for (resource, metrics) in &self.resources {
            for (name, settings) in metrics {
                let merged = self
                    .metrics
                    .get(name)
                    .copied()
                    .unwrap_or_default()
                    .overlay(*settings);
                let label = format!("{resource}/{name}");
                catalog = catalog.with_override(resource.clone(), name.clone(), merged.build(&label)?);
            }
        }
        Ok(catalog)
    }

    /// Store call timeout; `None` when disabled (`0`).
    pub fn store_timeout(&self) -> Option<Duration> {
        (self.store_timeout_ms > 0).then(|| Duration::from_millis(self.store_timeout_ms))
    }

    /// Metric fetch timeout; `None` when disabled (`0`).
    pub fn source_timeout(&self) -> Option<Duration> {
        (self.source_timeout_ms > 0).then(|| Duration::from_millis(self.source_timeout_ms))
    }
}
