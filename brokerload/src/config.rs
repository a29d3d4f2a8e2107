//! Run descriptor: the YAML scenario a load run executes.
//!
//! Loading only checks the document shape (unknown enum values are rejected by
//! serde). [`RunConfig::validate`] then reports every semantic problem at once
//! so an operator can fix a file in one pass.

use crate::utils::parse_duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default periodic report interval when unset or unparsable.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Size used for string payloads when `message_size` is 0.
pub const DEFAULT_STRING_PAYLOAD_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub broker: BrokerConfig,
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
    #[serde(default)]
    pub producers: Vec<ProducerGroup>,
    #[serde(default)]
    pub consumers: Vec<ConsumerGroup>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub service_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub duration: String,
    /// Accepted for compatibility; not used to gate measurement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_duration: Option<String>,
    /// Accepted for compatibility; not used to gate measurement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_duration: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    String,
    Json,
    Int64,
    Number,
}

/// Delivery guarantee requested for a topic. Opaque to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    NonReliable,
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Exclusive,
    Shared,
    Failover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// 0 means non-partitioned.
    #[serde(default)]
    pub partitions: u32,
    pub schema_type: SchemaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<String>,
    #[serde(default)]
    pub dispatch_strategy: DispatchMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerGroup {
    #[serde(default)]
    pub name: String,
    pub topic: String,
    pub count: usize,
    /// 0 means unlimited.
    #[serde(default)]
    pub rate_per_second: u32,
    #[serde(default)]
    pub message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerGroup {
    #[serde(default)]
    pub name: String,
    pub topic: String,
    pub subscription: String,
    pub subscription_type: SubscriptionMode,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Terminal,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<String>,
    #[serde(default)]
    pub percentiles: Vec<f64>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval: None,
            percentiles: Vec::new(),
            output_format: OutputFormat::Terminal,
            export_path: None,
        }
    }
}

impl MetricsConfig {
    /// Configured report interval, falling back to 5s if unset or invalid.
    pub fn report_every(&self) -> Duration {
        self.report_interval
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_REPORT_INTERVAL)
    }
}

impl RunConfig {
    /// Reads and parses a YAML run descriptor from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("parse yaml")
    }

    /// Parsed run duration.
    pub fn duration(&self) -> Result<Duration> {
        parse_duration(&self.execution.duration).context("invalid execution.duration")
    }

    /// Replaces the configured run duration (`run --duration`).
    pub fn override_duration(&mut self, duration: &str) -> Result<()> {
        parse_duration(duration).with_context(|| format!("invalid duration override: {duration}"))?;
        self.execution.duration = duration.to_string();
        Ok(())
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn total_producers(&self) -> usize {
        self.producers.iter().map(|p| p.count).sum()
    }

    pub fn total_consumers(&self) -> usize {
        self.consumers.iter().map(|c| c.count).sum()
    }

    /// Returns every problem found in the descriptor; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        if self.test_name.trim().is_empty() {
            errs.push("test_name is required".to_string());
        }
        if self.broker.service_url.trim().is_empty() {
            errs.push("broker.service_url is required".to_string());
        }
        if self.execution.duration.trim().is_empty() {
            errs.push("execution.duration is required".to_string());
        } else {
            match parse_duration(&self.execution.duration) {
                Ok(d) if d.is_zero() => errs.push("execution.duration must be > 0".to_string()),
                Ok(_) => {}
                Err(e) => errs.push(format!("execution.duration is invalid: {e}")),
            }
        }

        let mut names = HashSet::new();
        for (i, t) in self.topics.iter().enumerate() {
            if t.name.trim().is_empty() {
                errs.push(format!("topics[{i}].name is required"));
            } else if !names.insert(t.name.as_str()) {
                errs.push(format!("topics[{i}].name '{}' is declared twice", t.name));
            }
            if t.schema_type == SchemaKind::Json
                && t.json_schema.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                errs.push(format!(
                    "topics[{i}].json_schema is required when schema_type=json"
                ));
            }
        }

        for (i, p) in self.producers.iter().enumerate() {
            if p.topic.trim().is_empty() {
                errs.push(format!("producers[{i}].topic is required"));
            } else if self.topic(&p.topic).is_none() {
                errs.push(format!(
                    "producers[{i}].topic '{}' is not declared in topics",
                    p.topic
                ));
            }
            if p.count == 0 {
                errs.push(format!("producers[{i}].count must be > 0"));
            }
        }

        for (i, c) in self.consumers.iter().enumerate() {
            if c.topic.trim().is_empty() {
                errs.push(format!("consumers[{i}].topic is required"));
            } else if self.topic(&c.topic).is_none() {
                errs.push(format!(
                    "consumers[{i}].topic '{}' is not declared in topics",
                    c.topic
                ));
            }
            if c.subscription.trim().is_empty() {
                errs.push(format!("consumers[{i}].subscription is required"));
            }
            if c.count == 0 {
                errs.push(format!("consumers[{i}].count must be > 0"));
            }
        }

        if self.metrics.enabled {
            match self.metrics.report_interval.as_deref() {
                None | Some("") => errs.push(
                    "metrics.report_interval is required when metrics.enabled=true".to_string(),
                ),
                Some(s) => {
                    if let Err(e) = parse_duration(s) {
                        errs.push(format!("metrics.report_interval is invalid: {e}"));
                    }
                }
            }
        }
        for (i, p) in self.metrics.percentiles.iter().enumerate() {
            if !(*p > 0.0 && *p <= 100.0) {
                errs.push(format!("metrics.percentiles[{i}] must be in (0, 100]"));
            }
        }

        errs
    }
}
