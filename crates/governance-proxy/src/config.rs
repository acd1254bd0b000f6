// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Proxy configuration.
//!
//! Loaded in priority order:
//! 1. Defaults
//! 2. YAML file
//! 3. Environment variables prefixed with `GOVERNANCE_PROXY_` (highest priority). Nested keys are
//!    separated by `__`, e.g. `GOVERNANCE_PROXY_CARDINALITY_LIMIT__MODE=drop_tag`.

use crate::errors::ConfigError;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::error;

pub const ENV_PREFIX: &str = "GOVERNANCE_PROXY_";

const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// How cardinality governance reacts when a label's counter passes the limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum EvictionMode {
    /// Forget all state of the metric and drop the offending record.
    #[default]
    #[serde(rename = "drop_metric")]
    DropMetric,
    /// Forget the offending label and strip it from the record.
    #[serde(rename = "drop_tag")]
    DropTag,
    /// Keep at most `maxTags` label names per metric, evicting the least recently observed.
    #[serde(rename = "last_100")]
    KeepRecentTags,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    #[serde(rename = "enable")]
    pub enabled: bool,
    pub capacity: usize,
    pub limit: u64,
    pub mode: EvictionMode,
    #[serde(rename = "maxTags")]
    pub max_tags: usize,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        GovernanceConfig {
            enabled: false,
            capacity: 100,
            limit: 1000,
            mode: EvictionMode::DropMetric,
            max_tags: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(
        rename = "remoteWriteURLs",
        deserialize_with = "deserialize_endpoints"
    )]
    pub remote_write_urls: Vec<String>,
    pub debug: bool,
    pub workers: usize,
    #[serde(rename = "batchSize")]
    pub batch_size: usize,
    #[serde(rename = "releaseAfterSeconds")]
    pub release_after_seconds: u64,
    #[serde(rename = "queueCapacity")]
    pub queue_capacity: usize,
    #[serde(rename = "jsonMinCardinality")]
    pub json_min_cardinality: u64,
    pub stats_interval_seconds: u64,
    #[serde(rename = "listenAddress")]
    pub listen_address: SocketAddr,
    #[serde(rename = "maxRequestContentLength")]
    pub max_request_content_length: usize,
    #[serde(rename = "dispatchTimeoutSeconds")]
    pub dispatch_timeout_seconds: u64,
    #[serde(rename = "cardinalityLimit")]
    pub cardinality_limit: GovernanceConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            remote_write_urls: Vec::new(),
            debug: false,
            workers: 1,
            batch_size: 100,
            release_after_seconds: 10,
            queue_capacity: 100,
            json_min_cardinality: 0,
            stats_interval_seconds: 60,
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            dispatch_timeout_seconds: 10,
            cardinality_limit: GovernanceConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Reads `path` and applies environment overrides. A missing file leaves the defaults in
    /// place so the proxy can be configured from the environment alone.
    pub fn load(path: &Path) -> Result<ProxyConfig, ConfigError> {
        let config: ProxyConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .split("__")
                    .map(|key| file_key(key.as_str()).into())
                    // `split` and `map` re-enable lowercasing, so this has to come last.
                    .lowercase(false),
            )
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_write_urls.is_empty() {
            return Err(ConfigError::Invalid(
                "remoteWriteURLs must name at least one endpoint".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batchSize must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queueCapacity must be greater than 0".to_string(),
            ));
        }
        if self.stats_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "stats_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if self.cardinality_limit.capacity == 0 {
            return Err(ConfigError::Invalid(
                "cardinalityLimit.capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn release_after(&self) -> Duration {
        Duration::from_secs(self.release_after_seconds)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }

    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }
}

/// Maps an environment key such as `CARDINALITY_LIMIT.MAX_TAGS` onto the file key
/// `cardinalityLimit.maxTags`.
fn file_key(env_key: &str) -> String {
    env_key
        .split('.')
        .map(|segment| {
            let segment = segment.to_ascii_lowercase();
            match segment.as_str() {
                "remote_write_urls" => "remoteWriteURLs".to_string(),
                "batch_size" => "batchSize".to_string(),
                "release_after_seconds" => "releaseAfterSeconds".to_string(),
                "queue_capacity" => "queueCapacity".to_string(),
                "json_min_cardinality" => "jsonMinCardinality".to_string(),
                "listen_address" => "listenAddress".to_string(),
                "max_request_content_length" => "maxRequestContentLength".to_string(),
                "dispatch_timeout_seconds" => "dispatchTimeoutSeconds".to_string(),
                "cardinality_limit" => "cardinalityLimit".to_string(),
                "max_tags" => "maxTags".to_string(),
                _ => segment,
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Accepts either a comma-separated string or a list of strings. Blank entries are skipped.
fn deserialize_endpoints<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let urls = match Value::deserialize(deserializer)? {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(values) => values
            .into_iter()
            .filter_map(|value| match value {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::String(_) => None,
                other => {
                    error!("Failed to parse remote write URL, expected a string, got: {other}, ignoring");
                    None
                }
            })
            .collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected a comma-separated string or a list of URLs, got: {other}"
            )))
        }
    };
    Ok(urls)
}
