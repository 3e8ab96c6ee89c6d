//! Crate-wide tunables, loadable from a TOML file.
//!
//! Parse-then-deserialize into a typed struct, simplified to a single TOML
//! document with `serde(default)` throughout rather than a YAML
//! `$include`/env-expansion pipeline, since this crate has no multi-file
//! composition to do.

use crate::error::{ExecutionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_queue_capacity() -> usize {
    100
}
fn default_event_buffer_capacity() -> usize {
    200
}
fn default_batch_size() -> usize {
    50
}
fn default_batch_timeout_ms() -> u64 {
    100
}
fn default_max_depth() -> u32 {
    100
}
fn default_max_concurrency() -> usize {
    8
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_cleanup_max_age_secs() -> u64 {
    24 * 3600
}
fn default_cleanup_max_executions() -> usize {
    50_000
}
fn default_execution_id_prefix() -> String {
    "EX".into()
}
fn default_event_id_prefix() -> String {
    "EV".into()
}

/// Queue-related tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub subscriber_capacity: usize,
    pub event_buffer_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_queue_capacity(),
            event_buffer_capacity: default_event_buffer_capacity(),
        }
    }
}

/// Durable event batching tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self { batch_size: default_batch_size(), batch_timeout_ms: default_batch_timeout_ms() }
    }
}

/// Reaper tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub max_age_secs: u64,
    pub max_executions: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            max_age_secs: default_cleanup_max_age_secs(),
            max_executions: default_cleanup_max_executions(),
        }
    }
}

/// Id-generation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    pub execution_prefix: String,
    pub event_prefix: String,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self { execution_prefix: default_execution_id_prefix(), event_prefix: default_event_id_prefix() }
    }
}

/// Top-level configuration for everything in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionCoreConfig {
    pub queue: QueueConfig,
    pub event_store: EventStoreConfig,
    pub cleanup: CleanupConfig,
    pub ids: IdConfig,
    /// Maximum parent-to-child spawn depth before a cycle is assumed.
    pub max_depth: u32,
    /// Default concurrency bound for the execution engine.
    pub max_concurrency: usize,
}

impl Default for ExecutionCoreConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            event_store: EventStoreConfig::default(),
            cleanup: CleanupConfig::default(),
            ids: IdConfig::default(),
            max_depth: default_max_depth(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl ExecutionCoreConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| ExecutionError::Internal(format!("invalid configuration: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ExecutionError::Internal(format!("failed to read {:?}: {e}", path.as_ref())))?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ExecutionCoreConfig::default();
        assert_eq!(config.queue.subscriber_capacity, 100);
        assert_eq!(config.queue.event_buffer_capacity, 200);
        assert_eq!(config.event_store.batch_size, 50);
        assert_eq!(config.event_store.batch_timeout_ms, 100);
        assert_eq!(config.max_depth, 100);
        assert_eq!(config.cleanup.max_age_secs, 24 * 3600);
        assert_eq!(config.cleanup.interval_secs, 3600);
        assert_eq!(config.cleanup.max_executions, 50_000);
        assert_eq!(config.ids.execution_prefix, "EX");
        assert_eq!(config.ids.event_prefix, "EV");
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = ExecutionCoreConfig::from_toml_str("max_depth = 5\n").unwrap();
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.queue.subscriber_capacity, 100);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(ExecutionCoreConfig::from_toml_str("not valid = = toml").is_err());
    }
}
