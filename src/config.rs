use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::transfer::{CompensationPolicy, ExecutionMode, RetryPolicy, WorkerConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL; the in-memory store is used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            acquire_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TransferConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub compensation: CompensationPolicy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Saga step retry policy
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub step_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step_timeout_ms: 60_000,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            step_timeout: Duration::from_millis(self.step_timeout_ms),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Recovery worker schedule
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            enabled: true,
            scan_interval_secs: worker.scan_interval.as_secs(),
            stale_threshold_secs: worker.stale_threshold.as_secs(),
            batch_size: worker.batch_size,
        }
    }
}

impl RecoveryConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            batch_size: self.batch_size,
        }
    }
}

/// Kafka REST proxy publisher
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PublisherConfig {
    pub enabled: bool,
    pub rest_proxy_url: String,
    pub topic: String,
    pub timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rest_proxy_url: "http://localhost:8082".to_string(),
            topic: "transfers".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = AppConfig::from_yaml(
            r#"
log_level: info
log_dir: ./logs
log_file: transfer.log
use_json: false
rotation: daily
"#,
        )
        .unwrap();

        assert!(config.postgres_url.is_none());
        assert_eq!(config.transfer.mode, ExecutionMode::Direct);
        assert_eq!(config.transfer.compensation, CompensationPolicy::None);

        let policy = config.transfer.retry.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.step_timeout, Duration::from_secs(60));

        let worker = config.transfer.recovery.worker_config();
        assert_eq!(worker.scan_interval, Duration::from_secs(30));
        assert_eq!(worker.stale_threshold, Duration::from_secs(60));
        assert!(!config.publisher.enabled);
    }

    #[test]
    fn test_transfer_section_parsed() {
        let config = AppConfig::from_yaml(
            r#"
log_level: debug
log_dir: ./logs
log_file: transfer.log
use_json: true
rotation: hourly
postgres_url: postgres://localhost/funds
transfer:
  mode: saga
  compensation: reverse
  retry:
    max_attempts: 5
    step_timeout_ms: 1000
    initial_backoff_ms: 10
    max_backoff_ms: 100
publisher:
  enabled: true
  rest_proxy_url: http://proxy:8082
  topic: funds.transfers
  timeout_ms: 2000
"#,
        )
        .unwrap();

        assert_eq!(config.transfer.mode, ExecutionMode::Saga);
        assert_eq!(config.transfer.compensation, CompensationPolicy::Reverse);
        assert_eq!(config.transfer.retry.policy().max_attempts, 5);
        assert!(config.transfer.recovery.enabled);
        assert_eq!(config.publisher.topic, "funds.transfers");
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = AppConfig::from_yaml(
            r#"
log_level: info
log_dir: ./logs
log_file: transfer.log
use_json: false
rotation: never
transfer:
  mode: eventual
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load("does-not-exist").is_err());
    }
}
