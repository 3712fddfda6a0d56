// alya-config - Unified configuration for workers and clients
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from ALYA_CONFIG env var
// 3. Default config file locations (./alya.toml, ./.alya.toml)
// 4. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod sources;

/// Main engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlyaConfig {
    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub keystore: KeystoreConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Tunables of the worker loop and batch lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Rows claimed per supervisor iteration.
    pub chunk_rows: i64,
    /// Base TTL of per-batch cache keys; terminal entries live 100x longer.
    pub status_cache_secs: u64,
    /// Bucket receiving assembled batch output files.
    pub output_bucket: String,
    pub polling_interval_secs: u64,
    pub max_consecutive_panics: u32,
    pub summarize_max_retries: u32,
    pub summarize_retry_delay_ms: u64,
    pub heartbeat_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub recovery_interval_secs: u64,
    pub worker_rows_ttl_secs: u64,
    pub sweep_min_secs: u64,
    pub sweep_max_secs: u64,
    /// Slow queries running longer than this are logged as warnings.
    pub slow_query_warn_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            chunk_rows: 10,
            status_cache_secs: 60,
            output_bucket: "alya-batch-output".to_string(),
            polling_interval_secs: 45,
            max_consecutive_panics: 3,
            summarize_max_retries: 5,
            summarize_retry_delay_ms: 50,
            heartbeat_ttl_secs: 60,
            heartbeat_interval_secs: 30,
            recovery_interval_secs: 60,
            worker_rows_ttl_secs: 180,
            sweep_min_secs: 300,
            sweep_max_secs: 600,
            slow_query_warn_secs: 30,
        }
    }
}

impl JobsConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_secs)
    }

    /// TTL for cache entries of terminal batches.
    pub fn terminal_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_secs.saturating_mul(100))
    }

    pub fn summarize_retry_delay(&self) -> Duration {
        Duration::from_millis(self.summarize_retry_delay_ms)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn worker_rows_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_rows_ttl_secs)
    }

    pub fn slow_query_warn(&self) -> Duration {
        Duration::from_secs(self.slow_query_warn_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/alya".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreConfig {
    pub url: String,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Object-store backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" | "aws" => Ok(StorageBackend::S3),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: fs, s3, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl AlyaConfig {
    /// Load configuration from all sources with priority.
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let jobs = &self.jobs;
        if jobs.chunk_rows < 1 {
            anyhow::bail!("jobs.chunk_rows must be at least 1");
        }
        if jobs.polling_interval_secs < 1 {
            anyhow::bail!("jobs.polling_interval_secs must be at least 1");
        }
        if jobs.output_bucket.is_empty() {
            anyhow::bail!("jobs.output_bucket must not be empty");
        }
        if jobs.max_consecutive_panics < 1 {
            anyhow::bail!("jobs.max_consecutive_panics must be at least 1");
        }
        if jobs.sweep_min_secs >= jobs.sweep_max_secs {
            anyhow::bail!("jobs.sweep_min_secs must be below jobs.sweep_max_secs");
        }
        if self.storage.backend == StorageBackend::S3 {
            let s3 = self
                .storage
                .s3
                .as_ref()
                .context("s3 backend requires storage.s3 configuration")?;
            if s3.bucket.is_empty() {
                anyhow::bail!("storage.s3.bucket must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let jobs = JobsConfig::default();
        assert_eq!(jobs.chunk_rows, 10);
        assert_eq!(jobs.status_cache_secs, 60);
        assert_eq!(jobs.output_bucket, "alya-batch-output");
        assert_eq!(jobs.polling_interval_secs, 45);
        assert_eq!(jobs.max_consecutive_panics, 3);
        assert_eq!(jobs.summarize_max_retries, 5);
        assert_eq!(jobs.summarize_retry_delay_ms, 50);
        assert_eq!(jobs.heartbeat_ttl_secs, 60);
        assert_eq!(jobs.heartbeat_interval_secs, 30);
        assert_eq!(jobs.recovery_interval_secs, 60);
        assert_eq!(jobs.worker_rows_ttl_secs, 180);
        assert_eq!(jobs.sweep_min_secs, 300);
        assert_eq!(jobs.sweep_max_secs, 600);
    }

    #[test]
    fn terminal_ttl_is_a_hundredfold() {
        let jobs = JobsConfig::default();
        assert_eq!(
            jobs.terminal_cache_ttl(),
            Duration::from_secs(jobs.status_cache_secs * 100)
        );
    }

    #[test]
    fn storage_backend_from_str() {
        assert_eq!("fs".parse::<StorageBackend>().unwrap(), StorageBackend::Fs);
        assert_eq!("s3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!(
            "memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert!("tape".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn validation_rejects_inverted_sweep_range() {
        let mut config = AlyaConfig::default();
        config.jobs.sweep_min_secs = 600;
        config.jobs.sweep_max_secs = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_chunk() {
        let mut config = AlyaConfig::default();
        config.jobs.chunk_rows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_parses_from_toml() {
        let config: AlyaConfig = toml::from_str(
            r#"
            [jobs]
            chunk_rows = 25
            status_cache_secs = 30
            output_bucket = "acme-batch-out"
            polling_interval_secs = 5
            max_consecutive_panics = 3
            summarize_max_retries = 5
            summarize_retry_delay_ms = 50
            heartbeat_ttl_secs = 60
            heartbeat_interval_secs = 30
            recovery_interval_secs = 60
            worker_rows_ttl_secs = 180
            sweep_min_secs = 300
            sweep_max_secs = 600
            slow_query_warn_secs = 30

            [database]
            url = "postgres://db/alya"
            max_connections = 4

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.jobs.chunk_rows, 25);
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        config.validate().unwrap();
    }
}
