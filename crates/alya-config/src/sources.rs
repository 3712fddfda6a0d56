// Configuration source loading
//
// Priority: environment variables > config file (ALYA_CONFIG path, then
// ./alya.toml, ./.alya.toml) > built-in defaults.

use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

const ENV_PREFIX: &str = "ALYA_";

pub fn load_config() -> Result<AlyaConfig> {
    let mut config = load_from_file()?.unwrap_or_default();
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn load_from_file() -> Result<Option<AlyaConfig>> {
    if let Ok(path) = env::var("ALYA_CONFIG") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: AlyaConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        return Ok(Some(config));
    }

    for path in &["./alya.toml", "./.alya.toml"] {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config: AlyaConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok(Some(config));
        }
    }

    Ok(None)
}

fn apply_env_overrides(config: &mut AlyaConfig) -> Result<()> {
    // Job loop
    if let Some(val) = get_env_i64("BATCH_CHUNK_NROWS")? {
        config.jobs.chunk_rows = val;
    }
    if let Some(val) = get_env_u64("BATCH_STATUS_CACHE_DUR_SEC")? {
        config.jobs.status_cache_secs = val;
    }
    if let Some(val) = get_env_string("BATCH_OUTPUT_BUCKET")? {
        config.jobs.output_bucket = val;
    }
    if let Some(val) = get_env_u64("POLLING_INTERVAL_SEC")? {
        config.jobs.polling_interval_secs = val;
    }
    if let Some(val) = get_env_u32("MAX_CONSECUTIVE_PANICS")? {
        config.jobs.max_consecutive_panics = val;
    }
    if let Some(val) = get_env_u32("SUMMARIZE_MAX_RETRIES")? {
        config.jobs.summarize_max_retries = val;
    }
    if let Some(val) = get_env_u64("SUMMARIZE_RETRY_DELAY_MS")? {
        config.jobs.summarize_retry_delay_ms = val;
    }
    if let Some(val) = get_env_u64("HEARTBEAT_TTL_SEC")? {
        config.jobs.heartbeat_ttl_secs = val;
    }
    if let Some(val) = get_env_u64("HEARTBEAT_INTERVAL_SEC")? {
        config.jobs.heartbeat_interval_secs = val;
    }
    if let Some(val) = get_env_u64("RECOVERY_INTERVAL_SEC")? {
        config.jobs.recovery_interval_secs = val;
    }
    if let Some(val) = get_env_u64("WORKER_ROWS_TTL_SEC")? {
        config.jobs.worker_rows_ttl_secs = val;
    }
    if let Some(val) = get_env_u64("SWEEP_MIN_SEC")? {
        config.jobs.sweep_min_secs = val;
    }
    if let Some(val) = get_env_u64("SWEEP_MAX_SEC")? {
        config.jobs.sweep_max_secs = val;
    }
    if let Some(val) = get_env_u64("SLOW_QUERY_WARN_SEC")? {
        config.jobs.slow_query_warn_secs = val;
    }

    // Database
    if let Some(val) = get_env_string("DATABASE_URL")? {
        config.database.url = val;
    }
    if let Some(val) = get_env_u32("DATABASE_MAX_CONNECTIONS")? {
        config.database.max_connections = val;
    }

    // Keystore
    if let Some(val) = get_env_string("KEYSTORE_URL")? {
        config.keystore.url = val;
    }

    // Storage
    if let Some(backend) = get_env_string("STORAGE_BACKEND")? {
        config.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid ALYA_STORAGE_BACKEND value")?;
    }
    if let Some(path) = get_env_string("STORAGE_PATH")? {
        let fs = config.storage.fs.get_or_insert_with(FsConfig::default);
        fs.path = path;
    }
    if let Some(bucket) = get_env_string("S3_BUCKET")? {
        let s3 = config.storage.s3.get_or_insert_with(|| S3Config {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
        });
        s3.bucket = bucket;
    }
    if let Some(region) = get_env_string("S3_REGION")? {
        let s3 = config.storage.s3.get_or_insert_with(|| S3Config {
            bucket: String::new(),
            region: String::new(),
            endpoint: None,
        });
        s3.region = region;
    }
    if let Some(endpoint) = get_env_string("S3_ENDPOINT")? {
        let s3 = config.storage.s3.get_or_insert_with(|| S3Config {
            bucket: String::new(),
            region: String::new(),
            endpoint: None,
        });
        s3.endpoint = Some(endpoint);
    }

    Ok(())
}

/// Helper: Get environment variable as string
fn get_env_string(key: &str) -> Result<Option<String>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match env::var(&full_key) {
        Ok(val) if !val.is_empty() => Ok(Some(val)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read env var {}", full_key)),
    }
}

/// Helper: Get environment variable as u64
fn get_env_u64(key: &str) -> Result<Option<u64>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u64>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Helper: Get environment variable as u32
fn get_env_u32(key: &str) -> Result<Option<u32>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<u32>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Helper: Get environment variable as i64
fn get_env_i64(key: &str) -> Result<Option<i64>> {
    let full_key = format!("{}{}", ENV_PREFIX, key);
    match get_env_string(key)? {
        Some(val) => {
            let parsed = val
                .parse::<i64>()
                .with_context(|| format!("{} must be a valid number", full_key))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}
