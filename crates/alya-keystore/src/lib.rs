// alya-keystore - Redis implementation of the keystore contract
//
// Holds the non-authoritative coordination state: per-batch status/result
// caches, the worker registry, per-worker heartbeats, and per-worker
// active-row sets. The database stays authoritative; callers treat failures
// here as log-and-continue except during recovery.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;

use alya_core::store::Keystore;
use alya_core::types::{BatchStatus, BatchSummary, OutputFiles};

pub mod keys;

/// Keystore over a multiplexed, auto-reconnecting redis connection.
/// Cloning is cheap; all clones share the underlying connection.
#[derive(Clone)]
pub struct RedisKeystore {
    conn: ConnectionManager,
}

impl RedisKeystore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid keystore url {}", url))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to keystore at {}", url))?;
        Ok(Self { conn })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl Keystore for RedisKeystore {
    async fn get_batch_status(&self, batch: &str) -> Result<Option<BatchStatus>> {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn.get(keys::status_key(batch)).await?;
        cached.map(|s| s.parse()).transpose()
    }

    async fn set_batch_status(
        &self,
        batch: &str,
        status: BatchStatus,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(keys::status_key(batch), status.as_str(), Self::ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn set_batch_caches(
        &self,
        batch: &str,
        status: BatchStatus,
        result: Option<&Value>,
        output_files: Option<&OutputFiles>,
        summary: Option<&BatchSummary>,
        ttl: Duration,
    ) -> Result<()> {
        let secs = Self::ttl_secs(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set_ex(keys::status_key(batch), status.as_str(), secs)
            .ignore();
        if let Some(result) = result {
            pipe.set_ex(keys::result_key(batch), serde_json::to_string(result)?, secs)
                .ignore();
        }
        if let Some(files) = output_files {
            pipe.set_ex(
                keys::output_files_key(batch),
                serde_json::to_string(files)?,
                secs,
            )
            .ignore();
        }
        if let Some(summary) = summary {
            pipe.set_ex(
                keys::summary_key(batch),
                serde_json::to_string(summary)?,
                secs,
            )
            .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_batch_summary(&self, batch: &str) -> Result<Option<BatchSummary>> {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn.get(keys::summary_key(batch)).await?;
        cached
            .map(|raw| serde_json::from_str(&raw).context("Malformed cached batch summary"))
            .transpose()
    }

    async fn get_batch_result(&self, batch: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn.get(keys::result_key(batch)).await?;
        cached
            .map(|raw| serde_json::from_str(&raw).context("Malformed cached batch result"))
            .transpose()
    }

    async fn register_worker(&self, instance: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(keys::WORKERS_SET, instance).await?;
        Ok(())
    }

    async fn deregister_worker(&self, instance: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(keys::WORKERS_SET, instance).await?;
        Ok(())
    }

    async fn worker_members(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(keys::WORKERS_SET).await?;
        Ok(members)
    }

    async fn set_heartbeat(&self, instance: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(keys::heartbeat_key(instance), "1", Self::ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn delete_heartbeat(&self, instance: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::heartbeat_key(instance)).await?;
        Ok(())
    }

    async fn heartbeat_exists(&self, instance: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(keys::heartbeat_key(instance)).await?;
        Ok(exists)
    }

    async fn track_rows(&self, instance: &str, rowids: &[i64], ttl: Duration) -> Result<()> {
        if rowids.is_empty() {
            return Ok(());
        }
        let key = keys::rows_key(instance);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(&key, rowids).ignore();
        pipe.expire(&key, Self::ttl_secs(ttl) as i64).ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn untrack_row(&self, instance: &str, rowid: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(keys::rows_key(instance), rowid).await?;
        Ok(())
    }

    async fn tracked_rows(&self, instance: &str) -> Result<Vec<i64>> {
        let mut conn = self.conn.clone();
        let rows: Vec<i64> = conn.smembers(keys::rows_key(instance)).await?;
        Ok(rows)
    }

    async fn delete_tracked_rows(&self, instance: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::rows_key(instance)).await?;
        Ok(())
    }

    async fn refresh_tracked_ttl(&self, instance: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .expire(keys::rows_key(instance), Self::ttl_secs(ttl) as i64)
            .await?;
        Ok(())
    }
}
