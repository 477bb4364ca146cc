//! Typed, validated configuration backed by the `sync_settings` table.
//!
//! Every value is clamped on read and write, so a hand-edited row can
//! never push the engine outside its safe envelope. Reads go through a
//! short-lived in-process cache; anything that must be cluster-accurate
//! (interval claims, counters) bypasses the cache and runs as a single
//! SQL statement.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// Well-known settings keys.
pub mod keys {
    pub const BATCH_SIZE: &str = "sync.batch_size";
    pub const STALE_TIMEOUT_SECS: &str = "sync.stale_timeout_secs";
    pub const FAILURE_THRESHOLD: &str = "sync.failure_threshold";
    pub const FAILURE_COOLDOWN_SECS: &str = "sync.failure_cooldown_secs";
    pub const RETENTION_DAYS: &str = "sync.retention_days";
    pub const MEMORY_CAP_MB: &str = "sync.memory_cap_mb";
    pub const LOG_LEVEL: &str = "log.level";
    pub const SCHEMA_VERSION: &str = "schema.version";
    pub const LAST_CRON_RUN: &str = "cron.last_run_at";
    pub const LAST_STALE_RECOVERY: &str = "queue.last_stale_recovery";
    pub const LAST_DEPTH_ALERT: &str = "queue.last_depth_alert_at";
    pub const CONSECUTIVE_FAILURES: &str = "alerts.consecutive_failures";
    pub const LAST_ALERT_SENT: &str = "alerts.last_sent_at";
    pub const GLOBAL_BREAKER: &str = "breaker.global";
    pub const MODULE_BREAKERS: &str = "breaker.modules";
    pub const WEBHOOK_TOKEN: &str = "webhook.token";

    pub fn module_enabled(module: &str) -> String {
        format!("module.{module}.enabled")
    }
}

struct CacheEntry {
    at: Instant,
    value: Option<Value>,
}

/// Repository of runtime settings.
pub struct SettingsRepo {
    pool: PgPool,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl SettingsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Raw read with cache.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Value>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(key) {
                if entry.at.elapsed() < CACHE_TTL {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value: Option<Value> =
            sqlx::query_scalar("SELECT value FROM sync_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                at: Instant::now(),
                value: value.clone(),
            },
        );

        Ok(value)
    }

    /// Raw read bypassing the cache, for state that must be
    /// cluster-accurate (breaker records). Refreshes the cache entry.
    pub async fn get_raw_uncached(&self, key: &str) -> Result<Option<Value>> {
        let value: Option<Value> =
            sqlx::query_scalar("SELECT value FROM sync_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                at: Instant::now(),
                value: value.clone(),
            },
        );

        Ok(value)
    }

    /// Typed uncached JSON read.
    pub async fn get_json_uncached<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw_uncached(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Raw upsert; refreshes the cache entry.
    pub async fn set_raw(&self, key: &str, value: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(&value)
        .execute(&self.pool)
        .await?;

        self.cache.write().await.insert(
            key.to_string(),
            CacheEntry {
                at: Instant::now(),
                value: Some(value),
            },
        );

        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        self.cache.write().await.remove(key);
        Ok(())
    }

    /// Drop all cached entries (used by `cache flush`).
    pub async fn flush_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Typed JSON read.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Typed JSON write.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.set_raw(key, serde_json::to_value(value)?).await
    }

    async fn get_clamped(&self, key: &str, default: i64, lo: i64, hi: i64) -> Result<i64> {
        let value = self
            .get_raw(key)
            .await?
            .and_then(|v| json_i64(&v))
            .unwrap_or(default);
        Ok(value.clamp(lo, hi))
    }

    async fn set_clamped(&self, key: &str, value: i64, lo: i64, hi: i64) -> Result<i64> {
        let clamped = value.clamp(lo, hi);
        self.set_raw(key, Value::from(clamped)).await?;
        Ok(clamped)
    }

    /// Jobs fetched per scheduler iteration. 1–100, default 20.
    pub async fn batch_size(&self) -> Result<i64> {
        self.get_clamped(keys::BATCH_SIZE, 20, 1, 100).await
    }

    pub async fn set_batch_size(&self, value: i64) -> Result<i64> {
        self.set_clamped(keys::BATCH_SIZE, value, 1, 100).await
    }

    /// Seconds before an in-flight job is considered abandoned. 60–3600,
    /// default 300.
    pub async fn stale_timeout_secs(&self) -> Result<i64> {
        self.get_clamped(keys::STALE_TIMEOUT_SECS, 300, 60, 3600)
            .await
    }

    pub async fn set_stale_timeout_secs(&self, value: i64) -> Result<i64> {
        self.set_clamped(keys::STALE_TIMEOUT_SECS, value, 60, 3600)
            .await
    }

    /// Consecutive failures before the notifier alerts. 1–100, default 10.
    pub async fn failure_threshold(&self) -> Result<i64> {
        self.get_clamped(keys::FAILURE_THRESHOLD, 10, 1, 100).await
    }

    /// Seconds between repeated failure alerts. 60–86400, default 3600.
    pub async fn failure_cooldown_secs(&self) -> Result<i64> {
        self.get_clamped(keys::FAILURE_COOLDOWN_SECS, 3600, 60, 86400)
            .await
    }

    /// Days terminal jobs are kept before cleanup. 1–365, default 30.
    pub async fn retention_days(&self) -> Result<i64> {
        self.get_clamped(keys::RETENTION_DAYS, 30, 1, 365).await
    }

    /// Memory cap for the scheduler guard, in MiB. 64–16384, default 512.
    pub async fn memory_cap_mb(&self) -> Result<i64> {
        self.get_clamped(keys::MEMORY_CAP_MB, 512, 64, 16384).await
    }

    /// Log level name, validated against the tracing levels.
    pub async fn log_level(&self) -> Result<String> {
        let level = self
            .get_raw(keys::LOG_LEVEL)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "info".to_string());
        Ok(validate_log_level(&level))
    }

    /// Whether a module is enabled. Unset means enabled.
    pub async fn module_enabled(&self, module: &str) -> Result<bool> {
        Ok(self
            .get_raw(&keys::module_enabled(module))
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(true))
    }

    pub async fn set_module_enabled(&self, module: &str, enabled: bool) -> Result<()> {
        self.set_raw(&keys::module_enabled(module), Value::Bool(enabled))
            .await
    }

    /// Atomically claim a rate-limit interval.
    ///
    /// Returns true for exactly one caller per `min_secs` window across
    /// all workers; the timestamp row is advanced in the same statement,
    /// so there is no read-then-write race.
    pub async fn claim_interval(&self, key: &str, min_secs: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_settings (key, value, updated_at)
            VALUES ($1, to_jsonb(NOW()), NOW())
            ON CONFLICT (key) DO UPDATE SET value = to_jsonb(NOW()), updated_at = NOW()
            WHERE sync_settings.updated_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(key)
        .bind(min_secs as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Add to the consecutive-failure counter, returning the new total.
    /// Runs as one statement so concurrent workers cannot lose updates.
    pub async fn add_consecutive_failures(&self, by: i64) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_settings (key, value, updated_at)
            VALUES ($1, to_jsonb($2::bigint), NOW())
            ON CONFLICT (key) DO UPDATE
                SET value = to_jsonb(COALESCE((sync_settings.value #>> '{}')::bigint, 0) + $2),
                    updated_at = NOW()
            RETURNING (value #>> '{}')::bigint
            "#,
        )
        .bind(keys::CONSECUTIVE_FAILURES)
        .bind(by)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    pub async fn reset_consecutive_failures(&self) -> Result<()> {
        self.set_raw(keys::CONSECUTIVE_FAILURES, Value::from(0i64))
            .await
    }

    /// Timestamp read for alert bookkeeping.
    pub async fn get_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_raw(key)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    pub async fn set_timestamp(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.set_raw(key, Value::String(at.to_rfc3339())).await
    }
}

fn json_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn validate_log_level(level: &str) -> String {
    let lowered = level.to_lowercase();
    match lowered.as_str() {
        "error" | "warn" | "info" | "debug" | "trace" => lowered,
        _ => "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_i64_reads_numbers_and_strings() {
        assert_eq!(json_i64(&Value::from(42)), Some(42));
        assert_eq!(json_i64(&Value::String("42".into())), Some(42));
        assert_eq!(json_i64(&Value::Bool(true)), None);
    }

    #[test]
    fn invalid_log_level_falls_back_to_info() {
        assert_eq!(validate_log_level("verbose"), "info");
        assert_eq!(validate_log_level("DEBUG"), "debug");
    }

    #[test]
    fn module_enabled_key_is_per_module() {
        assert_eq!(keys::module_enabled("crm"), "module.crm.enabled");
    }
}
