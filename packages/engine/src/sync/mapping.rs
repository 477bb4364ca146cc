//! Bidirectional identity mapping between local and remote records.
//!
//! Every successfully synced entity leaves one row here: unique in both
//! directions, carrying the remote model and the content hash of the last
//! synced payload. The repository is a trait so the orchestrator can be
//! exercised against the in-memory double in [`crate::testing`].

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::info;

use super::module::ModuleResolver;

/// One identity link.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct Mapping {
    pub id: i64,
    pub module: String,
    pub entity_type: String,
    pub local_id: i64,
    pub remote_id: i64,
    pub remote_model: String,
    pub sync_hash: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage operations for identity mappings.
#[async_trait]
pub trait MappingRepo: Send + Sync {
    async fn get_remote_id(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
    ) -> Result<Option<i64>>;

    async fn get_local_id(
        &self,
        module: &str,
        entity_type: &str,
        remote_id: i64,
    ) -> Result<Option<i64>>;

    async fn get(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
    ) -> Result<Option<Mapping>>;

    async fn batch_get_remote_ids(
        &self,
        module: &str,
        entity_type: &str,
        local_ids: &[i64],
    ) -> Result<HashMap<i64, i64>>;

    /// Idempotent upsert keyed on `(module, entity_type, local_id)`.
    async fn save(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
        remote_id: i64,
        remote_model: &str,
        sync_hash: Option<&str>,
    ) -> Result<()>;

    /// Remove by local id; returns whether a row existed.
    async fn remove(&self, module: &str, entity_type: &str, local_id: i64) -> Result<bool>;

    /// Stamp the given remote ids as seen by the poll that started at
    /// `poll_start`.
    async fn mark_polled(
        &self,
        module: &str,
        entity_type: &str,
        seen_remote_ids: &[i64],
        poll_start: DateTime<Utc>,
    ) -> Result<u64>;

    /// Mappings the poll did not touch: candidates for remote deletion.
    async fn get_stale_poll_mappings(
        &self,
        module: &str,
        entity_type: &str,
        poll_start: DateTime<Utc>,
    ) -> Result<Vec<Mapping>>;

    async fn get_module_entity_mappings(
        &self,
        module: &str,
        entity_type: &str,
    ) -> Result<Vec<Mapping>>;
}

/// Outcome of an orphan-cleanup pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct OrphanCleanupReport {
    pub scanned: usize,
    pub orphans: Vec<OrphanMapping>,
    pub removed: usize,
    pub skipped_modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanMapping {
    pub module: String,
    pub entity_type: String,
    pub local_id: i64,
    pub remote_id: i64,
}

/// Postgres-backed mapping repository.
pub struct PgMappingStore {
    pool: PgPool,
}

const MAPPING_COLUMNS: &str = "id, module, entity_type, local_id, remote_id, remote_model, \
     sync_hash, last_polled_at, created_at, updated_at";

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinct `(module, entity_type)` pairs present in the table.
    async fn mapped_pairs(&self, module: Option<&str>) -> Result<Vec<(String, String)>> {
        let pairs: Vec<(String, String)> = match module {
            Some(module) => {
                sqlx::query_as(
                    "SELECT DISTINCT module, entity_type FROM sync_mappings WHERE module = $1",
                )
                .bind(module)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT DISTINCT module, entity_type FROM sync_mappings")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(pairs)
    }

    /// Remove mapping rows whose local record no longer exists.
    ///
    /// User-backed modules are skipped: their local ids live in a shared
    /// table that other plugins prune on their own schedule.
    pub async fn cleanup_orphans(
        &self,
        resolver: &ModuleResolver,
        module: Option<&str>,
        dry_run: bool,
    ) -> Result<OrphanCleanupReport> {
        let mut report = OrphanCleanupReport::default();

        for (module_id, entity_type) in self.mapped_pairs(module).await? {
            let Some(module_impl) = resolver.as_ref()(&module_id) else {
                report.skipped_modules.push(module_id);
                continue;
            };
            if module_impl.user_backed() {
                if !report.skipped_modules.contains(&module_id) {
                    report.skipped_modules.push(module_id.clone());
                }
                continue;
            }

            for mapping in self
                .get_module_entity_mappings(&module_id, &entity_type)
                .await?
            {
                report.scanned += 1;
                if module_impl
                    .local_exists(&entity_type, mapping.local_id)
                    .await?
                {
                    continue;
                }

                report.orphans.push(OrphanMapping {
                    module: mapping.module.clone(),
                    entity_type: mapping.entity_type.clone(),
                    local_id: mapping.local_id,
                    remote_id: mapping.remote_id,
                });

                if !dry_run && self.remove(&module_id, &entity_type, mapping.local_id).await? {
                    report.removed += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            orphans = report.orphans.len(),
            removed = report.removed,
            dry_run,
            "mapping orphan cleanup finished"
        );
        Ok(report)
    }
}

#[async_trait]
impl MappingRepo for PgMappingStore {
    async fn get_remote_id(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
    ) -> Result<Option<i64>> {
        let remote_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT remote_id FROM sync_mappings
            WHERE module = $1 AND entity_type = $2 AND local_id = $3
            "#,
        )
        .bind(module)
        .bind(entity_type)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remote_id)
    }

    async fn get_local_id(
        &self,
        module: &str,
        entity_type: &str,
        remote_id: i64,
    ) -> Result<Option<i64>> {
        let local_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT local_id FROM sync_mappings
            WHERE module = $1 AND entity_type = $2 AND remote_id = $3
            "#,
        )
        .bind(module)
        .bind(entity_type)
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(local_id)
    }

    async fn get(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
    ) -> Result<Option<Mapping>> {
        let mapping = sqlx::query_as::<_, Mapping>(&format!(
            r#"
            SELECT {MAPPING_COLUMNS} FROM sync_mappings
            WHERE module = $1 AND entity_type = $2 AND local_id = $3
            "#
        ))
        .bind(module)
        .bind(entity_type)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(mapping)
    }

    async fn batch_get_remote_ids(
        &self,
        module: &str,
        entity_type: &str,
        local_ids: &[i64],
    ) -> Result<HashMap<i64, i64>> {
        if local_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT local_id, remote_id FROM sync_mappings
            WHERE module = $1 AND entity_type = $2 AND local_id = ANY($3)
            "#,
        )
        .bind(module)
        .bind(entity_type)
        .bind(local_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn save(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
        remote_id: i64,
        remote_model: &str,
        sync_hash: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_mappings (module, entity_type, local_id, remote_id, remote_model, sync_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (module, entity_type, local_id) DO UPDATE
                SET remote_id = EXCLUDED.remote_id,
                    remote_model = EXCLUDED.remote_model,
                    sync_hash = EXCLUDED.sync_hash,
                    updated_at = NOW()
            "#,
        )
        .bind(module)
        .bind(entity_type)
        .bind(local_id)
        .bind(remote_id)
        .bind(remote_model)
        .bind(sync_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, module: &str, entity_type: &str, local_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_mappings
            WHERE module = $1 AND entity_type = $2 AND local_id = $3
            "#,
        )
        .bind(module)
        .bind(entity_type)
        .bind(local_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_polled(
        &self,
        module: &str,
        entity_type: &str,
        seen_remote_ids: &[i64],
        poll_start: DateTime<Utc>,
    ) -> Result<u64> {
        if seen_remote_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE sync_mappings
            SET last_polled_at = $4, updated_at = NOW()
            WHERE module = $1 AND entity_type = $2 AND remote_id = ANY($3)
            "#,
        )
        .bind(module)
        .bind(entity_type)
        .bind(seen_remote_ids)
        .bind(poll_start)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_stale_poll_mappings(
        &self,
        module: &str,
        entity_type: &str,
        poll_start: DateTime<Utc>,
    ) -> Result<Vec<Mapping>> {
        let mappings = sqlx::query_as::<_, Mapping>(&format!(
            r#"
            SELECT {MAPPING_COLUMNS} FROM sync_mappings
            WHERE module = $1 AND entity_type = $2
              AND (last_polled_at IS NULL OR last_polled_at < $3)
            ORDER BY local_id
            "#
        ))
        .bind(module)
        .bind(entity_type)
        .bind(poll_start)
        .fetch_all(&self.pool)
        .await?;

        Ok(mappings)
    }

    async fn get_module_entity_mappings(
        &self,
        module: &str,
        entity_type: &str,
    ) -> Result<Vec<Mapping>> {
        let mappings = sqlx::query_as::<_, Mapping>(&format!(
            r#"
            SELECT {MAPPING_COLUMNS} FROM sync_mappings
            WHERE module = $1 AND entity_type = $2
            ORDER BY local_id
            "#
        ))
        .bind(module)
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(mappings)
    }
}
