//! Durable job table operations.
//!
//! All mutations are single SQL statements or short transactions; the
//! guarantees the scheduler depends on (one in-flight job per entity,
//! claim-exactly-once, stale recovery) live in the WHERE clauses here,
//! not in process memory.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, PgConnection, PgPool};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::job::{clamp_priority, Job, JobSpec, JobStatus};
use crate::error::SyncError;

/// Error messages stored on jobs are trimmed to this length.
const ERROR_MESSAGE_MAX: usize = 1000;

/// Health metrics cache lifetime.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(300);

/// Stale recovery runs at most once per this interval per site.
pub const STALE_RECOVERY_INTERVAL_SECS: i64 = 60;

const JOB_COLUMNS: &str = "id, correlation_id, site_id, module, direction, entity_type, \
     local_id, remote_id, action, payload, priority, status, attempts, max_attempts, \
     error_message, scheduled_at, processed_at, created_at, updated_at";

/// Result of an enqueue: a fresh row or a coalesced hit on an in-flight one.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(i64),
    Coalesced(i64),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> i64 {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Coalesced(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Queue counters by status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn depth(&self) -> i64 {
        self.pending + self.processing
    }
}

/// 24-hour queue health digest.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthMetrics {
    pub completed_24h: i64,
    pub failed_24h: i64,
    /// completed / (completed + failed); 1.0 when idle.
    pub success_rate: f64,
    /// Mean seconds from enqueue to claim for completed jobs.
    pub avg_latency_secs: Option<f64>,
}

/// Counts from a stale-recovery pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StaleRecovery {
    pub recovered: u64,
    pub failed: u64,
}

/// Postgres-backed queue store, scoped to one site.
pub struct QueueStore {
    pool: PgPool,
    site_id: i64,
    health_cache: RwLock<Option<(Instant, HealthMetrics)>>,
}

impl QueueStore {
    pub fn new(pool: PgPool, site_id: i64) -> Self {
        Self {
            pool,
            site_id,
            health_cache: RwLock::new(None),
        }
    }

    pub fn site_id(&self) -> i64 {
        self.site_id
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Dedup-insert a job in its own transaction.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueOutcome, SyncError> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_in(&mut conn, spec).await
    }

    /// Dedup-insert a job on an existing connection.
    ///
    /// Runs inside its own transaction scope; when the connection is
    /// already in a transaction this becomes a savepoint, so a failure
    /// here does not poison the caller's work.
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        spec: JobSpec,
    ) -> Result<EnqueueOutcome, SyncError> {
        spec.validate()?;
        let priority = clamp_priority(spec.priority);

        let mut tx = conn.begin().await?;

        // Locking read over the dedup keyspace: concurrent producers for
        // the same entity serialize here and coalesce into one row.
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM sync_jobs
            WHERE site_id = $1 AND module = $2 AND entity_type = $3 AND direction = $4
              AND status IN ('pending', 'processing')
              AND ($5::bigint = 0 OR local_id = $5)
              AND ($6::bigint = 0 OR remote_id = $6)
            ORDER BY id
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(self.site_id)
        .bind(&spec.module)
        .bind(&spec.entity_type)
        .bind(spec.direction)
        .bind(spec.local_id)
        .bind(spec.remote_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE sync_jobs
                    SET action = $2,
                        payload = $3,
                        priority = $4,
                        scheduled_at = $5,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(spec.action)
                .bind(&spec.payload)
                .bind(priority)
                .bind(spec.scheduled_at)
                .execute(&mut *tx)
                .await?;

                debug!(job_id = id, module = %spec.module, "coalesced into existing job");
                EnqueueOutcome::Coalesced(id)
            }
            None => {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO sync_jobs (
                        correlation_id, site_id, module, direction, entity_type,
                        local_id, remote_id, action, payload, priority,
                        status, attempts, max_attempts, scheduled_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', 0, $11, $12)
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(self.site_id)
                .bind(&spec.module)
                .bind(spec.direction)
                .bind(&spec.entity_type)
                .bind(spec.local_id)
                .bind(spec.remote_id)
                .bind(spec.action)
                .bind(&spec.payload)
                .bind(priority)
                .bind(spec.max_attempts)
                .bind(spec.scheduled_at)
                .fetch_one(&mut *tx)
                .await?;

                EnqueueOutcome::Created(id)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    // ========================================================================
    // Claim & fetch
    // ========================================================================

    /// Claim a job for processing. Returns false when another worker won.
    pub async fn claim(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'processing', processed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Eligible pending jobs in deterministic order.
    pub async fn fetch_pending(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM sync_jobs
            WHERE site_id = $1 AND status = 'pending'
              AND (scheduled_at IS NULL OR scheduled_at <= $2)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(self.site_id)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Eligible pending jobs for one module.
    pub async fn fetch_pending_for_module(
        &self,
        module: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM sync_jobs
            WHERE site_id = $1 AND module = $2 AND status = 'pending'
              AND (scheduled_at IS NULL OR scheduled_at <= $3)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(self.site_id)
        .bind(module)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    // ========================================================================
    // Stale recovery
    // ========================================================================

    /// Return abandoned in-flight jobs to the queue, or fail them out when
    /// their attempts are exhausted.
    pub async fn recover_stale(&self, timeout_secs: i64) -> Result<StaleRecovery> {
        let mut tx = self.pool.begin().await?;

        let recovered = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending', attempts = attempts + 1,
                processed_at = NULL, scheduled_at = NULL, updated_at = NOW()
            WHERE site_id = $1 AND status = 'processing'
              AND processed_at < NOW() - make_interval(secs => $2)
              AND attempts + 1 < max_attempts
            "#,
        )
        .bind(self.site_id)
        .bind(timeout_secs as f64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', attempts = attempts + 1,
                error_message = 'processing lease expired', updated_at = NOW()
            WHERE site_id = $1 AND status = 'processing'
              AND processed_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(self.site_id)
        .bind(timeout_secs as f64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if recovered > 0 || failed > 0 {
            info!(recovered, failed, "recovered stale in-flight jobs");
        }
        Ok(StaleRecovery { recovered, failed })
    }

    // ========================================================================
    // Status transitions
    // ========================================================================

    pub async fn mark_completed(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'completed', updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Transient failure with retries left: back to pending with a retry
    /// schedule.
    pub async fn reschedule_retry(
        &self,
        job_id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending', attempts = attempts + 1,
                error_message = $2, scheduled_at = $3,
                processed_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(trim_error(error))
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal failure.
    pub async fn mark_failed(&self, job_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', attempts = attempts + 1,
                error_message = $2, processed_at = COALESCE(processed_at, NOW()),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(trim_error(error))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Adopt a remote id created by a partially-failed attempt, so the
    /// retry becomes an update instead of a duplicate create.
    pub async fn adopt_remote_id(&self, job_id: i64, remote_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET remote_id = $2, updated_at = NOW()
            WHERE id = $1 AND remote_id = 0
            "#,
        )
        .bind(job_id)
        .bind(remote_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove a job that has not started yet.
    pub async fn cancel(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = $1 AND status = 'pending'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete terminal jobs older than the cutoff. Non-terminal rows are
    /// never touched.
    pub async fn cleanup(&self, days_old: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE site_id = $1 AND status IN ('completed', 'failed')
              AND updated_at < NOW() - make_interval(days => $2)
            "#,
        )
        .bind(self.site_id)
        .bind(days_old as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Reset every failed job for another round of attempts.
    pub async fn retry_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET status = 'pending', attempts = 0, error_message = NULL,
                scheduled_at = NULL, processed_at = NULL, updated_at = NOW()
            WHERE site_id = $1 AND status = 'failed'
            "#,
        )
        .bind(self.site_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Jobs for the operator surface, newest first.
    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Job>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM sync_jobs
                    WHERE site_id = $1 AND status = $2
                    ORDER BY id DESC
                    LIMIT $3
                    "#
                ))
                .bind(self.site_id)
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(&format!(
                    r#"
                    SELECT {JOB_COLUMNS} FROM sync_jobs
                    WHERE site_id = $1
                    ORDER BY id DESC
                    LIMIT $2
                    "#
                ))
                .bind(self.site_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(jobs)
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub async fn get_stats(&self) -> Result<QueueStats> {
        let (pending, processing, completed, failed): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'processing'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed')
                FROM sync_jobs
                WHERE site_id = $1
                "#,
            )
            .bind(self.site_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStats {
            pending,
            processing,
            completed,
            failed,
        })
    }

    /// 24-hour success-rate and latency digest, cached for five minutes.
    pub async fn get_health_metrics(&self) -> Result<HealthMetrics> {
        {
            let cache = self.health_cache.read().await;
            if let Some((at, metrics)) = *cache {
                if at.elapsed() < HEALTH_CACHE_TTL {
                    return Ok(metrics);
                }
            }
        }

        let (completed, failed, avg_latency): (i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                (AVG(EXTRACT(EPOCH FROM (processed_at - created_at)))
                    FILTER (WHERE status = 'completed' AND processed_at IS NOT NULL))::float8
            FROM sync_jobs
            WHERE site_id = $1 AND updated_at >= NOW() - INTERVAL '24 hours'
            "#,
        )
        .bind(self.site_id)
        .fetch_one(&self.pool)
        .await?;

        let total = completed + failed;
        let metrics = HealthMetrics {
            completed_24h: completed,
            failed_24h: failed,
            success_rate: if total > 0 {
                completed as f64 / total as f64
            } else {
                1.0
            },
            avg_latency_secs: avg_latency,
        };

        *self.health_cache.write().await = Some((Instant::now(), metrics));
        Ok(metrics)
    }

    /// Drop the cached health digest (called after each scheduler run).
    pub async fn invalidate_health_cache(&self) {
        *self.health_cache.write().await = None;
    }
}

fn trim_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX {
        return message.to_string();
    }
    let mut end = ERROR_MESSAGE_MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_outcome_helpers() {
        let created = EnqueueOutcome::Created(7);
        assert!(created.is_created());
        assert_eq!(created.job_id(), 7);

        let coalesced = EnqueueOutcome::Coalesced(7);
        assert!(!coalesced.is_created());
        assert_eq!(coalesced.job_id(), 7);
    }

    #[test]
    fn stats_depth_counts_in_flight_work() {
        let stats = QueueStats {
            pending: 10,
            processing: 2,
            completed: 100,
            failed: 3,
        };
        assert_eq!(stats.depth(), 12);
    }

    #[test]
    fn trim_error_keeps_short_messages() {
        assert_eq!(trim_error("boom"), "boom");
    }

    #[test]
    fn trim_error_caps_long_messages() {
        let long = "e".repeat(5000);
        assert_eq!(trim_error(&long).len(), ERROR_MESSAGE_MAX);
    }

    #[test]
    fn trim_error_respects_char_boundaries() {
        let long = "é".repeat(ERROR_MESSAGE_MAX); // 2 bytes each
        let trimmed = trim_error(&long);
        assert!(trimmed.len() <= ERROR_MESSAGE_MAX);
        assert!(trimmed.is_char_boundary(trimmed.len()));
    }
}
