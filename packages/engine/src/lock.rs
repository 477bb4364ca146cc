//! Named advisory locks on top of Postgres session locks.
//!
//! A lock pins a dedicated pool connection while held: losing the session
//! (process crash, connection drop) releases the lock on the server side,
//! which is exactly the lease semantics the scheduler relies on.
//!
//! Lock names are strings; Postgres advisory locks key on a signed 64-bit
//! integer, so names are folded through SHA-256.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::warn;

use crate::common::hash::sha256_hex;

/// Poll interval while waiting for a contended lock.
const ACQUIRE_POLL: Duration = Duration::from_millis(250);

/// Fold a lock name to the Postgres advisory key space.
pub fn lock_key(name: &str) -> i64 {
    let digest = sha256_hex(name);
    // First 8 bytes of the digest, big-endian.
    let mut bytes = [0u8; 8];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digest[i * 2..i * 2 + 2], 16).unwrap_or(0);
    }
    i64::from_be_bytes(bytes)
}

/// Well-known lock names.
pub mod names {
    use crate::common::hash::sha256_hex;

    /// Site-wide scheduler lease.
    pub fn scheduler(site_id: i64) -> String {
        format!("wp4odoo_sync_{site_id}")
    }

    /// Per-module scheduler lease; allows cross-module parallelism.
    pub fn scheduler_module(site_id: i64, module: &str) -> String {
        format!("wp4odoo_sync_{site_id}_{module}")
    }

    /// Per-entity create serialization.
    pub fn push(module: &str, entity_type: &str, local_id: i64) -> String {
        let digest = sha256_hex(&format!("{module}|{entity_type}|{local_id}"));
        format!("wp4odoo_push_{digest}")
    }

    /// Batch-create serialization per remote model.
    pub fn batch(module: &str, remote_model: &str) -> String {
        format!("wp4odoo_batch_{module}_{remote_model}")
    }

    /// Ancillary partner creation, keyed on the normalized email.
    pub fn partner(email: &str) -> String {
        let digest = sha256_hex(&email.trim().to_lowercase());
        format!("wp4odoo_partner_{digest}")
    }

    /// Circuit-breaker probe admission.
    pub const CB_PROBE: &str = "wp4odoo_cb_probe";

    /// Circuit-breaker failure-counter serialization.
    pub const CB_FAILURE: &str = "wp4odoo_cb_failure";
}

/// A held or releasable named mutex.
#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Try to take the lock within the configured timeout.
    async fn acquire(&self) -> Result<bool>;
    /// Whether this handle currently holds the lock.
    async fn is_held(&self) -> bool;
    /// Release the lock. Idempotent; returns whether a lock was released.
    async fn release(&self) -> Result<bool>;
}

/// Produces named locks. The production implementation hands out
/// Postgres advisory locks; tests substitute free or blocked locks.
pub trait LockFactory: Send + Sync {
    fn named(&self, name: &str, timeout_secs: u64) -> Arc<dyn NamedLock>;
}

/// Postgres-backed lock factory.
pub struct PgLockFactory {
    pool: PgPool,
}

impl PgLockFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl LockFactory for PgLockFactory {
    fn named(&self, name: &str, timeout_secs: u64) -> Arc<dyn NamedLock> {
        Arc::new(AdvisoryLock::new(self.pool.clone(), name, timeout_secs))
    }
}

/// A named database-level mutex with bounded-wait acquisition.
pub struct AdvisoryLock {
    pool: PgPool,
    name: String,
    key: i64,
    timeout: Duration,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl AdvisoryLock {
    /// Create a handle. `timeout_secs = 0` makes [`acquire`](Self::acquire)
    /// a single non-blocking try.
    pub fn new(pool: PgPool, name: impl Into<String>, timeout_secs: u64) -> Self {
        let name = name.into();
        let key = lock_key(&name);
        Self {
            pool,
            name,
            key,
            timeout: Duration::from_secs(timeout_secs),
            conn: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take the lock within the configured timeout.
    pub async fn acquire(&self) -> Result<bool> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(true);
        }

        let mut conn = self.pool.acquire().await?;
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await?;

            if granted {
                *slot = Some(conn);
                return Ok(true);
            }

            if self.timeout.is_zero() || tokio::time::Instant::now() + ACQUIRE_POLL > deadline {
                return Ok(false);
            }
            tokio::time::sleep(ACQUIRE_POLL).await;
        }
    }

    /// Whether this handle currently holds the lock.
    pub async fn is_held(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Release the lock. Idempotent; returns whether the server confirmed
    /// a lock was released.
    pub async fn release(&self) -> Result<bool> {
        let mut slot = self.conn.lock().await;
        let Some(mut conn) = slot.take() else {
            return Ok(false);
        };

        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;

        if !released {
            warn!(lock = %self.name, "advisory unlock reported lock was not held");
        }
        Ok(released)
    }
}

#[async_trait]
impl NamedLock for AdvisoryLock {
    async fn acquire(&self) -> Result<bool> {
        AdvisoryLock::acquire(self).await
    }

    async fn is_held(&self) -> bool {
        AdvisoryLock::is_held(self).await
    }

    async fn release(&self) -> Result<bool> {
        AdvisoryLock::release(self).await
    }
}
