//! Engine-wide circuit breaker.
//!
//! State is stored twice: an in-process cache with a short TTL for the
//! hot `is_available` path, and the authoritative settings row that all
//! workers share. Counter updates are serialized under an advisory lock
//! so concurrent schedulers cannot lose increments after a cache miss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::notifier::FailureNotifier;
use super::state::{BreakerEvent, BreakerPhase, BreakerState, GLOBAL_POLICY};
use crate::lock::{names, LockFactory};
use crate::settings::{keys, SettingsRepo};

const CACHE_TTL: Duration = Duration::from_secs(30);

/// How long `record_batch` waits to serialize a counter update.
const FAILURE_LOCK_TIMEOUT_SECS: u64 = 5;

pub struct GlobalBreaker {
    locks: Arc<dyn LockFactory>,
    settings: Arc<SettingsRepo>,
    notifier: Arc<FailureNotifier>,
    cache: RwLock<Option<(Instant, BreakerState)>>,
}

impl GlobalBreaker {
    pub fn new(
        locks: Arc<dyn LockFactory>,
        settings: Arc<SettingsRepo>,
        notifier: Arc<FailureNotifier>,
    ) -> Self {
        Self {
            locks,
            settings,
            notifier,
            cache: RwLock::new(None),
        }
    }

    async fn load_cached(&self) -> Result<BreakerState> {
        {
            let cache = self.cache.read().await;
            if let Some((at, state)) = cache.as_ref() {
                if at.elapsed() < CACHE_TTL {
                    return Ok(state.clone());
                }
            }
        }
        self.load_authoritative().await
    }

    async fn load_authoritative(&self) -> Result<BreakerState> {
        let state: BreakerState = self
            .settings
            .get_json_uncached(keys::GLOBAL_BREAKER)
            .await?
            .unwrap_or_default();
        *self.cache.write().await = Some((Instant::now(), state.clone()));
        Ok(state)
    }

    async fn store(&self, state: &BreakerState) -> Result<()> {
        self.settings.set_json(keys::GLOBAL_BREAKER, state).await?;
        *self.cache.write().await = Some((Instant::now(), state.clone()));
        Ok(())
    }

    /// Current phase, for the operator surface.
    pub async fn phase(&self) -> Result<BreakerPhase> {
        let state = self.load_cached().await?;
        Ok(state.phase(&GLOBAL_POLICY, chrono::Utc::now()))
    }

    /// Whether the scheduler may run.
    ///
    /// In HalfOpen exactly one caller across the cluster gets `true`: the
    /// probe flag is flipped under a non-blocking advisory lock, so
    /// everyone else sees either the lock or the flag.
    pub async fn is_available(&self) -> Result<bool> {
        let now = chrono::Utc::now();
        let state = self.load_cached().await?;

        match state.phase(&GLOBAL_POLICY, now) {
            BreakerPhase::Closed => Ok(true),
            BreakerPhase::Open => Ok(false),
            BreakerPhase::HalfOpen => {
                let probe_lock = self.locks.named(names::CB_PROBE, 0);
                if !probe_lock.acquire().await? {
                    return Ok(false);
                }

                // Re-read under the lock: another worker may have taken
                // the probe between our cache read and here.
                let result = async {
                    let mut state = self.load_authoritative().await?;
                    if state.phase(&GLOBAL_POLICY, now) != BreakerPhase::HalfOpen
                        || state.probe_held
                    {
                        return Ok(false);
                    }
                    state.probe_held = true;
                    state.updated_at = Some(now);
                    self.store(&state).await?;
                    info!("admitting circuit breaker probe batch");
                    Ok(true)
                }
                .await;

                probe_lock.release().await?;
                result
            }
        }
    }

    /// Fold a batch result into the breaker.
    pub async fn record_batch(&self, successes: u64, failures: u64) -> Result<()> {
        let failure_lock = self.locks.named(names::CB_FAILURE, FAILURE_LOCK_TIMEOUT_SECS);
        let locked = failure_lock.acquire().await?;
        if !locked {
            warn!("could not serialize breaker update; recording anyway");
        }

        let result = async {
            let mut state = self.load_authoritative().await?;
            let event = state.record_batch(&GLOBAL_POLICY, successes, failures, chrono::Utc::now());
            self.store(&state).await?;
            Ok::<_, anyhow::Error>(event)
        }
        .await;

        if locked {
            failure_lock.release().await?;
        }

        match result? {
            Some(BreakerEvent::Opened) | Some(BreakerEvent::Reopened) => {
                warn!(successes, failures, "global circuit breaker opened");
                self.notifier.breaker_opened("global").await
            }
            Some(BreakerEvent::Closed) => {
                info!("global circuit breaker closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Drop the in-process cache; the next read goes to the settings row.
    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    /// Operator reset.
    pub async fn reset(&self) -> Result<()> {
        self.store(&BreakerState::default()).await
    }
}
