//! Per-module circuit breakers.
//!
//! One failing domain must not stall the others: each module carries its
//! own Closed/Open/HalfOpen record in a single settings document. A
//! module in Open is silently skipped by the scheduler; entries untouched
//! for two hours are discarded.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use super::notifier::FailureNotifier;
use super::state::{BreakerEvent, BreakerPhase, BreakerState, MODULE_POLICY};
use crate::lock::{names, LockFactory};
use crate::settings::{keys, SettingsRepo};

const FAILURE_LOCK_TIMEOUT_SECS: u64 = 5;

type StateMap = HashMap<String, BreakerState>;

pub struct ModuleBreaker {
    locks: Arc<dyn LockFactory>,
    settings: Arc<SettingsRepo>,
    notifier: Arc<FailureNotifier>,
}

impl ModuleBreaker {
    pub fn new(
        locks: Arc<dyn LockFactory>,
        settings: Arc<SettingsRepo>,
        notifier: Arc<FailureNotifier>,
    ) -> Self {
        Self {
            locks,
            settings,
            notifier,
        }
    }

    async fn load(&self) -> Result<StateMap> {
        Ok(self
            .settings
            .get_json_uncached(keys::MODULE_BREAKERS)
            .await?
            .unwrap_or_default())
    }

    async fn store(&self, map: &StateMap) -> Result<()> {
        self.settings.set_json(keys::MODULE_BREAKERS, map).await
    }

    /// Whether a module's jobs may run. Expired entries count as Closed.
    pub async fn is_available(&self, module: &str) -> Result<bool> {
        let map = self.load().await?;
        let Some(state) = map.get(module) else {
            return Ok(true);
        };
        Ok(state.phase(&MODULE_POLICY, chrono::Utc::now()) != BreakerPhase::Open)
    }

    /// Fold a module's batch tally into its breaker record.
    pub async fn record_batch(&self, module: &str, successes: u64, failures: u64) -> Result<()> {
        let failure_lock = self.locks.named(names::CB_FAILURE, FAILURE_LOCK_TIMEOUT_SECS);
        let locked = failure_lock.acquire().await?;
        if !locked {
            warn!(module, "could not serialize module breaker update; recording anyway");
        }

        let result = async {
            let now = chrono::Utc::now();
            let mut map = self.load().await?;

            // Drop entries past their TTL while we hold the document.
            map.retain(|_, state| !state.expired(&MODULE_POLICY, now));

            let state = map.entry(module.to_string()).or_default();
            let event = state.record_batch(&MODULE_POLICY, successes, failures, now);

            // A closed, untripped record carries no information.
            if state.failures == 0 && state.opened_at.is_none() {
                map.remove(module);
            }

            self.store(&map).await?;
            Ok::<_, anyhow::Error>(event)
        }
        .await;

        if locked {
            failure_lock.release().await?;
        }

        match result? {
            Some(BreakerEvent::Opened) | Some(BreakerEvent::Reopened) => {
                warn!(module, "module circuit breaker opened");
                self.notifier
                    .breaker_opened(&format!("module {module}"))
                    .await
            }
            Some(BreakerEvent::Closed) => {
                info!(module, "module circuit breaker closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Operator reset for one module.
    pub async fn reset(&self, module: &str) -> Result<()> {
        let mut map = self.load().await?;
        map.remove(module);
        self.store(&map).await
    }

    /// Current records, for the operator surface.
    pub async fn snapshot(&self) -> Result<Vec<(String, BreakerState)>> {
        let map = self.load().await?;
        let mut entries: Vec<_> = map.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
