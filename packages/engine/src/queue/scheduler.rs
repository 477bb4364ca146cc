//! Leased batch scheduler.
//!
//! One `run` call is one tick: take the site (or module) lease, recover
//! stale work, then fetch and drive bounded batches until the queue
//! drains or a budget trips. Multiple workers on multiple hosts can tick
//! concurrently; the advisory lease and the per-job claim keep them from
//! stepping on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use super::batch::{BatchCreateProcessor, BatchOutcome};
use super::job::{Direction, Job};
use super::store::{QueueStore, STALE_RECOVERY_INTERVAL_SECS};
use crate::breaker::{FailureNotifier, GlobalBreaker, ModuleBreaker};
use crate::common::memory::over_memory_threshold;
use crate::error::{retry_at, FailureKind, SyncOutcome};
use crate::lock::{names, LockFactory};
use crate::rpc::ErpTransport;
use crate::settings::{keys, SettingsRepo};
use crate::sync::mapping::MappingRepo;
use crate::sync::module::ModuleResolver;
use crate::sync::orchestrator::Orchestrator;

/// Wall-clock budget for one tick.
const RUN_BUDGET: Duration = Duration::from_secs(55);

/// Batches per tick.
const MAX_ITERATIONS: u32 = 20;

/// What a tick did, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub processed: u64,
    pub iterations: u32,
    pub module: Option<String>,
}

pub struct Scheduler {
    queue: Arc<QueueStore>,
    settings: Arc<SettingsRepo>,
    transport: Arc<dyn ErpTransport>,
    mappings: Arc<dyn MappingRepo>,
    resolver: ModuleResolver,
    global_breaker: Arc<GlobalBreaker>,
    module_breakers: Arc<ModuleBreaker>,
    notifier: Arc<FailureNotifier>,
    locks: Arc<dyn LockFactory>,
    site_id: i64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueStore>,
        settings: Arc<SettingsRepo>,
        transport: Arc<dyn ErpTransport>,
        mappings: Arc<dyn MappingRepo>,
        resolver: ModuleResolver,
        global_breaker: Arc<GlobalBreaker>,
        module_breakers: Arc<ModuleBreaker>,
        notifier: Arc<FailureNotifier>,
        locks: Arc<dyn LockFactory>,
        site_id: i64,
    ) -> Self {
        Self {
            queue,
            settings,
            transport,
            mappings,
            resolver,
            global_breaker,
            module_breakers,
            notifier,
            locks,
            site_id,
        }
    }

    /// One scheduler tick. Returns immediately when another worker holds
    /// the lease or a breaker is open.
    pub async fn run(&self, module_filter: Option<&str>) -> Result<RunReport> {
        let empty = RunReport {
            processed: 0,
            iterations: 0,
            module: module_filter.map(str::to_string),
        };

        if let Some(module) = module_filter {
            if !self.module_breakers.is_available(module).await? {
                debug!(module, "module breaker open, skipping tick");
                return Ok(empty);
            }
        }
        if !self.global_breaker.is_available().await? {
            debug!("global breaker open, skipping tick");
            return Ok(empty);
        }

        let lock_name = match module_filter {
            Some(module) => names::scheduler_module(self.site_id, module),
            None => names::scheduler(self.site_id),
        };
        let lease = self.locks.named(&lock_name, 0);
        if !lease.acquire().await? {
            debug!(lock = %lock_name, "another worker holds the scheduler lease");
            return Ok(empty);
        }

        let result = self.run_locked(module_filter).await;

        match lease.release().await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %lock_name, "scheduler lease was not held at release"),
            Err(error) => warn!(lock = %lock_name, error = %error, "failed to release scheduler lease"),
        }
        self.queue.invalidate_health_cache().await;

        let report = result?;
        info!(
            processed = report.processed,
            iterations = report.iterations,
            module = report.module.as_deref().unwrap_or("*"),
            "scheduler tick finished"
        );
        Ok(report)
    }

    async fn run_locked(&self, module_filter: Option<&str>) -> Result<RunReport> {
        let mut report = RunReport {
            processed: 0,
            iterations: 0,
            module: module_filter.map(str::to_string),
        };

        self.settings
            .set_timestamp(keys::LAST_CRON_RUN, Utc::now())
            .await?;

        let memory_cap = self.settings.memory_cap_mb().await? as u64;
        if over_memory_threshold(memory_cap) {
            warn!("memory pressure, skipping scheduler tick");
            return Ok(report);
        }

        // At most one stale-recovery pass per minute per site, across all
        // workers.
        if self
            .settings
            .claim_interval(keys::LAST_STALE_RECOVERY, STALE_RECOVERY_INTERVAL_SECS)
            .await?
        {
            let timeout = self.settings.stale_timeout_secs().await?;
            self.queue.recover_stale(timeout).await?;
        }

        let batch_size = self.settings.batch_size().await?;
        let started = Instant::now();

        let mut batch_successes: u64 = 0;
        let mut batch_failures: u64 = 0;
        let mut module_tally: HashMap<String, (u64, u64)> = HashMap::new();
        let mut orchestrators: HashMap<String, Arc<Orchestrator>> = HashMap::new();

        'tick: while report.iterations < MAX_ITERATIONS {
            if started.elapsed() >= RUN_BUDGET {
                debug!("time budget exhausted");
                break;
            }
            if over_memory_threshold(memory_cap) {
                warn!("memory pressure, stopping batch loop");
                break;
            }
            // A HalfOpen probe admits exactly one batch: the second pass
            // through this check comes back unavailable.
            if report.iterations > 0 && !self.global_breaker.is_available().await? {
                debug!("global breaker tripped mid-run");
                break;
            }

            let now = Utc::now();
            let batch = match module_filter {
                Some(module) => {
                    self.queue
                        .fetch_pending_for_module(module, batch_size, now)
                        .await?
                }
                None => self.queue.fetch_pending(batch_size, now).await?,
            };
            if batch.is_empty() {
                break;
            }
            report.iterations += 1;

            for job in &batch {
                if !orchestrators.contains_key(&job.module) {
                    if let Some(module) = self.resolver.as_ref()(&job.module) {
                        orchestrators.insert(
                            job.module.clone(),
                            Arc::new(Orchestrator::new(
                                module,
                                Arc::clone(&self.transport),
                                Arc::clone(&self.mappings),
                                Arc::clone(&self.locks),
                            )),
                        );
                    }
                }
            }

            // Offer eligible creates to the bulk optimizer first.
            let processor = BatchCreateProcessor {
                queue: &self.queue,
                transport: &self.transport,
                mappings: &self.mappings,
                resolver: &self.resolver,
                locks: &self.locks,
            };
            let bulk: BatchOutcome = processor.process(&batch, &orchestrators).await?;
            batch_successes += bulk.successes;
            batch_failures += bulk.failures;
            report.processed += bulk.processed();
            for (module, (s, f)) in &bulk.module_tally {
                let tally = module_tally.entry(module.clone()).or_default();
                tally.0 += s;
                tally.1 += f;
            }

            // Module-breaker decisions are stable within one batch.
            let mut module_open: HashMap<String, bool> = HashMap::new();

            for job in &batch {
                if bulk.handled.contains(&job.id) {
                    continue;
                }
                if started.elapsed() >= RUN_BUDGET {
                    break 'tick;
                }
                if over_memory_threshold(memory_cap) {
                    warn!("memory pressure, abandoning batch");
                    break 'tick;
                }

                let open = match module_open.get(&job.module) {
                    Some(open) => *open,
                    None => {
                        let open = !self.module_breakers.is_available(&job.module).await?;
                        module_open.insert(job.module.clone(), open);
                        open
                    }
                };
                if open {
                    continue;
                }

                if !self.queue.claim(job.id).await? {
                    debug!(job_id = job.id, "lost claim race to another worker");
                    continue;
                }

                let outcome = self.drive_job(job, &orchestrators).await;
                apply_outcome(&self.queue, job, &outcome).await?;

                report.processed += 1;
                let tally = module_tally.entry(job.module.clone()).or_default();
                if outcome.ok {
                    batch_successes += 1;
                    tally.0 += 1;
                } else {
                    batch_failures += 1;
                    tally.1 += 1;
                }
            }
        }

        // Post-batch accounting. An idle tick records nothing: only real
        // work moves the breakers and the notifier.
        for orchestrator in orchestrators.values() {
            if let Err(error) = orchestrator.flush_pull_translations().await {
                warn!(module = %orchestrator.module_id(), error = %error, "translation flush failed");
            }
        }

        if batch_successes + batch_failures > 0 {
            self.notifier.check(batch_successes, batch_failures).await?;
            self.global_breaker
                .record_batch(batch_successes, batch_failures)
                .await?;
            for (module, (successes, failures)) in &module_tally {
                self.module_breakers
                    .record_batch(module, *successes, *failures)
                    .await?;
            }
        }

        Ok(report)
    }

    /// Drive one claimed job through its orchestrator, inside a
    /// correlation-id span.
    async fn drive_job(
        &self,
        job: &Job,
        orchestrators: &HashMap<String, Arc<Orchestrator>>,
    ) -> SyncOutcome {
        let span = tracing::info_span!(
            "sync_job",
            job_id = job.id,
            correlation_id = %job.correlation_id,
            module = %job.module,
            entity_type = %job.entity_type,
        );

        async {
            let Some(orchestrator) = orchestrators.get(&job.module) else {
                return SyncOutcome::failure(
                    FailureKind::Permanent,
                    format!("module not registered: {}", job.module),
                );
            };

            let payload = match job.payload_map() {
                Ok(payload) => payload,
                Err(error) => return SyncOutcome::failure(FailureKind::Permanent, error.to_string()),
            };

            match job.direction {
                Direction::Push => {
                    orchestrator
                        .push_to_remote(
                            &job.entity_type,
                            job.action,
                            job.local_id,
                            job.remote_id,
                            payload,
                        )
                        .await
                }
                Direction::Pull => {
                    orchestrator
                        .pull_from_remote(
                            &job.entity_type,
                            job.action,
                            job.remote_id,
                            job.local_id,
                            payload,
                        )
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Write a job outcome back to the queue.
pub(crate) async fn apply_outcome(
    queue: &QueueStore,
    job: &Job,
    outcome: &SyncOutcome,
) -> Result<()> {
    if outcome.ok {
        queue.mark_completed(job.id).await?;
        return Ok(());
    }
    apply_failure(
        queue,
        job,
        &outcome.message,
        outcome.kind_or_transient(),
        outcome.entity_id,
    )
    .await
}

/// Retry-or-fail policy for one failed job.
///
/// When the remote created a record before the failure, its id is
/// persisted on the job first: the retry then runs as an update and the
/// entity keeps a single remote counterpart.
pub(crate) async fn apply_failure(
    queue: &QueueStore,
    job: &Job,
    message: &str,
    kind: FailureKind,
    created_entity_id: Option<i64>,
) -> Result<()> {
    if let Some(created) = created_entity_id {
        if created > 0 && job.remote_id == 0 {
            queue.adopt_remote_id(job.id, created).await?;
        }
    }

    if kind.should_retry() && job.retries_remain() {
        let retry = retry_at(job.attempts + 1, Utc::now());
        debug!(job_id = job.id, retry_at = %retry, "transient failure, rescheduling");
        queue.reschedule_retry(job.id, message, retry).await?;
    } else {
        warn!(job_id = job.id, error = message, "job failed permanently");
        queue.mark_failed(job.id, message).await?;
    }
    Ok(())
}

