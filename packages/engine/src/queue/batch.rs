//! Bulk-create optimizer.
//!
//! When a fetched batch contains several creates for the same
//! `(module, entity_type)`, one `create_batch` RPC replaces N round
//! trips. Anything that goes wrong falls back to the per-job push path,
//! whose per-entity lock is the final dedup safety net.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::job::{Direction, Job, SyncAction};
use super::scheduler::{apply_failure, apply_outcome};
use super::store::QueueStore;
use crate::error::FailureKind;
use crate::lock::{names, LockFactory};
use crate::rpc::ErpTransport;
use crate::sync::mapping::MappingRepo;
use crate::sync::module::ModuleResolver;
use crate::sync::orchestrator::{Orchestrator, PreparedPush};

/// Minimum group size worth a bulk RPC.
const MIN_GROUP_SIZE: usize = 2;

/// How long to wait on the per-model batch lock.
const BATCH_LOCK_TIMEOUT_SECS: u64 = 5;

/// What the optimizer did with the batch it was offered.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Jobs this processor took ownership of (the scheduler skips them).
    pub handled: HashSet<i64>,
    pub successes: u64,
    pub failures: u64,
    /// Per-module success/failure tallies for the module breakers.
    pub module_tally: HashMap<String, (u64, u64)>,
}

impl BatchOutcome {
    pub fn processed(&self) -> u64 {
        self.successes + self.failures
    }

    fn record(&mut self, module: &str, ok: bool) {
        let tally = self.module_tally.entry(module.to_string()).or_default();
        if ok {
            self.successes += 1;
            tally.0 += 1;
        } else {
            self.failures += 1;
            tally.1 += 1;
        }
    }
}

/// Group eligible creates by `(module, entity_type)`, deduplicating by
/// local id (latest enqueued wins). Only groups of two or more are
/// returned; singletons stay on the ordinary path.
pub(crate) fn group_creates(jobs: &[Job]) -> Vec<Vec<&Job>> {
    let mut groups: HashMap<(&str, &str), HashMap<i64, &Job>> = HashMap::new();

    for job in jobs {
        if job.direction != Direction::Push
            || job.action != SyncAction::Create
            || job.local_id == 0
        {
            continue;
        }
        let by_local = groups
            .entry((job.module.as_str(), job.entity_type.as_str()))
            .or_default();
        match by_local.get(&job.local_id) {
            Some(existing) if existing.id >= job.id => {}
            _ => {
                by_local.insert(job.local_id, job);
            }
        }
    }

    let mut result: Vec<Vec<&Job>> = groups
        .into_values()
        .filter(|group| group.len() >= MIN_GROUP_SIZE)
        .map(|group| {
            let mut jobs: Vec<&Job> = group.into_values().collect();
            jobs.sort_by_key(|job| job.id);
            jobs
        })
        .collect();
    result.sort_by_key(|group| group.first().map(|job| job.id));
    result
}

pub struct BatchCreateProcessor<'a> {
    pub queue: &'a QueueStore,
    pub transport: &'a Arc<dyn ErpTransport>,
    pub mappings: &'a Arc<dyn MappingRepo>,
    pub resolver: &'a ModuleResolver,
    pub locks: &'a Arc<dyn LockFactory>,
}

impl<'a> BatchCreateProcessor<'a> {
    /// Offer a fetched batch; returns the jobs consumed here so the
    /// scheduler loop skips them.
    pub async fn process(
        &self,
        jobs: &[Job],
        orchestrators: &HashMap<String, Arc<Orchestrator>>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for group in group_creates(jobs) {
            self.process_group(&group, orchestrators, &mut outcome)
                .await?;
        }

        Ok(outcome)
    }

    async fn process_group(
        &self,
        group: &[&Job],
        orchestrators: &HashMap<String, Arc<Orchestrator>>,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let module_id = group[0].module.clone();
        let entity_type = group[0].entity_type.clone();

        let module = self.resolver.as_ref()(&module_id);
        let orchestrator = orchestrators.get(&module_id);

        let (module, orchestrator) = match (module, orchestrator) {
            (Some(module), Some(orchestrator)) => (module, orchestrator),
            _ => {
                // No module implementation: nothing will ever process
                // these jobs, so fail them out now.
                return self
                    .fail_group(
                        group,
                        &module_id,
                        &format!("module not registered: {module_id}"),
                        outcome,
                    )
                    .await;
            }
        };

        let Some(remote_model) = module.remote_model(&entity_type) else {
            return self
                .fail_group(
                    group,
                    &module_id,
                    &format!("entity type not registered: {entity_type}"),
                    outcome,
                )
                .await;
        };

        // Claim and prepare each member. Jobs lost to another worker are
        // noted and skipped; payloads that cannot be prepared fail with
        // their own classification.
        let mut prepared: Vec<(&Job, PreparedPush)> = Vec::with_capacity(group.len());
        for job in group {
            if !self.queue.claim(job.id).await? {
                debug!(job_id = job.id, "lost claim race to another worker");
                outcome.handled.insert(job.id);
                continue;
            }
            outcome.handled.insert(job.id);

            let payload = match job.payload_map() {
                Ok(payload) => payload,
                Err(error) => {
                    apply_failure(
                        self.queue,
                        job,
                        &error.to_string(),
                        FailureKind::Permanent,
                        None,
                    )
                    .await?;
                    outcome.record(&module_id, false);
                    continue;
                }
            };

            match orchestrator
                .prepare_push_values(&entity_type, job.local_id, payload)
                .await
            {
                Ok(values) => prepared.push((job, values)),
                Err(error) => {
                    apply_failure(self.queue, job, &error.to_string(), error.kind(), None)
                        .await?;
                    outcome.record(&module_id, false);
                }
            }
        }

        if prepared.is_empty() {
            return Ok(());
        }

        if let Err(error) = self
            .create_group(&module_id, &entity_type, &remote_model, &prepared, outcome)
            .await
        {
            // Bulk path failed somewhere; drive every member through the
            // per-job push, whose per-entity lock dedups against anything
            // the bulk call may have half-done.
            warn!(
                module = %module_id,
                entity_type = %entity_type,
                error = %error,
                "batch create failed, falling back to per-job push"
            );
            self.fallback(&module_id, &entity_type, orchestrator, &prepared, outcome)
                .await?;
        }

        Ok(())
    }

    /// Claim and permanently fail every job in a group.
    async fn fail_group(
        &self,
        group: &[&Job],
        module_id: &str,
        message: &str,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        for job in group {
            if self.queue.claim(job.id).await? {
                apply_failure(self.queue, job, message, FailureKind::Permanent, None).await?;
                outcome.record(module_id, false);
            }
            outcome.handled.insert(job.id);
        }
        Ok(())
    }

    async fn create_group(
        &self,
        module_id: &str,
        entity_type: &str,
        remote_model: &str,
        prepared: &[(&Job, PreparedPush)],
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let lock = self
            .locks
            .named(&names::batch(module_id, remote_model), BATCH_LOCK_TIMEOUT_SECS);
        if !lock.acquire().await? {
            anyhow::bail!("batch lock unavailable");
        }

        let result = async {
            let values_list: Vec<Map<String, Value>> = prepared
                .iter()
                .map(|(_, push)| push.values.clone())
                .collect();

            let ids = self
                .transport
                .create_batch(remote_model, values_list)
                .await?;
            if ids.len() != prepared.len() {
                anyhow::bail!(
                    "create_batch returned {} ids for {} records",
                    ids.len(),
                    prepared.len()
                );
            }
            Ok::<Vec<i64>, anyhow::Error>(ids)
        }
        .await;

        if let Err(error) = lock.release().await {
            warn!(error = %error, "failed to release batch lock");
        }
        let ids = result?;

        // Positional correspondence: ids come back in input order.
        for ((job, push), remote_id) in prepared.iter().zip(ids) {
            match self
                .mappings
                .save(
                    module_id,
                    entity_type,
                    job.local_id,
                    remote_id,
                    remote_model,
                    Some(&push.hash),
                )
                .await
            {
                Ok(()) => {
                    self.queue.mark_completed(job.id).await?;
                    outcome.record(module_id, true);
                }
                Err(error) => {
                    // The record exists remotely; keep its id on the job
                    // so the retry runs as an update.
                    apply_failure(
                        self.queue,
                        job,
                        &format!("mapping save failed after batch create: {error}"),
                        FailureKind::Transient,
                        Some(remote_id),
                    )
                    .await?;
                    outcome.record(module_id, false);
                }
            }
        }

        Ok(())
    }

    async fn fallback(
        &self,
        module_id: &str,
        entity_type: &str,
        orchestrator: &Arc<Orchestrator>,
        prepared: &[(&Job, PreparedPush)],
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        for (job, _) in prepared {
            let payload = job.payload_map().ok().flatten();
            let push_outcome = orchestrator
                .push_to_remote(entity_type, SyncAction::Create, job.local_id, 0, payload)
                .await;
            apply_outcome(self.queue, job, &push_outcome).await?;
            outcome.record(module_id, push_outcome.ok);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn job(id: i64, module: &str, entity_type: &str, action: SyncAction, local_id: i64) -> Job {
        Job {
            id,
            correlation_id: Uuid::new_v4(),
            site_id: 1,
            module: module.to_string(),
            direction: Direction::Push,
            entity_type: entity_type.to_string(),
            local_id,
            remote_id: 0,
            action,
            payload: None,
            priority: 5,
            status: super::super::job::JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            error_message: None,
            scheduled_at: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn groups_by_module_and_entity_type() {
        let jobs = vec![
            job(1, "crm", "contact", SyncAction::Create, 10),
            job(2, "crm", "contact", SyncAction::Create, 11),
            job(3, "shop", "product", SyncAction::Create, 20),
            job(4, "shop", "product", SyncAction::Create, 21),
        ];
        let groups = group_creates(&jobs);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.len() == 2));
    }

    #[test]
    fn singletons_are_left_out() {
        let jobs = vec![
            job(1, "crm", "contact", SyncAction::Create, 10),
            job(2, "shop", "product", SyncAction::Create, 20),
        ];
        assert!(group_creates(&jobs).is_empty());
    }

    #[test]
    fn non_creates_are_ignored() {
        let jobs = vec![
            job(1, "crm", "contact", SyncAction::Update, 10),
            job(2, "crm", "contact", SyncAction::Update, 11),
            job(3, "crm", "contact", SyncAction::Delete, 12),
        ];
        assert!(group_creates(&jobs).is_empty());
    }

    #[test]
    fn dedup_keeps_latest_per_local_id() {
        let jobs = vec![
            job(1, "crm", "contact", SyncAction::Create, 10),
            job(2, "crm", "contact", SyncAction::Create, 10),
            job(3, "crm", "contact", SyncAction::Create, 11),
        ];
        let groups = group_creates(&jobs);
        assert_eq!(groups.len(), 1);
        let ids: Vec<i64> = groups[0].iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn unknown_local_ids_are_skipped() {
        let jobs = vec![
            job(1, "crm", "contact", SyncAction::Create, 0),
            job(2, "crm", "contact", SyncAction::Create, 0),
        ];
        assert!(group_creates(&jobs).is_empty());
    }

    #[test]
    fn group_members_are_ordered_by_id() {
        let jobs = vec![
            job(5, "crm", "contact", SyncAction::Create, 12),
            job(1, "crm", "contact", SyncAction::Create, 10),
            job(3, "crm", "contact", SyncAction::Create, 11),
        ];
        let groups = group_creates(&jobs);
        let ids: Vec<i64> = groups[0].iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
