//! Per-job sync driver for one module.
//!
//! The scheduler builds one orchestrator per module per run; the company
//! cache and the pull-translation buffer are therefore naturally scoped
//! to a batch. Every thrown error is converted into a [`SyncOutcome`]
//! before it leaves this module; the scheduler only ever sees results.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::mapping::MappingRepo;
use super::module::{PullTranslations, SyncModule};
use crate::common::hash::sync_hash;
use crate::error::{FailureKind, SyncError, SyncOutcome};
use crate::lock::{names, LockFactory};
use crate::queue::job::SyncAction;
use crate::rpc::ErpTransport;

/// Wait for a contended per-entity create lock this long before deferring
/// the job to a retry.
const PUSH_LOCK_TIMEOUT_SECS: u64 = 5;

/// Pull translations buffered before a mid-batch flush.
const TRANSLATION_BUFFER_CAP: usize = 500;

/// Values prepared for a push, shared with the batch-create optimizer.
pub struct PreparedPush {
    pub remote_model: String,
    pub values: Map<String, Value>,
    pub hash: String,
}

pub struct Orchestrator {
    module: Arc<dyn SyncModule>,
    transport: Arc<dyn ErpTransport>,
    mappings: Arc<dyn MappingRepo>,
    locks: Arc<dyn LockFactory>,
    /// `None` until probed; the inner option is the remote's answer.
    company_id: RwLock<Option<Option<i64>>>,
    /// Process-local re-entrancy flag for pull writes. A helpful
    /// short-circuit for hook producers only; the queue dedup is the
    /// authoritative guard.
    importing: AtomicBool,
    translations: Mutex<PullTranslations>,
    translation_count: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        module: Arc<dyn SyncModule>,
        transport: Arc<dyn ErpTransport>,
        mappings: Arc<dyn MappingRepo>,
        locks: Arc<dyn LockFactory>,
    ) -> Self {
        Self {
            module,
            transport,
            mappings,
            locks,
            company_id: RwLock::new(None),
            importing: AtomicBool::new(false),
            translations: Mutex::new(PullTranslations::new()),
            translation_count: AtomicUsize::new(0),
        }
    }

    pub fn module_id(&self) -> String {
        self.module.id().to_string()
    }

    /// Whether a pull write is in flight in this process. Hook producers
    /// consult this to avoid re-enqueuing their own import.
    pub fn is_importing(&self) -> bool {
        self.importing.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Push
    // ========================================================================

    pub async fn push_to_remote(
        &self,
        entity_type: &str,
        action: SyncAction,
        local_id: i64,
        remote_id: i64,
        payload: Option<&Map<String, Value>>,
    ) -> SyncOutcome {
        match self
            .push_inner(entity_type, action, local_id, remote_id, payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => SyncOutcome::from_error(&error),
        }
    }

    async fn push_inner(
        &self,
        entity_type: &str,
        action: SyncAction,
        local_id: i64,
        remote_id: i64,
        payload: Option<&Map<String, Value>>,
    ) -> Result<SyncOutcome, SyncError> {
        let module_id = self.module.id().to_string();
        let remote_model = self
            .module
            .remote_model(entity_type)
            .ok_or_else(|| SyncError::UnregisteredEntityType(entity_type.to_string()))?;

        if action == SyncAction::Delete {
            if remote_id > 0 {
                self.transport.unlink(&remote_model, &[remote_id]).await?;
            }
            self.mappings
                .remove(&module_id, entity_type, local_id)
                .await
                .map_err(|e| SyncError::MappingSave(e.to_string()))?;
            return Ok(SyncOutcome::success("deleted remotely"));
        }

        let prepared = self
            .prepare_push_values(entity_type, local_id, payload)
            .await?;

        // Resolve the real action: a create for an already-mapped entity
        // (or an update that lost its remote id) goes through the mapping.
        let mut action = action;
        let mut remote_id = remote_id;
        if action == SyncAction::Create || remote_id == 0 {
            match self
                .mappings
                .get_remote_id(&module_id, entity_type, local_id)
                .await?
            {
                Some(mapped) => {
                    remote_id = mapped;
                    action = SyncAction::Update;
                }
                None => action = SyncAction::Create,
            }
        }

        if action == SyncAction::Update {
            // No-op guard: skip the remote write when nothing changed
            // since the last successful sync.
            if let Some(mapping) = self.mappings.get(&module_id, entity_type, local_id).await? {
                if mapping.sync_hash.as_deref() == Some(prepared.hash.as_str()) {
                    debug!(entity_type, local_id, "payload unchanged, skipping write");
                    return Ok(SyncOutcome::success_with("unchanged", remote_id));
                }
            }
            return self
                .write_existing(entity_type, &prepared, local_id, remote_id)
                .await;
        }

        // Create path: serialize per entity, then double-check under the
        // lock, since another worker may have finished this create while
        // we were waiting.
        let lock_name = names::push(&module_id, entity_type, local_id);
        let lock = self.locks.named(&lock_name, PUSH_LOCK_TIMEOUT_SECS);
        if !lock
            .acquire()
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))?
        {
            return Err(SyncError::LockTimeout(lock_name));
        }

        let result = self
            .create_under_lock(entity_type, &prepared, local_id)
            .await;

        if let Err(error) = lock.release().await {
            warn!(lock = %lock_name, error = %error, "failed to release push lock");
        }
        result
    }

    /// Load, map and hash the values for a push.
    pub async fn prepare_push_values(
        &self,
        entity_type: &str,
        local_id: i64,
        payload: Option<&Map<String, Value>>,
    ) -> Result<PreparedPush, SyncError> {
        let remote_model = self
            .module
            .remote_model(entity_type)
            .ok_or_else(|| SyncError::UnregisteredEntityType(entity_type.to_string()))?;

        let data = match payload {
            Some(map) if !map.is_empty() => map.clone(),
            _ => self
                .module
                .load_local(entity_type, local_id)
                .await
                .map_err(|e| SyncError::Module(e.to_string()))?,
        };
        if data.is_empty() {
            return Err(SyncError::NoData);
        }

        let mut values = self
            .module
            .map_to_remote(entity_type, &data)
            .map_err(|e| SyncError::Module(e.to_string()))?;

        if !values.contains_key("company_id") {
            if let Some(company_id) = self.company_id().await? {
                values.insert("company_id".to_string(), Value::from(company_id));
            }
        }

        let hash = sync_hash(&values);
        Ok(PreparedPush {
            remote_model,
            values,
            hash,
        })
    }

    async fn write_existing(
        &self,
        entity_type: &str,
        prepared: &PreparedPush,
        local_id: i64,
        remote_id: i64,
    ) -> Result<SyncOutcome, SyncError> {
        let module_id = self.module.id();

        self.transport
            .write(&prepared.remote_model, &[remote_id], prepared.values.clone())
            .await?;

        if let Err(error) = self
            .mappings
            .save(
                module_id,
                entity_type,
                local_id,
                remote_id,
                &prepared.remote_model,
                Some(&prepared.hash),
            )
            .await
        {
            // The remote mutation happened; the retry reconciles.
            return Ok(SyncOutcome::failure_with(
                FailureKind::Transient,
                format!("mapping save failed: {error}"),
                remote_id,
            ));
        }

        Ok(SyncOutcome::success_with("updated", remote_id))
    }

    async fn create_under_lock(
        &self,
        entity_type: &str,
        prepared: &PreparedPush,
        local_id: i64,
    ) -> Result<SyncOutcome, SyncError> {
        let module_id = self.module.id().to_string();

        // Double-check: the create may have completed during our wait.
        if let Some(remote_id) = self
            .mappings
            .get_remote_id(&module_id, entity_type, local_id)
            .await?
        {
            debug!(entity_type, local_id, remote_id, "mapping appeared during lock wait");
            return self
                .write_existing(entity_type, prepared, local_id, remote_id)
                .await;
        }

        // Dedup search: a prior attempt may have created the record and
        // then died before writing the mapping.
        if let Some(domain) = self.module.dedup_domain(entity_type, &prepared.values) {
            let found = self
                .transport
                .search(&prepared.remote_model, domain, None, Some(1))
                .await?;
            if let Some(&orphan_id) = found.first() {
                debug!(entity_type, local_id, orphan_id, "dedup search matched an orphan");
                return self
                    .write_existing(entity_type, prepared, local_id, orphan_id)
                    .await;
            }
        }

        let created = self
            .transport
            .create(&prepared.remote_model, prepared.values.clone())
            .await?;

        if let Err(error) = self
            .mappings
            .save(
                &module_id,
                entity_type,
                local_id,
                created,
                &prepared.remote_model,
                Some(&prepared.hash),
            )
            .await
        {
            // Remote record exists without a mapping: surface the id so
            // the job adopts it and the retry becomes an update.
            return Ok(SyncOutcome::failure_with(
                FailureKind::Transient,
                format!("mapping save failed after create: {error}"),
                created,
            ));
        }

        Ok(SyncOutcome::success_with("created", created))
    }

    // ========================================================================
    // Pull
    // ========================================================================

    pub async fn pull_from_remote(
        &self,
        entity_type: &str,
        action: SyncAction,
        remote_id: i64,
        local_id: i64,
        payload: Option<&Map<String, Value>>,
    ) -> SyncOutcome {
        match self
            .pull_inner(entity_type, action, remote_id, local_id, payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => SyncOutcome::from_error(&error),
        }
    }

    async fn pull_inner(
        &self,
        entity_type: &str,
        action: SyncAction,
        remote_id: i64,
        local_id: i64,
        payload: Option<&Map<String, Value>>,
    ) -> Result<SyncOutcome, SyncError> {
        let module_id = self.module.id().to_string();
        let remote_model = self
            .module
            .remote_model(entity_type)
            .ok_or_else(|| SyncError::UnregisteredEntityType(entity_type.to_string()))?;

        let _guard = ImportGuard::enter(&self.importing);

        if action == SyncAction::Delete {
            let target = if local_id > 0 {
                Some(local_id)
            } else {
                self.mappings
                    .get_local_id(&module_id, entity_type, remote_id)
                    .await?
            };
            if let Some(target) = target {
                self.module
                    .delete_local(entity_type, target)
                    .await
                    .map_err(|e| SyncError::Module(e.to_string()))?;
                self.mappings
                    .remove(&module_id, entity_type, target)
                    .await
                    .map_err(|e| SyncError::MappingSave(e.to_string()))?;
            }
            return Ok(SyncOutcome::success("deleted locally"));
        }

        let record = match payload {
            Some(map) if !map.is_empty() => map.clone(),
            _ => {
                let mut records = self
                    .transport
                    .read(&remote_model, &[remote_id], None)
                    .await?;
                if records.is_empty() {
                    return Err(SyncError::RemoteMissing(remote_id));
                }
                records.swap_remove(0)
            }
        };

        if !self.module.accept_pull(entity_type, &record) {
            debug!(entity_type, remote_id, "pull filtered by module");
            return Ok(SyncOutcome::success("filtered"));
        }

        let local_data = self
            .module
            .map_from_remote(entity_type, &record)
            .map_err(|e| SyncError::Module(e.to_string()))?;

        let target = if local_id > 0 {
            Some(local_id)
        } else {
            self.mappings
                .get_local_id(&module_id, entity_type, remote_id)
                .await?
        };

        let saved_id = self
            .module
            .save_local(entity_type, &local_data, target)
            .await
            .map_err(|e| SyncError::Module(e.to_string()))?;

        self.module
            .after_pull_save(entity_type, saved_id, &record)
            .await
            .map_err(|e| SyncError::Module(e.to_string()))?;

        let hash = sync_hash(&record);
        if let Err(error) = self
            .mappings
            .save(
                &module_id,
                entity_type,
                saved_id,
                remote_id,
                &remote_model,
                Some(&hash),
            )
            .await
        {
            return Ok(SyncOutcome::failure_with(
                FailureKind::Transient,
                format!("mapping save failed: {error}"),
                remote_id,
            ));
        }

        self.buffer_translation(&remote_model, remote_id, saved_id)
            .await?;

        Ok(SyncOutcome::success_with("pulled", saved_id))
    }

    async fn buffer_translation(
        &self,
        remote_model: &str,
        remote_id: i64,
        local_id: i64,
    ) -> Result<(), SyncError> {
        {
            let mut translations = self.translations.lock().await;
            translations
                .entry(remote_model.to_string())
                .or_default()
                .insert(remote_id, local_id);
        }
        let count = self.translation_count.fetch_add(1, Ordering::SeqCst) + 1;

        if count >= TRANSLATION_BUFFER_CAP {
            debug!(count, "translation buffer full, flushing mid-batch");
            self.flush_pull_translations().await?;
        }
        Ok(())
    }

    /// Deliver buffered remote→local translations to the module. Called
    /// by the scheduler at the end of each batch and mid-batch on
    /// overflow.
    pub async fn flush_pull_translations(&self) -> Result<(), SyncError> {
        let translations = {
            let mut buffer = self.translations.lock().await;
            self.translation_count.store(0, Ordering::SeqCst);
            std::mem::take(&mut *buffer)
        };
        if translations.is_empty() {
            return Ok(());
        }

        self.module
            .apply_pull_translations(&translations)
            .await
            .map_err(|e| SyncError::Module(e.to_string()))
    }

    async fn company_id(&self) -> Result<Option<i64>, SyncError> {
        {
            let cached = self.company_id.read().await;
            if let Some(answer) = *cached {
                return Ok(answer);
            }
        }
        let answer = self.transport.get_company_id().await?;
        *self.company_id.write().await = Some(answer);
        Ok(answer)
    }
}

/// RAII flag for a pull write in progress.
struct ImportGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ImportGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for ImportGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
