//! In-memory doubles for the engine's trait seams.
//!
//! These back the orchestrator and reconciler tests: a scripted remote
//! transport, a mapping repository with both-direction uniqueness, and a
//! minimal module whose local store is a hash map. No database required.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use odoo_rpc::OdooRpcError;
use serde_json::{Map, Value};

use crate::lock::{LockFactory, NamedLock};
use crate::rpc::ErpTransport;
use crate::sync::mapping::{Mapping, MappingRepo};
use crate::sync::module::{PullTranslations, SyncModule};

// ============================================================================
// Lock doubles
// ============================================================================

/// Lock factory whose locks always grant immediately.
pub struct FreeLockFactory;

impl LockFactory for FreeLockFactory {
    fn named(&self, _name: &str, _timeout_secs: u64) -> std::sync::Arc<dyn NamedLock> {
        std::sync::Arc::new(FreeLock {
            held: AtomicBool::new(false),
        })
    }
}

struct FreeLock {
    held: AtomicBool,
}

#[async_trait]
impl NamedLock for FreeLock {
    async fn acquire(&self) -> Result<bool> {
        self.held.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    async fn release(&self) -> Result<bool> {
        Ok(self.held.swap(false, Ordering::SeqCst))
    }
}

/// Lock factory whose locks can never be acquired, for contention paths.
pub struct BlockedLockFactory;

impl LockFactory for BlockedLockFactory {
    fn named(&self, _name: &str, _timeout_secs: u64) -> std::sync::Arc<dyn NamedLock> {
        std::sync::Arc::new(BlockedLock)
    }
}

struct BlockedLock;

#[async_trait]
impl NamedLock for BlockedLock {
    async fn acquire(&self) -> Result<bool> {
        Ok(false)
    }

    async fn is_held(&self) -> bool {
        false
    }

    async fn release(&self) -> Result<bool> {
        Ok(false)
    }
}

// ============================================================================
// MockTransport
// ============================================================================

/// Scripted remote system. Created records live in an in-memory model
/// table; `search` answers come from a queue of scripted results.
#[derive(Default)]
pub struct MockTransport {
    next_id: AtomicI64,
    pub records: Mutex<HashMap<String, HashMap<i64, Map<String, Value>>>>,
    pub search_results: Mutex<VecDeque<Vec<i64>>>,
    pub company_id: Mutex<Option<i64>>,
    pub fail_next_create: Mutex<Option<OdooRpcError>>,
    pub fail_next_create_batch: Mutex<Option<OdooRpcError>>,
    pub fail_next_write: Mutex<Option<OdooRpcError>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            ..Default::default()
        }
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Calls recorded so far, e.g. `create:res.partner`.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn push_search_result(&self, ids: Vec<i64>) {
        self.search_results.lock().unwrap().push_back(ids);
    }

    pub fn record_count(&self, model: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .get(model)
            .map(|table| table.len())
            .unwrap_or(0)
    }

    pub fn get_record(&self, model: &str, id: i64) -> Option<Map<String, Value>> {
        self.records
            .lock()
            .unwrap()
            .get(model)
            .and_then(|table| table.get(&id))
            .cloned()
    }

    pub fn insert_record(&self, model: &str, id: i64, values: Map<String, Value>) {
        self.records
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .insert(id, values);
    }
}

#[async_trait]
impl ErpTransport for MockTransport {
    async fn search(
        &self,
        model: &str,
        _domain: Value,
        _offset: Option<u32>,
        _limit: Option<u32>,
    ) -> Result<Vec<i64>, OdooRpcError> {
        self.log(format!("search:{model}"));
        Ok(self
            .search_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn search_count(&self, model: &str, _domain: Value) -> Result<i64, OdooRpcError> {
        self.log(format!("search_count:{model}"));
        Ok(self.record_count(model) as i64)
    }

    async fn search_read(
        &self,
        model: &str,
        _domain: Value,
        _fields: &[&str],
        _offset: u32,
        limit: u32,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
        self.log(format!("search_read:{model}"));
        let records = self.records.lock().unwrap();
        Ok(records
            .get(model)
            .map(|table| table.values().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        _fields: Option<&[&str]>,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
        self.log(format!("read:{model}"));
        let records = self.records.lock().unwrap();
        let table = records.get(model);
        Ok(ids
            .iter()
            .filter_map(|id| table.and_then(|t| t.get(id)).cloned())
            .collect())
    }

    async fn create(&self, model: &str, values: Map<String, Value>) -> Result<i64, OdooRpcError> {
        self.log(format!("create:{model}"));
        if let Some(error) = self.fail_next_create.lock().unwrap().take() {
            return Err(error);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.insert_record(model, id, values);
        Ok(id)
    }

    async fn create_batch(
        &self,
        model: &str,
        values_list: Vec<Map<String, Value>>,
    ) -> Result<Vec<i64>, OdooRpcError> {
        self.log(format!("create_batch:{model}:{}", values_list.len()));
        if let Some(error) = self.fail_next_create_batch.lock().unwrap().take() {
            return Err(error);
        }
        let mut ids = Vec::with_capacity(values_list.len());
        for values in values_list {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.insert_record(model, id, values);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: Map<String, Value>,
    ) -> Result<bool, OdooRpcError> {
        self.log(format!("write:{model}"));
        if let Some(error) = self.fail_next_write.lock().unwrap().take() {
            return Err(error);
        }
        let mut records = self.records.lock().unwrap();
        let table = records.entry(model.to_string()).or_default();
        for id in ids {
            let entry = table.entry(*id).or_default();
            for (key, value) in &values {
                entry.insert(key.clone(), value.clone());
            }
        }
        Ok(true)
    }

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, OdooRpcError> {
        self.log(format!("unlink:{model}"));
        let mut records = self.records.lock().unwrap();
        if let Some(table) = records.get_mut(model) {
            for id in ids {
                table.remove(id);
            }
        }
        Ok(true)
    }

    async fn execute(
        &self,
        model: &str,
        method: &str,
        _args: Value,
    ) -> Result<Value, OdooRpcError> {
        self.log(format!("execute:{model}:{method}"));
        Ok(Value::Null)
    }

    async fn get_company_id(&self) -> Result<Option<i64>, OdooRpcError> {
        self.log("get_company_id");
        Ok(*self.company_id.lock().unwrap())
    }
}

// ============================================================================
// InMemoryMappingRepo
// ============================================================================

/// Mapping repository over a vector, enforcing both-direction uniqueness
/// like the real table's constraints.
#[derive(Default)]
pub struct InMemoryMappingRepo {
    next_id: AtomicI64,
    rows: Mutex<Vec<Mapping>>,
    pub fail_next_save: AtomicBool,
}

impl InMemoryMappingRepo {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arrange a mapping directly, bypassing save-failure injection.
    pub fn insert(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
        remote_id: i64,
        remote_model: &str,
        sync_hash: Option<&str>,
    ) {
        let now = Utc::now();
        self.rows.lock().unwrap().push(Mapping {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            module: module.to_string(),
            entity_type: entity_type.to_string(),
            local_id,
            remote_id,
            remote_model: remote_model.to_string(),
            sync_hash: sync_hash.map(str::to_string),
            last_polled_at: None,
            created_at: now,
            updated_at: now,
        });
    }
}

#[async_trait]
impl MappingRepo for InMemoryMappingRepo {
    async fn get_remote_id(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
    ) -> Result<Option<i64>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.module == module && m.entity_type == entity_type && m.local_id == local_id)
            .map(|m| m.remote_id))
    }

    async fn get_local_id(
        &self,
        module: &str,
        entity_type: &str,
        remote_id: i64,
    ) -> Result<Option<i64>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|m| {
                m.module == module && m.entity_type == entity_type && m.remote_id == remote_id
            })
            .map(|m| m.local_id))
    }

    async fn get(
        &self,
        module: &str,
        entity_type: &str,
        local_id: i64,
    ) -> Result<Option<Mapping>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.module == module && m.entity_type == entity_type && m.local_id == local_id)
            .cloned())
    }

    async fn batch_get_remote_ids(
        &self,
        module: &str,
        entity_type: &str,
        local_ids: &[i64],
    ) -> Result<HashMap<i64, i64>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|m| {
                m.module == module
                    && m.entity_type == entity_type
                    && local_ids.contains(&m.local_id)
            })
            .map(|m| (m.local_id, m.remote_id))
            .collect())
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
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("injected mapping save failure"));
        }

        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|m| {
            m.module == module
                && m.entity_type == entity_type
                && m.remote_id == remote_id
                && m.local_id != local_id
        }) {
            return Err(anyhow!("duplicate remote_id {remote_id}"));
        }

        let now = Utc::now();
        if let Some(existing) = rows.iter_mut().find(|m| {
            m.module == module && m.entity_type == entity_type && m.local_id == local_id
        }) {
            existing.remote_id = remote_id;
            existing.remote_model = remote_model.to_string();
            existing.sync_hash = sync_hash.map(str::to_string);
            existing.updated_at = now;
            return Ok(());
        }

        rows.push(Mapping {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            module: module.to_string(),
            entity_type: entity_type.to_string(),
            local_id,
            remote_id,
            remote_model: remote_model.to_string(),
            sync_hash: sync_hash.map(str::to_string),
            last_polled_at: None,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    async fn remove(&self, module: &str, entity_type: &str, local_id: i64) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|m| {
            !(m.module == module && m.entity_type == entity_type && m.local_id == local_id)
        });
        Ok(rows.len() < before)
    }

    async fn mark_polled(
        &self,
        module: &str,
        entity_type: &str,
        seen_remote_ids: &[i64],
        poll_start: chrono::DateTime<Utc>,
    ) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let mut touched = 0;
        for mapping in rows.iter_mut() {
            if mapping.module == module
                && mapping.entity_type == entity_type
                && seen_remote_ids.contains(&mapping.remote_id)
            {
                mapping.last_polled_at = Some(poll_start);
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn get_stale_poll_mappings(
        &self,
        module: &str,
        entity_type: &str,
        poll_start: chrono::DateTime<Utc>,
    ) -> Result<Vec<Mapping>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|m| {
                m.module == module
                    && m.entity_type == entity_type
                    && m.last_polled_at.map(|at| at < poll_start).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn get_module_entity_mappings(
        &self,
        module: &str,
        entity_type: &str,
    ) -> Result<Vec<Mapping>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.module == module && m.entity_type == entity_type)
            .cloned()
            .collect())
    }
}

// ============================================================================
// ScriptedModule
// ============================================================================

/// Minimal module whose local store is a map and whose field mappings are
/// identity.
pub struct ScriptedModule {
    id: String,
    entity_types: Vec<(String, String)>,
    next_local_id: AtomicI64,
    pub local_records: Mutex<HashMap<(String, i64), Map<String, Value>>>,
    pub dedup_domains: Mutex<HashMap<String, Value>>,
    pub deleted: Mutex<Vec<(String, i64)>>,
    pub translations_seen: Mutex<Vec<PullTranslations>>,
    pub reject_pulls: AtomicBool,
    user_backed: bool,
}

impl ScriptedModule {
    pub fn new(id: &str, entity_types: Vec<(&str, &str)>) -> Self {
        Self {
            id: id.to_string(),
            entity_types: entity_types
                .into_iter()
                .map(|(et, model)| (et.to_string(), model.to_string()))
                .collect(),
            next_local_id: AtomicI64::new(1000),
            local_records: Mutex::new(HashMap::new()),
            dedup_domains: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            translations_seen: Mutex::new(Vec::new()),
            reject_pulls: AtomicBool::new(false),
            user_backed: false,
        }
    }

    pub fn new_user_backed(id: &str, entity_types: Vec<(&str, &str)>) -> Self {
        Self {
            user_backed: true,
            ..Self::new(id, entity_types)
        }
    }

    pub fn set_local(&self, entity_type: &str, local_id: i64, data: Map<String, Value>) {
        self.local_records
            .lock()
            .unwrap()
            .insert((entity_type.to_string(), local_id), data);
    }

    pub fn set_dedup_domain(&self, entity_type: &str, domain: Value) {
        self.dedup_domains
            .lock()
            .unwrap()
            .insert(entity_type.to_string(), domain);
    }

    pub fn local(&self, entity_type: &str, local_id: i64) -> Option<Map<String, Value>> {
        self.local_records
            .lock()
            .unwrap()
            .get(&(entity_type.to_string(), local_id))
            .cloned()
    }
}

#[async_trait]
impl SyncModule for ScriptedModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn entity_types(&self) -> Vec<(String, String)> {
        self.entity_types.clone()
    }

    async fn load_local(&self, entity_type: &str, local_id: i64) -> Result<Map<String, Value>> {
        self.local(entity_type, local_id)
            .ok_or_else(|| anyhow!("no data to push"))
    }

    async fn save_local(
        &self,
        entity_type: &str,
        data: &Map<String, Value>,
        local_id: Option<i64>,
    ) -> Result<i64> {
        let id = local_id.unwrap_or_else(|| self.next_local_id.fetch_add(1, Ordering::SeqCst));
        self.set_local(entity_type, id, data.clone());
        Ok(id)
    }

    async fn delete_local(&self, entity_type: &str, local_id: i64) -> Result<bool> {
        self.deleted
            .lock()
            .unwrap()
            .push((entity_type.to_string(), local_id));
        Ok(self
            .local_records
            .lock()
            .unwrap()
            .remove(&(entity_type.to_string(), local_id))
            .is_some())
    }

    async fn local_exists(&self, entity_type: &str, local_id: i64) -> Result<bool> {
        Ok(self
            .local_records
            .lock()
            .unwrap()
            .contains_key(&(entity_type.to_string(), local_id)))
    }

    fn map_to_remote(
        &self,
        _entity_type: &str,
        local_data: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        Ok(local_data.clone())
    }

    fn map_from_remote(
        &self,
        _entity_type: &str,
        remote_data: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        Ok(remote_data.clone())
    }

    fn dedup_domain(&self, entity_type: &str, _values: &Map<String, Value>) -> Option<Value> {
        self.dedup_domains.lock().unwrap().get(entity_type).cloned()
    }

    fn accept_pull(&self, _entity_type: &str, _remote_data: &Map<String, Value>) -> bool {
        !self.reject_pulls.load(Ordering::SeqCst)
    }

    async fn apply_pull_translations(&self, translations: &PullTranslations) -> Result<()> {
        self.translations_seen
            .lock()
            .unwrap()
            .push(translations.clone());
        Ok(())
    }

    fn user_backed(&self) -> bool {
        self.user_backed
    }
}

/// Object map literal helper for tests.
pub fn map_of(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
