//! Contract between the engine core and domain modules.
//!
//! A module owns one or more entity types (posts, products, orders, …),
//! knows how to load and store them locally, and how their fields map to
//! the remote model. The core never links module concrete types: the
//! scheduler receives a [`ModuleResolver`] closure and looks modules up
//! by id at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Remote-id to local-id translations accumulated during a pull batch,
/// keyed by remote model.
pub type PullTranslations = HashMap<String, HashMap<i64, i64>>;

/// A domain plug-in owning entity types and their mapping rules.
#[async_trait]
pub trait SyncModule: Send + Sync {
    /// Stable module id, used in job rows, mappings and lock names.
    fn id(&self) -> &str;

    /// `(entity_type, remote_model)` pairs this module owns.
    fn entity_types(&self) -> Vec<(String, String)>;

    /// Remote model for an entity type, when registered.
    fn remote_model(&self, entity_type: &str) -> Option<String> {
        self.entity_types()
            .into_iter()
            .find(|(et, _)| et == entity_type)
            .map(|(_, model)| model)
    }

    /// Load the local record's data for a push.
    async fn load_local(&self, entity_type: &str, local_id: i64) -> Result<Map<String, Value>>;

    /// Create or update the local record from pulled data; returns the
    /// local id.
    async fn save_local(
        &self,
        entity_type: &str,
        data: &Map<String, Value>,
        local_id: Option<i64>,
    ) -> Result<i64>;

    /// Delete the local record; returns whether anything was deleted.
    async fn delete_local(&self, entity_type: &str, local_id: i64) -> Result<bool>;

    /// Whether the local record still exists (orphan cleanup).
    async fn local_exists(&self, entity_type: &str, local_id: i64) -> Result<bool>;

    /// Map local fields to remote fields.
    fn map_to_remote(
        &self,
        entity_type: &str,
        local_data: &Map<String, Value>,
    ) -> Result<Map<String, Value>>;

    /// Map remote fields to local fields.
    fn map_from_remote(
        &self,
        entity_type: &str,
        remote_data: &Map<String, Value>,
    ) -> Result<Map<String, Value>>;

    /// Remote query expression identifying an orphan record from a prior
    /// failed create, e.g. `[["email", "=", <email>]]`. None disables the
    /// dedup search.
    fn dedup_domain(
        &self,
        _entity_type: &str,
        _values: &Map<String, Value>,
    ) -> Option<Value> {
        None
    }

    /// Pull-side filter; a rejected record is skipped without error.
    fn accept_pull(&self, _entity_type: &str, _remote_data: &Map<String, Value>) -> bool {
        true
    }

    /// Hook fired after a pulled record was saved locally, for
    /// meta-module enrichment.
    async fn after_pull_save(
        &self,
        _entity_type: &str,
        _local_id: i64,
        _remote_data: &Map<String, Value>,
    ) -> Result<()> {
        Ok(())
    }

    /// End-of-batch delivery of accumulated remote→local id translations.
    async fn apply_pull_translations(&self, _translations: &PullTranslations) -> Result<()> {
        Ok(())
    }

    /// User-backed modules are skipped by mapping orphan cleanup.
    fn user_backed(&self) -> bool {
        false
    }
}

/// Resolves a module id to its implementation. Injected into the
/// scheduler so the core stays free of module concrete types.
pub type ModuleResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn SyncModule>> + Send + Sync>;

/// Build a resolver from a fixed module list.
pub fn resolver_from(modules: Vec<Arc<dyn SyncModule>>) -> ModuleResolver {
    let by_id: HashMap<String, Arc<dyn SyncModule>> = modules
        .into_iter()
        .map(|module| (module.id().to_string(), module))
        .collect();
    Arc::new(move |id| by_id.get(id).cloned())
}
