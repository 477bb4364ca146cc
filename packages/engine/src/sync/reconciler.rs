//! Periodic orphan detector against remote truth.
//!
//! Mappings drift when remote records are deleted behind the engine's
//! back. The reconciler batch-queries the remote in bounded chunks and
//! reports (or removes) the mappings whose remote id no longer resolves.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::mapping::{Mapping, MappingRepo};
use crate::rpc::ErpTransport;

/// Remote ids queried per round trip.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

#[derive(Debug, Clone, Serialize, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub orphaned_remote_ids: Vec<i64>,
    pub removed: usize,
}

pub struct Reconciler {
    transport: Arc<dyn ErpTransport>,
    mappings: Arc<dyn MappingRepo>,
    chunk_size: usize,
}

impl Reconciler {
    pub fn new(transport: Arc<dyn ErpTransport>, mappings: Arc<dyn MappingRepo>) -> Self {
        Self {
            transport,
            mappings,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Find mappings whose remote record is gone. With `fix`, remove them.
    pub async fn run(
        &self,
        module: &str,
        entity_type: &str,
        remote_model: &str,
        fix: bool,
    ) -> Result<ReconcileReport> {
        let mappings = self
            .mappings
            .get_module_entity_mappings(module, entity_type)
            .await?;

        let mut report = ReconcileReport {
            checked: mappings.len(),
            ..Default::default()
        };
        if mappings.is_empty() {
            return Ok(report);
        }

        let remote_ids: Vec<i64> = mappings.iter().map(|m| m.remote_id).collect();
        let mut existing: HashSet<i64> = HashSet::with_capacity(remote_ids.len());

        for chunk in remote_ids.chunks(self.chunk_size) {
            let found = self
                .transport
                .search(remote_model, json!([["id", "in", chunk]]), None, None)
                .await?;
            existing.extend(found);
        }

        let orphans: Vec<&Mapping> = mappings
            .iter()
            .filter(|m| !existing.contains(&m.remote_id))
            .collect();

        for orphan in &orphans {
            report.orphaned_remote_ids.push(orphan.remote_id);
            if fix
                && self
                    .mappings
                    .remove(module, entity_type, orphan.local_id)
                    .await?
            {
                report.removed += 1;
            }
        }

        info!(
            module,
            entity_type,
            checked = report.checked,
            orphans = report.orphaned_remote_ids.len(),
            removed = report.removed,
            "reconcile finished"
        );
        Ok(report)
    }
}
