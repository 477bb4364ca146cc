//! Identity mapping, the module contract and the per-job sync driver.

pub mod mapping;
pub mod module;
pub mod orchestrator;
pub mod reconciler;

pub use mapping::{Mapping, MappingRepo, OrphanCleanupReport, PgMappingStore};
pub use module::{resolver_from, ModuleResolver, PullTranslations, SyncModule};
pub use orchestrator::Orchestrator;
pub use reconciler::{ReconcileReport, Reconciler, DEFAULT_CHUNK_SIZE};
