//! Durable, at-least-once synchronization engine bridging a local content
//! store with an Odoo ERP over JSON-RPC.
//!
//! Domain hooks enqueue change events; a leased scheduler replays them
//! against the remote system, reconciling identity through a persistent
//! bidirectional mapping table with at-most-one-in-flight semantics per
//! entity. See the `queue`, `sync` and `breaker` modules for the moving
//! parts, and [`kernel::SyncKernel`] for assembly.

pub mod breaker;
pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub mod kernel;
pub mod lock;
pub mod queue;
pub mod rpc;
pub mod settings;
pub mod sync;
pub mod testing;

pub use config::Config;
pub use error::{FailureKind, SyncError, SyncOutcome};
pub use kernel::SyncKernel;
