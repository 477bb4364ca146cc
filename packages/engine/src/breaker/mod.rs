//! Circuit breakers and failure alerting.
//!
//! Two layers protect the remote system: a global breaker that pauses all
//! sync after repeated failed batches, and per-module breakers that
//! isolate a single misbehaving domain. Both share the pure state machine
//! in [`state`]. [`notifier`] raises the throttled operator alerts.

mod global;
mod module;
pub mod notifier;
pub mod state;

pub use global::GlobalBreaker;
pub use module::ModuleBreaker;
pub use notifier::{alert_due, AlertSeverity, AlertSink, FailureNotifier, LogAlertSink};
pub use state::{
    batch_failed, BreakerEvent, BreakerPhase, BreakerPolicy, BreakerState, GLOBAL_POLICY,
    MODULE_POLICY,
};
