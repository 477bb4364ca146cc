//! Error taxonomy and retry policy for sync operations.
//!
//! Everything that can go wrong while driving a job collapses into two
//! kinds: `Transient` failures are rescheduled with backoff, `Permanent`
//! failures terminate the job. Classification is centralized here so the
//! orchestrator, batch processor and scheduler all agree.

use chrono::{DateTime, Duration, Utc};
use odoo_rpc::OdooRpcError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted payload size (serialized), inclusive.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Base unit of the retry backoff schedule.
const RETRY_BASE_SECS: i64 = 60;

/// Maximum random jitter added to a retry delay, in seconds.
const RETRY_JITTER_SECS: i64 = 60;

/// How a failure should be treated by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation may succeed on retry
    Transient,
    /// Retrying will not help
    Permanent,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// Errors raised while pushing or pulling a single entity.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("entity type not registered: {0}")]
    UnregisteredEntityType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("payload exceeds {MAX_PAYLOAD_BYTES} bytes")]
    PayloadTooLarge,

    #[error("no data to push")]
    NoData,

    #[error("module not registered: {0}")]
    UnknownModule(String),

    #[error("timed out waiting for lock {0}")]
    LockTimeout(String),

    /// The remote mutation succeeded but the mapping row could not be
    /// written; the retry must reconcile instead of re-creating.
    #[error("mapping save failed: {0}")]
    MappingSave(String),

    #[error("remote record {0} no longer exists")]
    RemoteMissing(i64),

    #[error(transparent)]
    Rpc(#[from] OdooRpcError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Error raised by a domain module; classified by message content.
    #[error("{0}")]
    Module(String),

    /// Infrastructure failure outside the other categories.
    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    /// Classify this error for the retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::UnregisteredEntityType(_)
            | SyncError::InvalidPayload(_)
            | SyncError::PayloadTooLarge
            | SyncError::NoData
            | SyncError::UnknownModule(_) => FailureKind::Permanent,

            // The remote record exists; only the bookkeeping is behind.
            SyncError::MappingSave(_) => FailureKind::Transient,
            SyncError::LockTimeout(_) => FailureKind::Transient,

            SyncError::RemoteMissing(_) => FailureKind::Permanent,

            SyncError::Rpc(e) => classify_rpc(e),
            SyncError::Db(_) => FailureKind::Transient,
            SyncError::Other(_) => FailureKind::Transient,
            SyncError::Module(message) => classify_message(message),
            SyncError::Internal(_) => FailureKind::Transient,
        }
    }
}

/// Substrings that mark a remote fault as not worth retrying.
const PERMANENT_MARKERS: &[&str] = &[
    "access denied",
    "validationerror",
    "missing required",
    "constraint",
];

fn classify_rpc(error: &OdooRpcError) -> FailureKind {
    match error {
        OdooRpcError::Transport(_) => FailureKind::Transient,
        OdooRpcError::Http { status } if *status == 429 || *status >= 500 => FailureKind::Transient,
        OdooRpcError::Http { .. } => FailureKind::Transient,
        OdooRpcError::Fault { message, .. } => classify_message(message),
        OdooRpcError::Auth(_) => FailureKind::Permanent,
        OdooRpcError::Decode(_) => FailureKind::Transient,
    }
}

/// Classify a bare error message. Unknown messages default to Transient
/// (bias toward retry).
pub fn classify_message(message: &str) -> FailureKind {
    let lowered = message.to_lowercase();
    if PERMANENT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    }
}

/// Retry delay after `attempts` completed attempts: exponential backoff on
/// a one-minute base plus up to a minute of jitter.
pub fn retry_at(attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
    let exponent = attempts.clamp(0, 16) as u32;
    let base = RETRY_BASE_SECS * 2i64.pow(exponent);
    let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_SECS);
    now + Duration::seconds(base + jitter)
}

/// Outcome of one orchestrated push or pull.
///
/// The orchestrator never returns a raw error to the scheduler; every
/// exception is converted into one of these.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub ok: bool,
    pub message: String,
    pub kind: Option<FailureKind>,
    /// Remote id touched or created, when known. On a failed create this
    /// carries the id of a record that WAS created remotely so the job can
    /// adopt it and retry as an update.
    pub entity_id: Option<i64>,
}

impl SyncOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            kind: None,
            entity_id: None,
        }
    }

    pub fn success_with(message: impl Into<String>, entity_id: i64) -> Self {
        Self {
            ok: true,
            message: message.into(),
            kind: None,
            entity_id: Some(entity_id),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            kind: Some(kind),
            entity_id: None,
        }
    }

    pub fn failure_with(kind: FailureKind, message: impl Into<String>, entity_id: i64) -> Self {
        Self {
            ok: false,
            message: message.into(),
            kind: Some(kind),
            entity_id: Some(entity_id),
        }
    }

    pub fn from_error(error: &SyncError) -> Self {
        Self::failure(error.kind(), error.to_string())
    }

    pub fn kind_or_transient(&self) -> FailureKind {
        self.kind.unwrap_or(FailureKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_should_retry() {
        assert!(FailureKind::Transient.should_retry());
        assert!(!FailureKind::Permanent.should_retry());
    }

    #[test]
    fn unregistered_entity_type_is_permanent() {
        let err = SyncError::UnregisteredEntityType("contact".to_string());
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn mapping_save_is_transient() {
        let err = SyncError::MappingSave("row lock".to_string());
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[test]
    fn lock_timeout_is_transient() {
        let err = SyncError::LockTimeout("wp4odoo_push_abc".to_string());
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[test]
    fn http_500_is_transient() {
        let err = SyncError::Rpc(OdooRpcError::Http { status: 500 });
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[test]
    fn http_429_is_transient() {
        let err = SyncError::Rpc(OdooRpcError::Http { status: 429 });
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[test]
    fn validation_fault_is_permanent() {
        let err = SyncError::Rpc(OdooRpcError::Fault {
            code: 200,
            message: "odoo.exceptions.ValidationError: bad email".to_string(),
        });
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn access_denied_fault_is_permanent() {
        assert_eq!(
            classify_message("Access Denied for model res.partner"),
            FailureKind::Permanent
        );
    }

    #[test]
    fn missing_required_is_permanent() {
        assert_eq!(
            classify_message("Missing required field: name"),
            FailureKind::Permanent
        );
    }

    #[test]
    fn constraint_violation_is_permanent() {
        assert_eq!(
            classify_message("unique constraint violated"),
            FailureKind::Permanent
        );
    }

    #[test]
    fn unknown_fault_defaults_to_transient() {
        assert_eq!(
            classify_message("something unexpected happened"),
            FailureKind::Transient
        );
    }

    #[test]
    fn retry_at_third_attempt_is_within_bounds() {
        let now = Utc::now();
        // attempts=3: 8 minutes base plus up to a minute of jitter.
        let at = retry_at(3, now);
        let delta = (at - now).num_seconds();
        assert!(delta >= 8 * 60, "delay {delta} below lower bound");
        assert!(delta < 8 * 60 + 60, "delay {delta} above upper bound");
    }

    #[test]
    fn retry_at_grows_exponentially() {
        let now = Utc::now();
        let first = (retry_at(0, now) - now).num_seconds();
        let second = (retry_at(1, now) - now).num_seconds();
        assert!(first >= 60 && first < 120);
        assert!(second >= 120 && second < 180);
    }
}
