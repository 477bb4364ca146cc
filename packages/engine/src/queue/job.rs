//! Job model for the durable sync queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{SyncError, MAX_PAYLOAD_BYTES};

// ============================================================================
// Enums
// ============================================================================

/// Which way an entity travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_direction", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local change replayed against the remote system
    Push,
    /// Remote change applied to the local store
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "sync_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states never revert.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// ============================================================================
// Job model
// ============================================================================

/// One unit of queued work.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub correlation_id: Uuid,
    pub site_id: i64,
    pub module: String,
    pub direction: Direction,
    pub entity_type: String,
    /// 0 when unknown (e.g. a pull for a never-seen remote record).
    pub local_id: i64,
    /// 0 when unknown (e.g. a push create).
    pub remote_id: i64,
    pub action: SyncAction,
    pub payload: Option<Value>,
    pub priority: i16,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job could be fetched at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && match self.scheduled_at {
                None => true,
                Some(at) => at <= now,
            }
    }

    /// Whether another attempt is allowed after a transient failure.
    pub fn retries_remain(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }

    /// The payload as an object map, when present and well-formed.
    pub fn payload_map(&self) -> Result<Option<&serde_json::Map<String, Value>>, SyncError> {
        match &self.payload {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(SyncError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_type_name(other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// JobSpec
// ============================================================================

/// Priority bounds; lower is more urgent.
pub const MIN_PRIORITY: i16 = 1;
pub const MAX_PRIORITY: i16 = 10;
pub const DEFAULT_PRIORITY: i16 = 5;

pub fn clamp_priority(priority: i16) -> i16 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// What a producer wants enqueued.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    pub module: String,
    pub direction: Direction,
    pub entity_type: String,
    pub action: SyncAction,
    #[builder(default = 0)]
    pub local_id: i64,
    #[builder(default = 0)]
    pub remote_id: i64,
    #[builder(default)]
    pub payload: Option<Value>,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i16,
    #[builder(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default = 3)]
    pub max_attempts: i32,
}

impl JobSpec {
    /// Reject oversized payloads before they reach the queue table.
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(payload) = &self.payload {
            if payload_size(payload) > MAX_PAYLOAD_BYTES {
                return Err(SyncError::PayloadTooLarge);
            }
        }
        Ok(())
    }
}

/// Serialized size of a payload in bytes.
pub fn payload_size(payload: &Value) -> usize {
    serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_spec() -> JobSpec {
        JobSpec::builder()
            .module("crm")
            .direction(Direction::Push)
            .entity_type("contact")
            .action(SyncAction::Update)
            .local_id(42i64)
            .build()
    }

    #[test]
    fn spec_defaults() {
        let spec = sample_spec();
        assert_eq!(spec.priority, 5);
        assert_eq!(spec.max_attempts, 3);
        assert_eq!(spec.remote_id, 0);
        assert!(spec.scheduled_at.is_none());
    }

    #[test]
    fn priority_clamps_to_bounds() {
        assert_eq!(clamp_priority(0), 1);
        assert_eq!(clamp_priority(11), 10);
        assert_eq!(clamp_priority(7), 7);
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn payload_at_limit_is_accepted() {
        // A string payload of exactly 1 MiB serialized: the two quotes
        // count, so the string body is 1 MiB minus 2.
        let body = "x".repeat(MAX_PAYLOAD_BYTES - 2);
        let mut spec = sample_spec();
        spec.payload = Some(Value::String(body));
        assert_eq!(payload_size(spec.payload.as_ref().unwrap()), MAX_PAYLOAD_BYTES);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn payload_over_limit_is_rejected() {
        let body = "x".repeat(MAX_PAYLOAD_BYTES - 1);
        let mut spec = sample_spec();
        spec.payload = Some(Value::String(body));
        assert!(matches!(
            spec.validate(),
            Err(SyncError::PayloadTooLarge)
        ));
    }

    #[test]
    fn retries_remain_respects_max_attempts() {
        let mut job = Job {
            id: 1,
            correlation_id: uuid::Uuid::new_v4(),
            site_id: 1,
            module: "crm".to_string(),
            direction: Direction::Push,
            entity_type: "contact".to_string(),
            local_id: 42,
            remote_id: 0,
            action: SyncAction::Create,
            payload: None,
            priority: 5,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            error_message: None,
            scheduled_at: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.retries_remain());
        job.attempts = 2;
        assert!(!job.retries_remain());
    }

    #[test]
    fn eligibility_honors_scheduled_at() {
        let now = Utc::now();
        let mut job = Job {
            id: 1,
            correlation_id: uuid::Uuid::new_v4(),
            site_id: 1,
            module: "crm".to_string(),
            direction: Direction::Push,
            entity_type: "contact".to_string(),
            local_id: 42,
            remote_id: 0,
            action: SyncAction::Update,
            payload: None,
            priority: 5,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            error_message: None,
            scheduled_at: Some(now + chrono::Duration::seconds(30)),
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!job.is_eligible(now));
        job.scheduled_at = Some(now - chrono::Duration::seconds(1));
        assert!(job.is_eligible(now));
        job.scheduled_at = None;
        assert!(job.is_eligible(now));
    }

    #[test]
    fn payload_map_rejects_non_objects() {
        let mut job = Job {
            id: 1,
            correlation_id: uuid::Uuid::new_v4(),
            site_id: 1,
            module: "crm".to_string(),
            direction: Direction::Push,
            entity_type: "contact".to_string(),
            local_id: 42,
            remote_id: 0,
            action: SyncAction::Create,
            payload: Some(json!([1, 2, 3])),
            priority: 5,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            error_message: None,
            scheduled_at: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.payload_map().is_err());
        job.payload = Some(json!({"name": "A"}));
        assert!(job.payload_map().unwrap().is_some());
        job.payload = None;
        assert!(job.payload_map().unwrap().is_none());
    }
}
