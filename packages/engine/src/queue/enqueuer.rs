//! Producer-side enqueue facade.
//!
//! Hook handlers call this instead of the store directly: pushes get a
//! short debounce so rapid-fire edits coalesce into one job, and every
//! successful enqueue may trigger a (cluster-throttled) queue-depth
//! check.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{error, warn};
use typed_builder::TypedBuilder;

use super::job::{Direction, JobSpec, SyncAction, DEFAULT_PRIORITY};
use super::store::{EnqueueOutcome, QueueStore};
use crate::breaker::{AlertSeverity, FailureNotifier};
use crate::error::SyncError;
use crate::settings::{keys, SettingsRepo};

/// Default debounce for push events, seconds.
const PUSH_DEBOUNCE_SECS: i64 = 5;

/// Queue depth that triggers a warning alert.
pub const DEPTH_WARNING: i64 = 1000;

/// Queue depth that triggers a critical alert.
pub const DEPTH_CRITICAL: i64 = 5000;

/// Depth checks run at most once per this window, cluster-wide.
const DEPTH_ALERT_INTERVAL_SECS: i64 = 300;

/// A local change to replay against the remote system.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PushRequest {
    pub module: String,
    pub entity_type: String,
    pub action: SyncAction,
    pub local_id: i64,
    #[builder(default = 0)]
    pub remote_id: i64,
    #[builder(default)]
    pub payload: Option<Value>,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i16,
    #[builder(default = PUSH_DEBOUNCE_SECS)]
    pub debounce_secs: i64,
}

/// A remote change to apply locally.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PullRequest {
    pub module: String,
    pub entity_type: String,
    pub action: SyncAction,
    pub remote_id: i64,
    #[builder(default = 0)]
    pub local_id: i64,
    #[builder(default)]
    pub payload: Option<Value>,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i16,
    #[builder(default = 0)]
    pub debounce_secs: i64,
}

/// Alert level for a queue depth, if any.
pub fn depth_severity(depth: i64) -> Option<AlertSeverity> {
    if depth >= DEPTH_CRITICAL {
        Some(AlertSeverity::Critical)
    } else if depth >= DEPTH_WARNING {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

pub struct Enqueuer {
    queue: Arc<QueueStore>,
    settings: Arc<SettingsRepo>,
    notifier: Arc<FailureNotifier>,
}

impl Enqueuer {
    pub fn new(
        queue: Arc<QueueStore>,
        settings: Arc<SettingsRepo>,
        notifier: Arc<FailureNotifier>,
    ) -> Self {
        Self {
            queue,
            settings,
            notifier,
        }
    }

    pub async fn enqueue_push(&self, request: PushRequest) -> Result<EnqueueOutcome, SyncError> {
        let scheduled_at = if request.debounce_secs > 0 {
            Some(Utc::now() + Duration::seconds(request.debounce_secs))
        } else {
            None
        };

        let spec = JobSpec::builder()
            .module(request.module)
            .direction(Direction::Push)
            .entity_type(request.entity_type)
            .action(request.action)
            .local_id(request.local_id)
            .remote_id(request.remote_id)
            .payload(request.payload)
            .priority(request.priority)
            .scheduled_at(scheduled_at)
            .build();

        let outcome = self.queue.enqueue(spec).await?;
        self.check_depth().await;
        Ok(outcome)
    }

    pub async fn enqueue_pull(&self, request: PullRequest) -> Result<EnqueueOutcome, SyncError> {
        let scheduled_at = if request.debounce_secs > 0 {
            Some(Utc::now() + Duration::seconds(request.debounce_secs))
        } else {
            None
        };

        let spec = JobSpec::builder()
            .module(request.module)
            .direction(Direction::Pull)
            .entity_type(request.entity_type)
            .action(request.action)
            .local_id(request.local_id)
            .remote_id(request.remote_id)
            .payload(request.payload)
            .priority(request.priority)
            .scheduled_at(scheduled_at)
            .build();

        let outcome = self.queue.enqueue(spec).await?;
        self.check_depth().await;
        Ok(outcome)
    }

    /// Depth inspection after an enqueue. Never fails the producer: the
    /// job is already stored.
    async fn check_depth(&self) {
        let result: anyhow::Result<()> = async {
            // One worker per window inspects; bulk imports do not hammer
            // the counters with every enqueue.
            if !self
                .settings
                .claim_interval(keys::LAST_DEPTH_ALERT, DEPTH_ALERT_INTERVAL_SECS)
                .await?
            {
                return Ok(());
            }

            let stats = self.queue.get_stats().await?;
            let depth = stats.depth();
            let Some(severity) = depth_severity(depth) else {
                return Ok(());
            };

            if severity == AlertSeverity::Critical {
                error!(depth, "sync queue critically backed up");
            } else {
                warn!(depth, "sync queue backing up");
            }
            self.notifier.queue_depth(depth, severity).await
        }
        .await;

        if let Err(err) = result {
            warn!(error = %err, "queue depth check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_request_defaults_debounce_and_priority() {
        let request = PushRequest::builder()
            .module("crm")
            .entity_type("contact")
            .action(SyncAction::Update)
            .local_id(42i64)
            .build();
        assert_eq!(request.debounce_secs, 5);
        assert_eq!(request.priority, 5);
        assert_eq!(request.remote_id, 0);
    }

    #[test]
    fn pull_request_has_no_default_debounce() {
        let request = PullRequest::builder()
            .module("crm")
            .entity_type("contact")
            .action(SyncAction::Update)
            .remote_id(7i64)
            .build();
        assert_eq!(request.debounce_secs, 0);
    }

    #[test]
    fn depth_thresholds() {
        assert_eq!(depth_severity(0), None);
        assert_eq!(depth_severity(999), None);
        assert_eq!(depth_severity(1000), Some(AlertSeverity::Warning));
        assert_eq!(depth_severity(4999), Some(AlertSeverity::Warning));
        assert_eq!(depth_severity(5000), Some(AlertSeverity::Critical));
    }
}
