//! Out-of-band alerting for sustained sync failure.
//!
//! Counts consecutive failed jobs across batches (cluster-wide, the
//! counter lives in settings) and raises a throttled alert when the
//! configured threshold is reached. Both breakers also report their open
//! transitions here.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use super::state::batch_failed;
use crate::settings::{keys, SettingsRepo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Delivery seam for alerts (mail, chat, pager). The default sink writes
/// to the log.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, severity: AlertSeverity, subject: &str, body: &str) -> Result<()>;
}

/// Alert sink that only logs.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, severity: AlertSeverity, subject: &str, body: &str) -> Result<()> {
        match severity {
            AlertSeverity::Warning => warn!(subject, body, "sync alert"),
            AlertSeverity::Critical => error!(subject, body, "sync alert"),
        }
        Ok(())
    }
}

/// Whether an alert is due given the counter and throttle state.
pub fn alert_due(
    total_failures: i64,
    threshold: i64,
    last_sent: Option<DateTime<Utc>>,
    cooldown_secs: i64,
    now: DateTime<Utc>,
) -> bool {
    if total_failures < threshold {
        return false;
    }
    match last_sent {
        None => true,
        Some(at) => now - at >= Duration::seconds(cooldown_secs),
    }
}

/// Consecutive-failure tracker with throttled delivery.
pub struct FailureNotifier {
    settings: Arc<SettingsRepo>,
    sink: Arc<dyn AlertSink>,
}

impl FailureNotifier {
    pub fn new(settings: Arc<SettingsRepo>, sink: Arc<dyn AlertSink>) -> Self {
        Self { settings, sink }
    }

    /// Fold one batch result into the consecutive-failure counter and
    /// alert when the threshold is crossed.
    pub async fn check(&self, successes: u64, failures: u64) -> Result<()> {
        if !batch_failed(successes, failures) {
            self.settings.reset_consecutive_failures().await?;
            return Ok(());
        }

        let total = self
            .settings
            .add_consecutive_failures(failures as i64)
            .await?;
        let threshold = self.settings.failure_threshold().await?;
        let cooldown = self.settings.failure_cooldown_secs().await?;
        let last_sent = self.settings.get_timestamp(keys::LAST_ALERT_SENT).await?;
        let now = Utc::now();

        if !alert_due(total, threshold, last_sent, cooldown, now) {
            return Ok(());
        }

        // Record the send first: a second worker racing through here will
        // see the fresh timestamp and stay quiet even if our send is slow.
        self.settings.set_timestamp(keys::LAST_ALERT_SENT, now).await?;

        info!(total, threshold, "failure threshold reached, alerting");
        self.sink
            .send(
                AlertSeverity::Critical,
                "sync failures accumulating",
                &format!("{total} consecutive failed sync jobs (threshold {threshold})"),
            )
            .await
    }

    /// Called by a breaker when it trips open.
    pub async fn breaker_opened(&self, scope: &str) -> Result<()> {
        let cooldown = self.settings.failure_cooldown_secs().await?;
        let last_sent = self.settings.get_timestamp(keys::LAST_ALERT_SENT).await?;
        let now = Utc::now();

        if let Some(at) = last_sent {
            if now - at < Duration::seconds(cooldown) {
                return Ok(());
            }
        }

        self.settings.set_timestamp(keys::LAST_ALERT_SENT, now).await?;
        self.sink
            .send(
                AlertSeverity::Critical,
                "sync circuit breaker opened",
                &format!("the {scope} circuit breaker has opened; sync is paused"),
            )
            .await
    }

    /// Queue-depth alerts raised by the enqueuer.
    pub async fn queue_depth(&self, depth: i64, severity: AlertSeverity) -> Result<()> {
        self.sink
            .send(
                severity,
                "sync queue backlog",
                &format!("{depth} jobs waiting in the sync queue"),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn below_threshold_never_alerts() {
        assert!(!alert_due(9, 10, None, 3600, at(0)));
    }

    #[test]
    fn first_crossing_alerts_immediately() {
        assert!(alert_due(10, 10, None, 3600, at(0)));
    }

    #[test]
    fn repeat_alert_waits_for_cooldown() {
        assert!(!alert_due(50, 10, Some(at(0)), 3600, at(3599)));
        assert!(alert_due(50, 10, Some(at(0)), 3600, at(3600)));
    }
}
