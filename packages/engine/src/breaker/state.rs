//! Circuit breaker state machine, free of IO.
//!
//! The persistence wrappers in this module's siblings load a
//! [`BreakerState`], call [`BreakerState::record_batch`] with the current
//! time, and store the result. Keeping the transitions pure makes the
//! timing laws directly testable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A batch counts as failed when at least this fraction of its jobs failed.
pub const FAILURE_RATIO_THRESHOLD: f64 = 0.8;

/// Thresholds and timing for one breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    /// Failed batches before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds in Open before a probe is admitted.
    pub recovery_secs: i64,
    /// Persisted state older than this is discarded, so a breaker whose
    /// counters stopped being updated can never stay open forever.
    pub state_ttl_secs: i64,
}

pub const GLOBAL_POLICY: BreakerPolicy = BreakerPolicy {
    failure_threshold: 3,
    recovery_secs: 300,
    state_ttl_secs: 3600,
};

pub const MODULE_POLICY: BreakerPolicy = BreakerPolicy {
    failure_threshold: 5,
    recovery_secs: 600,
    state_ttl_secs: 7200,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Transition produced by recording a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    Reopened,
    Closed,
}

/// Persisted breaker record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerState {
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Set while a HalfOpen probe is out; cleared by the probe's batch.
    #[serde(default)]
    pub probe_held: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Classify a batch by its failure ratio. Empty batches are healthy.
pub fn batch_failed(successes: u64, failures: u64) -> bool {
    let total = successes + failures;
    total > 0 && (failures as f64 / total as f64) >= FAILURE_RATIO_THRESHOLD
}

impl BreakerState {
    /// Whether this record is past its TTL and should be treated as fresh.
    pub fn expired(&self, policy: &BreakerPolicy, now: DateTime<Utc>) -> bool {
        match self.updated_at {
            Some(at) => now - at >= Duration::seconds(policy.state_ttl_secs),
            None => false,
        }
    }

    pub fn phase(&self, policy: &BreakerPolicy, now: DateTime<Utc>) -> BreakerPhase {
        if self.expired(policy, now) {
            return BreakerPhase::Closed;
        }
        match self.opened_at {
            None => BreakerPhase::Closed,
            Some(opened_at) => {
                if now - opened_at >= Duration::seconds(policy.recovery_secs) {
                    BreakerPhase::HalfOpen
                } else {
                    BreakerPhase::Open
                }
            }
        }
    }

    /// Fold a batch result into the state. Returns the transition, if any.
    pub fn record_batch(
        &mut self,
        policy: &BreakerPolicy,
        successes: u64,
        failures: u64,
        now: DateTime<Utc>,
    ) -> Option<BreakerEvent> {
        if self.expired(policy, now) {
            *self = BreakerState::default();
        }
        let phase = self.phase(policy, now);
        self.updated_at = Some(now);

        if !batch_failed(successes, failures) {
            let was_tripped = self.opened_at.is_some();
            self.failures = 0;
            self.opened_at = None;
            self.probe_held = false;
            return if was_tripped {
                Some(BreakerEvent::Closed)
            } else {
                None
            };
        }

        match phase {
            BreakerPhase::Closed => {
                self.failures += 1;
                if self.failures >= policy.failure_threshold {
                    self.opened_at = Some(now);
                    Some(BreakerEvent::Opened)
                } else {
                    None
                }
            }
            BreakerPhase::HalfOpen => {
                // Failed probe: re-open with a fresh window.
                self.failures += 1;
                self.opened_at = Some(now);
                self.probe_held = false;
                Some(BreakerEvent::Reopened)
            }
            BreakerPhase::Open => {
                self.failures += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn ratio_boundary_at_eighty_percent() {
        assert!(batch_failed(2, 8)); // exactly 0.8
        assert!(!batch_failed(3, 8)); // just under
        assert!(batch_failed(1, 9));
        assert!(batch_failed(0, 1));
    }

    #[test]
    fn empty_batch_is_healthy() {
        assert!(!batch_failed(0, 0));
    }

    #[test]
    fn three_failed_batches_open_the_global_breaker() {
        let mut state = BreakerState::default();
        assert_eq!(state.record_batch(&GLOBAL_POLICY, 1, 9, at(0)), None);
        assert_eq!(state.record_batch(&GLOBAL_POLICY, 1, 9, at(10)), None);
        assert_eq!(
            state.record_batch(&GLOBAL_POLICY, 1, 9, at(20)),
            Some(BreakerEvent::Opened)
        );
        assert_eq!(state.phase(&GLOBAL_POLICY, at(21)), BreakerPhase::Open);
    }

    #[test]
    fn healthy_batch_resets_the_count() {
        let mut state = BreakerState::default();
        state.record_batch(&GLOBAL_POLICY, 1, 9, at(0));
        state.record_batch(&GLOBAL_POLICY, 1, 9, at(10));
        assert_eq!(state.record_batch(&GLOBAL_POLICY, 10, 0, at(20)), None);
        assert_eq!(state.failures, 0);
        // The run starts over; two more failed batches do not open it.
        state.record_batch(&GLOBAL_POLICY, 1, 9, at(30));
        assert_eq!(state.record_batch(&GLOBAL_POLICY, 1, 9, at(40)), None);
    }

    #[test]
    fn open_becomes_half_open_after_recovery_window() {
        let mut state = BreakerState::default();
        for i in 0..3 {
            state.record_batch(&GLOBAL_POLICY, 0, 10, at(i));
        }
        assert_eq!(state.phase(&GLOBAL_POLICY, at(100)), BreakerPhase::Open);
        assert_eq!(
            state.phase(&GLOBAL_POLICY, at(2 + 300)),
            BreakerPhase::HalfOpen
        );
    }

    #[test]
    fn healthy_probe_closes() {
        let mut state = BreakerState::default();
        for i in 0..3 {
            state.record_batch(&GLOBAL_POLICY, 0, 10, at(i));
        }
        let probe_time = at(2 + 300);
        assert_eq!(
            state.record_batch(&GLOBAL_POLICY, 10, 0, probe_time),
            Some(BreakerEvent::Closed)
        );
        assert_eq!(state.phase(&GLOBAL_POLICY, probe_time), BreakerPhase::Closed);
        assert_eq!(state.failures, 0);
    }

    #[test]
    fn failed_probe_reopens_with_fresh_window() {
        let mut state = BreakerState::default();
        for i in 0..3 {
            state.record_batch(&GLOBAL_POLICY, 0, 10, at(i));
        }
        let probe_time = at(2 + 300);
        assert_eq!(
            state.record_batch(&GLOBAL_POLICY, 0, 10, probe_time),
            Some(BreakerEvent::Reopened)
        );
        // Open again for a full recovery window from the probe.
        assert_eq!(
            state.phase(&GLOBAL_POLICY, probe_time + Duration::seconds(299)),
            BreakerPhase::Open
        );
        assert_eq!(
            state.phase(&GLOBAL_POLICY, probe_time + Duration::seconds(300)),
            BreakerPhase::HalfOpen
        );
    }

    #[test]
    fn stale_state_auto_heals() {
        let mut state = BreakerState::default();
        for i in 0..3 {
            state.record_batch(&GLOBAL_POLICY, 0, 10, at(i));
        }
        // One hour after the last update the record is discarded.
        assert_eq!(
            state.phase(&GLOBAL_POLICY, at(2 + 3600)),
            BreakerPhase::Closed
        );
    }

    #[test]
    fn module_policy_needs_five_failures() {
        let mut state = BreakerState::default();
        for i in 0..4 {
            assert_eq!(state.record_batch(&MODULE_POLICY, 0, 10, at(i)), None);
        }
        assert_eq!(
            state.record_batch(&MODULE_POLICY, 0, 10, at(4)),
            Some(BreakerEvent::Opened)
        );
    }
}
