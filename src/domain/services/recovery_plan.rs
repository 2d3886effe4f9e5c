//! Recovery transition table and per-step budgets
//!
//! The restart procedure is a linear chain of states. Each non-terminal
//! state has a timeout and an attempt budget; exceeding the timeout fails the
//! job with the stuck step as the reason.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::entities::recovery_job::{LastObservation, RecoveryState};
use crate::domain::entities::snapshot::{staleness_window, AccountSnapshot};

/// Success transitions. `Verifying` resolves to `Succeeded` or `Failed`
/// depending on per-account results, any step may fall to `Failed`.
pub const TRANSITIONS: [(RecoveryState, RecoveryState); 7] = [
    (RecoveryState::Idle, RecoveryState::Stopping),
    (RecoveryState::Stopping, RecoveryState::Waiting),
    (RecoveryState::Waiting, RecoveryState::Starting),
    (RecoveryState::Starting, RecoveryState::Initializing),
    (RecoveryState::Initializing, RecoveryState::Reconnecting),
    (RecoveryState::Reconnecting, RecoveryState::Verifying),
    (RecoveryState::Verifying, RecoveryState::Succeeded),
];

/// Next state on success, `None` for terminal states
pub fn successor(state: RecoveryState) -> Option<RecoveryState> {
    TRANSITIONS
        .iter()
        .find(|(from, _)| *from == state)
        .map(|(_, to)| *to)
}

/// Timeout and attempt budget of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub timeout: Duration,
    pub max_attempts: u32,
}

/// Headroom added on top of fixed delays so the delay itself never times out
const STEP_SLACK: Duration = Duration::from_secs(5);

/// Durations and retry counts the orchestrator runs with
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// Wait for a graceful stop before killing
    pub stop_grace: Duration,
    pub stop_timeout: Duration,
    pub stop_attempts: u32,
    /// Fixed delay after stopping to let OS resources release
    pub settle_delay: Duration,
    pub start_timeout: Duration,
    pub start_attempts: u32,
    /// Fixed delay for terminal startup before touching accounts
    pub init_delay: Duration,
    pub login_timeout: Duration,
    pub login_attempts: u32,
    /// Pause between login attempts of one account
    pub login_retry_delay: Duration,
    pub verification_timeout: Duration,
    pub verification_poll: Duration,
    /// Relative tolerance against the pre-restart balance, if required
    pub baseline_tolerance: Option<f64>,
    /// Snapshot staleness threshold used while verifying
    pub staleness_threshold: Duration,
    slack: Duration,
}

impl Default for RecoveryPlan {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(45),
            stop_attempts: 2,
            settle_delay: Duration::from_secs(5),
            start_timeout: Duration::from_secs(30),
            start_attempts: 2,
            init_delay: Duration::from_secs(30),
            login_timeout: Duration::from_secs(20),
            login_attempts: 3,
            login_retry_delay: Duration::from_secs(2),
            verification_timeout: Duration::from_secs(120),
            verification_poll: Duration::from_secs(5),
            baseline_tolerance: None,
            staleness_threshold: Duration::from_secs(90),
            slack: STEP_SLACK,
        }
    }
}

impl RecoveryPlan {
    /// Override the headroom added to derived step timeouts
    pub fn with_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// Budget for `state`; terminal and idle states get a zero budget
    pub fn budget(&self, state: RecoveryState) -> StepBudget {
        match state {
            RecoveryState::Stopping => StepBudget {
                timeout: self.stop_timeout,
                max_attempts: self.stop_attempts.max(1),
            },
            RecoveryState::Waiting => StepBudget {
                timeout: self.settle_delay + self.slack,
                max_attempts: 1,
            },
            RecoveryState::Starting => StepBudget {
                timeout: self.start_timeout,
                max_attempts: self.start_attempts.max(1),
            },
            RecoveryState::Initializing => StepBudget {
                timeout: self.init_delay + self.slack,
                max_attempts: 1,
            },
            RecoveryState::Reconnecting => {
                let attempts = self.login_attempts.max(1);
                // Credential lookup is bounded by one login timeout
                let per_account = self.login_timeout
                    + (self.login_timeout + self.login_retry_delay) * attempts
                    + self.slack;
                StepBudget {
                    timeout: per_account,
                    max_attempts: attempts,
                }
            }
            RecoveryState::Verifying => StepBudget {
                timeout: self.verification_timeout + self.verification_poll + self.slack,
                max_attempts: 1,
            },
            RecoveryState::Idle | RecoveryState::Succeeded | RecoveryState::Failed => StepBudget {
                timeout: Duration::ZERO,
                max_attempts: 0,
            },
        }
    }

    /// All step budgets keyed by state
    pub fn budgets(&self) -> HashMap<RecoveryState, StepBudget> {
        TRANSITIONS
            .iter()
            .map(|(from, _)| *from)
            .filter(|s| *s != RecoveryState::Idle)
            .map(|s| (s, self.budget(s)))
            .collect()
    }

    /// Upper bound on a job's wall-clock time
    pub fn total_budget(&self) -> Duration {
        self.budgets().values().map(|b| b.timeout).sum()
    }

    /// Check one account after reconnection.
    ///
    /// Only snapshots ingested at or after `since` count. Returns the
    /// verified balance, or what was observed instead.
    pub fn verify(
        &self,
        snapshot: Option<&AccountSnapshot>,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        baseline: Option<f64>,
    ) -> Result<f64, LastObservation> {
        let snapshot = match snapshot {
            Some(s) if s.ingested_at >= since => s,
            _ => return Err(LastObservation::NoData),
        };
        if snapshot.is_stale(now, staleness_window(self.staleness_threshold)) {
            return Err(LastObservation::Stale {
                age_secs: snapshot.age_secs(now),
            });
        }
        if snapshot.has_zero_balance() {
            return Err(LastObservation::ZeroBalance);
        }
        if let (Some(tolerance), Some(baseline)) = (self.baseline_tolerance, baseline) {
            if baseline.abs() > f64::EPSILON
                && ((snapshot.balance - baseline) / baseline).abs() > tolerance
            {
                return Err(LastObservation::OffBaseline {
                    balance: snapshot.balance,
                    baseline,
                });
            }
        }
        Ok(snapshot.balance)
    }
}
