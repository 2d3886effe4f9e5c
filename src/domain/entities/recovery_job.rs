//! Recovery job - one execution of the terminal restart state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::account::Login;

/// Whole milliseconds of `duration`, saturating
pub fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// States of the restart procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    Stopping,
    Waiting,
    Starting,
    Initializing,
    Reconnecting,
    Verifying,
    Succeeded,
    Failed,
}

impl RecoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryState::Succeeded | RecoveryState::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecoveryState::Idle => "idle",
            RecoveryState::Stopping => "stopping",
            RecoveryState::Waiting => "waiting",
            RecoveryState::Starting => "starting",
            RecoveryState::Initializing => "initializing",
            RecoveryState::Reconnecting => "reconnecting",
            RecoveryState::Verifying => "verifying",
            RecoveryState::Succeeded => "succeeded",
            RecoveryState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Who asked for the recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Watchdog,
    External,
}

/// What the verifier last saw for an account before giving up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LastObservation {
    /// Nothing ingested since reconnection started
    NoData,
    /// Snapshot older than the staleness threshold
    Stale { age_secs: i64 },
    ZeroBalance,
    /// Balance outside tolerance of the pre-restart baseline
    OffBaseline { balance: f64, baseline: f64 },
}

/// Why a single account could not be brought back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountFailure {
    LoginFailure { attempts: u32, message: String },
    VerificationTimeout { waited_ms: u64, last: LastObservation },
    /// The account was never attempted because the terminal did not come up
    ProcessStartFailure,
    /// Password could not be resolved from the credential reference
    CredentialUnavailable { message: String },
    /// The job failed in `step` before this account got a result
    Interrupted { step: RecoveryState },
}

/// Per-account outcome of the reconnect / verify steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountVerification {
    pub login: Login,
    pub logged_in: bool,
    pub login_attempts: u32,
    pub verified: bool,
    pub balance: Option<f64>,
    pub baseline: Option<f64>,
    pub verified_at: Option<DateTime<Utc>>,
    pub failure: Option<AccountFailure>,
}

impl AccountVerification {
    pub fn pending(login: Login, baseline: Option<f64>) -> Self {
        Self {
            login,
            logged_in: false,
            login_attempts: 0,
            verified: false,
            balance: None,
            baseline,
            verified_at: None,
            failure: None,
        }
    }
}

/// Reason tag attached to a failed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A step exceeded its timeout budget
    StepTimeout { step: RecoveryState, timeout_ms: u64 },
    /// Terminal process would not stop or start
    ProcessControl { step: RecoveryState, message: String },
    /// One or more accounts could not be verified
    AccountsUnverified { accounts: Vec<Login> },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StepTimeout { step, timeout_ms } => {
                write!(f, "step '{}' timed out after {}ms", step, timeout_ms)
            }
            FailureReason::ProcessControl { step, message } => {
                write!(f, "process control failed during '{}': {}", step, message)
            }
            FailureReason::AccountsUnverified { accounts } => {
                write!(f, "accounts not verified: {:?}", accounts)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed { reason: FailureReason },
}

/// Entry / exit time of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub state: RecoveryState,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// One execution of the recovery state machine.
///
/// Immutable once `state` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryJob {
    pub id: String,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub state: RecoveryState,
    pub steps: Vec<StepRecord>,
    pub accounts: BTreeMap<Login, AccountVerification>,
    pub outcome: Option<JobOutcome>,
    pub retry_count: u32,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RecoveryJob {
    pub fn new(id: String, trigger: TriggerSource) -> Self {
        Self {
            id,
            trigger,
            started_at: Utc::now(),
            state: RecoveryState::Idle,
            steps: Vec::new(),
            accounts: BTreeMap::new(),
            outcome: None,
            retry_count: 0,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Close the current step and open `state`
    pub fn enter(&mut self, state: RecoveryState) {
        if self.is_finished() {
            return;
        }
        let now = Utc::now();
        if let Some(last) = self.steps.last_mut() {
            if last.exited_at.is_none() {
                last.exited_at = Some(now);
            }
        }
        self.state = state;
        if !state.is_terminal() {
            self.steps.push(StepRecord {
                state,
                entered_at: now,
                exited_at: None,
            });
        }
    }

    pub fn succeed(&mut self) {
        if self.is_finished() {
            return;
        }
        self.enter(RecoveryState::Succeeded);
        self.outcome = Some(JobOutcome::Succeeded);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if self.is_finished() {
            return;
        }
        self.enter(RecoveryState::Failed);
        self.outcome = Some(JobOutcome::Failed { reason });
        self.finished_at = Some(Utc::now());
    }

    pub fn entered_at(&self, state: RecoveryState) -> Option<DateTime<Utc>> {
        self.steps
            .iter()
            .find(|s| s.state == state)
            .map(|s| s.entered_at)
    }

    pub fn unverified_accounts(&self) -> Vec<Login> {
        self.accounts
            .values()
            .filter(|a| !a.verified)
            .map(|a| a.login)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_records_steps() {
        let mut job = RecoveryJob::new("job-1".to_string(), TriggerSource::External);
        job.enter(RecoveryState::Stopping);
        job.enter(RecoveryState::Waiting);
        job.succeed();

        assert_eq!(job.state, RecoveryState::Succeeded);
        assert_eq!(job.steps.len(), 2);
        assert!(job.steps.iter().all(|s| s.exited_at.is_some()));
        assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
        assert!(job.entered_at(RecoveryState::Waiting).is_some());
        assert!(job.entered_at(RecoveryState::Verifying).is_none());
    }

    #[test]
    fn test_finished_job_is_immutable() {
        let mut job = RecoveryJob::new("job-2".to_string(), TriggerSource::Watchdog);
        job.enter(RecoveryState::Stopping);
        job.fail(FailureReason::StepTimeout {
            step: RecoveryState::Stopping,
            timeout_ms: 30_000,
        });
        job.enter(RecoveryState::Starting);
        job.succeed();

        assert_eq!(job.state, RecoveryState::Failed);
        assert!(matches!(job.outcome, Some(JobOutcome::Failed { .. })));
        assert_eq!(job.steps.len(), 1);
    }

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::ProcessControl {
            step: RecoveryState::Starting,
            message: "no such file".to_string(),
        };
        assert_eq!(
            reason.to_string(),
            "process control failed during 'starting': no such file"
        );
    }

    #[test]
    fn test_sub_second_step_timeout_keeps_its_duration() {
        let reason = FailureReason::StepTimeout {
            step: RecoveryState::Reconnecting,
            timeout_ms: duration_ms(std::time::Duration::from_millis(450)),
        };
        assert_eq!(reason.to_string(), "step 'reconnecting' timed out after 450ms");
    }
}
