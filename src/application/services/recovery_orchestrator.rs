//! Recovery Orchestrator
//!
//! Drives the terminal through stop / settle / start / initialize /
//! reconnect / verify. At most one job runs at a time: the active job lives
//! in a single lock-guarded slot that is taken on trigger and cleared in the
//! same critical section that records the terminal state.
//!
//! Every step runs under the timeout of its [`StepBudget`]; a step that
//! overruns fails the job with that step as the reason. Per-account login and
//! verification run in parallel and never abort the job on their own.

use chrono::Utc;
use futures_util::future::join_all;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::entities::account::AccountRegistryEntry;
use crate::domain::entities::recovery_job::{
    duration_ms, AccountFailure, AccountVerification, FailureReason, JobOutcome, RecoveryJob,
    RecoveryState, TriggerSource,
};
use crate::domain::errors::{BridgeError, ProcessControlError};
use crate::domain::repositories::terminal::{AccountProbe, TerminalController};
use crate::domain::services::account_registry::AccountRegistry;
use crate::domain::services::recovery_plan::{successor, RecoveryPlan, StepBudget};
use crate::infrastructure::snapshot_store::SnapshotStore;
use crate::persistence::recovery_audit::RecoveryAuditRepository;
use crate::persistence::DatabaseError;
use crate::secrets::{CredentialSource, SecretError};

/// Default number of finished jobs kept in memory
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Handle to a launched job
pub struct RecoveryTicket {
    pub job_id: String,
    /// Resolves to the finished job
    pub handle: JoinHandle<RecoveryJob>,
}

pub struct RecoveryOrchestrator {
    registry: Arc<AccountRegistry>,
    store: Arc<SnapshotStore>,
    terminal: Arc<dyn TerminalController>,
    probe: Arc<dyn AccountProbe>,
    credentials: Arc<dyn CredentialSource>,
    plan: RecoveryPlan,
    audit: Option<Arc<dyn RecoveryAuditRepository>>,
    active: Mutex<Option<RecoveryJob>>,
    history: Mutex<VecDeque<RecoveryJob>>,
    history_limit: usize,
    sequence: AtomicU64,
}

impl RecoveryOrchestrator {
    pub fn new(
        registry: Arc<AccountRegistry>,
        store: Arc<SnapshotStore>,
        terminal: Arc<dyn TerminalController>,
        probe: Arc<dyn AccountProbe>,
        credentials: Arc<dyn CredentialSource>,
        plan: RecoveryPlan,
    ) -> Self {
        Self {
            registry,
            store,
            terminal,
            probe,
            credentials,
            plan,
            audit: None,
            active: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn RecoveryAuditRepository>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn plan(&self) -> &RecoveryPlan {
        &self.plan
    }

    /// Load recent finished jobs from the audit trail
    pub async fn restore_history(&self) -> Result<usize, DatabaseError> {
        let Some(audit) = &self.audit else {
            return Ok(0);
        };
        let jobs = audit.recent_jobs(self.history_limit).await?;
        let restored = jobs.len();
        let mut history = self.history.lock().await;
        history.clear();
        history.extend(jobs);
        info!("Restored {} recovery job(s) from audit trail", restored);
        Ok(restored)
    }

    /// Launch a job unless one is already active
    pub async fn trigger(
        self: &Arc<Self>,
        source: TriggerSource,
    ) -> Result<RecoveryTicket, BridgeError> {
        let job_id = {
            let mut active = self.active.lock().await;
            if let Some(job) = active.as_ref() {
                warn!(
                    "Rejecting {:?} recovery trigger: job {} is {}",
                    source, job.id, job.state
                );
                return Err(BridgeError::Conflict {
                    active_job: job.id.clone(),
                });
            }
            let job_id = format!(
                "job-{}-{}",
                Utc::now().format("%Y%m%d%H%M%S"),
                self.sequence.fetch_add(1, Ordering::SeqCst)
            );
            *active = Some(RecoveryJob::new(job_id.clone(), source));
            job_id
        };

        info!("Recovery job {} triggered by {:?}", job_id, source);
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.run().await });
        Ok(RecoveryTicket { job_id, handle })
    }

    pub async fn is_busy(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn active_job(&self) -> Option<RecoveryJob> {
        self.active.lock().await.clone()
    }

    /// Look a job up in memory, then in the audit trail
    pub async fn job(&self, job_id: &str) -> Option<RecoveryJob> {
        if let Some(job) = self.active.lock().await.as_ref().filter(|j| j.id == job_id) {
            return Some(job.clone());
        }
        if let Some(job) = self.history.lock().await.iter().find(|j| j.id == job_id) {
            return Some(job.clone());
        }
        let audit = self.audit.as_ref()?;
        match audit.get_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!("Audit lookup for job {} failed: {}", job_id, e);
                None
            }
        }
    }

    /// Active job first, then finished jobs most recent first
    pub async fn recent_jobs(&self, limit: usize) -> Vec<RecoveryJob> {
        let mut jobs: Vec<RecoveryJob> = self.active.lock().await.iter().cloned().collect();
        let history = self.history.lock().await;
        jobs.extend(history.iter().cloned());
        jobs.truncate(limit);
        jobs
    }

    async fn update(&self, f: impl FnOnce(&mut RecoveryJob)) {
        if let Some(job) = self.active.lock().await.as_mut() {
            f(job);
        }
    }

    async fn run(self: Arc<Self>) -> RecoveryJob {
        let started = Instant::now();
        let accounts: Vec<AccountRegistryEntry> = self.registry.enabled().cloned().collect();

        let mut pending = Vec::with_capacity(accounts.len());
        for entry in &accounts {
            let baseline = self.store.last_good_balance(entry.login).await;
            pending.push(AccountVerification::pending(entry.login, baseline));
        }
        self.update(|job| {
            job.accounts = pending.into_iter().map(|a| (a.login, a)).collect();
        })
        .await;

        let mut state = RecoveryState::Idle;
        while let Some(next) = successor(state) {
            if next.is_terminal() {
                break;
            }
            let mut job_id = String::new();
            self.update(|job| {
                job.enter(next);
                job_id = job.id.clone();
            })
            .await;
            info!(
                "Recovery job {}: {} -> {} (elapsed {:?})",
                job_id,
                state,
                next,
                started.elapsed()
            );

            let budget = self.plan.budget(next);
            let result = match timeout(budget.timeout, self.run_step(next, budget, &accounts)).await
            {
                Ok(result) => result,
                Err(_) => Err(FailureReason::StepTimeout {
                    step: next,
                    timeout_ms: duration_ms(budget.timeout),
                }),
            };
            if let Err(reason) = result {
                return self.finish(Some(reason), started).await;
            }
            state = next;
        }

        self.finish(None, started).await
    }

    async fn run_step(
        &self,
        state: RecoveryState,
        budget: StepBudget,
        accounts: &[AccountRegistryEntry],
    ) -> Result<(), FailureReason> {
        match state {
            RecoveryState::Stopping => {
                self.with_attempts(state, budget, || self.terminal.stop(self.plan.stop_grace))
                    .await
            }
            RecoveryState::Waiting => {
                sleep(self.plan.settle_delay).await;
                Ok(())
            }
            RecoveryState::Starting => {
                self.with_attempts(state, budget, || self.terminal.start())
                    .await
            }
            RecoveryState::Initializing => {
                sleep(self.plan.init_delay).await;
                self.terminal
                    .ensure_running()
                    .await
                    .map_err(|e| FailureReason::ProcessControl {
                        step: state,
                        message: e.to_string(),
                    })
            }
            RecoveryState::Reconnecting => {
                join_all(accounts.iter().map(|entry| self.reconnect_account(entry))).await;
                Ok(())
            }
            RecoveryState::Verifying => {
                join_all(accounts.iter().map(|entry| self.verify_account(entry))).await;
                Ok(())
            }
            RecoveryState::Idle | RecoveryState::Succeeded | RecoveryState::Failed => Ok(()),
        }
    }

    /// Retry a process-control call up to the step's attempt budget
    async fn with_attempts<F, Fut>(
        &self,
        state: RecoveryState,
        budget: StepBudget,
        mut call: F,
    ) -> Result<(), FailureReason>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), ProcessControlError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < budget.max_attempts => {
                    warn!(
                        "{} attempt {}/{} failed: {}",
                        state, attempt, budget.max_attempts, e
                    );
                    self.update(|job| job.retry_count += 1).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempt(s): {}", state, attempt, e);
                    return Err(FailureReason::ProcessControl {
                        step: state,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    async fn reconnect_account(&self, entry: &AccountRegistryEntry) {
        let lookup = timeout(
            self.plan.login_timeout,
            self.credentials.resolve(&entry.credential_ref),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SecretError::TimedOut {
                credential_ref: entry.credential_ref.clone(),
                timeout_ms: duration_ms(self.plan.login_timeout),
            })
        });
        let password = match lookup {
            Ok(password) => password,
            Err(e) => {
                warn!("No credential for account {}: {}", entry.login, e);
                let failure = AccountFailure::CredentialUnavailable {
                    message: e.to_string(),
                };
                self.update(|job| {
                    if let Some(account) = job.accounts.get_mut(&entry.login) {
                        account.failure = Some(failure);
                    }
                })
                .await;
                return;
            }
        };

        let max_attempts = self.plan.login_attempts.max(1);
        let mut last_error = String::new();
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            let outcome = timeout(
                self.plan.login_timeout,
                self.terminal.login(entry, password.as_str()),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {
                    info!(
                        "Account {} logged in (attempt {}/{})",
                        entry.login, attempts, max_attempts
                    );
                    self.update(|job| {
                        job.retry_count += attempts - 1;
                        if let Some(account) = job.accounts.get_mut(&entry.login) {
                            account.logged_in = true;
                            account.login_attempts = attempts;
                        }
                    })
                    .await;
                    return;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "login timed out after {}s",
                        self.plan.login_timeout.as_secs_f64()
                    )
                }
            }
            warn!(
                "Login attempt {}/{} for account {} failed: {}",
                attempts, max_attempts, entry.login, last_error
            );
            if attempts < max_attempts {
                sleep(self.plan.login_retry_delay).await;
            }
        }

        error!(
            "Account {} could not log in after {} attempts",
            entry.login, attempts
        );
        self.update(|job| {
            job.retry_count += attempts - 1;
            if let Some(account) = job.accounts.get_mut(&entry.login) {
                account.login_attempts = attempts;
                account.failure = Some(AccountFailure::LoginFailure {
                    attempts,
                    message: last_error,
                });
            }
        })
        .await;
    }

    async fn verify_account(&self, entry: &AccountRegistryEntry) {
        let (logged_in, baseline, since) = {
            let active = self.active.lock().await;
            let Some(job) = active.as_ref() else {
                return;
            };
            let Some(account) = job.accounts.get(&entry.login) else {
                return;
            };
            (
                account.logged_in,
                account.baseline,
                job.entered_at(RecoveryState::Reconnecting)
                    .unwrap_or(job.started_at),
            )
        };
        if !logged_in {
            return;
        }

        let started = Instant::now();
        let deadline = started + self.plan.verification_timeout;
        loop {
            let snapshot = self.probe.probe(entry).await;
            let now = Utc::now();
            match self.plan.verify(snapshot.as_deref(), since, now, baseline) {
                Ok(balance) => {
                    info!("Account {} verified with balance {:.2}", entry.login, balance);
                    self.update(|job| {
                        if let Some(account) = job.accounts.get_mut(&entry.login) {
                            account.verified = true;
                            account.balance = Some(balance);
                            account.verified_at = Some(now);
                        }
                    })
                    .await;
                    return;
                }
                Err(observation) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!(
                            "Account {} not verified after {:?}: {:?}",
                            entry.login,
                            started.elapsed(),
                            observation
                        );
                        let balance = snapshot.map(|s| s.balance);
                        let failure = AccountFailure::VerificationTimeout {
                            waited_ms: duration_ms(started.elapsed()),
                            last: observation,
                        };
                        self.update(|job| {
                            if let Some(account) = job.accounts.get_mut(&entry.login) {
                                account.balance = balance;
                                account.failure = Some(failure);
                            }
                        })
                        .await;
                        return;
                    }
                    debug!("Account {} pending: {:?}", entry.login, observation);
                    sleep(self.plan.verification_poll.min(remaining)).await;
                }
            }
        }
    }

    /// Record the terminal state, release the slot and persist the job
    async fn finish(&self, failure: Option<FailureReason>, started: Instant) -> RecoveryJob {
        let finished = {
            let mut active = self.active.lock().await;
            let Some(mut job) = active.take() else {
                // Only reachable if the slot was cleared by someone else
                return RecoveryJob::new(String::new(), TriggerSource::External);
            };

            let reached_accounts = job.entered_at(RecoveryState::Reconnecting).is_some();
            let failure = failure.or_else(|| {
                let unverified = job.unverified_accounts();
                (!unverified.is_empty())
                    .then_some(FailureReason::AccountsUnverified { accounts: unverified })
            });

            match failure {
                None => job.succeed(),
                Some(reason) => {
                    let untouched = if reached_accounts {
                        AccountFailure::Interrupted { step: job.state }
                    } else {
                        AccountFailure::ProcessStartFailure
                    };
                    for account in job.accounts.values_mut().filter(|a| !a.verified) {
                        account.failure.get_or_insert_with(|| untouched.clone());
                    }
                    job.fail(reason);
                }
            }

            let mut history = self.history.lock().await;
            history.push_front(job.clone());
            history.truncate(self.history_limit);
            job
        };

        match &finished.outcome {
            Some(JobOutcome::Failed { reason }) => error!(
                "Recovery job {} failed after {:?}: {}",
                finished.id,
                started.elapsed(),
                reason
            ),
            _ => info!(
                "Recovery job {} succeeded after {:?} ({} account(s) verified)",
                finished.id,
                started.elapsed(),
                finished.accounts.len()
            ),
        }

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.save_job(&finished).await {
                warn!("Recovery job {} not persisted: {}", finished.id, e);
            }
        }
        finished
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::entities::account::Login;
    use crate::domain::entities::recovery_job::LastObservation;
    use crate::domain::entities::snapshot::AccountSnapshot;
    use crate::domain::repositories::terminal::TerminalStatus;
    use crate::secrets::StaticCredentials;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    /// Terminal double: scripted failures, logins write a fresh snapshot
    #[derive(Default)]
    pub(crate) struct ScriptedTerminal {
        pub store: Arc<SnapshotStore>,
        pub balances: HashMap<Login, f64>,
        pub failing_logins: HashSet<Login>,
        pub hanging_logins: HashSet<Login>,
        pub fail_start: bool,
        pub start_delay: Duration,
        pub calls: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedTerminal {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TerminalController for ScriptedTerminal {
        async fn stop(&self, _grace: Duration) -> Result<(), ProcessControlError> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }

        async fn start(&self) -> Result<(), ProcessControlError> {
            self.calls.lock().unwrap().push("start".to_string());
            sleep(self.start_delay).await;
            if self.fail_start {
                return Err(ProcessControlError::SpawnFailed {
                    path: "terminal64.exe".to_string(),
                    message: "not found".to_string(),
                });
            }
            Ok(())
        }

        async fn ensure_running(&self) -> Result<(), ProcessControlError> {
            Ok(())
        }

        async fn login(
            &self,
            account: &AccountRegistryEntry,
            _password: &str,
        ) -> Result<(), ProcessControlError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("login:{}", account.login));
            if self.hanging_logins.contains(&account.login) {
                sleep(Duration::from_secs(3600)).await;
            }
            if self.failing_logins.contains(&account.login) {
                return Err(ProcessControlError::LoginRejected {
                    login: account.login,
                    message: "invalid account".to_string(),
                });
            }
            let balance = self.balances.get(&account.login).copied().unwrap_or(1000.0);
            let mut snapshot = crate::infrastructure::snapshot_store::tests::snapshot_at(
                account.login,
                balance,
                Utc::now(),
            );
            snapshot.ingested_at = Utc::now();
            self.store.replace(snapshot).await;
            Ok(())
        }

        async fn status(&self) -> TerminalStatus {
            TerminalStatus::default()
        }
    }

    pub(crate) struct StoreProbe(pub Arc<SnapshotStore>);

    #[async_trait]
    impl AccountProbe for StoreProbe {
        async fn probe(&self, account: &AccountRegistryEntry) -> Option<Arc<AccountSnapshot>> {
            self.0.get(account.login).await
        }
    }

    pub(crate) fn fast_plan() -> RecoveryPlan {
        let mut plan = RecoveryPlan::default().with_slack(Duration::from_millis(200));
        plan.stop_grace = Duration::from_millis(10);
        plan.stop_timeout = Duration::from_millis(500);
        plan.settle_delay = Duration::from_millis(10);
        plan.start_timeout = Duration::from_millis(500);
        plan.init_delay = Duration::from_millis(10);
        plan.login_timeout = Duration::from_millis(50);
        plan.login_retry_delay = Duration::from_millis(5);
        plan.verification_timeout = Duration::from_millis(200);
        plan.verification_poll = Duration::from_millis(20);
        plan
    }

    pub(crate) fn registry(logins: &[Login]) -> Arc<AccountRegistry> {
        Arc::new(
            AccountRegistry::new(
                logins
                    .iter()
                    .map(|l| {
                        AccountRegistryEntry::new(*l, "icm", "ICM-Live", &format!("ref_{}", l), "Alpha")
                    })
                    .collect(),
            )
            .unwrap(),
        )
    }

    pub(crate) fn credentials(logins: &[Login]) -> Arc<StaticCredentials> {
        Arc::new(
            logins
                .iter()
                .fold(StaticCredentials::new(), |c, l| c.with(&format!("ref_{}", l), "pw")),
        )
    }

    fn orchestrator(
        logins: &[Login],
        terminal: ScriptedTerminal,
    ) -> (Arc<RecoveryOrchestrator>, Arc<ScriptedTerminal>) {
        let store = terminal.store.clone();
        let terminal = Arc::new(terminal);
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            registry(logins),
            store.clone(),
            terminal.clone(),
            Arc::new(StoreProbe(store)),
            credentials(logins),
            fast_plan(),
        ));
        (orchestrator, terminal)
    }

    #[tokio::test]
    async fn test_successful_recovery_walks_every_step() {
        let (orchestrator, terminal) = orchestrator(&[1, 2], ScriptedTerminal::default());
        let ticket = orchestrator.trigger(TriggerSource::External).await.unwrap();
        let job = ticket.handle.await.unwrap();

        assert_eq!(job.state, RecoveryState::Succeeded);
        assert_eq!(job.outcome, Some(JobOutcome::Succeeded));
        let steps: Vec<RecoveryState> = job.steps.iter().map(|s| s.state).collect();
        assert_eq!(
            steps,
            vec![
                RecoveryState::Stopping,
                RecoveryState::Waiting,
                RecoveryState::Starting,
                RecoveryState::Initializing,
                RecoveryState::Reconnecting,
                RecoveryState::Verifying,
            ]
        );
        assert!(job.accounts.values().all(|a| a.verified && a.logged_in));
        assert_eq!(&terminal.calls()[..2], &["stop".to_string(), "start".to_string()]);
        assert!(!orchestrator.is_busy().await);
        assert_eq!(orchestrator.job(&ticket.job_id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_active() {
        let (orchestrator, _) = orchestrator(
            &[1],
            ScriptedTerminal {
                start_delay: Duration::from_millis(100),
                ..ScriptedTerminal::default()
            },
        );
        let first = orchestrator.trigger(TriggerSource::Watchdog).await.unwrap();
        let second = orchestrator.trigger(TriggerSource::External).await;

        match second {
            Err(BridgeError::Conflict { active_job }) => assert_eq!(active_job, first.job_id),
            other => panic!("expected conflict, got {:?}", other.map(|t| t.job_id)),
        }
        first.handle.await.unwrap();
        assert_eq!(orchestrator.recent_jobs(10).await.len(), 1);

        // Slot is released once the job is terminal
        let third = orchestrator.trigger(TriggerSource::External).await.unwrap();
        assert_ne!(third.job_id, first.job_id);
        third.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_timeouts_fail_only_that_account() {
        let (orchestrator, terminal) = orchestrator(
            &[1, 2],
            ScriptedTerminal {
                hanging_logins: HashSet::from([2]),
                ..ScriptedTerminal::default()
            },
        );
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, RecoveryState::Failed);
        assert_eq!(
            job.outcome,
            Some(JobOutcome::Failed {
                reason: FailureReason::AccountsUnverified { accounts: vec![2] }
            })
        );
        assert!(job.accounts[&1].verified);
        assert!(matches!(
            job.accounts[&2].failure,
            Some(AccountFailure::LoginFailure { attempts: 3, .. })
        ));
        assert_eq!(job.retry_count, 2);
        let login_calls = terminal.calls().iter().filter(|c| *c == "login:2").count();
        assert_eq!(login_calls, 3);
    }

    #[tokio::test]
    async fn test_start_failure_short_circuits() {
        let (orchestrator, terminal) = orchestrator(
            &[1, 2],
            ScriptedTerminal {
                fail_start: true,
                ..ScriptedTerminal::default()
            },
        );
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert!(matches!(
            job.outcome,
            Some(JobOutcome::Failed {
                reason: FailureReason::ProcessControl {
                    step: RecoveryState::Starting,
                    ..
                }
            })
        ));
        assert!(job
            .accounts
            .values()
            .all(|a| a.failure == Some(AccountFailure::ProcessStartFailure)));
        assert_eq!(job.retry_count, 1);
        assert!(!terminal.calls().iter().any(|c| c.starts_with("login")));
    }

    #[tokio::test]
    async fn test_step_timeout_names_the_stuck_step() {
        let (orchestrator, _) = orchestrator(
            &[1],
            ScriptedTerminal {
                start_delay: Duration::from_secs(60),
                ..ScriptedTerminal::default()
            },
        );
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert!(matches!(
            job.outcome,
            Some(JobOutcome::Failed {
                reason: FailureReason::StepTimeout {
                    step: RecoveryState::Starting,
                    ..
                }
            })
        ));
    }

    #[tokio::test]
    async fn test_zero_balance_after_login_times_out_verification() {
        let (orchestrator, _) = orchestrator(
            &[1],
            ScriptedTerminal {
                balances: HashMap::from([(1, 0.0)]),
                ..ScriptedTerminal::default()
            },
        );
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(job.state, RecoveryState::Failed);
        assert!(matches!(
            job.accounts[&1].failure,
            Some(AccountFailure::VerificationTimeout {
                last: LastObservation::ZeroBalance,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_credential_is_reported_per_account() {
        let store = Arc::new(SnapshotStore::new());
        let terminal = Arc::new(ScriptedTerminal {
            store: store.clone(),
            ..ScriptedTerminal::default()
        });
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            registry(&[1, 2]),
            store.clone(),
            terminal,
            Arc::new(StoreProbe(store)),
            credentials(&[1]),
            fast_plan(),
        ));
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert!(job.accounts[&1].verified);
        assert!(matches!(
            job.accounts[&2].failure,
            Some(AccountFailure::CredentialUnavailable { .. })
        ));
    }

    /// Credential store whose lookup for one reference never answers
    struct StuckCredentials {
        stuck_ref: String,
        inner: StaticCredentials,
    }

    #[async_trait]
    impl CredentialSource for StuckCredentials {
        async fn resolve(
            &self,
            credential_ref: &str,
        ) -> Result<zeroize::Zeroizing<String>, SecretError> {
            if credential_ref == self.stuck_ref {
                std::future::pending::<()>().await;
            }
            self.inner.resolve(credential_ref).await
        }
    }

    #[tokio::test]
    async fn test_stuck_credential_lookup_fails_only_its_account() {
        let store = Arc::new(SnapshotStore::new());
        let terminal = Arc::new(ScriptedTerminal {
            store: store.clone(),
            ..ScriptedTerminal::default()
        });
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            registry(&[1, 2]),
            store.clone(),
            terminal.clone(),
            Arc::new(StoreProbe(store)),
            Arc::new(StuckCredentials {
                stuck_ref: "ref_2".to_string(),
                inner: StaticCredentials::new().with("ref_1", "pw").with("ref_2", "pw"),
            }),
            fast_plan(),
        ));
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        assert_eq!(
            job.outcome,
            Some(JobOutcome::Failed {
                reason: FailureReason::AccountsUnverified { accounts: vec![2] }
            })
        );
        assert!(job.accounts[&1].verified);
        match &job.accounts[&2].failure {
            Some(AccountFailure::CredentialUnavailable { message }) => {
                assert!(message.contains("timed out"), "{}", message)
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        assert!(!terminal.calls().contains(&"login:2".to_string()));
    }

    /// Account reader that never answers for one account
    struct StuckAccountReader {
        stuck: Login,
        inner: StoreProbe,
    }

    #[async_trait]
    impl AccountProbe for StuckAccountReader {
        async fn probe(&self, account: &AccountRegistryEntry) -> Option<Arc<AccountSnapshot>> {
            if account.login == self.stuck {
                std::future::pending::<()>().await;
            }
            self.inner.probe(account).await
        }
    }

    #[tokio::test]
    async fn test_step_timeout_tags_accounts_without_a_result() {
        let store = Arc::new(SnapshotStore::new());
        let terminal = Arc::new(ScriptedTerminal {
            store: store.clone(),
            ..ScriptedTerminal::default()
        });
        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            registry(&[1, 2]),
            store.clone(),
            terminal,
            Arc::new(StuckAccountReader {
                stuck: 2,
                inner: StoreProbe(store),
            }),
            credentials(&[1, 2]),
            fast_plan(),
        ));
        let job = orchestrator
            .trigger(TriggerSource::External)
            .await
            .unwrap()
            .handle
            .await
            .unwrap();

        let budget = fast_plan().budget(RecoveryState::Verifying).timeout;
        assert_eq!(
            job.outcome,
            Some(JobOutcome::Failed {
                reason: FailureReason::StepTimeout {
                    step: RecoveryState::Verifying,
                    timeout_ms: duration_ms(budget),
                }
            })
        );
        assert!(duration_ms(budget) > 0);
        assert!(job.accounts[&1].verified);
        assert_eq!(job.accounts[&1].failure, None);
        assert_eq!(
            job.accounts[&2].failure,
            Some(AccountFailure::Interrupted {
                step: RecoveryState::Verifying
            })
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_most_recent_first() {
        let store = Arc::new(SnapshotStore::new());
        let terminal = Arc::new(ScriptedTerminal {
            store: store.clone(),
            ..ScriptedTerminal::default()
        });
        let orchestrator = Arc::new(
            RecoveryOrchestrator::new(
                registry(&[1]),
                store.clone(),
                terminal,
                Arc::new(StoreProbe(store)),
                credentials(&[1]),
                fast_plan(),
            )
            .with_history_limit(2),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let ticket = orchestrator.trigger(TriggerSource::External).await.unwrap();
            ids.push(ticket.job_id.clone());
            ticket.handle.await.unwrap();
        }
        let recent: Vec<String> = orchestrator
            .recent_jobs(10)
            .await
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(recent, vec![ids[2].clone(), ids[1].clone()]);
        assert!(orchestrator.job(&ids[0]).await.is_none());
    }
}
