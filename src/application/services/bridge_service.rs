//! Bridge Service
//!
//! Read-through facade over the snapshot store plus the restart trigger.
//! Every response carries owned copies of cached records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::application::actors::snapshot_poller::{PollStatus, SnapshotPoller};
use crate::application::actors::watchdog_actor::WatchdogActor;
use crate::application::services::recovery_orchestrator::RecoveryOrchestrator;
use crate::domain::entities::account::{AccountRegistryEntry, Login};
use crate::domain::entities::recovery_job::{RecoveryJob, RecoveryState, TriggerSource};
use crate::domain::entities::snapshot::{
    AccountSnapshot, BalanceOperation, ClosedDeal, PendingOrder, Position,
};
use crate::domain::errors::BridgeError;
use crate::domain::repositories::terminal::{TerminalController, TerminalStatus};
use crate::domain::services::account_registry::AccountRegistry;
use crate::domain::services::summary::{build_summary, AccountsSummary};
use crate::domain::services::watchdog::{AccountHealth, WatchdogStatus};
use crate::infrastructure::snapshot_reader::SnapshotReader;
use crate::infrastructure::snapshot_store::SnapshotStore;

pub const DEFAULT_TRADES_LIMIT: usize = 100;
pub const MAX_TRADES_LIMIT: usize = 1000;
pub const DEFAULT_JOBS_LIMIT: usize = 20;

/// Freshness of the cached data behind a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStatus {
    Fresh,
    Stale,
    /// Registered account, nothing ingested yet
    NoCachedData,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "ok" when every enabled account has fresh data and no job is running
    pub status: &'static str,
    pub accounts_total: usize,
    pub accounts_enabled: usize,
    pub fresh: usize,
    pub stale: usize,
    pub no_data: usize,
    pub zero_balance: usize,
    pub terminal: TerminalStatus,
    pub mt_initialized: bool,
    pub active_job: Option<JobBrief>,
    pub watchdog: Option<WatchdogStatus>,
    pub last_poll: Option<PollStatus>,
    pub parse_errors: BTreeMap<Login, String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobBrief {
    pub job_id: String,
    pub state: RecoveryState,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
}

impl From<&RecoveryJob> for JobBrief {
    fn from(job: &RecoveryJob) -> Self {
        Self {
            job_id: job.id.clone(),
            state: job.state,
            trigger: job.trigger,
            started_at: job.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub login: Login,
    pub broker: String,
    pub server: String,
    pub fund: String,
    pub enabled: bool,
    pub status: DataStatus,
    pub age_secs: Option<i64>,
    pub snapshot: Option<AccountSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountTrades {
    pub login: Login,
    pub status: DataStatus,
    pub limit: usize,
    pub count: usize,
    pub deals: Vec<ClosedDeal>,
    pub balance_operations: Vec<BalanceOperation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountPositions {
    pub login: Login,
    pub status: DataStatus,
    pub positions: Vec<Position>,
    pub pending_orders: Vec<PendingOrder>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartAccepted {
    pub job_id: String,
    pub status: RecoveryState,
}

pub struct BridgeService {
    registry: Arc<AccountRegistry>,
    store: Arc<SnapshotStore>,
    terminal: Arc<dyn TerminalController>,
    orchestrator: Arc<RecoveryOrchestrator>,
    stale_after: chrono::Duration,
    reader: Option<Arc<SnapshotReader>>,
    poller: Option<Arc<SnapshotPoller>>,
    watchdog: Option<Arc<WatchdogActor>>,
}

impl BridgeService {
    pub fn new(
        registry: Arc<AccountRegistry>,
        store: Arc<SnapshotStore>,
        terminal: Arc<dyn TerminalController>,
        orchestrator: Arc<RecoveryOrchestrator>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            store,
            terminal,
            orchestrator,
            stale_after,
            reader: None,
            poller: None,
            watchdog: None,
        }
    }

    pub fn with_reader(mut self, reader: Arc<SnapshotReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn with_poller(mut self, poller: Arc<SnapshotPoller>) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn with_watchdog(mut self, watchdog: Arc<WatchdogActor>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    fn entry(&self, login: Login) -> Result<&AccountRegistryEntry, BridgeError> {
        self.registry
            .get(login)
            .ok_or(BridgeError::AccountNotFound(login))
    }

    fn data_status(&self, snapshot: Option<&AccountSnapshot>, now: DateTime<Utc>) -> DataStatus {
        match snapshot {
            None => DataStatus::NoCachedData,
            Some(s) if s.is_stale(now, self.stale_after) => DataStatus::Stale,
            Some(_) => DataStatus::Fresh,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let now = Utc::now();
        let readings = self.store.readings(&self.registry, now, self.stale_after).await;
        let count = |health: AccountHealth| readings.iter().filter(|r| r.health == health).count();
        let (fresh, stale, no_data, zero_balance) = (
            count(AccountHealth::Healthy),
            count(AccountHealth::Stale),
            count(AccountHealth::NoData),
            count(AccountHealth::ZeroBalance),
        );

        let terminal = self.terminal.status().await;
        let active_job = self.orchestrator.active_job().await;
        let status = if active_job.is_some() {
            "recovering"
        } else if fresh == readings.len() {
            "ok"
        } else {
            "degraded"
        };

        let parse_errors = match &self.reader {
            Some(reader) => reader.last_errors().await.into_iter().collect(),
            None => BTreeMap::new(),
        };
        let watchdog = match &self.watchdog {
            Some(watchdog) => Some(watchdog.status().await),
            None => None,
        };
        let last_poll = match &self.poller {
            Some(poller) => poller.last_status().await,
            None => None,
        };

        HealthReport {
            status,
            accounts_total: self.registry.len(),
            accounts_enabled: readings.len(),
            fresh,
            stale,
            no_data,
            zero_balance,
            mt_initialized: terminal.initialized,
            terminal,
            active_job: active_job.as_ref().map(JobBrief::from),
            watchdog,
            last_poll,
            parse_errors,
            checked_at: now,
        }
    }

    pub async fn summary(&self) -> AccountsSummary {
        let view = self.store.view().await;
        build_summary(&self.registry, &view, Utc::now(), self.stale_after)
    }

    pub async fn account_info(&self, login: Login) -> Result<AccountInfo, BridgeError> {
        let entry = self.entry(login)?;
        let snapshot = self.store.get(login).await;
        let now = Utc::now();
        Ok(AccountInfo {
            login,
            broker: entry.broker.clone(),
            server: entry.server.clone(),
            fund: entry.fund.clone(),
            enabled: entry.enabled,
            status: self.data_status(snapshot.as_deref(), now),
            age_secs: snapshot.as_ref().map(|s| s.age_secs(now)),
            snapshot: snapshot.map(|s| AccountSnapshot::clone(&s)),
        })
    }

    /// Closed deals most recent first; `limit` defaults to 100, capped at 1000
    pub async fn account_trades(
        &self,
        login: Login,
        limit: Option<usize>,
    ) -> Result<AccountTrades, BridgeError> {
        self.entry(login)?;
        let limit = limit
            .unwrap_or(DEFAULT_TRADES_LIMIT)
            .clamp(1, MAX_TRADES_LIMIT);
        let snapshot = self.store.get(login).await;
        let deals = snapshot
            .as_ref()
            .map(|s| s.recent_deals(limit))
            .unwrap_or_default();
        Ok(AccountTrades {
            login,
            status: self.data_status(snapshot.as_deref(), Utc::now()),
            limit,
            count: deals.len(),
            deals,
            balance_operations: snapshot
                .map(|s| s.balance_operations.clone())
                .unwrap_or_default(),
        })
    }

    pub async fn account_positions(&self, login: Login) -> Result<AccountPositions, BridgeError> {
        self.entry(login)?;
        let snapshot = self.store.get(login).await;
        Ok(AccountPositions {
            login,
            status: self.data_status(snapshot.as_deref(), Utc::now()),
            positions: snapshot
                .as_ref()
                .map(|s| s.positions.clone())
                .unwrap_or_default(),
            pending_orders: snapshot
                .map(|s| s.pending_orders.clone())
                .unwrap_or_default(),
        })
    }

    /// Launch a full restart; `Conflict` while a job is active
    pub async fn trigger_restart(&self) -> Result<RestartAccepted, BridgeError> {
        let ticket = self.orchestrator.trigger(TriggerSource::External).await?;
        Ok(RestartAccepted {
            job_id: ticket.job_id,
            status: RecoveryState::Idle,
        })
    }

    pub async fn job(&self, job_id: &str) -> Result<RecoveryJob, BridgeError> {
        self.orchestrator
            .job(job_id)
            .await
            .ok_or_else(|| BridgeError::JobNotFound(job_id.to_string()))
    }

    pub async fn jobs(&self, limit: Option<usize>) -> Vec<RecoveryJob> {
        self.orchestrator
            .recent_jobs(limit.unwrap_or(DEFAULT_JOBS_LIMIT))
            .await
    }

    pub async fn watchdog_status(&self) -> Option<WatchdogStatus> {
        match &self.watchdog {
            Some(watchdog) => Some(watchdog.status().await),
            None => None,
        }
    }
}
