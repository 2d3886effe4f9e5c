//! Watchdog Actor
//!
//! Periodically evaluates the [`FailureDetector`] against one consistent view
//! of the snapshot store and launches a recovery job on sustained outage.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::entities::recovery_job::TriggerSource;
use crate::domain::errors::BridgeError;
use crate::domain::services::account_registry::AccountRegistry;
use crate::domain::services::watchdog::{
    DetectorState, FailureDetector, WatchdogDecision, WatchdogStatus,
};
use crate::application::services::recovery_orchestrator::RecoveryOrchestrator;
use crate::infrastructure::snapshot_store::SnapshotStore;
use crate::task_runner::{run_with_circuit_breaker, CircuitBreakerConfig, TaskAborted};

pub struct WatchdogActor {
    detector: Mutex<FailureDetector>,
    registry: Arc<AccountRegistry>,
    store: Arc<SnapshotStore>,
    orchestrator: Arc<RecoveryOrchestrator>,
    stale_after: chrono::Duration,
    interval: Duration,
}

impl WatchdogActor {
    pub fn new(
        registry: Arc<AccountRegistry>,
        store: Arc<SnapshotStore>,
        orchestrator: Arc<RecoveryOrchestrator>,
        debounce_cycles: u32,
        stale_after: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            detector: Mutex::new(FailureDetector::new(debounce_cycles)),
            registry,
            store,
            orchestrator,
            stale_after,
            interval,
        }
    }

    /// One evaluation cycle; returns the id of a launched job, if any
    pub async fn tick(&self) -> Result<Option<String>, BridgeError> {
        let now = Utc::now();
        let readings = self.store.readings(&self.registry, now, self.stale_after).await;
        let recovery_active = self.orchestrator.is_busy().await;

        let mut detector = self.detector.lock().await;
        let before = detector.state();
        let decision = detector.evaluate(readings, recovery_active, now);
        if detector.state() != before {
            info!(
                "Watchdog {:?} -> {:?} ({} consecutive outage cycle(s))",
                before,
                detector.state(),
                detector.consecutive_outage_cycles()
            );
        } else if detector.state() == DetectorState::Suspect {
            debug!("Watchdog still suspect, recovery active: {}", recovery_active);
        }

        if decision != WatchdogDecision::LaunchRecovery {
            return Ok(None);
        }
        match self.orchestrator.trigger(TriggerSource::Watchdog).await {
            Ok(ticket) => {
                warn!(
                    "Global outage confirmed, launched recovery job {}",
                    ticket.job_id
                );
                Ok(Some(ticket.job_id))
            }
            Err(BridgeError::Conflict { active_job }) => {
                info!("Recovery job {} already running, staying suspect", active_job);
                detector.launch_rejected();
                Ok(None)
            }
            Err(e) => {
                detector.launch_rejected();
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> WatchdogStatus {
        self.detector.lock().await.status()
    }

    /// Spawn the evaluation loop; resolves only if the loop gives up
    pub fn spawn(self: Arc<Self>, breaker: CircuitBreakerConfig) -> JoinHandle<TaskAborted> {
        info!("Watchdog started, evaluating every {:?}", self.interval);
        tokio::spawn(async move {
            let actor = self.clone();
            run_with_circuit_breaker("watchdog", self.interval, breaker, move || {
                let actor = actor.clone();
                async move { actor.tick().await.map(|_| ()) }
            })
            .await
        })
    }
}
