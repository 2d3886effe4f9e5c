//! Snapshot Poller
//!
//! Fixed-interval loop driving the [`SnapshotReader`]. Keeps the outcome of
//! the last tick for the health endpoint. Reader failures back off but never
//! stop the loop: an unreachable snapshot share is reported, not fatal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::domain::errors::SnapshotError;
use crate::infrastructure::snapshot_reader::{PollReport, SnapshotReader};
use crate::task_runner::{run_with_circuit_breaker, CircuitBreakerConfig};

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub polled_at: DateTime<Utc>,
    pub report: Option<PollReport>,
    pub error: Option<String>,
    /// Failed ticks in a row, 0 after a successful one
    pub consecutive_failures: u32,
}

pub struct SnapshotPoller {
    reader: Arc<SnapshotReader>,
    interval: Duration,
    last: RwLock<Option<PollStatus>>,
}

impl SnapshotPoller {
    pub fn new(reader: Arc<SnapshotReader>, interval: Duration) -> Self {
        Self {
            reader,
            interval,
            last: RwLock::new(None),
        }
    }

    /// One poll over the registry
    pub async fn tick(&self) -> Result<PollReport, SnapshotError> {
        let result = self.reader.poll_once().await;
        let mut last = self.last.write().await;
        let consecutive_failures = match (&result, last.as_ref()) {
            (Ok(_), _) => 0,
            (Err(_), Some(previous)) => previous.consecutive_failures.saturating_add(1),
            (Err(_), None) => 1,
        };
        *last = Some(PollStatus {
            polled_at: Utc::now(),
            report: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            consecutive_failures,
        });
        result
    }

    pub async fn last_status(&self) -> Option<PollStatus> {
        self.last.read().await.clone()
    }

    /// Spawn the polling loop. An open circuit is logged and the loop
    /// starts over with fresh backoff.
    pub fn spawn(self: Arc<Self>, breaker: CircuitBreakerConfig) -> JoinHandle<()> {
        info!(
            "Snapshot poller started on {} every {:?}",
            self.reader.dir().display(),
            self.interval
        );
        tokio::spawn(async move {
            loop {
                let poller = self.clone();
                let aborted = run_with_circuit_breaker(
                    "snapshot_poller",
                    self.interval,
                    breaker.clone(),
                    move || {
                        let poller = poller.clone();
                        async move { poller.tick().await.map(|_| ()) }
                    },
                )
                .await;
                error!("{}, polling continues", aborted);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::account::AccountRegistryEntry;
    use crate::domain::services::account_registry::AccountRegistry;
    use crate::infrastructure::snapshot_store::SnapshotStore;

    fn poller(dir: impl Into<std::path::PathBuf>) -> SnapshotPoller {
        let registry = Arc::new(
            AccountRegistry::new(vec![AccountRegistryEntry::new(
                1, "icm", "ICM-Live", "c", "Alpha",
            )])
            .unwrap(),
        );
        let reader = SnapshotReader::new(
            dir,
            "account_{login}.json",
            registry,
            Arc::new(SnapshotStore::new()),
        );
        SnapshotPoller::new(Arc::new(reader), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_tick_records_directory_error() {
        let poller = poller("/nonexistent/mtbridge/poller");
        assert!(poller.last_status().await.is_none());
        assert!(poller.tick().await.is_err());

        let status = poller.last_status().await.unwrap();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.report.is_none());
        assert!(status.error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_spawned_loop_outlives_missing_directory() {
        let dir = std::env::temp_dir().join(format!(
            "mtbridge-poller-{}-late",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        let poller = Arc::new(poller(dir.clone()));
        let handle = poller.clone().spawn(CircuitBreakerConfig {
            max_consecutive_failures: 2,
            initial_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());
        let status = poller.last_status().await.unwrap();
        assert!(status.consecutive_failures > 2);
        assert!(status.error.is_some());

        // Share comes back: the same loop picks it up
        std::fs::create_dir_all(&dir).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = poller.last_status().await.unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.error.is_none());
        assert_eq!(status.report.unwrap().missing, 1);

        handle.abort();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
