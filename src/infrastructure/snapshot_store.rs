//! Snapshot Store
//!
//! In-memory cache of the latest snapshot per login. Records are immutable
//! `Arc<AccountSnapshot>` values replaced whole on every successful read, so
//! a reader holding one never observes a half-updated account.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::entities::account::Login;
use crate::domain::entities::snapshot::AccountSnapshot;
use crate::domain::services::account_registry::AccountRegistry;
use crate::domain::services::watchdog::{AccountHealth, AccountReading};

#[derive(Debug, Default)]
pub struct SnapshotStore {
    records: RwLock<HashMap<Login, Arc<AccountSnapshot>>>,
    /// Last non-zero balance per login
    last_good_balances: RwLock<HashMap<Login, f64>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record for the snapshot's login.
    ///
    /// `ingested_at` is bumped if needed so it strictly increases per login.
    pub async fn replace(&self, mut snapshot: AccountSnapshot) -> Arc<AccountSnapshot> {
        let mut records = self.records.write().await;
        if let Some(previous) = records.get(&snapshot.login) {
            if snapshot.ingested_at <= previous.ingested_at {
                snapshot.ingested_at = previous.ingested_at + Duration::microseconds(1);
            }
        }
        let login = snapshot.login;
        if !snapshot.has_zero_balance() {
            self.last_good_balances
                .write()
                .await
                .insert(login, snapshot.balance);
        }
        let record = Arc::new(snapshot);
        records.insert(login, record.clone());
        debug!("Snapshot store updated for account {}", login);
        record
    }

    pub async fn get(&self, login: Login) -> Option<Arc<AccountSnapshot>> {
        self.records.read().await.get(&login).cloned()
    }

    /// Last non-zero balance ever ingested for `login`
    pub async fn last_good_balance(&self, login: Login) -> Option<f64> {
        self.last_good_balances.read().await.get(&login).copied()
    }

    /// Consistent copy of every record, taken under one read lock
    pub async fn view(&self) -> HashMap<Login, Arc<AccountSnapshot>> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Health of every enabled account at `now`, from one consistent view
    pub async fn readings(
        &self,
        registry: &AccountRegistry,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Vec<AccountReading> {
        let view = self.view().await;
        registry
            .enabled()
            .map(|entry| AccountReading {
                login: entry.login,
                health: AccountHealth::of(
                    view.get(&entry.login).map(Arc::as_ref),
                    now,
                    stale_after,
                ),
            })
            .collect()
    }
}
