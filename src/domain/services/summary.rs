//! Accounts summary aggregation
//!
//! Joins the registry with the latest snapshots and computes totals at
//! request time. Iteration follows registry order so repeated calls over the
//! same snapshots produce identical figures.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::entities::account::Login;
use crate::domain::entities::snapshot::AccountSnapshot;
use crate::domain::services::account_registry::AccountRegistry;
use crate::domain::services::watchdog::AccountHealth;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummaryRow {
    pub login: Login,
    pub fund: String,
    pub server: String,
    pub enabled: bool,
    pub health: AccountHealth,
    pub has_data: bool,
    pub stale: bool,
    pub currency: Option<String>,
    pub allocated: f64,
    pub balance: f64,
    pub equity: f64,
    pub profit: f64,
    pub open_positions: usize,
    pub pending_orders: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryTotals {
    pub accounts: usize,
    pub accounts_with_data: usize,
    pub accounts_without_data: usize,
    pub stale_accounts: usize,
    /// Net deposits minus withdrawals
    pub allocated: f64,
    pub balance: f64,
    pub equity: f64,
    /// Floating profit as reported by the terminal
    pub profit: f64,
    pub open_positions: usize,
}

impl SummaryTotals {
    fn add(&mut self, row: &AccountSummaryRow) {
        self.accounts += 1;
        if row.has_data {
            self.accounts_with_data += 1;
        } else {
            self.accounts_without_data += 1;
        }
        if row.stale {
            self.stale_accounts += 1;
        }
        self.allocated += row.allocated;
        self.balance += row.balance;
        self.equity += row.equity;
        self.profit += row.profit;
        self.open_positions += row.open_positions;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerSummary {
    pub broker: String,
    pub accounts: Vec<AccountSummaryRow>,
    pub totals: SummaryTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountsSummary {
    pub generated_at: DateTime<Utc>,
    pub brokers: Vec<BrokerSummary>,
    pub totals: SummaryTotals,
}

/// Build the summary from a consistent view of the snapshot store
pub fn build_summary(
    registry: &AccountRegistry,
    snapshots: &HashMap<Login, Arc<AccountSnapshot>>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> AccountsSummary {
    let mut totals = SummaryTotals::default();
    let mut brokers = Vec::new();

    for (broker, entries) in registry.grouped_by_broker() {
        let mut group_totals = SummaryTotals::default();
        let mut rows = Vec::with_capacity(entries.len());

        for entry in entries {
            let snapshot = snapshots.get(&entry.login).map(Arc::as_ref);
            let health = AccountHealth::of(snapshot, now, stale_after);
            let row = AccountSummaryRow {
                login: entry.login,
                fund: entry.fund.clone(),
                server: entry.server.clone(),
                enabled: entry.enabled,
                health,
                has_data: snapshot.is_some(),
                stale: health == AccountHealth::Stale,
                currency: snapshot.map(|s| s.currency.clone()),
                allocated: snapshot.map(AccountSnapshot::net_deposits).unwrap_or(0.0),
                balance: snapshot.map(|s| s.balance).unwrap_or(0.0),
                equity: snapshot.map(|s| s.equity).unwrap_or(0.0),
                profit: snapshot.map(|s| s.profit).unwrap_or(0.0),
                open_positions: snapshot.map(|s| s.positions.len()).unwrap_or(0),
                pending_orders: snapshot.map(|s| s.pending_orders.len()).unwrap_or(0),
                updated_at: snapshot.map(|s| s.timestamp),
            };
            group_totals.add(&row);
            totals.add(&row);
            rows.push(row);
        }

        brokers.push(BrokerSummary {
            broker: broker.to_string(),
            accounts: rows,
            totals: group_totals,
        });
    }

    AccountsSummary {
        generated_at: now,
        brokers,
        totals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::account::AccountRegistryEntry;
    use crate::domain::entities::snapshot::{BalanceOperation, BalanceOperationKind, SchemaVersion};

    fn snapshot(login: Login, balance: f64, timestamp: DateTime<Utc>) -> Arc<AccountSnapshot> {
        Arc::new(AccountSnapshot {
            login,
            broker: String::new(),
            server: String::new(),
            balance,
            equity: balance + 10.0,
            margin: 0.0,
            free_margin: 0.0,
            margin_level: 0.0,
            profit: 10.0,
            currency: "USD".to_string(),
            leverage: 100,
            timestamp,
            positions: vec![],
            pending_orders: vec![],
            closed_deals: vec![],
            balance_operations: vec![BalanceOperation {
                ticket: 1,
                kind: BalanceOperationKind::Deposit,
                amount: balance,
                time: None,
                comment: String::new(),
            }],
            ingested_at: timestamp,
            schema: SchemaVersion::Current,
        })
    }

    fn registry() -> AccountRegistry {
        AccountRegistry::new(vec![
            AccountRegistryEntry::new(1, "icm", "ICM-1", "c1", "Alpha"),
            AccountRegistryEntry::new(2, "pepper", "PEP-1", "c2", "Beta"),
            AccountRegistryEntry::new(3, "icm", "ICM-1", "c3", "Alpha"),
        ])
        .unwrap()
    }

    #[test]
    fn test_summary_groups_and_totals() {
        let now = Utc::now();
        let mut snapshots = HashMap::new();
        snapshots.insert(1, snapshot(1, 1000.0, now));
        snapshots.insert(2, snapshot(2, 2000.0, now - Duration::minutes(10)));

        let summary = build_summary(&registry(), &snapshots, now, Duration::seconds(90));

        assert_eq!(summary.brokers.len(), 2);
        assert_eq!(summary.brokers[0].broker, "icm");
        assert_eq!(summary.brokers[0].accounts.len(), 2);
        assert_eq!(summary.brokers[0].totals.balance, 1000.0);
        assert_eq!(summary.totals.accounts, 3);
        assert_eq!(summary.totals.accounts_with_data, 2);
        assert_eq!(summary.totals.accounts_without_data, 1);
        assert_eq!(summary.totals.stale_accounts, 1);
        assert_eq!(summary.totals.balance, 3000.0);
        assert_eq!(summary.totals.equity, 3020.0);
        assert_eq!(summary.totals.allocated, 3000.0);
        assert_eq!(summary.brokers[1].accounts[0].health, AccountHealth::Stale);
    }

    #[test]
    fn test_summary_is_idempotent() {
        let now = Utc::now();
        let mut snapshots = HashMap::new();
        snapshots.insert(1, snapshot(1, 1000.1, now));
        snapshots.insert(2, snapshot(2, 2000.2, now));
        snapshots.insert(3, snapshot(3, 0.3, now));

        let first = build_summary(&registry(), &snapshots, now, Duration::seconds(90));
        let second = build_summary(&registry(), &snapshots, now, Duration::seconds(90));
        assert_eq!(first.totals, second.totals);
        assert_eq!(first, second);
    }
}
