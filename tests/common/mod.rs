//! Shared doubles for the end-to-end tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use mtbridge::domain::entities::account::{AccountRegistryEntry, Login};
use mtbridge::domain::errors::ProcessControlError;
use mtbridge::domain::repositories::terminal::{TerminalController, TerminalStatus};
use mtbridge::domain::services::account_registry::AccountRegistry;
use mtbridge::domain::services::recovery_plan::RecoveryPlan;
use mtbridge::secrets::StaticCredentials;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh per-test snapshot directory
pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "mtbridge-{}-{}-{}",
        tag,
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write a writer-format snapshot file for `login`
pub fn write_snapshot(dir: &Path, login: Login, balance: f64, age_secs: i64) {
    let body = serde_json::json!({
        "account": login,
        "server": "ICM-Live",
        "balance": balance,
        "equity": balance,
        "margin": 0.0,
        "free_margin": balance,
        "margin_level": 0.0,
        "profit": 0.0,
        "leverage": 100,
        "currency": "USD",
        "timestamp": Utc::now().timestamp() - age_secs,
        "positions": [],
        "orders": [],
        "closed_deals": [
            {"ticket": 11, "symbol": "EURUSD", "type": "buy", "volume": 0.1,
             "open_price": 1.1, "close_price": 1.2, "open_time": "2024.03.01 10:00:00",
             "close_time": "2024.03.01 12:00:00", "profit": 10.0, "swap": 0.0, "commission": -0.5},
            {"ticket": 12, "symbol": "GBPUSD", "type": "sell", "volume": 0.2,
             "open_price": 1.3, "close_price": 1.25, "open_time": "2024.03.02 10:00:00",
             "close_time": "2024.03.02 12:00:00", "profit": 20.0, "swap": 0.0, "commission": -0.5}
        ],
        "balance_operations": [
            {"ticket": 1, "amount": balance, "time": "2024.02.01 09:00:00", "comment": "initial"}
        ]
    });
    std::fs::write(
        dir.join(format!("account_{}.json", login)),
        serde_json::to_vec(&body).unwrap(),
    )
    .unwrap();
}

pub fn registry(logins: &[Login]) -> Arc<AccountRegistry> {
    Arc::new(
        AccountRegistry::new(
            logins
                .iter()
                .map(|l| {
                    AccountRegistryEntry::new(*l, "icm", "ICM-Live", format!("ref_{}", l), "Alpha")
                })
                .collect(),
        )
        .unwrap(),
    )
}

pub fn credentials(logins: &[Login]) -> Arc<StaticCredentials> {
    Arc::new(
        logins
            .iter()
            .fold(StaticCredentials::new(), |c, l| c.with(&format!("ref_{}", l), "pw")),
    )
}

pub fn fast_plan() -> RecoveryPlan {
    let mut plan = RecoveryPlan::default().with_slack(Duration::from_millis(300));
    plan.stop_grace = Duration::from_millis(10);
    plan.stop_timeout = Duration::from_millis(500);
    plan.settle_delay = Duration::from_millis(10);
    plan.start_timeout = Duration::from_millis(1000);
    plan.init_delay = Duration::from_millis(10);
    plan.login_timeout = Duration::from_millis(50);
    plan.login_retry_delay = Duration::from_millis(5);
    plan.verification_timeout = Duration::from_millis(300);
    plan.verification_poll = Duration::from_millis(20);
    plan
}

/// Terminal double. A successful login makes the "terminal" write a fresh
/// snapshot file for the account, like the real writer would.
pub struct ScriptedTerminal {
    pub snapshot_dir: PathBuf,
    pub balances: HashMap<Login, f64>,
    pub hanging_logins: HashSet<Login>,
    pub start_delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedTerminal {
    pub fn new(snapshot_dir: PathBuf) -> Self {
        Self {
            snapshot_dir,
            balances: HashMap::new(),
            hanging_logins: HashSet::new(),
            start_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn login_calls(&self, login: Login) -> usize {
        let expected = format!("login:{}", login);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == expected)
            .count()
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
        tokio::time::sleep(self.start_delay).await;
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
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let balance = self.balances.get(&account.login).copied().unwrap_or(1000.0);
        write_snapshot(&self.snapshot_dir, account.login, balance, 0);
        Ok(())
    }

    async fn status(&self) -> TerminalStatus {
        TerminalStatus {
            initialized: true,
            running_processes: 1,
            configured_executables: 1,
        }
    }
}
