//! Terminal ports
//!
//! The recovery orchestrator drives the external trading terminal through
//! [`TerminalController`] and observes accounts through [`AccountProbe`].
//! Production implementations live in `infrastructure`; tests use scripted
//! doubles.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::domain::entities::account::AccountRegistryEntry;
use crate::domain::entities::snapshot::AccountSnapshot;
use crate::domain::errors::ProcessControlError;

/// Process-level view of the terminal(s)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TerminalStatus {
    /// At least one process is running a configured terminal image
    pub initialized: bool,
    pub running_processes: usize,
    pub configured_executables: usize,
}

/// Lifecycle control of the terminal process(es).
///
/// Every call must return within a bounded time; the orchestrator wraps them
/// in step timeouts as well.
#[async_trait]
pub trait TerminalController: Send + Sync {
    /// Stop all terminal processes, forcefully after `grace` if needed
    async fn stop(&self, grace: std::time::Duration) -> Result<(), ProcessControlError>;

    /// Launch all configured terminal processes
    async fn start(&self) -> Result<(), ProcessControlError>;

    /// Fail if a launched terminal died
    async fn ensure_running(&self) -> Result<(), ProcessControlError>;

    /// Log `account` in with its resolved password
    async fn login(
        &self,
        account: &AccountRegistryEntry,
        password: &str,
    ) -> Result<(), ProcessControlError>;

    async fn status(&self) -> TerminalStatus;
}

/// Fresh read of one account's state, used to verify a reconnection
#[async_trait]
pub trait AccountProbe: Send + Sync {
    /// Latest snapshot after re-reading the account's source, if any
    async fn probe(&self, account: &AccountRegistryEntry) -> Option<Arc<AccountSnapshot>>;
}
