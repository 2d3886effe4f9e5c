//! Failure detector
//!
//! State machine over the whole registry, not per account. A global outage is
//! declared only when every enabled account is stale, zero-balance or missing
//! for `debounce_cycles` consecutive evaluations; one healthy reading resets
//! the streak.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::entities::account::Login;
use crate::domain::entities::snapshot::AccountSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Normal,
    Suspect,
    Triggered,
}

/// Health of one enabled account as seen at the start of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountHealth {
    Healthy,
    ZeroBalance,
    Stale,
    NoData,
}

impl AccountHealth {
    /// Classify the latest cached snapshot of one account
    pub fn of(snapshot: Option<&AccountSnapshot>, now: DateTime<Utc>, stale_after: Duration) -> Self {
        match snapshot {
            None => AccountHealth::NoData,
            Some(s) if s.is_stale(now, stale_after) => AccountHealth::Stale,
            Some(s) if s.has_zero_balance() => AccountHealth::ZeroBalance,
            Some(_) => AccountHealth::Healthy,
        }
    }

    pub fn is_outage(&self) -> bool {
        !matches!(self, AccountHealth::Healthy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountReading {
    pub login: Login,
    pub health: AccountHealth,
}

/// What the caller must do after an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogDecision {
    Hold,
    LaunchRecovery,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub state: DetectorState,
    pub consecutive_outage_cycles: u32,
    pub debounce_cycles: u32,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_readings: Vec<AccountReading>,
    pub recoveries_launched: u64,
}

#[derive(Debug, Clone)]
pub struct FailureDetector {
    debounce_cycles: u32,
    state: DetectorState,
    consecutive: u32,
    last_evaluated_at: Option<DateTime<Utc>>,
    last_readings: Vec<AccountReading>,
    recoveries_launched: u64,
}

/// Debounce below two cycles would restart on a single bad tick
pub const MIN_DEBOUNCE_CYCLES: u32 = 2;

impl FailureDetector {
    pub fn new(debounce_cycles: u32) -> Self {
        Self {
            debounce_cycles: debounce_cycles.max(MIN_DEBOUNCE_CYCLES),
            state: DetectorState::Normal,
            consecutive: 0,
            last_evaluated_at: None,
            last_readings: Vec::new(),
            recoveries_launched: 0,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn consecutive_outage_cycles(&self) -> u32 {
        self.consecutive
    }

    /// All readings report an outage; an empty registry never does
    pub fn is_global_outage(readings: &[AccountReading]) -> bool {
        !readings.is_empty() && readings.iter().all(|r| r.health.is_outage())
    }

    /// Run one evaluation cycle.
    ///
    /// `readings` must be taken at one instant for the whole registry.
    /// `recovery_active` is whether a recovery job is currently non-terminal.
    pub fn evaluate(
        &mut self,
        readings: Vec<AccountReading>,
        recovery_active: bool,
        now: DateTime<Utc>,
    ) -> WatchdogDecision {
        let outage = Self::is_global_outage(&readings);
        self.last_evaluated_at = Some(now);
        self.last_readings = readings;

        if self.state == DetectorState::Triggered {
            if !recovery_active {
                self.state = DetectorState::Normal;
                self.consecutive = 0;
            }
            return WatchdogDecision::Hold;
        }

        if !outage {
            self.state = DetectorState::Normal;
            self.consecutive = 0;
            return WatchdogDecision::Hold;
        }

        self.consecutive = self.consecutive.saturating_add(1);
        if self.consecutive >= self.debounce_cycles {
            self.state = DetectorState::Suspect;
        }

        if self.state == DetectorState::Suspect && !recovery_active {
            self.state = DetectorState::Triggered;
            self.recoveries_launched += 1;
            return WatchdogDecision::LaunchRecovery;
        }
        WatchdogDecision::Hold
    }

    /// The orchestrator refused the launch (another job won the race)
    pub fn launch_rejected(&mut self) {
        if self.state == DetectorState::Triggered {
            self.state = DetectorState::Suspect;
            self.recoveries_launched = self.recoveries_launched.saturating_sub(1);
        }
    }

    pub fn status(&self) -> WatchdogStatus {
        WatchdogStatus {
            state: self.state,
            consecutive_outage_cycles: self.consecutive,
            debounce_cycles: self.debounce_cycles,
            last_evaluated_at: self.last_evaluated_at,
            last_readings: self.last_readings.clone(),
            recoveries_launched: self.recoveries_launched,
        }
    }
}
