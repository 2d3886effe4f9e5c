use thiserror::Error;

use crate::domain::entities::account::Login;

/// Malformed or unusable snapshot file
#[derive(Debug, Error)]
pub enum SnapshotParseError {
    #[error("snapshot file is empty")]
    Empty,

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("snapshot belongs to account {found}, expected {expected}")]
    LoginMismatch { expected: Login, found: Login },

    #[error("unrecognized timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Failures reading the snapshot directory
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot directory {path} unavailable: {source}")]
    DirectoryUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse snapshot for account {login}: {source}")]
    Parse {
        login: Login,
        #[source]
        source: SnapshotParseError,
    },
}

/// Terminal process would not stop, start or accept a login
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessControlError {
    #[error("no terminal executable configured")]
    NotConfigured,

    #[error("failed to launch {path}: {message}")]
    SpawnFailed { path: String, message: String },

    #[error("terminal {path} exited during startup with {status}")]
    ExitedEarly { path: String, status: String },

    #[error("terminal did not stop: {0}")]
    StopFailed(String),

    #[error("terminal is not running")]
    NotRunning,

    #[error("login rejected for account {login}: {message}")]
    LoginRejected { login: Login, message: String },

    #[error("login call for account {login} timed out after {timeout_ms}ms")]
    LoginTimedOut { login: Login, timeout_ms: u64 },
}

/// Invalid account registry definition
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid registry JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("account {0} is defined more than once")]
    DuplicateLogin(Login),

    #[error("account {login} has an empty {field}")]
    MissingField { login: Login, field: &'static str },
}

/// Errors surfaced by the bridge service and its HTTP API
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("account {0} is not in the registry")]
    AccountNotFound(Login),

    #[error("recovery job {0} not found")]
    JobNotFound(String),

    #[error("recovery job {active_job} is already in progress")]
    Conflict { active_job: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    ProcessControl(#[from] ProcessControlError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// Caller mistake or expected contention
    Minor,
    /// Degraded data, service keeps running
    Moderate,
    /// Operator attention required
    Critical,
}

impl BridgeError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BridgeError::AccountNotFound(_)
            | BridgeError::JobNotFound(_)
            | BridgeError::Conflict { .. }
            | BridgeError::InvalidRequest(_) => ErrorSeverity::Minor,
            BridgeError::Snapshot(_) => ErrorSeverity::Moderate,
            BridgeError::ProcessControl(_) | BridgeError::Registry(_) => ErrorSeverity::Critical,
        }
    }
}
