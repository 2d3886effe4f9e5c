//! Account registry entry - one monitored trading account

use serde::{Deserialize, Serialize};

/// Terminal account number. Unique within the registry.
pub type Login = u64;

fn default_enabled() -> bool {
    true
}

/// Static definition of a monitored account.
///
/// Entries are created by configuration and never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRegistryEntry {
    pub login: Login,
    /// Broker code used for grouping (e.g. "icmarkets")
    pub broker: String,
    /// Trade server name the terminal logs into
    pub server: String,
    /// Name of the secret holding the account password
    pub credential_ref: String,
    /// Fund / strategy label shown in summaries
    #[serde(default)]
    pub fund: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AccountRegistryEntry {
    pub fn new(
        login: Login,
        broker: impl Into<String>,
        server: impl Into<String>,
        credential_ref: impl Into<String>,
        fund: impl Into<String>,
    ) -> Self {
        Self {
            login,
            broker: broker.into(),
            server: server.into(),
            credential_ref: credential_ref.into(),
            fund: fund.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
