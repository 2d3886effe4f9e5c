//! Account Registry
//!
//! Static list of monitored accounts, loaded once at startup. Every other
//! component iterates the registry generically; adding an account is a
//! configuration change only.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tracing::{info, warn};

use crate::domain::entities::account::{AccountRegistryEntry, Login};
use crate::domain::errors::RegistryError;

#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    entries: Vec<AccountRegistryEntry>,
}

impl AccountRegistry {
    /// Build a registry, rejecting duplicate logins and blank fields
    pub fn new(entries: Vec<AccountRegistryEntry>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.login) {
                return Err(RegistryError::DuplicateLogin(entry.login));
            }
            if entry.broker.trim().is_empty() {
                return Err(RegistryError::MissingField {
                    login: entry.login,
                    field: "broker",
                });
            }
            if entry.server.trim().is_empty() {
                return Err(RegistryError::MissingField {
                    login: entry.login,
                    field: "server",
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        let entries: Vec<AccountRegistryEntry> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    /// Load the registry file (JSON array of entries)
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let json = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let registry = Self::from_json_str(&json)?;

        info!(
            "Account registry loaded from {}: {} accounts ({} enabled) across {} brokers",
            path.display(),
            registry.len(),
            registry.enabled().count(),
            registry.brokers().len()
        );
        if registry.is_empty() {
            warn!("Account registry is empty, nothing will be monitored");
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AccountRegistryEntry] {
        &self.entries
    }

    pub fn enabled(&self) -> impl Iterator<Item = &AccountRegistryEntry> {
        self.entries.iter().filter(|e| e.enabled)
    }

    pub fn get(&self, login: Login) -> Option<&AccountRegistryEntry> {
        self.entries.iter().find(|e| e.login == login)
    }

    pub fn brokers(&self) -> Vec<&str> {
        self.grouped_by_broker().into_keys().collect()
    }

    /// Entries grouped by broker code. Brokers sort alphabetically, entries
    /// within a broker keep registry order.
    pub fn grouped_by_broker(&self) -> BTreeMap<&str, Vec<&AccountRegistryEntry>> {
        let mut groups: BTreeMap<&str, Vec<&AccountRegistryEntry>> = BTreeMap::new();
        for entry in &self.entries {
            groups.entry(entry.broker.as_str()).or_default().push(entry);
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY_JSON: &str = r#"[
        {"login": 1001, "broker": "icm", "server": "ICMarkets-Live07", "credential_ref": "icm_1001", "fund": "Alpha"},
        {"login": 1002, "broker": "pepper", "server": "Pepperstone-Edge", "credential_ref": "pep_1002", "fund": "Beta"},
        {"login": 1003, "broker": "icm", "server": "ICMarkets-Live07", "credential_ref": "icm_1003", "fund": "Alpha", "enabled": false}
    ]"#;

    #[test]
    fn test_load_from_json() {
        let registry = AccountRegistry::from_json_str(REGISTRY_JSON).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.enabled().count(), 2);
        assert_eq!(registry.get(1002).unwrap().server, "Pepperstone-Edge");
        assert!(registry.get(4242).is_none());
    }

    #[test]
    fn test_grouped_by_broker() {
        let registry = AccountRegistry::from_json_str(REGISTRY_JSON).unwrap();
        let groups = registry.grouped_by_broker();
        assert_eq!(groups.len(), 2);
        let icm: Vec<Login> = groups["icm"].iter().map(|e| e.login).collect();
        assert_eq!(icm, vec![1001, 1003]);
        assert_eq!(registry.brokers(), vec!["icm", "pepper"]);
    }

    #[test]
    fn test_brokers_sort_alphabetically_not_by_first_entry() {
        let registry = AccountRegistry::new(vec![
            AccountRegistryEntry::new(3, "zenith", "s", "c", "f"),
            AccountRegistryEntry::new(1, "alpari", "s", "c", "f"),
            AccountRegistryEntry::new(2, "zenith", "s", "c", "f"),
        ])
        .unwrap();
        assert_eq!(registry.brokers(), vec!["alpari", "zenith"]);
        let zenith: Vec<Login> = registry.grouped_by_broker()["zenith"]
            .iter()
            .map(|e| e.login)
            .collect();
        assert_eq!(zenith, vec![3, 2]);
    }

    #[test]
    fn test_duplicate_login_rejected() {
        let entries = vec![
            AccountRegistryEntry::new(1, "b", "s", "c", "f"),
            AccountRegistryEntry::new(1, "b", "s", "c", "f"),
        ];
        assert!(matches!(
            AccountRegistry::new(entries),
            Err(RegistryError::DuplicateLogin(1))
        ));
    }

    #[test]
    fn test_blank_server_rejected() {
        let entries = vec![AccountRegistryEntry::new(7, "b", " ", "c", "f")];
        assert!(matches!(
            AccountRegistry::new(entries),
            Err(RegistryError::MissingField { login: 7, field: "server" })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = AccountRegistry::load(Path::new("/nonexistent/accounts.json")).unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }
}
