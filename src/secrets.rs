//! Account credential resolution
//!
//! Registry entries carry a credential reference, never a password. The
//! reference is resolved at login time and the password is held in a
//! `Zeroizing<String>` so it is wiped from memory when dropped.
//!
//! Supported references:
//! - `op://vault/item/field` - read through the 1Password CLI
//! - anything else - environment variable `MT_PASSWORD_<REF>` (uppercased,
//!   non-alphanumerics replaced by `_`)

use async_trait::async_trait;
use std::collections::HashMap;
use std::env;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Prefix of environment variables holding account passwords
pub const PASSWORD_ENV_PREFIX: &str = "MT_PASSWORD_";

/// Error type for credential resolution
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("1Password CLI error: {0}")]
    OnePasswordError(String),

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Lookup of {credential_ref} timed out after {timeout_ms}ms")]
    TimedOut {
        credential_ref: String,
        timeout_ms: u64,
    },
}

/// Resolve a credential reference to a password
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn resolve(&self, credential_ref: &str) -> Result<Zeroizing<String>, SecretError>;
}

/// Environment variable name for a plain credential reference
pub fn env_var_for(credential_ref: &str) -> String {
    let suffix: String = credential_ref
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", PASSWORD_ENV_PREFIX, suffix)
}

/// Production source: 1Password references through `op`, the rest from env
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource;

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn resolve(&self, credential_ref: &str) -> Result<Zeroizing<String>, SecretError> {
        if credential_ref.starts_with("op://") {
            return load_from_op_cli(credential_ref).await;
        }
        let var = env_var_for(credential_ref);
        debug!("Resolving credential '{}' from {}", credential_ref, var);
        load_from_env(&var)
    }
}

/// Fixed in-memory credentials
#[derive(Default)]
pub struct StaticCredentials {
    secrets: HashMap<String, Zeroizing<String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential_ref: &str, password: &str) -> Self {
        self.secrets.insert(
            credential_ref.to_string(),
            Zeroizing::new(password.to_string()),
        );
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn resolve(&self, credential_ref: &str) -> Result<Zeroizing<String>, SecretError> {
        self.secrets
            .get(credential_ref)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(credential_ref.to_string()))
    }
}

/// Load a secret from 1Password CLI
async fn load_from_op_cli(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    let output = Command::new("op")
        .arg("read")
        .arg(reference)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            SecretError::OnePasswordError(format!("Failed to execute 'op' command: {}", e))
        })?;

    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        warn!("1Password CLI failed for {}", reference);
        return Err(SecretError::OnePasswordError(format!(
            "1Password CLI failed: {}",
            error_msg.trim()
        )));
    }

    let secret = Zeroizing::new(
        String::from_utf8(output.stdout)
            .map_err(|e| {
                SecretError::OnePasswordError(format!("Invalid UTF-8 from 1Password: {}", e))
            })?
            .trim()
            .to_string(),
    );

    if secret.is_empty() {
        return Err(SecretError::OnePasswordError(
            "1Password returned empty secret".to_string(),
        ));
    }

    Ok(secret)
}

/// Load a secret from environment variable (wrapped in Zeroizing)
fn load_from_env(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    match env::var(env_var_name) {
        Ok(value) if !value.is_empty() => Ok(Zeroizing::new(value)),
        _ => Err(SecretError::EnvVarNotSet(env_var_name.to_string())),
    }
}
