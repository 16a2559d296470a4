// =============================================================================
// Secret Store — OS-native credential storage with environment fallback
// =============================================================================
//
// Resolution order on get():
//   1. OS keyring, scoped to the fixed service identifier.
//   2. Process environment.
//   3. On-disk `.env` (its presence is what distinguishes "fallback" from
//      "secure" in the audit trail; main() loads it into the environment at
//      startup).
//
// An env-sourced read is migrated into the keyring best-effort and recorded
// as FALLBACK_TO_ENV. No in-process cache: every get() re-reads so operator
// rotation is picked up without a restart.
// =============================================================================

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};

/// Fixed service identifier under which all secrets live in the keyring.
const SERVICE: &str = "steamwatch";

/// Canonical secret names resolved at startup.
pub const SECRET_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const SECRET_CHAT_ID: &str = "TELEGRAM_CHAT_ID";

#[derive(Debug, Error)]
pub enum SecretError {
    /// Fatal at startup: the secret exists in none of the three sources.
    #[error("required secret '{0}' not found in keyring, environment, or .env")]
    Missing(String),

    #[error("keyring operation failed for '{name}': {source}")]
    Keyring {
        name: String,
        #[source]
        source: keyring::Error,
    },
}

pub struct SecretStore {
    audit: AuditSink,
}

impl SecretStore {
    pub fn new(audit: AuditSink) -> Self {
        Self { audit }
    }

    /// Resolve a secret. Returns `None` when no source has it.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Ok(entry) = keyring::Entry::new(SERVICE, name) {
            if let Ok(value) = entry.get_password() {
                debug!(name, "secret resolved from keyring");
                return Some(value);
            }
        }

        match std::env::var(name) {
            Ok(value) if !value.is_empty() => {
                let from_dotenv = dotenv_defines(name);
                self.audit.submit(
                    AuditRecord::new("FALLBACK_TO_ENV", "secrets")
                        .field_str("name", name)
                        .field("dotenvPresent", serde_json::json!(from_dotenv)),
                );
                self.migrate(name, &value);
                Some(value)
            }
            _ => None,
        }
    }

    /// Resolve a secret that the process cannot run without.
    pub fn require(&self, name: &str) -> Result<String, SecretError> {
        self.get(name)
            .ok_or_else(|| SecretError::Missing(name.to_string()))
    }

    /// Store or rotate a secret in the keyring.
    pub fn set(&self, name: &str, value: &str) -> Result<(), SecretError> {
        let entry = keyring::Entry::new(SERVICE, name).map_err(|source| {
            SecretError::Keyring {
                name: name.to_string(),
                source,
            }
        })?;
        entry
            .set_password(value)
            .map_err(|source| SecretError::Keyring {
                name: name.to_string(),
                source,
            })?;
        self.audit.submit(
            AuditRecord::new("SECRET_ROTATED", "secrets").field_str("name", name),
        );
        Ok(())
    }

    /// Remove a secret from the keyring. Missing entries are not an error.
    pub fn delete(&self, name: &str) -> Result<(), SecretError> {
        let entry = keyring::Entry::new(SERVICE, name).map_err(|source| {
            SecretError::Keyring {
                name: name.to_string(),
                source,
            }
        })?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                self.audit.submit(
                    AuditRecord::new("SECRET_DELETED", "secrets").field_str("name", name),
                );
                Ok(())
            }
            Err(source) => Err(SecretError::Keyring {
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Best-effort migration of an env-sourced value into the keyring so the
    /// next get() resolves securely. Headless hosts without a keyring daemon
    /// stay on the env path.
    fn migrate(&self, name: &str, value: &str) {
        let outcome = keyring::Entry::new(SERVICE, name)
            .and_then(|entry| entry.set_password(value));
        match outcome {
            Ok(()) => {
                self.audit.submit(
                    AuditRecord::new("SECRET_MIGRATED", "secrets").field_str("name", name),
                );
            }
            Err(e) => warn!(name, error = %e, "could not migrate secret into keyring"),
        }
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").field("service", &SERVICE).finish()
    }
}

/// Explicit `.env` probe: true when the file exists and defines `name`.
fn dotenv_defines(name: &str) -> bool {
    if !Path::new(".env").exists() {
        return false;
    }
    match std::fs::read_to_string(".env") {
        Ok(content) => content.lines().any(|line| {
            let line = line.trim_start();
            !line.starts_with('#')
                && line
                    .split_once('=')
                    .is_some_and(|(key, _)| key.trim() == name)
        }),
        Err(_) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store() -> SecretStore {
        SecretStore::new(AuditSink::disabled(Arc::new(ManualClock::at(0))))
    }

    #[test]
    fn missing_secret_is_an_error() {
        let s = store();
        let err = s.require("STEAMWATCH_TEST_SECRET_NEVER_SET").unwrap_err();
        assert!(matches!(err, SecretError::Missing(_)));
    }

    #[test]
    fn env_fallback_resolves() {
        // Serialized by name uniqueness; env mutation is process-global.
        std::env::set_var("STEAMWATCH_TEST_ENV_SECRET", "s3cret");
        let s = store();
        assert_eq!(
            s.get("STEAMWATCH_TEST_ENV_SECRET").as_deref(),
            Some("s3cret")
        );
        std::env::remove_var("STEAMWATCH_TEST_ENV_SECRET");
    }

    #[test]
    fn empty_env_value_counts_as_missing() {
        std::env::set_var("STEAMWATCH_TEST_EMPTY_SECRET", "");
        let s = store();
        assert!(s.get("STEAMWATCH_TEST_EMPTY_SECRET").is_none());
        std::env::remove_var("STEAMWATCH_TEST_EMPTY_SECRET");
    }

    #[test]
    fn dotenv_probe_matches_keys_only() {
        // No .env in the test working directory: the probe reports false
        // rather than erroring.
        assert!(!dotenv_defines("STEAMWATCH_TEST_ENV_SECRET"));
    }
}
