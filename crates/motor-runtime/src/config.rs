//! Environment configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration failures map to exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is not set")]
    Missing(&'static str),

    #[error("Environment variable {0} is invalid: {1}")]
    Invalid(&'static str, String),
}

/// Everything the Motor reads from its environment.
#[derive(Debug, Clone)]
pub struct MotorEnv {
    /// Master passphrase for the credential vault. Never logged.
    pub master_secret: String,
    /// Bus connection URL (`mem://local` selects the in-process transport).
    pub bus_url: String,
    /// Root directory for durable state and the vault file.
    pub data_dir: PathBuf,
    /// Canonical policy file.
    pub policy_path: PathBuf,
    /// Bus identity of this process.
    pub identity: String,
    /// Trading account.
    pub account: String,
}

impl MotorEnv {
    /// Read the environment. Missing required variables are a hard refusal.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            master_secret: require("REFLEX_MASTER_SECRET")?,
            bus_url: std::env::var("REFLEX_BUS_URL").unwrap_or_else(|_| "mem://local".to_string()),
            data_dir: PathBuf::from(
                std::env::var("REFLEX_DATA_DIR").unwrap_or_else(|_| "./reflex-data".to_string()),
            ),
            policy_path: PathBuf::from(require("REFLEX_POLICY_PATH")?),
            identity: std::env::var("REFLEX_IDENTITY").unwrap_or_else(|_| "motor".to_string()),
            account: std::env::var("REFLEX_ACCOUNT").unwrap_or_else(|_| "main".to_string()),
        })
    }

    /// Path of the credential vault file.
    #[must_use]
    pub fn vault_path(&self) -> PathBuf {
        self.data_dir.join("credentials.vault")
    }

    /// Directory of the durable Motor state.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("motor-state")
    }

    /// Path of the shadow-state snapshot.
    #[must_use]
    pub fn shadow_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("shadow.snapshot")
    }

    /// Path of the bus cursor file.
    #[must_use]
    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir.join("cursors.bin")
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) => Err(ConfigError::Invalid(name, "empty".to_string())),
        Err(_) => Err(ConfigError::Missing(name)),
    }
}
