//! Server configuration, parsed from a TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use heirloom_core::{HolderKey, HolderKeyRef};
use heirloom_inherit::UnlockPolicy;
use heirloom_notify::NotifyConfig;
use heirloom_vault::FileKeyring;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DB_FILE: &str = "heirloom.db";

/// Top-level server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// General server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Policy given to vaults provisioned without one
    #[serde(default)]
    pub policy: UnlockPolicy,

    /// Where holder keys come from
    #[serde(default)]
    pub keyring: KeyringSection,

    /// Reminder lead days and the email transport
    #[serde(default)]
    pub notifications: NotifyConfig,
}

/// General server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Data directory (SQLite DB)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between maintenance cycles (default: 15 minutes)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Parallel check-in sweep workers, one connection each
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How long a connection waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sweep_interval_secs: default_sweep_interval(),
            workers: default_workers(),
            log_level: default_log_level(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Holder key files and the optional passphrase escrow key
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyringSection {
    /// Directory of `<holder_ref>.key` files
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,

    /// Passphrase for the escrow holder key (self-only vaults)
    #[serde(default)]
    pub escrow_passphrase: Option<String>,

    /// Argon2id salt for the escrow key, at least 8 bytes
    #[serde(default)]
    pub escrow_salt: Option<String>,

    /// Holder reference the escrow key answers to
    #[serde(default = "default_escrow_ref")]
    pub escrow_ref: String,
}

impl Default for KeyringSection {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
            escrow_passphrase: None,
            escrow_salt: None,
            escrow_ref: default_escrow_ref(),
        }
    }
}

impl std::fmt::Debug for KeyringSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringSection")
            .field("keys_dir", &self.keys_dir)
            .field(
                "escrow_passphrase",
                &self.escrow_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("escrow_salt", &self.escrow_salt)
            .field("escrow_ref", &self.escrow_ref)
            .finish()
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_sweep_interval() -> u64 {
    900 // 15 minutes
}

fn default_workers() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_busy_timeout() -> u64 {
    5000
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("/data/keys")
}

fn default_escrow_ref() -> String {
    "escrow".to_string()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `HEIRLOOM_DATA_DIR`
    /// - `HEIRLOOM_SWEEP_INTERVAL`
    /// - `HEIRLOOM_WORKERS`
    /// - `HEIRLOOM_LOG_LEVEL`
    /// - `HEIRLOOM_KEYS_DIR`
    /// - `HEIRLOOM_ESCROW_PASSPHRASE`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HEIRLOOM_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEIRLOOM_SWEEP_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.server.sweep_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("HEIRLOOM_WORKERS") {
            if let Ok(workers) = v.parse::<u32>() {
                self.server.workers = workers;
            }
        }
        if let Ok(v) = std::env::var("HEIRLOOM_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_KEYS_DIR") {
            self.keyring.keys_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEIRLOOM_ESCROW_PASSPHRASE") {
            self.keyring.escrow_passphrase = Some(v);
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.server.sweep_interval_secs >= 60,
            "server.sweep_interval_secs must be >= 60"
        );
        anyhow::ensure!(self.server.workers >= 1, "server.workers must be >= 1");

        self.policy
            .validate()
            .context("policy section is not a valid unlock policy")?;

        if self.keyring.escrow_passphrase.is_some() {
            let salt = self.keyring.escrow_salt.as_deref().unwrap_or("");
            anyhow::ensure!(
                salt.len() >= 8,
                "keyring.escrow_salt must be at least 8 bytes when a passphrase is set"
            );
            anyhow::ensure!(
                !self.keyring.escrow_ref.is_empty(),
                "keyring.escrow_ref must not be empty"
            );
        }

        anyhow::ensure!(
            self.notifications.batch_size >= 1,
            "notifications.batch_size must be >= 1"
        );

        // If email notifications configured, need core SMTP fields
        if let Some(ref email) = self.notifications.email {
            if email.enabled {
                email
                    .validate()
                    .map_err(|e| anyhow::anyhow!("notifications.email: {}", e))?;
                anyhow::ensure!(
                    !email.smtp_user.is_empty(),
                    "notifications.email.smtp_user must not be empty"
                );
            }
        }

        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join(DB_FILE)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.server.busy_timeout_ms)
    }

    /// Build the file keyring, deriving the escrow key if a passphrase is set.
    pub fn build_keyring(&self) -> Result<FileKeyring> {
        let keyring = FileKeyring::new(&self.keyring.keys_dir);
        let Some(passphrase) = self.keyring.escrow_passphrase.as_deref() else {
            return Ok(keyring);
        };
        let salt = self
            .keyring
            .escrow_salt
            .as_deref()
            .context("keyring.escrow_salt is required with a passphrase")?;
        let key = HolderKey::derive_from_passphrase(passphrase, salt.as_bytes())
            .context("Failed to derive escrow key")?;
        Ok(keyring.with_escrow(HolderKeyRef::from(self.keyring.escrow_ref.as_str()), key))
    }
}

// ============================================================================
// Tests
// ============================================================================
