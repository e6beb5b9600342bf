//! # Configuration Management Module
//!
//! Plain key/value configuration for the lifecycle core, stored as TOML.
//!
//! ## Configuration File Format
//!
//! ```toml
//! debug = false
//!
//! [storage]
//! data_dir = "./data"
//!
//! [backup]
//! root = "./data/backups"
//! per_owner_subfolder = true
//! max_backups_per_user = 10
//! retention_days = 30
//!
//! [archive]
//! notification_days = 30
//! push_notification_days = 60
//! audit_log_days = 365
//!
//! [logging]
//! level = "info"
//! file = "colombier.log"
//! ```
//!
//! Every section and field has a default, so a partial file (or an empty one)
//! is valid. A value of `0` for `max_backups_per_user` or `retention_days`
//! disables that half of the retention policy.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Upper bound for every day-count setting (about a century).
pub const MAX_POLICY_DAYS: i64 = 36_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Include underlying causes in error responses.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Optional override for the sled database path; defaults to `<data_dir>/register`.
    #[serde(default)]
    pub db_path: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Root directory for backup files.
    #[serde(default = "default_backup_root")]
    pub root: String,
    /// Keep each owner's backups in a `user_<id>` subfolder.
    #[serde(default = "default_true")]
    pub per_owner_subfolder: bool,
    /// Newest backups kept per owner (0 = unlimited).
    #[serde(default = "default_max_backups")]
    pub max_backups_per_user: usize,
    /// Backups older than this many days are pruned (0 = keep forever).
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_backup_root() -> String {
    "./data/backups".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_backups() -> usize {
    10
}

fn default_retention_days() -> i64 {
    30
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_backup_root(),
            per_owner_subfolder: true,
            max_backups_per_user: default_max_backups(),
            retention_days: default_retention_days(),
        }
    }
}

/// Age thresholds for the archive engine, in days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Read notifications older than this are archived.
    #[serde(default = "default_notification_days")]
    pub notification_days: i64,
    /// Read push notifications are archived this long after being read.
    #[serde(default = "default_push_notification_days")]
    pub push_notification_days: i64,
    /// Audit logs older than this are deleted.
    #[serde(default = "default_audit_log_days")]
    pub audit_log_days: i64,
}

fn default_notification_days() -> i64 {
    30
}

fn default_push_notification_days() -> i64 {
    60
}

fn default_audit_log_days() -> i64 {
    365
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            notification_days: default_notification_days(),
            push_notification_days: default_push_notification_days(),
            audit_log_days: default_audit_log_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    /// Separate file for `security` target records (cross-owner access attempts).
    #[serde(default)]
    pub security_file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: Some("colombier.log".to_string()),
            security_file: Some("colombier-security.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject thresholds that would archive or prune everything immediately,
    /// or that reach further back than a timestamp can express.
    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_POLICY_DAYS).contains(&self.backup.retention_days) {
            return Err(anyhow!(
                "backup.retention_days must be between 0 and {}",
                MAX_POLICY_DAYS
            ));
        }
        for (name, days) in [
            ("archive.notification_days", self.archive.notification_days),
            ("archive.push_notification_days", self.archive.push_notification_days),
            ("archive.audit_log_days", self.archive.audit_log_days),
        ] {
            if !(1..=MAX_POLICY_DAYS).contains(&days) {
                return Err(anyhow!(
                    "{} must be between 1 and {} days",
                    name,
                    MAX_POLICY_DAYS
                ));
            }
        }
        Ok(())
    }

    /// Resolved location of the register database.
    pub fn db_path(&self) -> PathBuf {
        match &self.storage.db_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.storage.data_dir).join("register"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            storage: StorageConfig::default(),
            backup: BackupConfig::default(),
            archive: ArchiveConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
