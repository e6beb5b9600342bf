//! # Data lifecycle core
//!
//! Four engines share one [`Store`] handle:
//!
//! - [`ExportEngine`] builds an ownership-scoped [`Snapshot`](crate::model::Snapshot).
//! - [`ImportEngine`] replays a snapshot into a destination owner, rebuilding
//!   primary keys and remapping foreign keys inside one store transaction.
//! - [`BackupStorage`] persists snapshots as JSON files isolated per owner.
//! - [`ArchiveEngine`] moves aged notifications into archive tables and purges
//!   stale logs and reset codes.
//!
//! [`Lifecycle`] wires them together from a [`Config`] and composes the
//! multi-step flows the outer surfaces need (save a backup, restore from one).
//!
//! ```text
//!   export ──► Snapshot ──► BackupStorage (backup_user<id>_<ts>.json)
//!                 │                 │
//!                 ▼                 ▼
//!              import ◄────── read_backup (ownership checked)
//!
//!   archive (independent): notifications ─► archived_notifications
//! ```

pub mod archive;
pub mod backup;
pub mod export;
pub mod import;

pub use archive::{ArchiveEngine, ArchiveOutcome, ArchiveStats, ArchiveStep, FullArchiveReport};
pub use backup::{BackupFile, BackupStorage};
pub use export::ExportEngine;
pub use import::{ImportCounts, ImportEngine, ImportResult, ImportStep, OwnerLocks, RestoreOptions};

use std::error::Error as StdError;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::model::RecordId;
use crate::store::{Store, StoreError};

/// `days` days before `at`, or `None` when that falls outside chrono's range.
pub(crate) fn days_before(at: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|span| at.checked_sub_signed(span))
}

/// Errors surfaced by the lifecycle engines. Each variant has a stable [`code`](Self::code).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("owner #{0} not found")]
    OwnerNotFound(RecordId),

    #[error("export failed: {0}")]
    ExportFailed(#[source] StoreError),

    #[error("invalid snapshot format: {0}")]
    InvalidSnapshotFormat(String),

    #[error("import failed during {step}: {source}")]
    ImportFailed {
        step: ImportStep,
        #[source]
        source: StoreError,
    },

    #[error("backup {filename} not found")]
    BackupNotFound { filename: String },

    #[error("backup {filename} is corrupt: {reason}")]
    BackupCorrupt { filename: String, reason: String },

    #[error("could not persist backup to {}: {source}", path.display())]
    BackupPersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup storage at {} is unavailable: {source}", path.display())]
    BackupStorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive run failed during {step}: {source}")]
    ArchiveRunFailed {
        step: ArchiveStep,
        #[source]
        source: StoreError,
    },
}

/// Caller-facing rendering of a [`LifecycleError`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub detail: Option<String>,
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::OwnerNotFound(_) => "OWNER_NOT_FOUND",
            LifecycleError::ExportFailed(_) => "EXPORT_FAILED",
            LifecycleError::InvalidSnapshotFormat(_) => "INVALID_SNAPSHOT_FORMAT",
            LifecycleError::ImportFailed { .. } => "IMPORT_FAILED",
            LifecycleError::BackupNotFound { .. } => "BACKUP_NOT_FOUND",
            LifecycleError::BackupCorrupt { .. } => "BACKUP_CORRUPT",
            LifecycleError::BackupPersistFailed { .. } => "BACKUP_PERSIST_FAILED",
            LifecycleError::BackupStorageUnavailable { .. } => "BACKUP_STORAGE_UNAVAILABLE",
            LifecycleError::ArchiveRunFailed { .. } => "ARCHIVE_RUN_FAILED",
        }
    }

    /// Message that is safe to show any caller: no paths, no store internals.
    pub fn public_message(&self) -> String {
        match self {
            LifecycleError::OwnerNotFound(id) => format!("owner #{} not found", id),
            LifecycleError::ExportFailed(_) => "export failed".to_string(),
            LifecycleError::InvalidSnapshotFormat(reason) => {
                format!("invalid snapshot format: {}", reason)
            }
            LifecycleError::ImportFailed { step, .. } => format!("import failed during {}", step),
            LifecycleError::BackupNotFound { filename } => format!("backup {} not found", filename),
            LifecycleError::BackupCorrupt { filename, .. } => {
                format!("backup {} is corrupt", filename)
            }
            LifecycleError::BackupPersistFailed { .. } => "backup could not be saved".to_string(),
            LifecycleError::BackupStorageUnavailable { .. } => {
                "backup storage is unavailable".to_string()
            }
            LifecycleError::ArchiveRunFailed { step, .. } => {
                format!("archive run failed during {}", step)
            }
        }
    }

    /// Render for a caller; `debug` adds the full error chain.
    pub fn to_response(&self, debug: bool) -> ErrorResponse {
        let detail = if debug {
            let mut chain = self.to_string();
            let mut source = StdError::source(self);
            while let Some(cause) = source {
                chain.push_str(": ");
                chain.push_str(&cause.to_string());
                source = cause.source();
            }
            Some(chain)
        } else {
            None
        };
        ErrorResponse {
            code: self.code(),
            message: self.public_message(),
            detail,
        }
    }
}

/// The four engines, built from one store handle and one configuration.
#[derive(Clone)]
pub struct Lifecycle {
    pub export: ExportEngine,
    pub import: ImportEngine,
    pub backups: BackupStorage,
    pub archive: ArchiveEngine,
}

impl Lifecycle {
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            export: ExportEngine::new(store.clone()),
            import: ImportEngine::new(store.clone()),
            backups: BackupStorage::new(config.backup.clone()),
            archive: ArchiveEngine::new(store, config.archive.clone()),
        }
    }

    /// Export `owner_id` and persist the snapshot as a new backup file.
    pub fn save_backup(&self, owner_id: RecordId) -> Result<BackupFile, LifecycleError> {
        let snapshot = self.export.export_snapshot(owner_id)?;
        self.backups.write_backup(owner_id, &snapshot)
    }

    /// Restore one of `owner_id`'s own backups into `owner_id`.
    pub fn restore_from_backup(
        &self,
        owner_id: RecordId,
        filename: &str,
        options: RestoreOptions,
    ) -> Result<ImportResult, LifecycleError> {
        let snapshot = self.backups.read_backup(owner_id, filename)?;
        self.import.restore_snapshot(owner_id, &snapshot, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_hides_cause_unless_debug() {
        let err = LifecycleError::ImportFailed {
            step: ImportStep::Eggs,
            source: StoreError::NotFound("couples:42".to_string()),
        };
        let public = err.to_response(false);
        assert_eq!(public.code, "IMPORT_FAILED");
        assert_eq!(public.message, "import failed during eggs");
        assert!(public.detail.is_none());

        let debug = err.to_response(true);
        assert!(debug.detail.unwrap().contains("couples:42"));
    }

    #[test]
    fn persist_failure_message_has_no_path() {
        let err = LifecycleError::BackupPersistFailed {
            path: PathBuf::from("/srv/secret/backups"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.public_message().contains("/srv/secret"));
        assert_eq!(err.code(), "BACKUP_PERSIST_FAILED");
    }
}
