//! Backup filename and record field validation.
//!
//! Backup filenames double as the ownership filter for listings, so parsing is
//! strict: anything that does not round-trip through [`backup_filename`] is
//! rejected before it reaches the filesystem.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::model::RecordId;

const BACKUP_PREFIX: &str = "backup_user";
const BACKUP_EXTENSION: &str = ".json";
/// ISO-8601 UTC with `-` in place of `:` so names stay portable.
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";

/// Maximum length accepted for short identifying text fields.
pub const MAX_LABEL_LEN: usize = 64;

/// Backup filename errors
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackupNameError {
    #[error("Backup filename contains path separators or traversal sequences")]
    PathTraversal,

    #[error("Backup filename does not follow backup_user<id>_<timestamp>.json")]
    Malformed,

    #[error("Backup filename has an invalid owner id: {0}")]
    InvalidOwner(String),

    #[error("Backup filename has an invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Field-level validation errors raised by the store on insert.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is too long (maximum {max} characters)")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains control characters")]
    ControlCharacters { field: &'static str },
}

/// Owner and creation time recovered from a backup filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupName {
    pub owner_id: RecordId,
    pub created_at: DateTime<Utc>,
}

/// Build the canonical filename for a backup taken at `created_at`.
pub fn backup_filename(owner_id: RecordId, created_at: DateTime<Utc>) -> String {
    format!(
        "{}{}_{}{}",
        BACKUP_PREFIX,
        owner_id,
        created_at.format(BACKUP_TIMESTAMP_FORMAT),
        BACKUP_EXTENSION
    )
}

/// Parse a backup filename, rejecting anything that could escape the owner directory.
pub fn parse_backup_filename(name: &str) -> Result<BackupName, BackupNameError> {
    if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(BackupNameError::PathTraversal);
    }

    let stem = name
        .strip_prefix(BACKUP_PREFIX)
        .and_then(|rest| rest.strip_suffix(BACKUP_EXTENSION))
        .ok_or(BackupNameError::Malformed)?;
    let (owner_part, ts_part) = stem.split_once('_').ok_or(BackupNameError::Malformed)?;

    if owner_part.is_empty() || !owner_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(BackupNameError::InvalidOwner(owner_part.to_string()));
    }
    let owner_id = owner_part
        .parse::<RecordId>()
        .map_err(|_| BackupNameError::InvalidOwner(owner_part.to_string()))?;

    let created_at = NaiveDateTime::parse_from_str(ts_part, BACKUP_TIMESTAMP_FORMAT)
        .map_err(|_| BackupNameError::InvalidTimestamp(ts_part.to_string()))?
        .and_utc();

    Ok(BackupName {
        owner_id,
        created_at,
    })
}

/// Validate a short label such as a nest number or a product name.
pub fn validate_label(field: &'static str, value: &str) -> Result<(), FieldError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FieldError::Empty { field });
    }
    if trimmed.chars().count() > MAX_LABEL_LEN {
        return Err(FieldError::TooLong {
            field,
            max: MAX_LABEL_LEN,
        });
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(FieldError::ControlCharacters { field });
    }
    Ok(())
}
