use thiserror::Error;

use crate::model::RecordId;
use crate::validation::FieldError;

/// Errors that can arise while interacting with the register store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when fetching a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A row failed field validation on insert.
    #[error("invalid {entity}: {source}")]
    InvalidRecord {
        entity: &'static str,
        #[source]
        source: FieldError,
    },

    /// A foreign key points at a row that does not exist (or is being deleted).
    #[error("{entity} references missing {parent} #{parent_id}")]
    DanglingReference {
        entity: &'static str,
        parent: &'static str,
        parent_id: RecordId,
    },
}
