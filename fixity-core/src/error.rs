use thiserror::Error;

#[derive(Error, Debug)]
pub enum FixityError {
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("No entry for file '{0}'")]
    NotFound(String),

    #[error(
        "Cannot upload '{filename}': already archived with checksum '{archived}', uploaded content has '{uploaded}'"
    )]
    InconsistentUpload {
        filename: String,
        archived: String,
        uploaded: String,
    },

    #[error("Checksum conflict for '{filename}': registered '{existing}', requested '{requested}'")]
    ChecksumConflict {
        filename: String,
        existing: String,
        requested: String,
    },

    #[error("Correction of '{filename}' does not change its checksum '{checksum}'")]
    NoOpCorrection { filename: String, checksum: String },

    #[error("Invalid upload state transition for '{filename}' on '{replica_id}': {from} -> {to}")]
    InvalidStateTransition {
        filename: String,
        replica_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FixityError {
    /// True for failures of the persistent medium (file system or database).
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, FixityError::Io(_) | FixityError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, FixityError>;
