use thiserror::Error;

/// Result type for stash operations
pub type StashResult<T> = Result<T, StashError>;

/// Errors that can occur during stash operations
#[derive(Error, Debug)]
pub enum StashError {
    #[error("File size {size} exceeds limit of {max} bytes")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("Total size limit of {max} bytes exceeded ({used} used, {incoming} incoming)")]
    QuotaExceeded { used: u64, incoming: u64, max: u64 },

    #[error("Conflicting offset: expected {expected}, got {got}")]
    ConflictingOffset { expected: u64, got: u64 },

    #[error("File not found: {id}")]
    NotFound { id: String },

    #[error("Duplicate file id: {id}")]
    DuplicateId { id: String },

    #[error("Upload session not found: {upload_id}")]
    UploadNotFound { upload_id: String },

    #[error("Too many open uploads: {open} open, at most {max} allowed")]
    TooManyUploads { open: usize, max: usize },

    #[error("Size mismatch: expected {expected} bytes, stored {actual}")]
    IntegrityFailure { expected: u64, actual: u64 },

    #[error("Transfer aborted: {reason}")]
    Aborted { reason: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    #[error("Storage I/O error: {source}")]
    StorageIo {
        #[from]
        source: std::io::Error,
    },
}

impl StashError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an aborted transfer error
    pub fn aborted<S: Into<String>>(reason: S) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Create an upload not found error
    pub fn upload_not_found<S: Into<String>>(upload_id: S) -> Self {
        Self::UploadNotFound {
            upload_id: upload_id.into(),
        }
    }

    /// Create a configuration error
    pub fn config<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Outcomes that are part of normal operation and should not be logged
    /// as failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::UploadNotFound { .. }
                | Self::TooManyUploads { .. }
                | Self::PayloadTooLarge { .. }
                | Self::QuotaExceeded { .. }
                | Self::ConflictingOffset { .. }
                | Self::Aborted { .. }
        )
    }

    /// Admission rejections: nothing was written, nothing needs undoing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge { .. } | Self::QuotaExceeded { .. }
        )
    }
}
