use thiserror::Error;

/// regmirror error types
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed image or target reference
    #[error("Invalid reference '{reference}': {message}")]
    ReferenceError {
        reference: String,
        message: String,
    },

    /// Registry interaction failed
    #[error("Registry error: {registry}: {message}")]
    RegistryError {
        registry: String,
        message: String,
    },

    /// Object storage interaction failed
    #[error("Object storage error: {bucket}: {message}")]
    ObjectStoreError {
        bucket: String,
        message: String,
    },

    /// Credential helper failed; the caller degrades to anonymous
    #[error("Credential helper '{helper}' failed: {message}")]
    CredentialHelperError {
        helper: String,
        message: String,
    },

    /// Schema-v1 images are skipped, not mirrored
    #[error("Image '{reference}' uses manifest schema v1")]
    SchemaV1 {
        reference: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation aborted by the cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Too many image-level errors in a single run
    #[error("Aborted after {count} image sync errors")]
    TooManyErrors {
        count: usize,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::SerializationError(err.to_string())
    }
}

/// Result type alias for regmirror operations
pub type Result<T> = std::result::Result<T, SyncError>;
