// src/error.rs

use thiserror::Error;

/// Core error types for BPM
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization errors for metadata documents
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Malformed archive, manifest or metadata document
    #[error("Format error: {0}")]
    FormatError(String),

    /// Package or dependency missing from every catalog and the root
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Conflicting packages in the planned state
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Another operation owns the target root
    #[error("Lock file {0} is held by another operation")]
    LockHeld(String),

    /// Download failure
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Checksum of a fetched archive did not match
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Lifecycle script exited unsuccessfully
    #[error("Script {script} of package {package} failed: {status}")]
    ScriptError {
        package: String,
        script: String,
        status: String,
    },

    /// Package built for another architecture
    #[error("Package {package} is built for {found}, expected {expected}")]
    ArchitectureMismatch {
        package: String,
        expected: String,
        found: String,
    },

    /// A second action for a package already in the action list
    #[error("An action for package {0} is already planned")]
    DuplicateAction(String),

    /// Requested behavior is not supported by this implementation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Failure while executing a single action
    #[error("Failed to {action} package {package}: {source}")]
    ActionFailed {
        action: &'static str,
        package: String,
        #[source]
        source: Box<Error>,
    },

    /// Target root does not exist
    #[error("Root directory not found at path: {0}")]
    DatabaseNotFound(String),
}

/// Result type alias using BPM's Error type
pub type Result<T> = std::result::Result<T, Error>;
