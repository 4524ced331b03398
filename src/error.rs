//! Error types for the offline library
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are categorized by domain (download, file, manifest, state) so the
//! library store can decide what to surface to the user and whether a failed
//! download may be retried.
//!
//! ## Propagation
//!
//! - Executor-level transfer failures never escape the worker: they become a
//!   `failed` job status plus a failure event.
//! - Manifest read failures are logged and degrade to an empty manifest.
//! - Library store actions catch every error and keep `user_message()` in
//!   the store's `error` field. Nothing here is fatal to the process.

use thiserror::Error;

/// Result type alias using our LibraryError type
pub type Result<T> = std::result::Result<T, LibraryError>;

/// Main error type for the offline library
#[derive(Error, Debug)]
pub enum LibraryError {
    // ===== Download Errors =====

    /// Generic download failure
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Server returned unexpected status code
    #[error("Server responded with unexpected status code: {status_code}")]
    UnexpectedStatusCode {
        status_code: u16,
        url: String,
    },

    /// Invalid download URL format or protocol
    #[error("Invalid download URL: {0}")]
    InvalidDownloadUrl(String),

    /// Resumed transfer reported a different total size than the bytes on disk allow
    #[error("Download file size mismatch: expected {expected} bytes, got {actual} bytes")]
    FileSizeMismatch {
        expected: u64,
        actual: u64,
    },

    /// Download job does not exist in the registry
    #[error("Download not found: {0}")]
    JobNotFound(String),

    /// Download blocked by the user's offline settings
    #[error("Download not allowed: {0}")]
    PolicyViolation(String),

    // ===== File/Storage Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Download quota would be exceeded
    #[error("Download quota exceeded (need {need} bytes, limit {limit} bytes)")]
    QuotaExceeded {
        need: u64,
        limit: u64,
    },

    /// Manifest could not be read or written
    #[error("Library metadata error: {0}")]
    ManifestError(String),

    // ===== Configuration/State Errors =====

    /// Job state does not allow the requested operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ===== General Errors =====

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Executor has been shut down
    #[error("Download executor is shut down")]
    Shutdown,

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// Helper methods for creating common errors
impl LibraryError {
    /// Create a JobNotFound error for a download id
    pub fn job_not_found<S: Into<String>>(download_id: S) -> Self {
        LibraryError::JobNotFound(download_id.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        LibraryError::InvalidInput(message.into())
    }

    /// Create an InvalidState error with a message
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        LibraryError::InvalidState(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        LibraryError::InternalError(message.into())
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        LibraryError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Check if a failed download may succeed when retried
    ///
    /// Returns `true` for transfer-level failures (network drops, server
    /// errors, reqwest/io errors while streaming). Policy, input and state
    /// errors will fail again with the same inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            LibraryError::NetworkError { is_transient, .. } => *is_transient,
            LibraryError::UnexpectedStatusCode { status_code, .. } => {
                *status_code >= 500 || *status_code == 408 || *status_code == 429
            }
            LibraryError::DownloadFailed(_)
            | LibraryError::FileSizeMismatch { .. }
            | LibraryError::ReqwestError(_)
            | LibraryError::IoError(_)
            | LibraryError::FileIoError(_) => true,
            _ => false,
        }
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            LibraryError::FileNotFound(_)
                | LibraryError::FileIoError(_)
                | LibraryError::QuotaExceeded { .. }
                | LibraryError::ManifestError(_)
                | LibraryError::IoError(_)
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            LibraryError::QuotaExceeded { need, limit } => {
                format!(
                    "Not enough download space left. This download needs {} MB but your limit is {} MB.",
                    need / 1_000_000,
                    limit / 1_000_000
                )
            }
            LibraryError::PolicyViolation(reason) => reason.clone(),
            LibraryError::NetworkError { .. } | LibraryError::ReqwestError(_) => {
                "Download failed because of a network problem. Please try again.".to_string()
            }
            LibraryError::JobNotFound(id) => {
                format!("Download '{}' no longer exists.", id)
            }
            _ => self.to_string(),
        }
    }
}
