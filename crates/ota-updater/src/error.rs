//! Error types for the update lifecycle.

use std::fmt;

use thiserror::Error;

use crate::record::UpdateStatus;

/// Single-flight roles guarded by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveRole {
    /// The download slot (STARTING/DOWNLOADING).
    Download,
    /// The install slot (INSTALLING).
    Install,
}

impl fmt::Display for ActiveRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveRole::Download => f.write_str("download"),
            ActiveRole::Install => f.write_str("install"),
        }
    }
}

/// Why a downloaded package was rejected by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    /// File length differs from the size declared by the feed
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Digest of the file differs from the declared digest
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// The archive lacks the installer entries for the install mode
    #[error("package structure mismatch: {0}")]
    StructureMismatch(String),

    /// The file could not be opened as an archive at all
    #[error("not a valid package archive: {0}")]
    NotAnArchive(String),
}

/// Coarse reason code for a verification failure.
///
/// Kept separate from [`VerifyFailure`] so retry policies can match on it
/// without caring about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyReason {
    Size,
    Hash,
    Structure,
}

impl VerifyFailure {
    pub fn reason(&self) -> VerifyReason {
        match self {
            VerifyFailure::SizeMismatch { .. } => VerifyReason::Size,
            VerifyFailure::HashMismatch { .. } => VerifyReason::Hash,
            VerifyFailure::StructureMismatch(_) | VerifyFailure::NotAnArchive(_) => {
                VerifyReason::Structure
            }
        }
    }
}

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Download failed with HTTP status
    #[error("download failed with status {status}")]
    HttpStatus { status: u16 },

    /// Network error during download
    #[error("network error: {0}")]
    Network(String),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Downloaded package failed verification
    #[error("verification failed: {0}")]
    Verification(#[from] VerifyFailure),

    /// Platform installer rejected the package
    #[error("installation failed: {0}")]
    InstallationFailed(String),

    /// Another record already holds the requested role
    #[error("{role} already active for update {active}")]
    ConcurrencyConflict { role: ActiveRole, active: String },

    /// No record with this download id
    #[error("unknown update: {0}")]
    NotFound(String),

    /// The record's current status does not allow the operation
    #[error("cannot {action} update {download_id} while {status}")]
    InvalidState {
        download_id: String,
        action: &'static str,
        status: UpdateStatus,
    },

    /// The record is info-only on this build
    #[error("update {0} is not installable on this build")]
    NotInstallable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Record store could not be loaded or saved
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// The controller has been shut down
    #[error("update controller is shut down")]
    ShutDown,

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UpdateError {
    /// Transport-class errors land a download in PAUSED_ERROR.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            UpdateError::HttpStatus { .. } | UpdateError::Network(_) | UpdateError::IoError(_)
        )
    }

    /// Whether the failed operation may be retried without a new download.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, UpdateError::InstallationFailed(_))
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => UpdateError::HttpStatus {
                status: status.as_u16(),
            },
            None => UpdateError::Network(err.to_string()),
        }
    }
}

impl From<zip::result::ZipError> for VerifyFailure {
    fn from(err: zip::result::ZipError) -> Self {
        VerifyFailure::NotAnArchive(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_reason_codes() {
        let size = VerifyFailure::SizeMismatch {
            expected: 10,
            actual: 9,
        };
        assert_eq!(size.reason(), VerifyReason::Size);

        let hash = VerifyFailure::HashMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(hash.reason(), VerifyReason::Hash);

        assert_eq!(
            VerifyFailure::NotAnArchive("eof".into()).reason(),
            VerifyReason::Structure
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(UpdateError::Network("reset".into()).is_transport());
        assert!(UpdateError::HttpStatus { status: 503 }.is_retryable());
        assert!(UpdateError::InstallationFailed("rejected".into()).is_retryable());

        let verify = UpdateError::from(VerifyFailure::StructureMismatch("x".into()));
        assert!(!verify.is_retryable());
        assert!(!UpdateError::Cancelled.is_transport());
    }

    #[test]
    fn test_conflict_message_names_role() {
        let err = UpdateError::ConcurrencyConflict {
            role: ActiveRole::Download,
            active: "abc".into(),
        };
        assert_eq!(err.to_string(), "download already active for update abc");
    }
}
