use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Stable classification of a pipeline failure, reported in `BackupResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SnapshotUnavailable,
    ToolMissing,
    CredentialsMissing,
    InvalidConfig,
    UploadFailed,
    LocalWriteFailed,
    IntegrityMismatch,
    Timeout,
    Cancelled,
    Unexpected,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Database snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("{tool} executable not found in PATH. Please ensure the database client tools are installed.")]
    ToolMissing { tool: &'static str },

    #[error("Remote storage credentials missing: {0}")]
    CredentialsMissing(String),

    #[error("Invalid backup configuration: {0}")]
    InvalidConfig(String),

    #[error("Upload to {location} failed: {detail}")]
    UploadFailed { location: String, detail: String },

    #[error("Local write to {} failed: {source}", path.display())]
    LocalWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity check failed for {artifact}: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("Operation exceeded its deadline of {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("Operation cancelled by signal")]
    Cancelled,

    #[error("Unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::SnapshotUnavailable(_) => ErrorKind::SnapshotUnavailable,
            BackupError::ToolMissing { .. } => ErrorKind::ToolMissing,
            BackupError::CredentialsMissing(_) => ErrorKind::CredentialsMissing,
            BackupError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            BackupError::UploadFailed { .. } => ErrorKind::UploadFailed,
            BackupError::LocalWriteFailed { .. } => ErrorKind::LocalWriteFailed,
            BackupError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            BackupError::Timeout { .. } => ErrorKind::Timeout,
            BackupError::Cancelled => ErrorKind::Cancelled,
            BackupError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    pub fn local_write(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> BackupError {
        let path = path.into();
        move |source| BackupError::LocalWriteFailed { path, source }
    }

    pub fn upload(location: impl Into<String>, detail: impl std::fmt::Display) -> BackupError {
        BackupError::UploadFailed {
            location: location.into(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_in_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CredentialsMissing).unwrap();
        assert_eq!(json, "\"credentials_missing\"");
    }

    #[test]
    fn anyhow_errors_become_unexpected() {
        let err: BackupError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn local_write_keeps_path_in_message() {
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left on device");
        let err = BackupError::local_write("/var/backups/x")(io);
        assert_eq!(err.kind(), ErrorKind::LocalWriteFailed);
        assert!(err.to_string().contains("/var/backups/x"));
    }
}
