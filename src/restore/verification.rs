// dbsnapshot/src/restore/verification.rs
use std::path::Path;

use crate::backup::archive::sha256_file;
use crate::errors::BackupError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { sha256: String },
    /// No checksum was supplied or recorded; the restore proceeds with a warning.
    Unverified,
}

/// Lower-case hex SHA-256, or `InvalidConfig` for anything else.
pub fn normalize_digest(raw: &str) -> Result<String, BackupError> {
    let digest = raw.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BackupError::InvalidConfig(format!(
            "{} is not a SHA-256 hex digest",
            raw.trim()
        )));
    }
    Ok(digest)
}

/// Compares the artifact's SHA-256 with `expected`.
pub async fn verify_artifact(
    artifact: &Path,
    artifact_name: &str,
    expected: Option<&str>,
) -> Result<Verification, BackupError> {
    let Some(expected) = expected else {
        tracing::warn!(
            "⚠️ No checksum available for {}; restoring without integrity verification",
            artifact_name
        );
        return Ok(Verification::Unverified);
    };
    let expected = normalize_digest(expected)?;

    let path = artifact.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| BackupError::Unexpected(anyhow::Error::new(e).context("checksum task panicked")))?
        .map_err(|e| {
            BackupError::Unexpected(
                anyhow::Error::new(e).context(format!("Failed to read {}", artifact.display())),
            )
        })?;

    if actual != expected {
        return Err(BackupError::IntegrityMismatch {
            artifact: artifact_name.to_string(),
            expected,
            actual,
        });
    }
    tracing::info!("✓ Checksum verified for {}", artifact_name);
    Ok(Verification::Verified { sha256: actual })
}
