//! Artifact destinations.
//!
//! Local directories and S3-compatible buckets expose the same capability set behind
//! [`ArtifactStore`]; the destination resolver picks one per invocation.

pub mod destination;
pub mod local;
pub mod s3;

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::TempPath;

use crate::backup::archive::StagedArtifact;
use crate::errors::BackupError;
use crate::utils::interrupt::Interrupt;
use destination::DestinationConfig;

/// Where an artifact lives. Renders as `local:<path>` or `remote:<bucket>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactLocation::Local(path) => write!(f, "local:{}", path.display()),
            ArtifactLocation::Remote { bucket, key } => write!(f, "remote:{}/{}", bucket, key),
        }
    }
}

impl FromStr for ArtifactLocation {
    type Err = BackupError;

    /// Accepts `s3://bucket/key`, `remote:bucket/key`, `local:<path>` or a bare path.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let remote = raw
            .strip_prefix("s3://")
            .or_else(|| raw.strip_prefix("remote:"));
        if let Some(rest) = remote {
            let (bucket, key) = rest.split_once('/').ok_or_else(|| {
                BackupError::InvalidConfig(format!("remote location {} is missing an object key", raw))
            })?;
            if bucket.is_empty() || key.is_empty() {
                return Err(BackupError::InvalidConfig(format!(
                    "remote location {} needs both a bucket and a key",
                    raw
                )));
            }
            return Ok(ArtifactLocation::Remote {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let path = raw.strip_prefix("local:").unwrap_or(raw);
        if path.is_empty() {
            return Err(BackupError::InvalidConfig("empty artifact location".to_string()));
        }
        Ok(ArtifactLocation::Local(PathBuf::from(path)))
    }
}

/// Outcome of a successful put.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub name: String,
    pub location: ArtifactLocation,
    pub size: u64,
    pub sha256: String,
}

/// An artifact made available on local disk for reading.
#[derive(Debug)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    /// Checksum recorded alongside the artifact, if any.
    pub recorded_sha256: Option<String>,
    /// Keeps a downloaded copy alive; `None` when reading in place.
    _download: Option<TempPath>,
}

impl FetchedArtifact {
    pub fn in_place(path: PathBuf, recorded_sha256: Option<String>) -> Self {
        Self {
            path,
            recorded_sha256,
            _download: None,
        }
    }

    pub fn downloaded(download: TempPath, recorded_sha256: Option<String>) -> Self {
        Self {
            path: download.to_path_buf(),
            recorded_sha256,
            _download: Some(download),
        }
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Human-readable destination, e.g. `remote:bucket/db-backups/`.
    fn describe(&self) -> String;

    /// Directory the compressor should stage into before [`ArtifactStore::put`].
    fn staging_dir(&self) -> &Path;

    /// Makes the artifact visible under `name` all at once, or not at all.
    async fn put(
        &self,
        name: &str,
        artifact: StagedArtifact,
        interrupt: &Interrupt,
    ) -> Result<StoredArtifact, BackupError>;

    /// Names of every entry at the destination; callers filter by naming scheme.
    async fn list(&self) -> Result<Vec<String>, BackupError>;

    /// Removes `name`. Deleting something that is already gone succeeds.
    async fn delete(&self, name: &str) -> Result<(), BackupError>;

    async fn fetch(&self, name: &str, scratch_dir: &Path) -> Result<FetchedArtifact, BackupError>;
}

/// Opens the store a resolved destination points at.
pub async fn open_store(
    destination: &DestinationConfig,
    staging_dir: &Path,
) -> Result<Box<dyn ArtifactStore>, BackupError> {
    match destination {
        DestinationConfig::Local { dir } => Ok(Box::new(local::LocalStore::open(dir)?)),
        DestinationConfig::Remote(target) => Ok(Box::new(
            s3::S3Store::connect(target, staging_dir.to_path_buf()).await,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_locations() {
        let expected = ArtifactLocation::Remote {
            bucket: "backups".to_string(),
            key: "db-backups/app-20240101-000000.sql.gz".to_string(),
        };
        assert_eq!(
            "s3://backups/db-backups/app-20240101-000000.sql.gz"
                .parse::<ArtifactLocation>()
                .unwrap(),
            expected
        );
        assert_eq!(
            "remote:backups/db-backups/app-20240101-000000.sql.gz"
                .parse::<ArtifactLocation>()
                .unwrap(),
            expected
        );
        assert_eq!(
            expected.to_string(),
            "remote:backups/db-backups/app-20240101-000000.sql.gz"
        );
    }

    #[test]
    fn parses_local_locations() {
        let expected = ArtifactLocation::Local(PathBuf::from("backups/app-20240101-000000.sql.gz"));
        assert_eq!(
            "backups/app-20240101-000000.sql.gz".parse::<ArtifactLocation>().unwrap(),
            expected
        );
        assert_eq!(
            "local:backups/app-20240101-000000.sql.gz"
                .parse::<ArtifactLocation>()
                .unwrap(),
            expected
        );
        assert_eq!(expected.to_string(), "local:backups/app-20240101-000000.sql.gz");
    }

    #[test]
    fn rejects_incomplete_remote_locations() {
        assert!("s3://bucket-only".parse::<ArtifactLocation>().is_err());
        assert!("s3:///key".parse::<ArtifactLocation>().is_err());
        assert!("".parse::<ArtifactLocation>().is_err());
    }
}
