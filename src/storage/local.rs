// dbsnapshot/src/storage/local.rs
use async_trait::async_trait;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{ArtifactLocation, ArtifactStore, FetchedArtifact, StoredArtifact};
use crate::backup::archive::StagedArtifact;
use crate::errors::BackupError;
use crate::utils::interrupt::Interrupt;

pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Artifacts as plain files in one directory, each with a `sha256sum`-style sidecar.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn open(dir: &Path) -> Result<Self, BackupError> {
        fs::create_dir_all(dir).map_err(BackupError::local_write(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sidecar_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, CHECKSUM_SUFFIX))
    }

    fn write_sidecar(&self, name: &str, sha256: &str) -> Result<(), BackupError> {
        let target = self.sidecar_path(name);
        let mut temp = tempfile::Builder::new()
            .prefix(".checksum-")
            .suffix(".partial")
            .tempfile_in(&self.dir)
            .map_err(BackupError::local_write(&target))?;
        writeln!(temp, "{}  {}", sha256, name).map_err(BackupError::local_write(&target))?;
        temp.persist(&target)
            .map_err(|e| BackupError::local_write(&target)(e.error))?;
        Ok(())
    }
}

/// Reads the digest from a `sha256sum`-format file, if present and well formed.
pub fn read_checksum_file(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let digest = content.split_whitespace().next()?;
    let valid = digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit());
    valid.then(|| digest.to_ascii_lowercase())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    fn describe(&self) -> String {
        format!("local:{}", self.dir.display())
    }

    fn staging_dir(&self) -> &Path {
        &self.dir
    }

    async fn put(
        &self,
        name: &str,
        artifact: StagedArtifact,
        interrupt: &Interrupt,
    ) -> Result<StoredArtifact, BackupError> {
        interrupt.check()?;
        let target = self.dir.join(name);

        // Never replace an existing artifact: its checksum file belongs to it.
        if let Err(e) = artifact.file.persist_noclobber(&target) {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                tracing::warn!("⚠️ {} already exists; keeping the earlier backup", target.display());
            }
            return Err(BackupError::local_write(&target)(e.error));
        }
        // A crash before the checksum lands leaves an artifact that restores unverified.
        if let Err(e) = self.write_sidecar(name, &artifact.sha256) {
            let _ = remove_if_present(&target);
            return Err(e);
        }

        tracing::info!("💾 Backup stored at {}", target.display());
        Ok(StoredArtifact {
            name: name.to_string(),
            location: ArtifactLocation::Local(target),
            size: artifact.size,
            sha256: artifact.sha256,
        })
    }

    async fn list(&self) -> Result<Vec<String>, BackupError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            BackupError::Unexpected(anyhow::Error::new(e).context(format!(
                "Failed to list backup directory {}",
                self.dir.display()
            )))
        })?;

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<(), BackupError> {
        let target = self.dir.join(name);
        remove_if_present(&target).map_err(BackupError::local_write(&target))?;
        let sidecar = self.sidecar_path(name);
        remove_if_present(&sidecar).map_err(BackupError::local_write(&sidecar))?;
        Ok(())
    }

    async fn fetch(&self, name: &str, _scratch_dir: &Path) -> Result<FetchedArtifact, BackupError> {
        let path = self.dir.join(name);
        if !path.is_file() {
            return Err(BackupError::InvalidConfig(format!(
                "backup file not found: {}",
                path.display()
            )));
        }
        let recorded = read_checksum_file(&self.sidecar_path(name));
        Ok(FetchedArtifact::in_place(path, recorded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::compress_stream;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn interrupt() -> Interrupt {
        Interrupt::new(CancellationToken::new(), Duration::from_secs(60))
    }

    async fn stage(store: &LocalStore, body: &[u8]) -> StagedArtifact {
        let mut reader = Cursor::new(body.to_vec());
        compress_stream(&mut reader, store.staging_dir(), &interrupt())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_renames_into_place_and_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let staged = stage(&store, b"SELECT 1;\n").await;
        let digest = staged.sha256.clone();

        let stored = store
            .put("app-20240101-000000.sql.gz", staged, &interrupt())
            .await
            .unwrap();

        assert_eq!(
            stored.location,
            ArtifactLocation::Local(dir.path().join("app-20240101-000000.sql.gz"))
        );
        assert_eq!(
            store.list().await.unwrap(),
            vec![
                "app-20240101-000000.sql.gz".to_string(),
                "app-20240101-000000.sql.gz.sha256".to_string(),
            ]
        );
        let fetched = store
            .fetch("app-20240101-000000.sql.gz", dir.path())
            .await
            .unwrap();
        assert_eq!(fetched.recorded_sha256, Some(digest));
    }

    #[tokio::test]
    async fn interrupted_put_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let staged = stage(&store, b"SELECT 1;\n").await;

        let token = CancellationToken::new();
        token.cancel();
        let stopped = Interrupt::new(token, Duration::from_secs(60));
        assert!(store.put("app-20240101-000000.sql.gz", staged, &stopped).await.is_err());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_name_put_keeps_the_first_artifact_and_its_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let first = stage(&store, b"SELECT 1;\n").await;
        let second = stage(&store, b"SELECT 2;\n").await;
        let first_digest = first.sha256.clone();
        assert_ne!(first_digest, second.sha256);

        store
            .put("app-20240101-000000.sql.gz", first, &interrupt())
            .await
            .unwrap();
        let err = store
            .put("app-20240101-000000.sql.gz", second, &interrupt())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::LocalWriteFailed);

        let artifact = dir.path().join("app-20240101-000000.sql.gz");
        assert_eq!(crate::backup::archive::sha256_file(&artifact).unwrap(), first_digest);
        let fetched = store
            .fetch("app-20240101-000000.sql.gz", dir.path())
            .await
            .unwrap();
        assert_eq!(fetched.recorded_sha256, Some(first_digest));
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deleting_missing_artifact_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.delete("app-20240101-000000.sql.gz").await.unwrap();
    }

    #[tokio::test]
    async fn delete_removes_sidecar_too() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let staged = stage(&store, b"SELECT 1;\n").await;
        store
            .put("app-20240101-000000.sql.gz", staged, &interrupt())
            .await
            .unwrap();

        store.delete("app-20240101-000000.sql.gz").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn checksum_file_must_hold_a_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.sha256");
        let digest = "a".repeat(64);
        fs::write(&good, format!("{}  app.sql.gz\n", digest)).unwrap();
        assert_eq!(read_checksum_file(&good), Some(digest));

        let bad = dir.path().join("bad.sha256");
        fs::write(&bad, "not-a-digest\n").unwrap();
        assert_eq!(read_checksum_file(&bad), None);
        assert_eq!(read_checksum_file(&dir.path().join("absent.sha256")), None);
    }
}
