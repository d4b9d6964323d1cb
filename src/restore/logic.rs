// dbsnapshot/src/restore/logic.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

use super::db_restore::RestoreSink;
use super::verification::{Verification, normalize_digest, verify_artifact};
use crate::config::{DatabaseEngine, DatabaseSettings, Settings, redact_url};
use crate::errors::BackupError;
use crate::storage::destination::{AmbientCredentials, RemoteTarget, resolve_credentials};
use crate::storage::local::LocalStore;
use crate::storage::s3::S3Store;
use crate::storage::{ArtifactLocation, ArtifactStore};
use crate::utils::interrupt::Interrupt;

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub location: ArtifactLocation,
    /// Database to load into; defaults to `DATABASE_URL`.
    pub target_url: Option<String>,
    /// Operator-supplied checksum, preferred over the recorded one.
    pub expected_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub location: String,
    pub target: String,
    pub verified: bool,
    pub sha256: Option<String>,
    pub bytes_restored: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The database a restore writes into. File-based engines are refused.
pub fn restore_target(
    settings: &Settings,
    request: &RestoreRequest,
) -> Result<DatabaseSettings, BackupError> {
    let target = match &request.target_url {
        Some(url) => DatabaseSettings::parse(url)
            .map_err(|e| BackupError::InvalidConfig(format!("invalid restore target: {:#}", e)))?,
        None => settings.database.clone(),
    };
    if target.engine == DatabaseEngine::Sqlite {
        let reason = if target.defaulted {
            "DATABASE_URL not set and no --target-url given; nothing to restore into"
        } else {
            "sqlite databases are restored by copying the database file"
        };
        return Err(BackupError::InvalidConfig(reason.to_string()));
    }
    Ok(target)
}

/// Opens the store holding `location` and returns it with the artifact's name there.
async fn open_source(
    location: &ArtifactLocation,
    settings: &Settings,
    ambient: &dyn AmbientCredentials,
) -> Result<(Box<dyn ArtifactStore>, String), BackupError> {
    match location {
        ArtifactLocation::Local(path) => {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    BackupError::InvalidConfig(format!("{} does not name a backup file", path.display()))
                })?
                .to_string();
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            Ok((Box::new(LocalStore::open(dir)?), name))
        }
        ArtifactLocation::Remote { bucket, key } => {
            let credentials = resolve_credentials(&settings.storage, ambient).await?;
            let target = RemoteTarget {
                bucket: bucket.clone(),
                prefix: String::new(),
                region: settings.storage.region.clone(),
                endpoint_url: settings.storage.endpoint_url.clone(),
                credentials,
            };
            let store = S3Store::connect(&target, settings.storage.staging_dir.clone()).await;
            Ok((Box::new(store), key.clone()))
        }
    }
}

/// Fetch, verify, decompress and replay one artifact.
pub async fn perform_restore_orchestration(
    settings: &Settings,
    request: &RestoreRequest,
    ambient: &dyn AmbientCredentials,
    sink: &dyn RestoreSink,
    interrupt: &Interrupt,
) -> Result<RestoreReport, BackupError> {
    let started_at = Utc::now();
    let target = restore_target(settings, request)?;
    let expected = request
        .expected_sha256
        .as_deref()
        .map(normalize_digest)
        .transpose()?;

    let (store, name) = open_source(&request.location, settings, ambient).await?;
    tracing::info!("🔄 Restoring {} into {}", request.location, redact_url(&target.url));

    let staging_dir = &settings.storage.staging_dir;
    std::fs::create_dir_all(staging_dir).map_err(BackupError::local_write(staging_dir))?;
    let scratch = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(staging_dir)
        .map_err(BackupError::local_write(staging_dir))?;

    let fetched = interrupt.bound(store.fetch(&name, scratch.path())).await?;

    let expected = expected.or_else(|| fetched.recorded_sha256.clone());
    let verification = verify_artifact(&fetched.path, &name, expected.as_deref()).await?;

    interrupt.check()?;
    let bytes_restored = sink.load(&fetched.path, interrupt).await?;

    let (verified, sha256) = match verification {
        Verification::Verified { sha256 } => (true, Some(sha256)),
        Verification::Unverified => (false, None),
    };
    tracing::info!("✅ Restore of {} complete", name);
    Ok(RestoreReport {
        location: request.location.to_string(),
        target: redact_url(&target.url),
        verified,
        sha256,
        bytes_restored,
        started_at,
        finished_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{compress_stream, decompress_stream};
    use crate::errors::ErrorKind;
    use crate::storage::destination::tests::{StaticProbe, storage};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const DUMP: &[u8] = b"CREATE TABLE orders (id int);\nINSERT INTO orders VALUES (7);\n";

    #[derive(Default)]
    struct RecordingSink {
        replayed: Mutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl RestoreSink for RecordingSink {
        async fn load(&self, artifact: &Path, interrupt: &Interrupt) -> Result<u64, BackupError> {
            let mut plain: Vec<u8> = Vec::new();
            let n = decompress_stream(artifact, &mut plain, interrupt).await?;
            *self.replayed.lock().unwrap() = Some(plain);
            Ok(n)
        }
    }

    fn interrupt() -> Interrupt {
        Interrupt::new(CancellationToken::new(), Duration::from_secs(60))
    }

    fn settings_for(staging: &Path) -> Settings {
        let mut storage = storage(None);
        storage.staging_dir = staging.to_path_buf();
        Settings {
            database: DatabaseSettings::parse("postgres://app@localhost:5432/app").unwrap(),
            storage,
            retention_days: 30,
            dump_timeout: Duration::from_secs(60),
            deadline: Duration::from_secs(120),
        }
    }

    /// Writes a compressed artifact and its sidecar, returning the artifact path and digest.
    async fn stored_artifact(dir: &Path) -> (PathBuf, String) {
        let store = LocalStore::open(dir).unwrap();
        let mut reader = Cursor::new(DUMP.to_vec());
        let staged = compress_stream(&mut reader, dir, &interrupt()).await.unwrap();
        let digest = staged.sha256.clone();
        let stored = store
            .put("app-20240101-000000.sql.gz", staged, &interrupt())
            .await
            .unwrap();
        match stored.location {
            ArtifactLocation::Local(path) => (path, digest),
            other => panic!("expected local location, got {}", other),
        }
    }

    fn request(path: PathBuf) -> RestoreRequest {
        RestoreRequest {
            location: ArtifactLocation::Local(path),
            target_url: None,
            expected_sha256: None,
        }
    }

    #[tokio::test]
    async fn restores_with_recorded_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let (path, digest) = stored_artifact(dir.path()).await;
        let sink = RecordingSink::default();

        let report = perform_restore_orchestration(
            &settings_for(dir.path()),
            &request(path),
            &StaticProbe(false),
            &sink,
            &interrupt(),
        )
        .await
        .unwrap();

        assert!(report.verified);
        assert_eq!(report.sha256, Some(digest));
        assert_eq!(report.bytes_restored, DUMP.len() as u64);
        assert_eq!(sink.replayed.lock().unwrap().as_deref(), Some(DUMP));
    }

    #[tokio::test]
    async fn checksum_mismatch_aborts_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = stored_artifact(dir.path()).await;
        let sink = RecordingSink::default();
        let mut req = request(path);
        req.expected_sha256 = Some("0".repeat(64));

        let err = perform_restore_orchestration(
            &settings_for(dir.path()),
            &req,
            &StaticProbe(false),
            &sink,
            &interrupt(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::IntegrityMismatch);
        assert!(sink.replayed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_checksum_restores_unverified() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = stored_artifact(dir.path()).await;
        std::fs::remove_file(dir.path().join("app-20240101-000000.sql.gz.sha256")).unwrap();
        let sink = RecordingSink::default();

        let report = perform_restore_orchestration(
            &settings_for(dir.path()),
            &request(path),
            &StaticProbe(false),
            &sink,
            &interrupt(),
        )
        .await
        .unwrap();

        assert!(!report.verified);
        assert_eq!(sink.replayed.lock().unwrap().as_deref(), Some(DUMP));
    }

    #[tokio::test]
    async fn sqlite_target_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = stored_artifact(dir.path()).await;
        let mut req = request(path);
        req.target_url = Some("sqlite://db.sqlite3".to_string());

        let err = perform_restore_orchestration(
            &settings_for(dir.path()),
            &req,
            &StaticProbe(false),
            &RecordingSink::default(),
            &interrupt(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn unknown_local_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = perform_restore_orchestration(
            &settings_for(dir.path()),
            &request(dir.path().join("app-20990101-000000.sql.gz")),
            &StaticProbe(false),
            &RecordingSink::default(),
            &interrupt(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn remote_restore_without_credentials_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let req = RestoreRequest {
            location: "s3://prod-backups/db-backups/app-20240101-000000.sql.gz"
                .parse()
                .unwrap(),
            target_url: None,
            expected_sha256: None,
        };

        let err = perform_restore_orchestration(
            &settings_for(dir.path()),
            &req,
            &StaticProbe(false),
            &RecordingSink::default(),
            &interrupt(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialsMissing);
    }
}
