// dbsnapshot/src/backup/logic.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::archive;
use super::db_dump::SnapshotProducer;
use super::naming::{ArtifactName, ArtifactPattern};
use super::retention::{RetentionPolicy, RetentionPruner};
use crate::config::{DatabaseSettings, Settings};
use crate::errors::{BackupError, ErrorKind};
use crate::storage::destination::{AmbientCredentials, resolve_destination};
use crate::storage::{ArtifactStore, StoredArtifact, open_store};
use crate::utils::interrupt::Interrupt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Dumping,
    Compressing,
    Uploading,
    Pruning,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    /// The stage that was running when the invocation failed.
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

/// Structured report of one invocation, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub status: BackupStatus,
    pub database: String,
    pub destination: Option<String>,
    pub artifact: Option<String>,
    pub location: Option<String>,
    pub bytes_transferred: u64,
    pub checksum: Option<String>,
    pub pruned_count: usize,
    pub prune_failures: usize,
    pub final_stage: Stage,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<FailureDetail>,
}

impl BackupResult {
    pub fn succeeded(&self) -> bool {
        self.status != BackupStatus::Failed
    }

    /// The result of an invocation whose configuration could not be loaded.
    pub fn rejected(database: Option<&str>, reason: String) -> Self {
        BackupRun::new(database.unwrap_or_default()).fail(BackupError::InvalidConfig(reason))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// Forces the local directory even when a bucket is configured.
    pub local_only: bool,
    /// Overrides `BACKUP_RETENTION_DAYS` for this invocation.
    pub retention_days: Option<u32>,
}

impl BackupRequest {
    fn retention(&self, settings: &Settings) -> RetentionPolicy {
        RetentionPolicy::new(self.retention_days.unwrap_or(settings.retention_days))
    }
}

/// Tracks stage transitions and accumulates the result of one invocation.
struct BackupRun {
    result: BackupResult,
}

impl BackupRun {
    fn new(database: &str) -> Self {
        let now = Utc::now();
        Self {
            result: BackupResult {
                status: BackupStatus::Ok,
                database: database.to_string(),
                destination: None,
                artifact: None,
                location: None,
                bytes_transferred: 0,
                checksum: None,
                pruned_count: 0,
                prune_failures: 0,
                final_stage: Stage::Idle,
                warnings: Vec::new(),
                started_at: now,
                finished_at: now,
                error: None,
            },
        }
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!("Stage {:?} -> {:?}", self.result.final_stage, stage);
        self.result.final_stage = stage;
    }

    fn warn(&mut self, warning: impl Into<String>) {
        self.result.warnings.push(warning.into());
    }

    fn record_artifact(&mut self, stored: &StoredArtifact) {
        self.result.artifact = Some(stored.name.clone());
        self.result.location = Some(stored.location.to_string());
        self.result.bytes_transferred = stored.size;
        self.result.checksum = Some(stored.sha256.clone());
    }

    fn skip(mut self, reason: String) -> BackupResult {
        tracing::warn!("⏭ Backup skipped: {}", reason);
        self.warn(reason);
        self.result.status = BackupStatus::Skipped;
        self.result.final_stage = Stage::Done;
        self.result.finished_at = Utc::now();
        self.result
    }

    fn fail(mut self, error: BackupError) -> BackupResult {
        let stage = self.result.final_stage;
        tracing::error!("❌ Backup failed during {:?}: {}", stage, error);
        self.result.status = BackupStatus::Failed;
        self.result.error = Some(FailureDetail {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        });
        self.result.final_stage = Stage::Failed;
        self.result.finished_at = Utc::now();
        self.result
    }

    fn finish(mut self) -> BackupResult {
        self.enter(Stage::Done);
        self.result.finished_at = Utc::now();
        self.result
    }
}

/// Runs one backup invocation end to end: resolve, dump, compress, upload, prune.
///
/// Never returns an error; every outcome is described by the returned result.
pub async fn perform_backup_orchestration(
    settings: &Settings,
    request: &BackupRequest,
    ambient: &dyn AmbientCredentials,
    producer: &dyn SnapshotProducer,
    interrupt: &Interrupt,
) -> BackupResult {
    let database = &settings.database;
    let mut run = BackupRun::new(&database.name);

    if !database.engine.requires_backup() {
        let reason = if database.defaulted {
            "DATABASE_URL not set; assuming the sqlite development database, which needs no backup"
                .to_string()
        } else {
            format!(
                "{} databases are file based and need no server-side backup",
                database.engine.as_str()
            )
        };
        return run.skip(reason);
    }

    // Resolution happens before any dump starts, so a bad destination leaves nothing behind.
    let resolved = interrupt
        .bound(resolve_destination(&settings.storage, request.local_only, ambient))
        .await;
    let resolution = match resolved {
        Ok(resolution) => resolution,
        Err(e) => return run.fail(e),
    };
    tracing::debug!("Resolved {} destination", resolution.destination.mode());
    if let Some(warning) = resolution.warning {
        run.warn(warning);
    }
    let store = match open_store(&resolution.destination, &settings.storage.staging_dir).await {
        Ok(store) => store,
        Err(e) => return run.fail(e),
    };
    run.result.destination = Some(store.describe());
    tracing::info!(
        "🚀 Backing up {} ({}) to {}",
        database.name,
        database.engine.as_str(),
        store.describe()
    );

    let produced = produce_artifact(
        &mut run,
        producer,
        store.as_ref(),
        database,
        settings.dump_timeout,
        interrupt,
    )
    .await;
    let stored = match produced {
        Ok(stored) => stored,
        Err(e) => return run.fail(e),
    };

    run.enter(Stage::Pruning);
    prune_after_backup(
        &mut run,
        store.as_ref(),
        database,
        request.retention(settings),
        &stored.name,
        interrupt,
    )
    .await;

    tracing::info!(
        "✅ Backup complete: {} ({} bytes)",
        stored.location,
        stored.size
    );
    run.finish()
}

async fn produce_artifact(
    run: &mut BackupRun,
    producer: &dyn SnapshotProducer,
    store: &dyn ArtifactStore,
    database: &DatabaseSettings,
    dump_timeout: Duration,
    interrupt: &Interrupt,
) -> Result<StoredArtifact, BackupError> {
    interrupt.check()?;
    run.enter(Stage::Dumping);
    let dump_interrupt = interrupt.narrowed(dump_timeout);
    // Dropping the dump on interrupt kills the child process.
    let mut dump = dump_interrupt.bound(producer.start()).await?;
    let name = ArtifactName::new(&database.name, database.engine, Utc::now());

    run.enter(Stage::Compressing);
    let staged = archive::compress_stream(dump.reader(), store.staging_dir(), &dump_interrupt).await?;
    dump_interrupt.bound(dump.finish()).await?;
    tracing::info!(
        "🗜 Dump compressed: {:.1} KB -> {:.1} KB",
        staged.raw_size as f64 / 1024.0,
        staged.size as f64 / 1024.0
    );

    interrupt.check()?;
    run.enter(Stage::Uploading);
    let stored = store.put(&name.file_name(), staged, interrupt).await?;
    run.record_artifact(&stored);
    Ok(stored)
}

/// Best effort: failures here become warnings, never a failed backup.
async fn prune_after_backup(
    run: &mut BackupRun,
    store: &dyn ArtifactStore,
    database: &DatabaseSettings,
    policy: RetentionPolicy,
    keep: &str,
    interrupt: &Interrupt,
) {
    if policy.max_age_days == 0 {
        tracing::info!("Retention is 0 days; pruning disabled");
        return;
    }
    if let Err(e) = interrupt.check() {
        run.warn(format!("pruning skipped: {}", e));
        return;
    }

    let pattern = ArtifactPattern::new(&database.name, database.engine);
    let report = RetentionPruner::new(store, &pattern, policy)
        .prune(Some(keep), Utc::now(), Some(interrupt))
        .await;
    match report {
        Ok(report) => {
            run.result.pruned_count = report.deleted.len();
            run.result.prune_failures = report.failed.len();
            for (name, reason) in &report.failed {
                run.warn(format!("failed to delete {}: {}", name, reason));
            }
            if report.interrupted {
                run.warn("pruning stopped early; remaining expired backups are left for the next run");
            }
        }
        Err(e) => {
            tracing::warn!("⚠️ Pruning skipped: {}", e);
            run.warn(format!("pruning skipped: {}", e));
        }
    }
}

/// Prunes the destination without producing a new artifact.
pub async fn perform_prune(
    settings: &Settings,
    request: &BackupRequest,
    ambient: &dyn AmbientCredentials,
    interrupt: &Interrupt,
) -> BackupResult {
    let database = &settings.database;
    let mut run = BackupRun::new(&database.name);

    let resolved = interrupt
        .bound(resolve_destination(&settings.storage, request.local_only, ambient))
        .await;
    let resolution = match resolved {
        Ok(resolution) => resolution,
        Err(e) => return run.fail(e),
    };
    if let Some(warning) = resolution.warning {
        run.warn(warning);
    }
    let store = match open_store(&resolution.destination, &settings.storage.staging_dir).await {
        Ok(store) => store,
        Err(e) => return run.fail(e),
    };
    run.result.destination = Some(store.describe());

    let policy = request.retention(settings);
    if policy.max_age_days == 0 {
        return run.skip("retention is 0 days; pruning disabled".to_string());
    }

    run.enter(Stage::Pruning);
    let pattern = ArtifactPattern::new(&database.name, database.engine);
    let report = RetentionPruner::new(store.as_ref(), &pattern, policy)
        .prune(None, Utc::now(), Some(interrupt))
        .await;
    match report {
        Ok(report) => {
            run.result.pruned_count = report.deleted.len();
            run.result.prune_failures = report.failed.len();
            for (name, reason) in &report.failed {
                run.warn(format!("failed to delete {}: {}", name, reason));
            }
            if report.interrupted {
                run.warn("pruning stopped early");
            }
            run.finish()
        }
        Err(e) => run.fail(e),
    }
}

/// One artifact found at the destination.
#[derive(Debug, Clone, Serialize)]
pub struct ListedArtifact {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub age_days: i64,
}

/// Artifacts for the configured database, newest first.
pub async fn list_backups(
    store: &dyn ArtifactStore,
    database: &DatabaseSettings,
) -> Result<Vec<ListedArtifact>, BackupError> {
    let pattern = ArtifactPattern::new(&database.name, database.engine);
    let now = Utc::now();
    let mut listed: Vec<ListedArtifact> = store
        .list()
        .await?
        .into_iter()
        .filter_map(|name| {
            let parsed = pattern.parse(&name)?;
            Some(ListedArtifact {
                age_days: now.signed_duration_since(parsed.created_at).num_days(),
                created_at: parsed.created_at,
                name,
            })
        })
        .collect();
    listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(listed)
}
