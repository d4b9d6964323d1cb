// dbsnapshot/src/backup/retention.rs
use chrono::{DateTime, Duration, Utc};

use super::naming::ArtifactPattern;
use crate::errors::BackupError;
use crate::storage::ArtifactStore;
use crate::utils::interrupt::Interrupt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl RetentionPolicy {
    pub fn new(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    pub fn max_age(&self) -> Duration {
        Duration::days(i64::from(self.max_age_days))
    }

    /// Strictly older than the window; an artifact exactly at the limit is kept.
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(created_at) > self.max_age()
    }
}

#[derive(Debug, Default, Clone)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Entries at the destination that do not follow the naming scheme.
    pub ignored: usize,
    pub interrupted: bool,
}

/// Deletes expired artifacts at one destination.
pub struct RetentionPruner<'a> {
    store: &'a dyn ArtifactStore,
    pattern: &'a ArtifactPattern,
    policy: RetentionPolicy,
}

impl<'a> RetentionPruner<'a> {
    pub fn new(store: &'a dyn ArtifactStore, pattern: &'a ArtifactPattern, policy: RetentionPolicy) -> Self {
        Self {
            store,
            pattern,
            policy,
        }
    }

    /// Runs one pruning pass.
    ///
    /// `keep` names the artifact produced by the current invocation; it is never a
    /// candidate regardless of its computed age. Only a failure to list is returned as
    /// an error; individual delete failures are recorded and the pass moves on.
    pub async fn prune(
        &self,
        keep: Option<&str>,
        now: DateTime<Utc>,
        interrupt: Option<&Interrupt>,
    ) -> Result<PruneReport, BackupError> {
        let mut report = PruneReport::default();
        let names = match interrupt {
            Some(interrupt) => interrupt.bound(self.store.list()).await?,
            None => self.store.list().await?,
        };

        for name in names {
            let Some(artifact) = self.pattern.parse(&name) else {
                report.ignored += 1;
                continue;
            };

            if keep == Some(name.as_str()) || !self.policy.is_expired(artifact.created_at, now) {
                continue;
            }

            if let Some(interrupt) = interrupt {
                if let Err(e) = interrupt.check() {
                    tracing::warn!("Pruning stopped early: {}", e);
                    report.interrupted = true;
                    break;
                }
            }

            let outcome = match interrupt {
                Some(interrupt) => tokio::select! {
                    outcome = self.store.delete(&name) => outcome,
                    stop = interrupt.triggered() => {
                        tracing::warn!("Pruning stopped early: {}", stop);
                        report.interrupted = true;
                        break;
                    }
                },
                None => self.store.delete(&name).await,
            };
            match outcome {
                Ok(()) => {
                    tracing::info!("🗑 Deleted old backup: {}", name);
                    report.deleted.push(name);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Failed to delete old backup {}: {}", name, e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}
