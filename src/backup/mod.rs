pub(crate) mod archive; // Streaming gzip + checksum
pub(crate) mod db_dump; // Engine dump tools
mod logic; // Orchestration and result reporting
pub(crate) mod naming; // Artifact naming scheme
pub(crate) mod retention; // Age-based pruning

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::errors::BackupError;
use crate::storage::destination::{DefaultChainProbe, resolve_destination};
use crate::storage::open_store;
use crate::utils::interrupt::Interrupt;
use db_dump::DumpCommand;

pub use logic::{BackupRequest, BackupResult, ListedArtifact};

/// Public entry point for one backup invocation.
pub async fn run_backup_flow(
    settings: &Settings,
    request: BackupRequest,
    shutdown: CancellationToken,
) -> BackupResult {
    let interrupt = Interrupt::new(shutdown, settings.deadline);
    let producer = DumpCommand::new(&settings.database);
    logic::perform_backup_orchestration(settings, &request, &DefaultChainProbe, &producer, &interrupt)
        .await
}

/// Applies the retention policy to the resolved destination without taking a backup.
pub async fn run_prune_flow(
    settings: &Settings,
    request: BackupRequest,
    shutdown: CancellationToken,
) -> BackupResult {
    let interrupt = Interrupt::new(shutdown, settings.deadline);
    logic::perform_prune(settings, &request, &DefaultChainProbe, &interrupt).await
}

/// Lists the configured database's artifacts at the resolved destination.
pub async fn list_artifacts(
    settings: &Settings,
    local_only: bool,
) -> Result<(String, Vec<ListedArtifact>), BackupError> {
    let resolution = resolve_destination(&settings.storage, local_only, &DefaultChainProbe).await?;
    let store = open_store(&resolution.destination, &settings.storage.staging_dir).await?;
    let listed = logic::list_backups(store.as_ref(), &settings.database).await?;
    Ok((store.describe(), listed))
}
