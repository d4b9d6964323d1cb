pub(crate) mod db_restore; // Replays a dump through psql / mysql
mod logic; // Fetch, verify, replay
pub(crate) mod verification; // Checksum verification

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::errors::BackupError;
use crate::storage::destination::DefaultChainProbe;
use crate::utils::interrupt::Interrupt;
use db_restore::ClientCommand;

pub use logic::{RestoreReport, RestoreRequest, restore_target};

/// Public entry point for the manual restore path.
pub async fn run_restore_flow(
    settings: &Settings,
    request: RestoreRequest,
    shutdown: CancellationToken,
) -> Result<RestoreReport, BackupError> {
    let interrupt = Interrupt::new(shutdown, settings.deadline);
    let target = restore_target(settings, &request)?;
    let client = ClientCommand::new(&target);
    logic::perform_restore_orchestration(settings, &request, &DefaultChainProbe, &client, &interrupt)
        .await
}
