// Preflight connectivity check against the source database
use sqlx::{Connection, MySqlConnection, PgConnection};

use crate::config::{DatabaseEngine, redact_url};
use crate::errors::BackupError;

/// Opens and closes one connection so an unreachable engine is reported before a dump
/// tool is spawned.
pub async fn check_db_connection(engine: DatabaseEngine, db_url: &str) -> Result<(), BackupError> {
    let outcome = match engine {
        DatabaseEngine::Postgres => match PgConnection::connect(db_url).await {
            Ok(conn) => conn.close().await,
            Err(e) => Err(e),
        },
        DatabaseEngine::MySql => match MySqlConnection::connect(db_url).await {
            Ok(conn) => conn.close().await,
            Err(e) => Err(e),
        },
        DatabaseEngine::Sqlite => return Ok(()),
    };

    match outcome {
        Ok(()) => {
            tracing::debug!("✅ Successfully connected to {}", redact_url(db_url));
            Ok(())
        }
        Err(e) => {
            tracing::error!("❌ Failed to connect to {}: {}", redact_url(db_url), e);
            Err(BackupError::SnapshotUnavailable(format!(
                "cannot connect to {} database at {}: {}",
                engine.as_str(),
                redact_url(db_url),
                e
            )))
        }
    }
}
