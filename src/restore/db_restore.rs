// dbsnapshot/src/restore/db_restore.rs
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::backup::archive::decompress_stream;
use crate::backup::db_dump::{MySqlArgs, drain_stderr};
use crate::config::{DatabaseEngine, DatabaseSettings, redact_url};
use crate::errors::BackupError;
use crate::utils::find_executable;
use crate::utils::interrupt::Interrupt;
use crate::utils::setting::check_db_connection;

/// Destination of a restore: something that replays a plain dump.
#[async_trait]
pub trait RestoreSink: Send + Sync {
    /// Loads the compressed dump at `artifact`, returning the plain bytes replayed.
    async fn load(&self, artifact: &Path, interrupt: &Interrupt) -> Result<u64, BackupError>;
}

/// Replays a dump through the engine's command-line client.
pub struct ClientCommand {
    database: DatabaseSettings,
}

impl ClientCommand {
    pub fn new(database: &DatabaseSettings) -> Self {
        Self {
            database: database.clone(),
        }
    }

    pub fn client_tool(engine: DatabaseEngine) -> Option<&'static str> {
        match engine {
            DatabaseEngine::Postgres => Some("psql"),
            DatabaseEngine::MySql => Some("mysql"),
            DatabaseEngine::Sqlite => None,
        }
    }

    fn command(&self, executable: &Path) -> Result<Command, BackupError> {
        let mut cmd = Command::new(executable);
        match self.database.engine {
            DatabaseEngine::Postgres => {
                cmd.arg("-X") // Do not read psqlrc
                    .arg("-q")
                    .arg("-v")
                    .arg("ON_ERROR_STOP=1")
                    .arg("-d")
                    .arg(&self.database.url);
            }
            DatabaseEngine::MySql => {
                let conn = MySqlArgs::from_url(&self.database.url)?;
                cmd.args(conn.args()).arg(&self.database.name);
                if let Some(password) = conn.password {
                    cmd.env("MYSQL_PWD", password);
                }
            }
            DatabaseEngine::Sqlite => return Err(sqlite_restore_error()),
        }
        Ok(cmd)
    }
}

fn sqlite_restore_error() -> BackupError {
    BackupError::InvalidConfig(
        "sqlite databases are restored by copying the database file".to_string(),
    )
}

#[async_trait]
impl RestoreSink for ClientCommand {
    async fn load(&self, artifact: &Path, interrupt: &Interrupt) -> Result<u64, BackupError> {
        let tool = Self::client_tool(self.database.engine).ok_or_else(sqlite_restore_error)?;
        let executable = find_executable(tool)?;
        interrupt
            .bound(check_db_connection(self.database.engine, &self.database.url))
            .await?;

        tracing::info!(
            "Restoring {} into {} with {}",
            artifact.display(),
            redact_url(&self.database.url),
            tool
        );
        let mut child = self
            .command(&executable)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackupError::ToolMissing { tool },
                _ => BackupError::Unexpected(
                    anyhow::Error::new(e).context(format!("Failed to execute {}", tool)),
                ),
            })?;
        let stderr = drain_stderr(child.stderr.take());

        let mut stdin = child.stdin.take().ok_or_else(|| {
            BackupError::Unexpected(anyhow::anyhow!("{} stdin was not captured", tool))
        })?;
        let replayed = match decompress_stream(artifact, &mut stdin, interrupt).await {
            Ok(n) => n,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        drop(stdin);

        // An interrupted wait drops the child, which kills it.
        let status = interrupt
            .bound(async {
                child.wait().await.map_err(|e| {
                    BackupError::Unexpected(
                        anyhow::Error::new(e).context(format!("waiting for {}", tool)),
                    )
                })
            })
            .await?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            return Err(BackupError::Unexpected(anyhow::anyhow!(
                "{} failed with status: {}\nStderr: {}",
                tool,
                status,
                stderr.trim()
            )));
        }

        tracing::info!("✓ Restored {:.1} KB of SQL with {}", replayed as f64 / 1024.0, tool);
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn client_tools_per_engine() {
        assert_eq!(ClientCommand::client_tool(DatabaseEngine::Postgres), Some("psql"));
        assert_eq!(ClientCommand::client_tool(DatabaseEngine::MySql), Some("mysql"));
        assert_eq!(ClientCommand::client_tool(DatabaseEngine::Sqlite), None);
    }

    #[tokio::test]
    async fn sqlite_target_is_rejected() {
        let database = DatabaseSettings::parse("sqlite://db.sqlite3").unwrap();
        let interrupt = Interrupt::new(CancellationToken::new(), Duration::from_secs(60));
        let err = ClientCommand::new(&database)
            .load(Path::new("app-20240101-000000.sql.gz"), &interrupt)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
