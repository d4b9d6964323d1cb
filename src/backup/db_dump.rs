// dbsnapshot/src/backup/db_dump.rs
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::{DatabaseEngine, DatabaseSettings, redact_url};
use crate::errors::BackupError;
use crate::utils::find_executable;
use crate::utils::setting::check_db_connection;

/// Longest stderr tail kept for error reports.
const STDERR_LIMIT: usize = 8 * 1024;

/// Source of a consistent, engine-native dump of one database.
#[async_trait]
pub trait SnapshotProducer: Send + Sync {
    async fn start(&self) -> Result<DumpStream, BackupError>;
}

/// A running dump: read it to the end, then call [`DumpStream::finish`].
pub struct DumpStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    process: Option<DumpProcess>,
}

struct DumpProcess {
    tool: &'static str,
    child: Child,
    stderr: JoinHandle<String>,
}

impl DumpStream {
    /// Wraps an in-process byte source.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            process: None,
        }
    }

    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self.reader.as_mut()
    }

    /// Waits for the dump tool and turns a non-zero exit into `SnapshotUnavailable`.
    pub async fn finish(self) -> Result<(), BackupError> {
        let Some(mut process) = self.process else {
            return Ok(());
        };
        drop(self.reader);

        let status = process.child.wait().await.map_err(|e| {
            BackupError::SnapshotUnavailable(format!("waiting for {}: {}", process.tool, e))
        })?;
        let stderr = process.stderr.await.unwrap_or_default();

        if !status.success() {
            return Err(BackupError::SnapshotUnavailable(format!(
                "{} failed with status: {}\nStderr: {}",
                process.tool,
                status,
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!("{} stderr: {}", process.tool, stderr.trim());
        }
        Ok(())
    }
}

/// Runs the engine's dump utility as a child process.
pub struct DumpCommand {
    database: DatabaseSettings,
}

impl DumpCommand {
    pub fn new(database: &DatabaseSettings) -> Self {
        Self {
            database: database.clone(),
        }
    }

    pub fn dump_tool(engine: DatabaseEngine) -> Option<&'static str> {
        match engine {
            DatabaseEngine::Postgres => Some("pg_dump"),
            DatabaseEngine::MySql => Some("mysqldump"),
            DatabaseEngine::Sqlite => None,
        }
    }

    fn command(&self, executable: &Path) -> Result<Command, BackupError> {
        let mut cmd = Command::new(executable);
        match self.database.engine {
            DatabaseEngine::Postgres => {
                cmd.arg("--no-owner").arg("--no-acl").arg("--dbname").arg(&self.database.url);
            }
            DatabaseEngine::MySql => {
                let conn = MySqlArgs::from_url(&self.database.url)?;
                cmd.arg("--single-transaction")
                    .arg("--routines")
                    .arg("--triggers")
                    .args(conn.args())
                    .arg(&self.database.name);
                if let Some(password) = conn.password {
                    cmd.env("MYSQL_PWD", password);
                }
            }
            DatabaseEngine::Sqlite => {
                return Err(BackupError::InvalidConfig(
                    "sqlite databases have no server-side dump".to_string(),
                ));
            }
        }
        Ok(cmd)
    }
}

#[async_trait]
impl SnapshotProducer for DumpCommand {
    async fn start(&self) -> Result<DumpStream, BackupError> {
        let tool = Self::dump_tool(self.database.engine).ok_or_else(|| {
            BackupError::InvalidConfig(format!(
                "{} databases have no server-side dump",
                self.database.engine.as_str()
            ))
        })?;
        let executable = find_executable(tool)?;
        tracing::debug!("Found {} executable at: {}", tool, executable.display());

        check_db_connection(self.database.engine, &self.database.url).await?;

        tracing::info!(
            "Running {} for database {} ({})",
            tool,
            self.database.name,
            redact_url(&self.database.url)
        );
        let mut child = self
            .command(&executable)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackupError::ToolMissing { tool },
                _ => BackupError::SnapshotUnavailable(format!("Failed to execute {}: {}", tool, e)),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            BackupError::SnapshotUnavailable(format!("{} stdout was not captured", tool))
        })?;
        let stderr = drain_stderr(child.stderr.take());

        Ok(DumpStream {
            reader: Box::new(stdout),
            process: Some(DumpProcess {
                tool,
                child,
                stderr,
            }),
        })
    }
}

/// Collects the tail of a child's stderr concurrently so a chatty tool never blocks
/// on a full pipe.
pub(crate) fn drain_stderr(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut collected = Vec::new();
        let _ = stderr.read_to_end(&mut collected).await;
        let start = collected.len().saturating_sub(STDERR_LIMIT);
        String::from_utf8_lossy(&collected[start..]).into_owned()
    })
}

/// Connection flags for the MySQL client tools, which do not take URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MySqlArgs {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl MySqlArgs {
    pub fn from_url(raw: &str) -> Result<Self, BackupError> {
        let parsed = Url::parse(raw).map_err(|e| {
            BackupError::InvalidConfig(format!("invalid MySQL URL {}: {}", redact_url(raw), e))
        })?;
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        Ok(Self {
            host: parsed.host_str().unwrap_or("localhost").to_string(),
            port: parsed.port().unwrap_or(3306),
            user: Some(parsed.username()).filter(|u| !u.is_empty()).map(decode),
            password: parsed.password().map(decode),
        })
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.host.clone(),
            "-P".to_string(),
            self.port.to_string(),
        ];
        if let Some(user) = &self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        args
    }
}
