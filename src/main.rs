//! Database snapshot tool
//!
//! Dumps, compresses, stores and prunes database backups, and restores them on demand.

// dbsnapshot/src/main.rs
mod backup;
mod config;
mod errors;
mod restore;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use backup::{BackupRequest, BackupResult};
use config::{DatabaseSettings, Settings, redact_url};
use restore::RestoreRequest;
use storage::ArtifactLocation;

#[derive(Parser, Debug)]
#[command(name = "dbsnapshot", version, about = "Database snapshot, retention and restore tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a backup now and prune expired ones
    Backup(RunArgs),
    /// Delete expired backups without taking a new one
    Prune(RunArgs),
    /// List backups of the configured database
    List {
        /// Look in the local backup directory even if a bucket is configured
        #[arg(long)]
        local_only: bool,
    },
    /// Load a backup into a database
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Store in the local backup directory even if a bucket is configured
    #[arg(long)]
    local_only: bool,
    /// Override BACKUP_RETENTION_DAYS; 0 disables pruning
    #[arg(long, value_name = "DAYS")]
    retention_days: Option<u32>,
}

impl From<RunArgs> for BackupRequest {
    fn from(args: RunArgs) -> Self {
        BackupRequest {
            local_only: args.local_only,
            retention_days: args.retention_days,
        }
    }
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// s3://bucket/key, remote:bucket/key, local:<path> or a plain path
    location: String,
    /// Database to restore into (defaults to DATABASE_URL)
    #[arg(long, value_name = "URL", env = "TARGET_DATABASE_URL")]
    target_url: Option<String>,
    /// Expected SHA-256 of the compressed artifact
    #[arg(long, value_name = "HEX")]
    sha256: Option<String>,
    /// Skip the interactive confirmation
    #[arg(long)]
    yes: bool,
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    // stdout carries the JSON result; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<ExitCode> {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => return reject_configuration(&cli.command, e),
    };
    tracing::debug!(
        "Loaded configuration: database={} ({}), bucket={:?}, local_dir={}",
        settings.database.name,
        redact_url(&settings.database.url),
        settings.storage.bucket,
        settings.storage.local_dir.display()
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    match cli.command {
        Command::Backup(args) => {
            let result = backup::run_backup_flow(&settings, args.into(), shutdown).await;
            print_json(&result)?;
            Ok(exit_code(result.succeeded()))
        }
        Command::Prune(args) => {
            let result = backup::run_prune_flow(&settings, args.into(), shutdown).await;
            print_json(&result)?;
            Ok(exit_code(result.succeeded()))
        }
        Command::List { local_only } => {
            let (destination, artifacts) = backup::list_artifacts(&settings, local_only)
                .await
                .context("Failed to list backups")?;
            print_json(&serde_json::json!({
                "destination": destination,
                "artifacts": artifacts,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Restore(args) => {
            let location: ArtifactLocation = args.location.parse()?;
            let request = RestoreRequest {
                location,
                target_url: args.target_url,
                expected_sha256: args.sha256,
            };
            let target = restore::restore_target(&settings, &request)?;
            if !args.yes && !confirm_restore(&request.location, &target)? {
                tracing::warn!("Restore aborted: confirmation did not match '{}'", target.name);
                return Ok(ExitCode::FAILURE);
            }

            let report = restore::run_restore_flow(&settings, request, shutdown)
                .await
                .context("Restore process failed")?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `backup` and `prune` still print a result when the configuration is unusable.
fn reject_configuration(command: &Command, error: anyhow::Error) -> Result<ExitCode> {
    match rejection_report(command, &error) {
        Some(result) => {
            print_json(&result)?;
            Ok(ExitCode::FAILURE)
        }
        None => Err(error.context("Failed to load configuration from environment")),
    }
}

fn rejection_report(command: &Command, error: &anyhow::Error) -> Option<BackupResult> {
    match command {
        Command::Backup(_) | Command::Prune(_) => {
            let database = std::env::var("DATABASE_URL")
                .ok()
                .and_then(|url| DatabaseSettings::parse(&url).ok());
            Some(BackupResult::rejected(
                database.as_ref().map(|d| d.name.as_str()),
                format!("{:#}", error),
            ))
        }
        Command::List { .. } | Command::Restore(_) => None,
    }
}

fn exit_code(succeeded: bool) -> ExitCode {
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{}", rendered);
    Ok(())
}

/// Asks the operator to type the target database name before overwriting it.
fn confirm_restore(location: &ArtifactLocation, target: &DatabaseSettings) -> Result<bool> {
    use std::io::{Write, stderr, stdin};

    eprintln!(
        "⚠️ About to load {} into database '{}' ({}).",
        location,
        target.name,
        redact_url(&target.url)
    );
    eprint!("Type the database name to continue: ");
    stderr().flush().context("Failed to flush stderr")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim() == target.name)
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("🛑 Shutdown signal received; stopping after cleanup");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::debug!("SIGTERM handler unavailable: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn backup_flags_map_onto_the_request() {
        let cli = Cli::try_parse_from(["dbsnapshot", "backup", "--local-only", "--retention-days", "7"]).unwrap();
        match cli.command {
            Command::Backup(args) => {
                let request = BackupRequest::from(args);
                assert!(request.local_only);
                assert_eq!(request.retention_days, Some(7));
            }
            other => panic!("expected backup, got {:?}", other),
        }
    }

    #[test]
    fn restore_takes_a_location_and_options() {
        let cli = Cli::try_parse_from([
            "dbsnapshot",
            "restore",
            "s3://prod-backups/db-backups/app-20240101-000000.sql.gz",
            "--target-url",
            "postgres://localhost/app_restored",
            "--yes",
        ])
        .unwrap();
        match cli.command {
            Command::Restore(args) => {
                assert!(args.yes);
                assert_eq!(args.target_url.as_deref(), Some("postgres://localhost/app_restored"));
                assert!(args.location.parse::<ArtifactLocation>().is_ok());
            }
            other => panic!("expected restore, got {:?}", other),
        }
    }

    #[test]
    fn configuration_errors_still_produce_a_backup_result() {
        let error = anyhow::anyhow!("invalid digit found in string")
            .context("parsing BACKUP_RETENTION_DAYS value `a week`");

        let backup = Cli::try_parse_from(["dbsnapshot", "backup"]).unwrap();
        let result = rejection_report(&backup.command, &error).expect("backup reports a result");
        assert!(!result.succeeded());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "invalid_config");
        assert!(json["error"]["message"].as_str().unwrap().contains("a week"));

        let prune = Cli::try_parse_from(["dbsnapshot", "prune"]).unwrap();
        assert!(rejection_report(&prune.command, &error).is_some());

        let list = Cli::try_parse_from(["dbsnapshot", "list"]).unwrap();
        assert!(rejection_report(&list.command, &error).is_none());
    }

    #[test]
    fn negative_retention_is_rejected() {
        assert!(Cli::try_parse_from(["dbsnapshot", "prune", "--retention-days", "-3"]).is_err());
    }
}
