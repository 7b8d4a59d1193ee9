/*
 * 5D Labs Backup Controller - Command Line Entry Point
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Backup Controller - schedules and runs volume backups
//!
//! - `operator backup` discovers mounted claims and launches one backup Job per claim
//! - `snapshot backup` and `snapshot maintenance` run inside those Jobs

use anyhow::{Context, Result};
use backup_controller::logging::{init_logging, LogFormat};
use backup_controller::snapshot::{maintenance_owner, SnapshotSettings, SnapshotTool};
use backup_controller::tasks::config::RepositoryConfig;
use backup_controller::{run_backup, BackupConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

#[derive(Parser)]
#[command(
    name = "backup-controller",
    version,
    about = "Backs up every mounted persistent volume claim in the cluster"
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true, env = "BACKUP_DEBUG")]
    debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "BACKUP_LOG_FORMAT")]
    log_format: LogFormat,

    /// Path to a YAML configuration file
    #[arg(long, global = true, env = "BACKUP_CONFIG_FILE")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs operator commands
    #[command(subcommand)]
    Operator(OperatorCommand),

    /// Runs snapshot tool commands inside a backup Job
    Snapshot(SnapshotArgs),
}

#[derive(Subcommand)]
enum OperatorCommand {
    /// Schedules backup jobs on the cluster and waits for them
    Backup(OperatorBackupArgs),
}

#[derive(Args)]
struct OperatorBackupArgs {
    /// How many backup Jobs may run at the same time
    #[arg(long, env = "BACKUP_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Identifier scoping this run's Jobs; a fresh one is generated when unset
    #[arg(long, env = "BACKUP_RUN_ID")]
    run_id: Option<String>,

    /// Annotation that contains the pre-backup command
    #[arg(long, env = "BACKUP_PRE_BACKUP_ANNOTATION")]
    pre_backup_annotation: Option<String>,

    #[command(flatten)]
    repository: RepositoryArgs,
}

#[derive(Args)]
struct SnapshotArgs {
    /// Directory the repository config is written to
    #[arg(long, env = "BACKUP_CONFIG_DIR", default_value = "/config")]
    config_dir: PathBuf,

    /// Snapshot tool binary
    #[arg(long, env = "BACKUP_SNAPSHOT_BIN", default_value = "/usr/local/bin/kopia")]
    snapshot_bin: PathBuf,

    /// Snapshot tool cache directory
    #[arg(long, env = "BACKUP_CACHE_DIR", default_value = "/cache")]
    cache_dir: PathBuf,

    #[command(flatten)]
    repository: RepositoryArgs,

    #[command(subcommand)]
    command: SnapshotCommand,
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// Does a backup
    Backup {
        /// Path which should get backed up
        #[arg(long, short, env = "BACKUP_PATH")]
        path: PathBuf,

        /// Hostname recorded with the snapshot
        #[arg(long, env = "HOSTNAME", default_value = "backup-controller")]
        hostname: String,
    },

    /// Runs the maintenance on the repository
    Maintenance {
        #[arg(long, env = "HOSTNAME", default_value = "backup-controller")]
        hostname: String,
    },
}

#[derive(Args, Default)]
struct RepositoryArgs {
    /// S3 access key ID
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    /// Repository encryption password
    #[arg(long, env = "BACKUP_ENCRYPTION_PASSWORD", hide_env_values = true)]
    encryption_password: Option<String>,

    /// S3 bucket
    #[arg(long, env = "BACKUP_BUCKET")]
    bucket: Option<String>,

    /// S3 endpoint
    #[arg(long = "s3-endpoint", env = "BACKUP_ENDPOINT")]
    s3_endpoint: Option<String>,
}

impl RepositoryArgs {
    fn apply(self, repository: &mut RepositoryConfig) {
        let overrides = [
            (self.access_key_id, &mut repository.access_key_id),
            (self.secret_access_key, &mut repository.secret_access_key),
            (self.encryption_password, &mut repository.encryption_password),
            (self.bucket, &mut repository.bucket),
            (self.s3_endpoint, &mut repository.endpoint),
        ];
        for (value, field) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

fn load_config(path: Option<&str>) -> Result<BackupConfig> {
    match path {
        Some(path) => BackupConfig::from_mounted_file(path)
            .with_context(|| format!("loading configuration from {path}")),
        None => Ok(BackupConfig::default()),
    }
}

fn operator_config(path: Option<&str>, args: OperatorBackupArgs) -> Result<BackupConfig> {
    let mut config = load_config(path)?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(run_id) = args.run_id {
        config.run_id = Some(run_id);
    }
    if let Some(annotation) = args.pre_backup_annotation {
        config.pre_backup_annotation = annotation;
    }
    args.repository.apply(&mut config.repository);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run_operator_backup(config: BackupConfig) -> Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes cluster")?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let shutdown = tokio::spawn(shutdown_signal(cancel.clone()));

    let result = run_backup(client, config, cancel).await;
    shutdown.abort();

    let summary = result.context("backup run failed")?;
    info!(
        run_id = %summary.run,
        mounted = summary.mounted,
        unmounted = summary.unmounted,
        hooks = summary.hooks,
        submitted = summary.dispatch.submitted,
        already_existing = summary.dispatch.already_existing,
        "backup run complete"
    );
    Ok(())
}

async fn run_snapshot(path: Option<&str>, args: SnapshotArgs) -> Result<()> {
    let mut repository = load_config(path)?.repository;
    args.repository.apply(&mut repository);

    let hostname = match &args.command {
        SnapshotCommand::Backup { hostname, .. } | SnapshotCommand::Maintenance { hostname } => {
            hostname.clone()
        }
    };
    let tool = SnapshotTool::new(SnapshotSettings {
        binary: args.snapshot_bin,
        config_dir: args.config_dir,
        cache_dir: args.cache_dir,
        hostname: hostname.clone(),
        repository,
    })
    .await
    .context("preparing the snapshot repository")?;

    match args.command {
        SnapshotCommand::Backup { path, .. } => tool
            .backup(&path)
            .await
            .with_context(|| format!("backing up {}", path.display())),
        SnapshotCommand::Maintenance { .. } => {
            info!("starting maintenance");
            tool.run_maintenance(&maintenance_owner(&hostname))
                .await
                .context("running maintenance")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.debug);

    let span = info_span!("backup_controller", version = env!("CARGO_PKG_VERSION"));
    run(cli).instrument(span).await
}

async fn run(cli: Cli) -> Result<()> {
    info!(
        "Starting 5D Labs Backup Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Operator(OperatorCommand::Backup(args)) => {
            let config = operator_config(config_path, args)?;
            run_operator_backup(config).await
        }
        Commands::Snapshot(args) => run_snapshot(config_path, args).await,
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, cancelling backup run");
        },
        () = terminate => {
            info!("Received SIGTERM, cancelling backup run");
        },
    }
    cancel.cancel();
}
