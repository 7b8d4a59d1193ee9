//! Snapshot tool wrapper
//!
//! Runs inside each backup Job: prepares the repository connection file, then drives the
//! external snapshot binary and turns its output into log lines.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::logging::forward_lines;
use crate::tasks::config::RepositoryConfig;
use crate::tasks::types::{Error, Result};

pub mod output;
pub mod repository;

pub use output::{OutputLine, OutputParser};
pub use repository::RepositoryFile;

/// Where the tool lives and how it reaches the repository.
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub hostname: String,
    pub repository: RepositoryConfig,
}

pub struct SnapshotTool {
    settings: SnapshotSettings,
    config_file: PathBuf,
}

impl SnapshotTool {
    /// Prepare the config directory, connect the repository and write the connection file.
    pub async fn new(settings: SnapshotSettings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.config_dir).await?;
        let config_file = RepositoryFile::path_in(&settings.config_dir);
        let tool = Self {
            settings,
            config_file,
        };

        // Usually the repository exists already, so this failing is expected
        if let Err(e) = tool.create_repository().await {
            error!(error = %e, "error during repository creation");
        }

        RepositoryFile::s3(
            &tool.settings.repository,
            &tool.settings.hostname,
            &tool.settings.cache_dir,
        )
        .write_to(&tool.settings.config_dir)
        .await?;
        debug!(path = %tool.config_file.display(), "repository config written");

        Ok(tool)
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    async fn create_repository(&self) -> Result<()> {
        let repository = &self.settings.repository;
        let config_file = self.config_file.display().to_string();
        let args = [
            "repository",
            "create",
            "s3",
            "--bucket",
            repository.bucket.as_str(),
            "--access-key",
            repository.access_key_id.as_str(),
            "--secret-access-key",
            repository.secret_access_key.as_str(),
            "--endpoint",
            repository.endpoint.as_str(),
            "--config-file",
            config_file.as_str(),
            "--password",
            repository.encryption_password.as_str(),
        ];
        self.run_raw("repository_create", &args).await
    }

    /// Snapshot everything below `path`.
    pub async fn backup(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "starting backup");
        let path = path.display().to_string();
        self.run("backup", &["snapshot", "create", "--json", path.as_str()])
            .await
    }

    /// Claim maintenance ownership, enable quick maintenance and run it.
    pub async fn run_maintenance(&self, owner: &str) -> Result<()> {
        debug!(owner = %owner, "setting maintenance owner");
        self.run("maintenance_set_owner", &["maintenance", "set", "--owner", owner])
            .await?;
        self.run(
            "maintenance_enable_quick",
            &["maintenance", "set", "--enable-quick", "true"],
        )
        .await?;
        info!("running maintenance");
        self.run("maintenance", &["maintenance", "run"]).await
    }

    /// Arguments for a repository command; connection flags come first.
    pub fn command_args(&self, args: &[&str]) -> Vec<String> {
        let mut full = vec![
            "--config-file".to_string(),
            self.config_file.display().to_string(),
            "--password".to_string(),
            self.settings.repository.encryption_password.clone(),
        ];
        full.extend(args.iter().map(ToString::to_string));
        full
    }

    async fn run(&self, name: &str, args: &[&str]) -> Result<()> {
        let full = self.command_args(args);
        let full: Vec<&str> = full.iter().map(String::as_str).collect();
        self.run_raw(name, &full).await.inspect_err(|e| {
            error!(command = %name, error = %e, "error during snapshot tool execution");
        })
    }

    async fn run_raw(&self, name: &str, args: &[&str]) -> Result<()> {
        let mut child = Command::new(&self.settings.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SnapshotTool(format!(
                    "failed to spawn {}: {e}",
                    self.settings.binary.display()
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let log_line = |line: &str| match OutputParser::parse(line) {
            OutputLine::Info(text) => info!(command = %name, "{text}"),
            OutputLine::Error(text) => error!(command = %name, "{text}"),
        };

        let out = async {
            match stdout {
                Some(reader) => forward_lines(reader, log_line).await,
                None => Ok(0),
            }
        };
        let err = async {
            match stderr {
                Some(reader) => forward_lines(reader, log_line).await,
                None => Ok(0),
            }
        };
        let (out, err) = tokio::join!(out, err);
        out?;
        err?;

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::SnapshotTool(format!("{name} exited with {status}")))
        }
    }
}

/// Maintenance owner for this host, as the tool expects it.
pub fn maintenance_owner(hostname: &str) -> String {
    format!("backup-controller@{hostname}").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(binary: &str, dir: &Path) -> SnapshotSettings {
        SnapshotSettings {
            binary: PathBuf::from(binary),
            config_dir: dir.join("config"),
            cache_dir: dir.join("cache"),
            hostname: "shop".to_string(),
            repository: RepositoryConfig {
                encryption_password: "hunter2".to_string(),
                bucket: "backups".to_string(),
                ..RepositoryConfig::default()
            },
        }
    }

    #[tokio::test]
    async fn connection_flags_precede_command() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SnapshotTool::new(settings("true", dir.path())).await.unwrap();

        let args = tool.command_args(&["snapshot", "create", "--json", "/data/pgdata"]);
        assert_eq!(
            args,
            vec![
                "--config-file".to_string(),
                dir.path()
                    .join("config/repository.config")
                    .display()
                    .to_string(),
                "--password".to_string(),
                "hunter2".to_string(),
                "snapshot".to_string(),
                "create".to_string(),
                "--json".to_string(),
                "/data/pgdata".to_string(),
            ]
        );
        assert!(tool.config_file().exists());
    }

    #[tokio::test]
    async fn failed_repository_creation_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SnapshotTool::new(settings("false", dir.path())).await;
        assert!(tool.is_ok());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SnapshotTool::new(settings("false", dir.path())).await.unwrap();
        let err = tool.backup(Path::new("/data")).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotTool(message) if message.starts_with("backup exited")));
    }

    #[tokio::test]
    async fn maintenance_runs_all_steps_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let tool = SnapshotTool::new(settings("true", dir.path())).await.unwrap();
        tool.run_maintenance(&maintenance_owner("Node-1")).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let tool = SnapshotTool::new(settings(missing.to_str().unwrap(), dir.path()))
            .await
            .unwrap();
        assert!(matches!(
            tool.backup(Path::new("/data")).await,
            Err(Error::SnapshotTool(message)) if message.contains("failed to spawn")
        ));
    }

    #[test]
    fn owner_is_lowercase() {
        assert_eq!(maintenance_owner("Node-1"), "backup-controller@node-1");
    }
}
