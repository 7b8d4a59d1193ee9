//! Backup Controller Configuration
//!
//! Everything the orchestration core needs as input: concurrency, run scoping, the
//! pre-backup annotation, the Job template and the repository credentials. Values come
//! from an optional mounted YAML file; command-line flags override them afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::lifecycle::LifecyclePolicy;
use super::types::{DEFAULT_OWNERSHIP_LABEL, DEFAULT_PRE_BACKUP_ANNOTATION};

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// How many backup Jobs may run at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Fixed run identity; a fresh one is generated when absent
    #[serde(default)]
    pub run_id: Option<String>,

    /// Annotation that holds the pre-backup command
    #[serde(default = "default_pre_backup_annotation")]
    pub pre_backup_annotation: String,

    /// Label key put on every Job to tie it to its run
    #[serde(default = "default_ownership_label")]
    pub ownership_label: String,

    #[serde(default)]
    pub job: JobTemplateConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub hooks: HookConfig,

    #[serde(default)]
    pub repository: RepositoryConfig,
}

/// Shape of the per-volume backup Job
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplateConfig {
    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default = "default_service_account_name")]
    pub service_account_name: String,

    /// ClusterRole bound to the service account in every target namespace
    #[serde(default = "default_cluster_role_name")]
    pub cluster_role_name: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Directory under which each claim is mounted (`<dataRoot>/<claim>`)
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Prefix of every generated Job name
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

/// Image configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    pub repository: String,
    pub tag: String,
}

impl ImageConfig {
    /// Returns `true` when both repository and tag are populated.
    pub fn is_configured(&self) -> bool {
        !self.repository.trim().is_empty() && !self.tag.trim().is_empty()
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Slot release tuning for the lifecycle watcher
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Age after which an active Job with a pending pod gives its slot back
    #[serde(default = "default_stuck_pending_minutes")]
    pub stuck_pending_minutes: u64,

    /// Only treat a Job as stuck when it has exactly one pod
    #[serde(default = "default_true")]
    pub require_single_pod: bool,

    #[serde(default = "default_requeue_seconds")]
    pub requeue_seconds: u64,
}

/// Pre-backup hook execution
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookConfig {
    /// Allocate a pseudo-terminal; stdout and stderr arrive combined when set
    #[serde(default = "default_true")]
    pub tty: bool,

    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Object storage repository credentials handed to every backup Job
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub encryption_password: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub endpoint: String,
}

// Credentials must not end up in logs through `{:?}`.
impl std::fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("access_key_id", &redacted(&self.access_key_id))
            .field("secret_access_key", &redacted(&self.secret_access_key))
            .field("encryption_password", &redacted(&self.encryption_password))
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

fn default_concurrency() -> usize {
    3
}

fn default_pre_backup_annotation() -> String {
    DEFAULT_PRE_BACKUP_ANNOTATION.to_string()
}

fn default_ownership_label() -> String {
    DEFAULT_OWNERSHIP_LABEL.to_string()
}

fn default_service_account_name() -> String {
    "backup-controller".to_string()
}

fn default_cluster_role_name() -> String {
    "backup-controller".to_string()
}

fn default_container_name() -> String {
    "volume-backup".to_string()
}

fn default_data_root() -> String {
    "/data".to_string()
}

fn default_name_prefix() -> String {
    "backup".to_string()
}

fn default_stuck_pending_minutes() -> u64 {
    15
}

fn default_requeue_seconds() -> u64 {
    60
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            repository: "ghcr.io/5dlabs/backup-controller".to_string(),
            tag: "latest".to_string(),
        }
    }
}

impl Default for JobTemplateConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            service_account_name: default_service_account_name(),
            cluster_role_name: default_cluster_role_name(),
            container_name: default_container_name(),
            data_root: default_data_root(),
            name_prefix: default_name_prefix(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stuck_pending_minutes: default_stuck_pending_minutes(),
            require_single_pod: true,
            requeue_seconds: default_requeue_seconds(),
        }
    }
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            tty: true,
            shell: default_shell(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            run_id: None,
            pre_backup_annotation: default_pre_backup_annotation(),
            ownership_label: default_ownership_label(),
            job: JobTemplateConfig::default(),
            lifecycle: LifecycleConfig::default(),
            hooks: HookConfig::default(),
            repository: RepositoryConfig::default(),
        }
    }
}

impl BackupConfig {
    /// Validate that the configuration can drive a backup run
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("concurrency must be at least 1"));
        }
        if self.pre_backup_annotation.trim().is_empty() {
            return Err(anyhow::anyhow!("preBackupAnnotation must not be empty"));
        }
        if self.ownership_label.trim().is_empty() {
            return Err(anyhow::anyhow!("ownershipLabel must not be empty"));
        }
        if !self.job.image.is_configured() {
            return Err(anyhow::anyhow!(
                "job.image must specify both repository and tag"
            ));
        }
        if self.job.name_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("job.namePrefix must not be empty"));
        }
        if self.lifecycle.requeue_seconds == 0 {
            return Err(anyhow::anyhow!("lifecycle.requeueSeconds must be positive"));
        }
        Ok(())
    }

    /// Load configuration from mounted YAML file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            stuck_pending_after: Duration::from_secs(
                self.lifecycle.stuck_pending_minutes.saturating_mul(60),
            ),
            require_single_pod: self.lifecycle.require_single_pod,
            requeue_interval: Duration::from_secs(self.lifecycle.requeue_seconds),
        }
    }
}
