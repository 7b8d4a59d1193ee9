//! Shared error type, identities and constants for the backup tasks.

use std::fmt;
use thiserror::Error;

/// Default label marking Jobs (and their pods) as owned by a backup run.
pub const DEFAULT_OWNERSHIP_LABEL: &str = "backup.cto.dev/run-id";

/// Default annotation carrying a pre-backup shell command.
pub const DEFAULT_PRE_BACKUP_ANNOTATION: &str = "backup.cto.dev/pre-backup";

/// Label the Job controller puts on every pod it creates.
pub const JOB_NAME_LABEL: &str = "job-name";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("could not get pvc {claim} for pod {pod}: {source}")]
    VolumeLookup {
        pod: String,
        claim: String,
        #[source]
        source: kube::Error,
    },

    #[error("can't exec pre-backup command in pod {pod}: {source}")]
    HookFailed {
        pod: String,
        #[source]
        source: HookError,
    },

    #[error("completion channel closed with {in_flight} backup job(s) still in flight")]
    CompletionChannelClosed { in_flight: usize },

    #[error("backup run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot tool failed: {0}")]
    SnapshotTool(String),
}

/// Why a single pre-backup command failed.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("exec request failed: {0}")]
    Exec(#[from] kube::Error),

    #[error("reading command output: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Status(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// True when the API server rejected a create because the object is already there.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Token scoping task ownership to a single orchestration invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunIdentity(String);

impl RunIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Use the supplied value when it is non-blank, otherwise generate a fresh token.
    pub fn resolve(supplied: Option<&str>) -> Self {
        supplied
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map_or_else(Self::generate, Self::new)
    }

    /// First `-` separated segment, used to keep task names short.
    pub fn seed(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespaced identity of a backup Job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub namespace: String,
    pub name: String,
}

impl TaskKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
