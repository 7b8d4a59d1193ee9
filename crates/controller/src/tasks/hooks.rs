//! Pre-backup hooks
//!
//! Workloads annotated with the pre-backup annotation get the annotation value executed as a
//! shell command in their first container before any backup Job is submitted. The first
//! failing hook aborts the run.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::io::AsyncRead;
use tracing::{error, info};

use super::config::HookConfig;
use super::types::{Error, HookError, Result};
use crate::logging::forward_lines;

/// A workload whose pre-backup command should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: String,
}

impl HookTarget {
    /// Returns `None` unless the pod is running, carries the annotation with a non-blank
    /// value and is not one of our own Job pods.
    pub fn from_pod(pod: &Pod, annotation: &str, ownership_label: &str) -> Option<Self> {
        if pod.labels().contains_key(ownership_label) {
            return None;
        }
        let running = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Running");
        if !running {
            return None;
        }
        let command = pod.annotations().get(annotation)?;
        if command.trim().is_empty() {
            return None;
        }
        let container = pod.spec.as_ref()?.containers.first()?.name.clone();

        Some(Self {
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            pod: pod.name_any(),
            container,
            command: command.clone(),
        })
    }
}

/// Select hook targets, sorted by namespace and pod name.
pub fn hook_targets(pods: &[Pod], annotation: &str, ownership_label: &str) -> Vec<HookTarget> {
    let mut targets: Vec<_> = pods
        .iter()
        .filter_map(|pod| HookTarget::from_pod(pod, annotation, ownership_label))
        .collect();
    targets.sort_by(|a, b| (&a.namespace, &a.pod).cmp(&(&b.namespace, &b.pod)));
    targets
}

#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<Pod>, kube::Error>;

    async fn execute(&self, target: &HookTarget) -> Result<(), HookError>;
}

pub struct KubeHookExecutor {
    client: Client,
    settings: HookConfig,
}

impl KubeHookExecutor {
    pub fn new(client: Client, settings: HookConfig) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl HookExecutor for KubeHookExecutor {
    async fn list_pods(&self) -> Result<Vec<Pod>, kube::Error> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        Ok(pods.list(&ListParams::default()).await?.items)
    }

    async fn execute(&self, target: &HookTarget) -> Result<(), HookError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let tty = self.settings.tty;
        // With a tty the API server merges stderr into stdout
        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(!tty)
            .tty(tty);
        let command = vec![
            self.settings.shell.clone(),
            "-c".to_string(),
            target.command.clone(),
        ];

        let mut process = pods.exec(&target.pod, command, &params).await?;

        let status = process.take_status();
        let stdout = process.stdout();
        let stderr = process.stderr();
        stream_output(target, stdout, stderr).await?;

        let Some(status) = status else {
            return Err(HookError::Status(
                "exec status channel unavailable".to_string(),
            ));
        };
        exec_outcome(status.await)
    }
}

/// Log command output as it arrives: stdout at info, stderr at error.
async fn stream_output<O, E>(
    target: &HookTarget,
    stdout: Option<O>,
    stderr: Option<E>,
) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let out = async {
        if let Some(reader) = stdout {
            forward_lines(reader, |line| {
                info!(pod = %target.pod, namespace = %target.namespace, "{line}");
            })
            .await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let err = async {
        if let Some(reader) = stderr {
            forward_lines(reader, |line| {
                error!(pod = %target.pod, namespace = %target.namespace, "{line}");
            })
            .await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (out, err) = tokio::join!(out, err);
    out.and(err)
}

/// Only an explicit `Success` status from the remote end counts.
fn exec_outcome(status: Option<Status>) -> Result<(), HookError> {
    match status {
        Some(status) if status.status.as_deref() == Some("Success") => Ok(()),
        Some(status) => Err(HookError::Status(
            status
                .message
                .unwrap_or_else(|| "command exited with an error".to_string()),
        )),
        None => Err(HookError::Status(
            "exec stream ended without a status".to_string(),
        )),
    }
}

/// Run every pre-backup hook in turn; stops at the first failure.
pub async fn run_pre_backup_hooks(
    executor: &dyn HookExecutor,
    annotation: &str,
    ownership_label: &str,
) -> Result<usize> {
    let pods = executor.list_pods().await?;
    let targets = hook_targets(&pods, annotation, ownership_label);

    for target in &targets {
        info!(
            pod = %target.pod,
            namespace = %target.namespace,
            command = %target.command,
            "running pre-backup command"
        );
        executor
            .execute(target)
            .await
            .map_err(|source| Error::HookFailed {
                pod: target.pod.clone(),
                source,
            })?;
    }

    if !targets.is_empty() {
        info!(count = targets.len(), "pre-backup commands finished");
    }
    Ok(targets.len())
}
