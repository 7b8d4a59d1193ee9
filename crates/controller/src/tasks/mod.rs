use kube::Client;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod hooks;
pub mod lifecycle;
pub mod naming;
pub mod ownership;
pub mod resources;
pub mod types;

// Re-export commonly used items
pub use config::BackupConfig;
pub use dispatch::{DispatchContext, DispatchReport, Dispatcher};
pub use ownership::OwnershipIndex;
pub use types::{Error, Result, RunIdentity, TaskKey};

use discovery::{list_eligible_volumes, KubeVolumeSource, VolumeSource};
use dispatch::TaskSubmitter;
use hooks::{run_pre_backup_hooks, HookExecutor, KubeHookExecutor};
use lifecycle::{run_job_watcher, KubeTaskOps, LifecycleWatcher};
use resources::KubeTaskSubmitter;

/// Resource kinds whose lifecycle feeds the completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    BackupJobs,
}

/// Every watcher a backup run starts, by name.
pub fn lifecycle_watchers() -> &'static [(&'static str, WatcherKind)] {
    &[("backup-jobs", WatcherKind::BackupJobs)]
}

impl WatcherKind {
    fn spawn(
        self,
        client: Client,
        watcher: Arc<LifecycleWatcher>,
        ownership_label: String,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        match self {
            WatcherKind::BackupJobs => tokio::spawn(async move {
                tokio::select! {
                    () = stop.cancelled() => {}
                    () = run_job_watcher(client, watcher, &ownership_label) => {}
                }
            }),
        }
    }
}

/// Outcome of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub run: RunIdentity,
    pub mounted: usize,
    pub unmounted: usize,
    pub hooks: usize,
    pub dispatch: DispatchReport,
}

/// Discovery, hooks and dispatch over pluggable cluster seams.
pub struct BackupPipeline {
    pub volumes: Arc<dyn VolumeSource>,
    pub hooks: Arc<dyn HookExecutor>,
    pub submitter: Arc<dyn TaskSubmitter>,
}

impl BackupPipeline {
    /// Run one backup pass. Watchers must already hold senders of `ctx`.
    pub async fn execute(
        &self,
        config: &BackupConfig,
        run: RunIdentity,
        ownership: OwnershipIndex,
        ctx: DispatchContext,
        cancel: CancellationToken,
    ) -> Result<BackupSummary> {
        let volumes = until_cancelled(
            &cancel,
            list_eligible_volumes(self.volumes.as_ref(), &config.ownership_label),
        )
        .await?;

        for claim in &volumes.unmounted {
            debug!(
                pvc = ?claim.metadata.name,
                namespace = ?claim.metadata.namespace,
                "pvc is not mounted by a running pod, skipping"
            );
        }
        if !volumes.unmounted.is_empty() {
            info!(count = volumes.unmounted.len(), "unmounted pvcs are not backed up");
        }

        let hooks = until_cancelled(
            &cancel,
            run_pre_backup_hooks(
                self.hooks.as_ref(),
                &config.pre_backup_annotation,
                &config.ownership_label,
            ),
        )
        .await?;

        let mounted = volumes.mounted.len();
        let unmounted = volumes.unmounted.len();
        let dispatcher = Dispatcher::new(
            ctx,
            run.clone(),
            config.job.name_prefix.clone(),
            ownership,
            self.submitter.clone(),
            cancel,
        );
        let dispatch = dispatcher.run(volumes.mounted.into_values()).await?;

        Ok(BackupSummary {
            run,
            mounted,
            unmounted,
            hooks,
            dispatch,
        })
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = call => result,
    }
}

/// Main entry point for a backup run against the cluster
#[instrument(skip(client, config, cancel))]
pub async fn run_backup(
    client: Client,
    config: BackupConfig,
    cancel: CancellationToken,
) -> Result<BackupSummary> {
    let run = RunIdentity::resolve(config.run_id.as_deref());
    info!(run_id = %run, concurrency = config.concurrency, "starting backup run");

    let ownership = OwnershipIndex::new();
    let ctx = DispatchContext::new(config.concurrency);
    let ops = Arc::new(KubeTaskOps::new(client.clone()));
    let stop_watchers = cancel.child_token();

    let mut watchers = Vec::new();
    for &(name, kind) in lifecycle_watchers() {
        let Some(signal) = ctx.completion_sender() else {
            return Err(Error::ConfigError(
                "dispatch context closed before watchers started".to_string(),
            ));
        };
        let watcher = Arc::new(LifecycleWatcher::new(
            run.clone(),
            ownership.clone(),
            signal,
            ops.clone(),
            config.lifecycle_policy(),
        ));
        debug!(watcher = %name, "starting lifecycle watcher");
        watchers.push(kind.spawn(
            client.clone(),
            watcher,
            config.ownership_label.clone(),
            stop_watchers.clone(),
        ));
    }

    let pipeline = BackupPipeline {
        volumes: Arc::new(KubeVolumeSource::new(client.clone())),
        hooks: Arc::new(KubeHookExecutor::new(client.clone(), config.hooks.clone())),
        submitter: Arc::new(KubeTaskSubmitter::new(
            client,
            run.clone(),
            config.clone(),
        )),
    };

    let result = pipeline
        .execute(&config, run.clone(), ownership.clone(), ctx, cancel)
        .await;

    stop_watchers.cancel();
    for handle in watchers {
        if let Err(e) = handle.await {
            error!(error = ?e, "lifecycle watcher task failed");
        }
    }
    ownership.forget(&run);

    match &result {
        Ok(summary) => info!(
            run_id = %run,
            mounted = summary.mounted,
            unmounted = summary.unmounted,
            submitted = summary.dispatch.submitted,
            "backup run finished"
        ),
        Err(e) => error!(run_id = %run, error = %e, "backup run failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_table_lists_backup_jobs() {
        let table = lifecycle_watchers();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0], ("backup-jobs", WatcherKind::BackupJobs));
    }
}
