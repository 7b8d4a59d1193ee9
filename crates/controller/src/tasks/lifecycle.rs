//! Backup Job lifecycle watcher
//!
//! Observes the Jobs of one run and hands dispatch slots back to the dispatcher:
//! - succeeded Jobs are deleted (background propagation) and release their slot
//! - failed Jobs are kept for inspection and release their slot
//! - Jobs whose only pod has been pending past the staleness threshold release their slot
//!   but are left alone otherwise
//!
//! `classify` decides what to do from a plain observation; `LifecycleWatcher` gathers the
//! observation and carries the actions out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::{CompletionReason, CompletionSender};
use super::ownership::{OwnershipIndex, SlotState};
use super::types::{is_not_found, Error, Result, RunIdentity, TaskKey, JOB_NAME_LABEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Minimum Job age before a pending pod counts as stuck
    pub stuck_pending_after: Duration,
    /// Require exactly one pod for the stuck check; otherwise every pod must be pending
    pub require_single_pod: bool,
    pub requeue_interval: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            stuck_pending_after: Duration::from_secs(15 * 60),
            require_single_pod: true,
            requeue_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not submitted by this run; ignored entirely.
    Unowned,
    Running,
    Succeeded,
    Failed,
    StuckPending,
    /// Deletion already in progress.
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    DeleteBackground,
    ReleaseSlot(CompletionReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: TaskState,
    pub actions: Vec<LifecycleAction>,
}

impl Transition {
    fn idle(state: TaskState) -> Self {
        Self {
            state,
            actions: Vec::new(),
        }
    }
}

/// What the watcher knows about one Job at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskObservation {
    pub key: TaskKey,
    pub owned: bool,
    pub deleting: bool,
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub complete_condition: bool,
    pub failed_condition: bool,
    pub created: Option<DateTime<Utc>>,
    /// Phases of the Job's pods; `None` until probed.
    pub pod_phases: Option<Vec<String>>,
}

impl TaskObservation {
    pub fn from_job(job: &Job, owned: bool) -> Result<Self> {
        let key = task_key(job)?;
        let status = job.status.clone().unwrap_or_default();
        let condition_true = |kind: &str| {
            status.conditions.as_ref().is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|condition| condition.type_ == kind && condition.status == "True")
            })
        };

        Ok(Self {
            key,
            owned,
            deleting: job.metadata.deletion_timestamp.is_some(),
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            complete_condition: condition_true("Complete"),
            failed_condition: condition_true("Failed"),
            created: job.metadata.creation_timestamp.as_ref().map(|time| time.0),
            pod_phases: None,
        })
    }

    fn has_succeeded(&self) -> bool {
        self.complete_condition || self.succeeded > 0
    }

    fn has_failed(&self) -> bool {
        self.failed_condition || self.failed > 0
    }

    fn is_stale(&self, policy: &LifecyclePolicy, now: DateTime<Utc>) -> bool {
        self.created.is_some_and(|created| {
            (now - created)
                .to_std()
                .is_ok_and(|age| age > policy.stuck_pending_after)
        })
    }

    /// Pod phases are only worth fetching for old Jobs that are still active.
    pub fn needs_pod_probe(&self, policy: &LifecyclePolicy, now: DateTime<Utc>) -> bool {
        self.owned
            && !self.deleting
            && !self.has_succeeded()
            && !self.has_failed()
            && self.active > 0
            && self.is_stale(policy, now)
    }

    fn pods_pending(&self, policy: &LifecyclePolicy) -> bool {
        let Some(phases) = &self.pod_phases else {
            return false;
        };
        let pending = |phase: &String| phase == "Pending";
        if policy.require_single_pod {
            phases.len() == 1 && phases.iter().all(pending)
        } else {
            !phases.is_empty() && phases.iter().all(pending)
        }
    }
}

pub fn task_key(job: &Job) -> Result<TaskKey> {
    let name = job.metadata.name.clone().ok_or(Error::MissingObjectKey)?;
    let namespace = job.namespace().ok_or(Error::MissingObjectKey)?;
    Ok(TaskKey::new(namespace, name))
}

/// Decide the state of a Job and the actions it calls for.
pub fn classify(
    observation: &TaskObservation,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> Transition {
    if !observation.owned {
        return Transition::idle(TaskState::Unowned);
    }
    if observation.deleting {
        return Transition::idle(TaskState::Terminating);
    }
    if observation.has_succeeded() {
        return Transition {
            state: TaskState::Succeeded,
            actions: vec![
                LifecycleAction::DeleteBackground,
                LifecycleAction::ReleaseSlot(CompletionReason::Succeeded),
            ],
        };
    }
    if observation.has_failed() {
        return Transition {
            state: TaskState::Failed,
            actions: vec![LifecycleAction::ReleaseSlot(CompletionReason::Failed)],
        };
    }
    if observation.active > 0
        && observation.is_stale(policy, now)
        && observation.pods_pending(policy)
    {
        return Transition {
            state: TaskState::StuckPending,
            actions: vec![LifecycleAction::ReleaseSlot(CompletionReason::StuckPending)],
        };
    }
    Transition::idle(TaskState::Running)
}

/// Cluster operations the watcher performs on a Job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskOps: Send + Sync {
    async fn delete_background(&self, task: &TaskKey) -> Result<(), kube::Error>;

    async fn pod_phases(&self, task: &TaskKey) -> Result<Vec<String>, kube::Error>;
}

pub struct KubeTaskOps {
    client: Client,
}

impl KubeTaskOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TaskOps for KubeTaskOps {
    async fn delete_background(&self, task: &TaskKey) -> Result<(), kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &task.namespace);
        jobs.delete(&task.name, &DeleteParams::background())
            .await
            .map(|_| ())
    }

    async fn pod_phases(&self, task: &TaskKey) -> Result<Vec<String>, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &task.namespace);
        let params = ListParams::default().labels(&format!("{JOB_NAME_LABEL}={}", task.name));
        Ok(pods
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|pod| {
                pod.status
                    .and_then(|status| status.phase)
                    .unwrap_or_else(|| "Unknown".to_string())
            })
            .collect())
    }
}

/// Watches one run's Jobs and feeds the run's completion channel.
pub struct LifecycleWatcher {
    run: RunIdentity,
    ownership: OwnershipIndex,
    signal: CompletionSender,
    ops: Arc<dyn TaskOps>,
    policy: LifecyclePolicy,
}

impl LifecycleWatcher {
    pub fn new(
        run: RunIdentity,
        ownership: OwnershipIndex,
        signal: CompletionSender,
        ops: Arc<dyn TaskOps>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            run,
            ownership,
            signal,
            ops,
            policy,
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn run_identity(&self) -> &RunIdentity {
        &self.run
    }

    /// Observe a Job once and apply whatever its state calls for.
    pub async fn observe(&self, job: &Job, now: DateTime<Utc>) -> Result<Transition> {
        let key = task_key(job)?;
        let owned = self.ownership.is_owned(&self.run, &key);
        let mut observation = TaskObservation::from_job(job, owned)?;

        let released = self.ownership.state(&self.run, &key) == Some(SlotState::Released);
        if !released && observation.needs_pod_probe(&self.policy, now) {
            match self.ops.pod_phases(&key).await {
                Ok(phases) => observation.pod_phases = Some(phases),
                Err(e) => {
                    error!(job = %key, error = %e, "could not list pods to determine pending state");
                }
            }
        }

        let transition = classify(&observation, &self.policy, now);
        debug!(job = %key, state = ?transition.state, "watched job");

        for action in &transition.actions {
            match action {
                LifecycleAction::DeleteBackground => self.delete(&key).await,
                LifecycleAction::ReleaseSlot(reason) => self.release(&key, *reason),
            }
        }

        Ok(transition)
    }

    async fn delete(&self, key: &TaskKey) {
        match self.ops.delete_background(key).await {
            Ok(()) => info!(job = %key, "job finished successfully, cleaning up"),
            Err(e) if is_not_found(&e) => debug!(job = %key, "job already gone"),
            Err(e) => {
                error!(job = %key, error = %e, "job finished successfully, but cannot be cleaned up");
            }
        }
    }

    fn release(&self, key: &TaskKey, reason: CompletionReason) {
        if !self.ownership.release(&self.run, key) {
            debug!(job = %key, reason = ?reason, "dispatch slot already released");
            return;
        }

        match reason {
            CompletionReason::Succeeded => {}
            CompletionReason::Failed => error!(job = %key, "job failed, not cleaning up"),
            CompletionReason::StuckPending => warn!(
                job = %key,
                minutes = self.policy.stuck_pending_after.as_secs() / 60,
                "pod has been pending too long, releasing slot and starting next job"
            ),
        }

        if !self.signal.signal(key.clone(), reason) {
            warn!(job = %key, "dispatcher is gone, completion dropped");
        }
    }
}

#[instrument(skip(job, watcher), fields(job_name = %job.name_any()))]
pub async fn reconcile_backup_job(job: Arc<Job>, watcher: Arc<LifecycleWatcher>) -> Result<Action> {
    let transition = watcher.observe(&job, Utc::now()).await?;
    Ok(match transition.state {
        TaskState::Unowned | TaskState::Terminating => Action::await_change(),
        _ => Action::requeue(watcher.policy.requeue_interval),
    })
}

/// Reconcile errors are logged and retried on the next requeue.
pub fn error_policy(job: Arc<Job>, err: &Error, watcher: Arc<LifecycleWatcher>) -> Action {
    error!(error = ?err, job_name = %job.name_any(), "backup job reconciliation failed");
    Action::requeue(watcher.policy.requeue_interval)
}

/// Run the Job controller for one run until the stream ends.
pub async fn run_job_watcher(
    client: Client,
    watcher: Arc<LifecycleWatcher>,
    ownership_label: &str,
) {
    let jobs: Api<Job> = Api::all(client);
    let selector = format!("{ownership_label}={}", watcher.run_identity());
    info!(selector = %selector, "starting backup job watcher");

    Controller::new(jobs, Config::default().labels(&selector))
        .run(reconcile_backup_job, error_policy, watcher)
        .for_each(|reconciliation_result| async move {
            match reconciliation_result {
                Ok(job) => debug!(resource = ?job, "backup job reconciliation successful"),
                Err(e) => warn!(error = ?e, "backup job reconciliation error"),
            }
        })
        .await;

    info!("backup job watcher shutting down");
}
