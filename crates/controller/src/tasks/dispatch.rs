//! Bounded-concurrency backup dispatcher
//!
//! Submits one backup Job per mounted volume and blocks on the completion channel whenever
//! `limit` Jobs are in flight. The lifecycle watcher is the only producer on that channel.
//!
//! The in-flight counter tracks completion signals, not cluster state. A Job released as
//! stuck keeps running, and a Job re-observed between its signal and its deletion is still
//! visible, so the number of non-terminal Jobs of a run may briefly exceed `limit` by one.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::discovery::MountedVolume;
use super::naming::ResourceNaming;
use super::ownership::OwnershipIndex;
use super::types::{Error, Result, RunIdentity, TaskKey};

/// Why the watcher gave a dispatch slot back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Succeeded,
    Failed,
    StuckPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCompletion {
    pub task: TaskKey,
    pub reason: CompletionReason,
}

/// Write half of a run's completion channel.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<TaskCompletion>,
}

impl CompletionSender {
    /// Returns `false` when the dispatcher is gone.
    pub fn signal(&self, task: TaskKey, reason: CompletionReason) -> bool {
        self.tx.send(TaskCompletion { task, reason }).is_ok()
    }
}

/// Per-run dispatch state: the concurrency ceiling, the in-flight counter and the
/// completion channel. Never shared between runs.
#[derive(Debug)]
pub struct DispatchContext {
    limit: usize,
    in_flight: usize,
    tx: Option<mpsc::UnboundedSender<TaskCompletion>>,
    completions: mpsc::UnboundedReceiver<TaskCompletion>,
}

impl DispatchContext {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        let (tx, completions) = mpsc::unbounded_channel();
        Self {
            limit: limit.max(1),
            in_flight: 0,
            tx: Some(tx),
            completions,
        }
    }

    pub fn completion_sender(&self) -> Option<CompletionSender> {
        self.tx.clone().map(|tx| CompletionSender { tx })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Drop our own sender so the channel closes once every watcher is gone.
    fn seal(&mut self) {
        self.tx = None;
    }

    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<TaskCompletion> {
        let mut drained = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            drained.push(completion);
        }
        drained
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created,
    AlreadyExists,
}

/// Cluster side of the dispatcher.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Make sure the backup service account exists in `namespace`.
    async fn ensure_service_account(&self, namespace: &str) -> Result<()>;

    /// Create the backup Job `task_name` for `volume`.
    async fn submit(&self, task_name: &str, volume: &MountedVolume) -> Result<SubmitOutcome>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub submitted: usize,
    pub already_existing: usize,
    pub completions: usize,
}

pub struct Dispatcher {
    ctx: DispatchContext,
    run: RunIdentity,
    name_prefix: String,
    ownership: OwnershipIndex,
    submitter: Arc<dyn TaskSubmitter>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        ctx: DispatchContext,
        run: RunIdentity,
        name_prefix: impl Into<String>,
        ownership: OwnershipIndex,
        submitter: Arc<dyn TaskSubmitter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            run,
            name_prefix: name_prefix.into(),
            ownership,
            submitter,
            cancel,
        }
    }

    /// Submit a backup Job for every volume, then wait until all of them gave their
    /// slot back.
    ///
    /// A submission error other than "already exists" aborts the run immediately. Jobs
    /// submitted before that keep running; nothing is rolled back.
    pub async fn run(
        mut self,
        volumes: impl IntoIterator<Item = MountedVolume> + Send,
    ) -> Result<DispatchReport> {
        self.ctx.seal();
        let mut report = DispatchReport::default();

        for volume in volumes {
            while self.ctx.in_flight >= self.ctx.limit {
                self.wait_for_completion(&mut report).await?;
            }

            let task_name = ResourceNaming::job_name(
                &self.name_prefix,
                &self.run,
                &volume.pod_name(),
                &volume.claim_name(),
            );
            let task = TaskKey::new(volume.namespace(), task_name.clone());

            info!(
                pvc = %volume.claim_name(),
                pod = %volume.pod_name(),
                job = %task,
                "starting backup"
            );

            self.cancellable(self.submitter.ensure_service_account(&task.namespace))
                .await?;

            // Claim first so the watcher never sees an owned Job it does not know about.
            self.ownership.claim(&self.run, task.clone());

            match self
                .cancellable(self.submitter.submit(&task_name, &volume))
                .await?
            {
                SubmitOutcome::Created => report.submitted += 1,
                SubmitOutcome::AlreadyExists => {
                    debug!(job = %task, "backup job already exists");
                    report.already_existing += 1;
                }
            }
            self.ctx.in_flight += 1;
        }

        while self.ctx.in_flight > 0 {
            self.wait_for_completion(&mut report).await?;
        }

        info!(
            submitted = report.submitted,
            already_existing = report.already_existing,
            completions = report.completions,
            "all backup jobs finished"
        );

        Ok(report)
    }

    async fn wait_for_completion(&mut self, report: &mut DispatchReport) -> Result<()> {
        let completion = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Error::Cancelled),
            completion = self.ctx.completions.recv() => completion,
        };

        let Some(completion) = completion else {
            return Err(Error::CompletionChannelClosed {
                in_flight: self.ctx.in_flight,
            });
        };

        self.ctx.in_flight = self.ctx.in_flight.saturating_sub(1);
        report.completions += 1;
        debug!(
            job = %completion.task,
            reason = ?completion.reason,
            in_flight = self.ctx.in_flight,
            "dispatch slot released"
        );
        Ok(())
    }

    async fn cancellable<T>(
        &self,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::discovery::tests::{claim, pod};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    fn volume(namespace: &str, pod_name: &str, claim_name: &str) -> MountedVolume {
        MountedVolume {
            pod: pod(namespace, pod_name, "Running", &[claim_name]),
            claim: claim(namespace, claim_name),
        }
    }

    fn run_id() -> RunIdentity {
        RunIdentity::new("0badc0de-1111-2222-3333-444455556666")
    }

    /// Reports every submitted Job name on a channel; the test plays the cluster.
    struct ScriptedSubmitter {
        created: mpsc::UnboundedSender<String>,
        existing: Vec<String>,
        failing: Option<String>,
        service_accounts: Mutex<Vec<String>>,
    }

    impl ScriptedSubmitter {
        fn new(created: mpsc::UnboundedSender<String>) -> Self {
            Self {
                created,
                existing: Vec::new(),
                failing: None,
                service_accounts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskSubmitter for ScriptedSubmitter {
        async fn ensure_service_account(&self, namespace: &str) -> Result<()> {
            self.service_accounts
                .lock()
                .unwrap()
                .push(namespace.to_string());
            Ok(())
        }

        async fn submit(&self, task_name: &str, volume: &MountedVolume) -> Result<SubmitOutcome> {
            if self.failing.as_deref() == Some(volume.claim_name().as_str()) {
                return Err(Error::ConfigError("admission webhook denied".to_string()));
            }
            self.created.send(task_name.to_string()).unwrap();
            if self.existing.contains(&volume.claim_name()) {
                Ok(SubmitOutcome::AlreadyExists)
            } else {
                Ok(SubmitOutcome::Created)
            }
        }
    }

    fn dispatcher(ctx: DispatchContext, submitter: Arc<dyn TaskSubmitter>) -> Dispatcher {
        Dispatcher::new(
            ctx,
            run_id(),
            "backup",
            OwnershipIndex::new(),
            submitter,
            CancellationToken::new(),
        )
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<String>) {
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "dispatcher submitted past the concurrency limit"
        );
    }

    #[tokio::test]
    async fn blocks_at_limit_until_a_slot_is_released() {
        let (created_tx, mut created) = mpsc::unbounded_channel();
        let ctx = DispatchContext::new(2);
        let signal = ctx.completion_sender().unwrap();
        let dispatcher = dispatcher(ctx, Arc::new(ScriptedSubmitter::new(created_tx)));

        let handle = tokio::spawn(dispatcher.run(vec![
            volume("shop", "a", "data"),
            volume("shop", "b", "data"),
            volume("shop", "c", "data"),
        ]));

        let first = created.recv().await.unwrap();
        let second = created.recv().await.unwrap();
        assert_eq!(first, "backup-0badc0de-a-data");
        assert_eq!(second, "backup-0badc0de-b-data");
        expect_silence(&mut created).await;

        assert!(signal.signal(TaskKey::new("shop", first), CompletionReason::Succeeded));
        let third = created.recv().await.unwrap();
        assert_eq!(third, "backup-0badc0de-c-data");

        signal.signal(TaskKey::new("shop", second), CompletionReason::Failed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "run ended before every job finished");

        signal.signal(TaskKey::new("shop", third), CompletionReason::Succeeded);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.submitted, 3);
        assert_eq!(report.completions, 3);
    }

    #[tokio::test]
    async fn already_existing_jobs_hold_a_slot() {
        let (created_tx, mut created) = mpsc::unbounded_channel();
        let mut submitter = ScriptedSubmitter::new(created_tx);
        submitter.existing.push("logs".to_string());
        let ctx = DispatchContext::new(1);
        let signal = ctx.completion_sender().unwrap();

        let handle = tokio::spawn(
            dispatcher(ctx, Arc::new(submitter)).run(vec![volume("ops", "loki-0", "logs")]),
        );

        let name = created.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        signal.signal(TaskKey::new("ops", name), CompletionReason::Succeeded);
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.already_existing, 1);
        assert_eq!(report.submitted, 0);
        assert_eq!(report.completions, 1);
    }

    #[tokio::test]
    async fn submission_error_aborts_the_run() {
        let (created_tx, mut created) = mpsc::unbounded_channel();
        let mut submitter = ScriptedSubmitter::new(created_tx);
        submitter.failing = Some("broken".to_string());
        let ctx = DispatchContext::new(5);
        let _signal = ctx.completion_sender();

        let result = dispatcher(ctx, Arc::new(submitter))
            .run(vec![
                volume("a", "one", "fine"),
                volume("a", "two", "broken"),
                volume("a", "three", "never"),
            ])
            .await;

        assert!(matches!(result, Err(Error::ConfigError(_))));
        assert_eq!(created.recv().await.unwrap(), "backup-0badc0de-one-fine");
        assert!(created.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_channel_fails_instead_of_hanging() {
        let (created_tx, _created) = mpsc::unbounded_channel();
        let ctx = DispatchContext::new(1);
        // No sender handed out: nobody can ever signal.
        let result = dispatcher(ctx, Arc::new(ScriptedSubmitter::new(created_tx)))
            .run(vec![volume("a", "one", "x")])
            .await;

        assert!(matches!(
            result,
            Err(Error::CompletionChannelClosed { in_flight: 1 })
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let (created_tx, _created) = mpsc::unbounded_channel();
        let ctx = DispatchContext::new(1);
        let _signal = ctx.completion_sender();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            ctx,
            run_id(),
            "backup",
            OwnershipIndex::new(),
            Arc::new(ScriptedSubmitter::new(created_tx)),
            cancel.clone(),
        );

        let handle = tokio::spawn(dispatcher.run(vec![volume("a", "one", "x")]));
        cancel.cancel();
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn empty_volume_list_finishes_immediately() {
        let (created_tx, _created) = mpsc::unbounded_channel();
        let report = dispatcher(
            DispatchContext::new(3),
            Arc::new(ScriptedSubmitter::new(created_tx)),
        )
        .run(Vec::new())
        .await
        .unwrap();
        assert_eq!(report, DispatchReport::default());
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(DispatchContext::new(0).limit(), 1);
    }

    /// Completes every Job on its own after a short delay and tracks peak concurrency.
    struct SelfCompletingSubmitter {
        signal: CompletionSender,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        ownership: OwnershipIndex,
        run: RunIdentity,
    }

    #[async_trait]
    impl TaskSubmitter for SelfCompletingSubmitter {
        async fn ensure_service_account(&self, _namespace: &str) -> Result<()> {
            Ok(())
        }

        async fn submit(&self, task_name: &str, volume: &MountedVolume) -> Result<SubmitOutcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let key = TaskKey::new(volume.namespace(), task_name);
            assert!(self.ownership.is_owned(&self.run, &key));

            let signal = self.signal.clone();
            let active = self.active.clone();
            let delay = Duration::from_millis((task_name.len() % 7) as u64 + 1);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                active.fetch_sub(1, Ordering::SeqCst);
                signal.signal(key, CompletionReason::Succeeded);
            });
            Ok(SubmitOutcome::Created)
        }
    }

    #[tokio::test]
    async fn never_exceeds_limit_and_receives_one_signal_per_job() {
        for limit in 1..=4 {
            let ctx = DispatchContext::new(limit);
            let ownership = OwnershipIndex::new();
            let peak = Arc::new(AtomicUsize::new(0));
            let submitter = SelfCompletingSubmitter {
                signal: ctx.completion_sender().unwrap(),
                active: Arc::new(AtomicUsize::new(0)),
                peak: peak.clone(),
                ownership: ownership.clone(),
                run: run_id(),
            };
            let volumes: Vec<_> = (0..9)
                .map(|i| volume("fleet", &format!("pod-{i}"), &format!("vol{}", "x".repeat(i))))
                .collect();

            let report = Dispatcher::new(
                ctx,
                run_id(),
                "backup",
                ownership.clone(),
                Arc::new(submitter),
                CancellationToken::new(),
            )
            .run(volumes)
            .await
            .unwrap();

            assert_eq!(report.submitted, 9);
            assert_eq!(report.completions, 9);
            assert!(peak.load(Ordering::SeqCst) <= limit);
            assert_eq!(ownership.owned_count(&run_id()), 9);
        }
    }
}
