//! Test scheduling across a pool of instances.
//!
//! The scheduler maps N selected items onto M test instances:
//!
//! 1. Every item becomes a pending [`TestJob`](crate::job::TestJob) in a
//!    FIFO [`JobQueue`], in path order.
//! 2. One worker per requested instance provisions it (with bounded retries
//!    and backoff), configures it and waits for it to become healthy.
//! 3. Ready workers pull jobs until the queue is empty, one job in flight per
//!    instance, then tear their instance down.
//! 4. Outcomes flow over a channel into the [`ResultCollector`].
//!
//! Only the scheduler decides on retries. An infrastructure error (including
//! a job timeout) puts the job back at the front of the queue until it has
//! used its retry budget, after which it is recorded as `error`. A test
//! failure is recorded as-is.

pub mod queue;

pub use queue::{Dispatch, JobQueue};

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetestConfig;
use crate::content::ContentItem;
use crate::instance::{InstanceManager, LifecycleState, TestInstance, bring_up};
use crate::job::{JobOutcome, JobRecord, JobStatus};
use crate::report::ResultCollector;
use crate::retry::{BackoffPolicy, RetryTracker};

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Not a single instance became ready.
    #[error("No test instance became ready ({requested} requested): {last_error}")]
    NoInstances {
        /// Instances requested.
        requested: usize,
        /// Last provisioning error seen.
        last_error: String,
    },
}

/// Scheduling parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Instances to run jobs on.
    pub instances: usize,
    /// Wall-clock limit for one job attempt.
    pub job_timeout: Duration,
    /// Infrastructure retries per job.
    pub retry_count: usize,
    /// Attempts and backoff for provisioning each instance.
    pub provision: BackoffPolicy,
}

impl SchedulerConfig {
    /// Scheduling parameters from the `[retest]` table.
    pub fn from_config(config: &RetestConfig) -> Self {
        Self {
            instances: config.instances.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            retry_count: config.retry_count,
            provision: config.provision.clone(),
        }
    }
}

/// Statistics about a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Instances that reached `Ready`.
    pub instances_ready: usize,
    /// Infrastructure retries consumed across all jobs.
    pub retries: usize,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

/// Runs jobs on a pool of instances from one [`InstanceManager`].
pub struct TestScheduler<'a, M: ?Sized> {
    manager: &'a M,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

/// State shared by all workers of one run.
struct RunState {
    queue: JobQueue,
    retries: RetryTracker,
    ready: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

/// How long an idle worker waits before asking the queue again.
const IDLE_POLL: Duration = Duration::from_millis(100);

enum Attempt {
    Done(JobOutcome),
    TimedOut,
    Cancelled,
}

impl<'a, M: InstanceManager + ?Sized> TestScheduler<'a, M> {
    /// Creates a scheduler.
    pub fn new(manager: &'a M, config: SchedulerConfig) -> Self {
        Self {
            manager,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to stop the run early.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Runs one job per item and records every outcome in `collector`.
    ///
    /// Must be called from a multi-threaded tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NoInstances`] if no instance ever became ready. In
    /// that case nothing is recorded and every instance has been torn down.
    pub async fn run(
        &self,
        items: Vec<ContentItem>,
        collector: &mut ResultCollector,
    ) -> Result<RunStats, SchedulerError> {
        let start = Instant::now();
        if items.is_empty() {
            warn!("No content selected; nothing to run");
            return Ok(RunStats::default());
        }

        let workers = self.config.instances.min(items.len()).max(1);
        info!(
            "Scheduling {} job(s) on {} {} instance(s)",
            items.len(),
            workers,
            self.manager.name()
        );

        let state = RunState {
            queue: JobQueue::new(items),
            retries: RetryTracker::new(self.config.retry_count),
            ready: AtomicUsize::new(0),
            last_error: Mutex::new(None),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<JobRecord>();

        tokio_scoped::scope(|scope| {
            for index in 0..workers {
                let tx = tx.clone();
                let state = &state;
                scope.spawn(async move {
                    self.worker(index, state, tx).await;
                });
            }
            drop(tx);

            let collector = &mut *collector;
            scope.spawn(async move {
                while let Some(record) = rx.recv().await {
                    if let Err(e) = collector.record(record) {
                        error!("{}", e);
                    }
                }
            });
        });

        let instances_ready = state.ready.load(Ordering::SeqCst);
        let cancelled = self.cancel.is_cancelled();
        let leftover = state.queue.drain().await;

        if instances_ready == 0 && !cancelled {
            let last_error = state
                .last_error
                .lock()
                .ok()
                .and_then(|e| e.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(SchedulerError::NoInstances {
                requested: workers,
                last_error,
            });
        }

        if !leftover.is_empty() {
            let reason = if cancelled {
                "run cancelled before the job was dispatched"
            } else {
                "no healthy instance remained"
            };
            warn!("{} job(s) not run: {}", leftover.len(), reason);
            for job in leftover {
                if let Err(e) = collector.record(job.finish(JobStatus::Error, reason, Duration::ZERO))
                {
                    error!("{}", e);
                }
            }
        }

        collector.set_duration(start.elapsed());
        Ok(RunStats {
            instances_ready,
            retries: state.retries.total_retries(),
            cancelled,
        })
    }

    /// One instance from provisioning to teardown.
    async fn worker(&self, index: usize, state: &RunState, tx: mpsc::UnboundedSender<JobRecord>) {
        let Some(mut instance) = self.acquire(index, state).await else {
            return;
        };
        state.ready.fetch_add(1, Ordering::SeqCst);

        self.drain_queue(&mut instance, state, &tx).await;

        if let Err(e) = self.manager.teardown(&mut instance).await {
            warn!("Teardown of {} failed: {}", instance.id, e);
        }
    }

    /// Provisions and readies an instance, retrying per the provision policy.
    async fn acquire(&self, index: usize, state: &RunState) -> Option<TestInstance> {
        let policy = &self.config.provision;
        for attempt in 1..=policy.attempts() {
            if self.cancel.is_cancelled() {
                return None;
            }

            let error = match self.manager.provision().await {
                Ok(mut instance) => match bring_up(self.manager, &mut instance).await {
                    Ok(()) => return Some(instance),
                    Err(e) => {
                        if let Err(te) = self.manager.teardown(&mut instance).await {
                            warn!("Teardown of {} failed: {}", instance.id, te);
                        }
                        e.to_string()
                    }
                },
                Err(e) => e.to_string(),
            };

            warn!(
                "Worker {}: instance not ready (attempt {}/{}): {}",
                index,
                attempt,
                policy.attempts(),
                error
            );
            if let Ok(mut last) = state.last_error.lock() {
                *last = Some(error);
            }

            if attempt < policy.attempts() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    _ = tokio::time::sleep(policy.delay_for(attempt)) => {}
                }
            }
        }

        error!("Worker {}: giving up on provisioning", index);
        None
    }

    /// Pulls jobs until the queue is empty, the instance becomes unhealthy
    /// or the run is cancelled.
    async fn drain_queue(
        &self,
        instance: &mut TestInstance,
        state: &RunState,
        tx: &mpsc::UnboundedSender<JobRecord>,
    ) {
        while !self.cancel.is_cancelled() {
            let mut job = match state.queue.dispatch().await {
                Dispatch::Job(job) => job,
                Dispatch::Done => break,
                Dispatch::Wait => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => continue,
                    }
                }
            };
            job.start(&instance.id);
            debug!(
                "Running {} on {} (attempt {})",
                job.id(),
                instance.id,
                job.attempts
            );

            let started = Instant::now();
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => Attempt::Cancelled,
                result = tokio::time::timeout(
                    self.config.job_timeout,
                    self.manager.execute(instance, &job),
                ) => match result {
                    Ok(outcome) => Attempt::Done(outcome),
                    Err(_) => Attempt::TimedOut,
                },
            };
            let elapsed = started.elapsed();

            let message = match attempt {
                Attempt::Done(JobOutcome::Passed { output }) => {
                    let _ = tx.send(job.finish(JobStatus::Passed, output, elapsed));
                    state.queue.complete().await;
                    continue;
                }
                Attempt::Done(JobOutcome::Failed { output }) => {
                    info!("{} failed on {}", job.id(), instance.id);
                    let _ = tx.send(job.finish(JobStatus::Failed, output, elapsed));
                    state.queue.complete().await;
                    continue;
                }
                Attempt::Cancelled => {
                    // Interrupted attempts do not count against the budget.
                    job.attempts -= 1;
                    job.requeue("cancelled");
                    state.queue.requeue(job).await;
                    break;
                }
                Attempt::Done(JobOutcome::InfraError { message }) => message,
                Attempt::TimedOut => {
                    format!("timed out after {:?}", self.config.job_timeout)
                }
            };

            // The execute future may have been dropped mid-job.
            if instance.state() == LifecycleState::Executing {
                let _ = instance.transition(LifecycleState::Ready);
            }

            if state.retries.record_infra_failure(&job.id()) {
                warn!(
                    "{} hit an infrastructure error on {}, requeueing: {}",
                    job.id(),
                    instance.id,
                    message
                );
                job.requeue(message);
                state.queue.requeue(job).await;
            } else {
                error!(
                    "{} exhausted {} retries: {}",
                    job.id(),
                    state.retries.max_retries(),
                    message
                );
                let _ = tx.send(job.finish(JobStatus::Error, message, elapsed));
                state.queue.complete().await;
            }

            if instance.state() != LifecycleState::Ready || !self.manager.check_health(instance).await
            {
                warn!("Instance {} is no longer healthy; retiring it", instance.id);
                instance.fail();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::instance::{BackendKind, Credentials, InfraError, InfraResult};
    use crate::job::TestJob;

    /// Scripted instance manager that tracks live instances.
    #[derive(Default)]
    struct MockManager {
        /// Provision calls that fail before any succeeds.
        failing_provisions: AtomicU32,
        always_fail_provision: bool,
        /// Job id -> number of leading infra errors.
        infra_errors: StdMutex<HashMap<String, u32>>,
        /// Job ids whose test fails.
        failing_tests: HashSet<String>,
        /// Job ids that hang until timeout.
        hanging: HashSet<String>,
        unhealthy_after_error: bool,
        live: StdMutex<HashSet<String>>,
        executions: StdMutex<Vec<(String, String)>>,
        health: BackoffPolicy,
    }

    impl MockManager {
        fn new() -> Self {
            Self {
                health: BackoffPolicy::immediate(1),
                ..Self::default()
            }
        }

        fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }

        fn executions_of(&self, id: &str) -> usize {
            self.executions
                .lock()
                .unwrap()
                .iter()
                .filter(|(job, _)| job == id)
                .count()
        }
    }

    #[async_trait]
    impl InstanceManager for MockManager {
        fn name(&self) -> &str {
            "mock"
        }

        fn health_policy(&self) -> &BackoffPolicy {
            &self.health
        }

        async fn provision(&self) -> InfraResult<TestInstance> {
            if self.always_fail_provision {
                return Err(InfraError::ProvisionFailed("no capacity".into()));
            }
            let fail = self
                .failing_provisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(InfraError::ProvisionFailed("container failed to start".into()));
            }
            let id = format!("mock-{}", uuid::Uuid::new_v4());
            let mut instance =
                TestInstance::new(id.clone(), BackendKind::Docker, Credentials::new("a", "b"));
            instance.transition(LifecycleState::Provisioning)?;
            instance.address = Some("127.0.0.1:8089".into());
            self.live.lock().unwrap().insert(id);
            Ok(instance)
        }

        async fn configure(&self, instance: &mut TestInstance) -> InfraResult<()> {
            instance.transition(LifecycleState::Configuring)
        }

        async fn check_health(&self, _instance: &mut TestInstance) -> bool {
            !self.unhealthy_after_error || self.executions.lock().unwrap().is_empty()
        }

        async fn execute(&self, instance: &mut TestInstance, job: &TestJob) -> JobOutcome {
            instance.transition(LifecycleState::Executing).unwrap();
            let id = job.id();
            self.executions
                .lock()
                .unwrap()
                .push((id.clone(), instance.id.clone()));

            if self.hanging.contains(&id) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }

            let infra = {
                let mut errors = self.infra_errors.lock().unwrap();
                match errors.get_mut(&id) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        true
                    }
                    _ => false,
                }
            };

            instance.transition(LifecycleState::Ready).unwrap();
            if infra {
                JobOutcome::InfraError {
                    message: "connection reset".into(),
                }
            } else if self.failing_tests.contains(&id) {
                JobOutcome::Failed {
                    output: "0 result(s)".into(),
                }
            } else {
                JobOutcome::Passed {
                    output: "1 result(s)".into(),
                }
            }
        }

        async fn teardown(&self, instance: &mut TestInstance) -> InfraResult<()> {
            if instance.state().is_terminal() {
                return Ok(());
            }
            instance.transition(LifecycleState::TearingDown)?;
            instance.transition(LifecycleState::Terminated)?;
            self.live.lock().unwrap().remove(&instance.id);
            Ok(())
        }
    }

    fn items(names: &[&str]) -> Vec<ContentItem> {
        names
            .iter()
            .map(|n| ContentItem::new(*n, format!("/r/detections/{n}.yml")))
            .collect()
    }

    fn id(name: &str) -> String {
        format!("/r/detections/{name}.yml")
    }

    fn config(instances: usize, retry_count: usize) -> SchedulerConfig {
        SchedulerConfig {
            instances,
            job_timeout: Duration::from_secs(5),
            retry_count,
            provision: BackoffPolicy::immediate(2),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_every_job_once() {
        let manager = MockManager::new();
        let scheduler = TestScheduler::new(&manager, config(2, 2));
        let mut collector = ResultCollector::new();

        let stats = scheduler
            .run(items(&["a", "b", "c", "d", "e"]), &mut collector)
            .await
            .unwrap();

        assert_eq!(stats.instances_ready, 2);
        assert_eq!(collector.summary().passed, 5);
        assert_eq!(collector.exit_code(), 0);
        for name in ["a", "b", "c", "d", "e"] {
            assert_eq!(manager.executions_of(&id(name)), 1);
        }
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_infra_error_retried_at_most_k_times() {
        let manager = MockManager::new();
        manager
            .infra_errors
            .lock()
            .unwrap()
            .insert(id("flaky"), 10);
        let scheduler = TestScheduler::new(&manager, config(1, 2));
        let mut collector = ResultCollector::new();

        let stats = scheduler
            .run(items(&["flaky", "ok"]), &mut collector)
            .await
            .unwrap();

        // One initial attempt plus two retries.
        assert_eq!(manager.executions_of(&id("flaky")), 3);
        assert_eq!(stats.retries, 2);

        let record = collector.get(&id("flaky")).unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.attempts, 3);
        assert_eq!(collector.get(&id("ok")).unwrap().status, JobStatus::Passed);
        assert_eq!(collector.exit_code(), 1);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requeued_job_runs_next() {
        let manager = MockManager::new();
        manager.infra_errors.lock().unwrap().insert(id("a"), 1);
        let scheduler = TestScheduler::new(&manager, config(1, 2));
        let mut collector = ResultCollector::new();

        scheduler
            .run(items(&["a", "b", "c"]), &mut collector)
            .await
            .unwrap();

        let order: Vec<String> = manager
            .executions
            .lock()
            .unwrap()
            .iter()
            .map(|(job, _)| job.clone())
            .collect();
        assert_eq!(order, vec![id("a"), id("a"), id("b"), id("c")]);
        assert_eq!(collector.get(&id("a")).unwrap().status, JobStatus::Passed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_test_failures_are_not_retried() {
        let manager = MockManager {
            failing_tests: HashSet::from([id("bad")]),
            ..MockManager::new()
        };
        let scheduler = TestScheduler::new(&manager, config(2, 3));
        let mut collector = ResultCollector::new();

        scheduler
            .run(items(&["bad", "good"]), &mut collector)
            .await
            .unwrap();

        assert_eq!(manager.executions_of(&id("bad")), 1);
        let record = collector.get(&id("bad")).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.output, "0 result(s)");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_instances_is_fatal() {
        let manager = MockManager {
            always_fail_provision: true,
            ..MockManager::new()
        };
        let scheduler = TestScheduler::new(&manager, config(3, 2));
        let mut collector = ResultCollector::new();

        let err = scheduler
            .run(items(&["a", "b"]), &mut collector)
            .await
            .unwrap_err();

        let SchedulerError::NoInstances {
            requested,
            last_error,
        } = err;
        assert_eq!(requested, 2);
        assert!(last_error.contains("no capacity"));
        assert_eq!(collector.summary().total, 0);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_failed_instance_leaves_two_ready() {
        // Three instances requested, one attempt each; the first provision fails.
        let manager = MockManager {
            failing_provisions: AtomicU32::new(1),
            ..MockManager::new()
        };
        let mut cfg = config(3, 2);
        cfg.provision = BackoffPolicy::immediate(1);
        let scheduler = TestScheduler::new(&manager, cfg);
        let mut collector = ResultCollector::new();

        let names = ["a", "b", "c", "d", "e", "f"];
        let stats = scheduler.run(items(&names), &mut collector).await.unwrap();

        assert_eq!(stats.instances_ready, 2);
        assert_eq!(collector.summary().total, names.len());
        assert_eq!(collector.summary().passed, names.len());
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_provisioning_still_runs_everything() {
        // Three instances requested, one attempt each; two workers fail to provision.
        let manager = MockManager {
            failing_provisions: AtomicU32::new(2),
            ..MockManager::new()
        };
        let mut cfg = config(3, 2);
        cfg.provision = BackoffPolicy::immediate(1);
        let scheduler = TestScheduler::new(&manager, cfg);
        let mut collector = ResultCollector::new();

        let names = ["a", "b", "c", "d", "e", "f"];
        let stats = scheduler.run(items(&names), &mut collector).await.unwrap();

        assert_eq!(stats.instances_ready, 1);
        assert_eq!(collector.summary().passed, names.len());
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_provision_retried_with_backoff() {
        let manager = MockManager {
            failing_provisions: AtomicU32::new(1),
            ..MockManager::new()
        };
        let scheduler = TestScheduler::new(&manager, config(1, 0));
        let mut collector = ResultCollector::new();

        let stats = scheduler.run(items(&["a"]), &mut collector).await.unwrap();
        assert_eq!(stats.instances_ready, 1);
        assert_eq!(collector.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_counts_as_infra_error() {
        let manager = MockManager {
            hanging: HashSet::from([id("slow")]),
            ..MockManager::new()
        };
        let mut cfg = config(1, 1);
        cfg.job_timeout = Duration::from_millis(50);
        let scheduler = TestScheduler::new(&manager, cfg);
        let mut collector = ResultCollector::new();

        scheduler
            .run(items(&["slow", "fast"]), &mut collector)
            .await
            .unwrap();

        let record = collector.get(&id("slow")).unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.output.contains("timed out"));
        assert_eq!(manager.executions_of(&id("slow")), 2);
        assert_eq!(collector.get(&id("fast")).unwrap().status, JobStatus::Passed);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unhealthy_instance_retires_and_leftovers_error() {
        let manager = MockManager {
            unhealthy_after_error: true,
            ..MockManager::new()
        };
        manager.infra_errors.lock().unwrap().insert(id("a"), 1);
        let scheduler = TestScheduler::new(&manager, config(1, 2));
        let mut collector = ResultCollector::new();

        let stats = scheduler
            .run(items(&["a", "b"]), &mut collector)
            .await
            .unwrap();

        assert_eq!(stats.instances_ready, 1);
        assert_eq!(manager.executions_of(&id("a")), 1);
        for name in ["a", "b"] {
            let record = collector.get(&id(name)).unwrap();
            assert_eq!(record.status, JobStatus::Error);
            assert_eq!(record.output, "no healthy instance remained");
        }
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_records_remaining_jobs() {
        let manager = MockManager::new();
        let token = CancellationToken::new();
        token.cancel();
        let scheduler =
            TestScheduler::new(&manager, config(2, 2)).with_cancellation_token(token);
        let mut collector = ResultCollector::new();

        let stats = scheduler
            .run(items(&["a", "b"]), &mut collector)
            .await
            .unwrap();

        assert!(stats.cancelled);
        assert_eq!(collector.summary().errored, 2);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_run() {
        let manager = MockManager::new();
        let scheduler = TestScheduler::new(&manager, config(2, 2));
        let mut collector = ResultCollector::new();

        let stats = scheduler.run(Vec::new(), &mut collector).await.unwrap();
        assert_eq!(stats, RunStats::default());
        assert_eq!(collector.exit_code(), 0);
        assert_eq!(manager.executions.lock().unwrap().len(), 0);
    }
}
