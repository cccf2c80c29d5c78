//! Action dispatcher
//!
//! Executes queued actions out-of-band from the transition that enqueued
//! them. Failures never touch approval status: retryable ones are requeued
//! with backoff, exhausted or permanent ones go dead and the instance is
//! flagged as degraded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use flowgate_core::{Clock, InstanceStatus, TraceEvent};

use super::poller::{Backoff, PollerConfig};
use super::{env_millis, every, worker_id_from_env, LoopHandles, WorkerError};
use crate::actions::{ActionOutcome, ActionRequest, HandlerRegistry};
use crate::persistence::{ActionTask, EngineStore, StoreError};

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_id: String,
    pub poller: PollerConfig,
    /// Upper bound on a single handler call
    pub handler_timeout: Duration,
    pub stale_reclaim_interval: Duration,
    pub stale_threshold: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatcher-{}", Uuid::now_v7()),
            poller: PollerConfig::default(),
            handler_timeout: Duration::from_secs(30),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Environment variables:
    /// - `WORKER_ID`: worker id prefix
    /// - `DISPATCH_POLL_MS`: minimum poll interval
    /// - `ACTION_TIMEOUT_MS`: handler timeout
    pub fn from_env() -> Self {
        let mut config = Self {
            worker_id: worker_id_from_env("dispatcher"),
            ..Self::default()
        };
        if let Some(interval) = env_millis("DISPATCH_POLL_MS") {
            config.poller = config.poller.with_min_interval(interval);
        }
        if let Some(timeout) = env_millis("ACTION_TIMEOUT_MS") {
            config.handler_timeout = timeout;
        }
        config
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

/// What happened to one claimed action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    /// Requeued for a later attempt
    Retried,
    /// Dead-lettered; the instance is now degraded
    Dead,
    /// Skipped because the instance was cancelled
    Cancelled,
}

/// Counts from one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead: usize,
    pub cancelled: usize,
}

impl DispatchReport {
    fn add(&mut self, result: TaskResult) {
        match result {
            TaskResult::Succeeded => self.succeeded += 1,
            TaskResult::Retried => self.retried += 1,
            TaskResult::Dead => self.dead += 1,
            TaskResult::Cancelled => self.cancelled += 1,
        }
    }

    fn merge(&mut self, other: DispatchReport) {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.dead += other.dead;
        self.cancelled += other.cancelled;
    }
}

/// Action queue worker
pub struct ActionDispatcher {
    store: Arc<dyn EngineStore>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    loops: LoopHandles,
}

impl ActionDispatcher {
    pub fn new(
        store: Arc<dyn EngineStore>,
        registry: HandlerRegistry,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
            loops: LoopHandles::new(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and execute every visible action
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_due(&self) -> Result<DispatchReport, WorkerError> {
        self.run_batch(None).await
    }

    /// Drain the visible actions of one instance
    ///
    /// Used right after a commit so actions usually run before the caller
    /// gets its answer. Delayed retries are left for the poll loop.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, instance_id = %instance_id))]
    pub async fn run_for_instance(&self, instance_id: Uuid) -> Result<DispatchReport, WorkerError> {
        let mut report = DispatchReport::default();
        loop {
            let batch = self.run_batch(Some(instance_id)).await?;
            report.merge(batch);
            if batch.claimed == 0 || batch.claimed == batch.retried {
                break;
            }
        }
        Ok(report)
    }

    async fn run_batch(&self, instance_id: Option<Uuid>) -> Result<DispatchReport, WorkerError> {
        let tasks = self
            .store
            .claim_actions(
                &self.config.worker_id,
                self.clock.now(),
                self.config.poller.batch_size,
                instance_id,
            )
            .await?;

        let mut report = DispatchReport {
            claimed: tasks.len(),
            ..DispatchReport::default()
        };
        if tasks.is_empty() {
            return Ok(report);
        }

        let results =
            futures::future::join_all(tasks.into_iter().map(|task| self.execute_task(task))).await;
        for result in results {
            report.add(result?);
        }

        debug!(
            claimed = report.claimed,
            succeeded = report.succeeded,
            retried = report.retried,
            dead = report.dead,
            cancelled = report.cancelled,
            "dispatch pass"
        );
        Ok(report)
    }

    /// Run one claimed action and record the outcome
    pub async fn execute_task(&self, task: ActionTask) -> Result<TaskResult, WorkerError> {
        if task.attempt > 1 && self.instance_cancelled(task.instance_id).await? {
            return self.cancel(&task).await;
        }

        let outcome = match self.registry.get(&task.action_type) {
            None => ActionOutcome::Permanent(format!(
                "no handler registered for action type: {}",
                task.action_type
            )),
            Some(handler) => {
                let request = ActionRequest::from(&task);
                match tokio::time::timeout(self.config.handler_timeout, handler.execute(&request))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => ActionOutcome::Retryable(format!(
                        "handler timed out after {}ms",
                        self.config.handler_timeout.as_millis()
                    )),
                }
            }
        };

        let now = self.clock.now();
        match outcome {
            ActionOutcome::Ok => {
                self.store.complete_action(task.id).await?;
                self.store
                    .append_audit(
                        task.instance_id,
                        vec![TraceEvent::ActionSucceeded {
                            action_type: task.action_type.clone(),
                            attempt: task.attempt,
                        }],
                        now,
                    )
                    .await?;
                debug!(action_id = %task.id, action_type = %task.action_type, "action succeeded");
                Ok(TaskResult::Succeeded)
            }
            ActionOutcome::Retryable(err) if task.retry_policy.has_attempts_remaining(task.attempt) => {
                if self.instance_cancelled(task.instance_id).await? {
                    return self.cancel(&task).await;
                }
                let retry_at = task.retry_policy.next_visible_at(now, task.attempt);
                self.retry(&task, &err, retry_at, now).await?;
                Ok(TaskResult::Retried)
            }
            ActionOutcome::Retryable(err) | ActionOutcome::Permanent(err) => {
                self.dead_letter(&task, &err, now).await?;
                Ok(TaskResult::Dead)
            }
        }
    }

    async fn instance_cancelled(&self, instance_id: Uuid) -> Result<bool, WorkerError> {
        match self.store.get_instance(instance_id).await {
            Ok(instance) => Ok(instance.status == InstanceStatus::Cancelled),
            Err(StoreError::InstanceNotFound(_)) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel(&self, task: &ActionTask) -> Result<TaskResult, WorkerError> {
        self.store.cancel_action(task.id).await?;
        self.store
            .append_audit(
                task.instance_id,
                vec![TraceEvent::ActionCancelled {
                    action_type: task.action_type.clone(),
                }],
                self.clock.now(),
            )
            .await
            .or_else(|e| match e {
                StoreError::InstanceNotFound(_) => Ok(()),
                other => Err(other),
            })?;
        info!(action_id = %task.id, instance_id = %task.instance_id, "retry cancelled with instance");
        Ok(TaskResult::Cancelled)
    }

    async fn retry(
        &self,
        task: &ActionTask,
        err: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        warn!(
            action_id = %task.id,
            action_type = %task.action_type,
            attempt = task.attempt,
            retry_at = %retry_at,
            "Action failed, will retry: {}", err
        );
        self.store.retry_action(task.id, err, retry_at).await?;
        self.store
            .append_audit(
                task.instance_id,
                vec![TraceEvent::ActionFailed {
                    action_type: task.action_type.clone(),
                    attempt: task.attempt,
                    error: err.to_string(),
                    retry_at: Some(retry_at),
                }],
                now,
            )
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        task: &ActionTask,
        err: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        error!(
            action_id = %task.id,
            instance_id = %task.instance_id,
            action_type = %task.action_type,
            attempts = task.attempt,
            "Action dead-lettered: {}", err
        );
        self.store.fail_action(task.id, err).await?;
        self.store
            .mark_degraded(
                task.instance_id,
                vec![
                    TraceEvent::ActionExhausted {
                        action_type: task.action_type.clone(),
                        attempts: task.attempt,
                        error: err.to_string(),
                    },
                    TraceEvent::InstanceDegraded {
                        action_type: task.action_type.clone(),
                    },
                ],
                now,
            )
            .await?;
        Ok(())
    }

    /// Return abandoned claims to pending
    pub async fn reclaim_stale(&self) -> Result<usize, WorkerError> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let reclaimed = self
            .store
            .reclaim_stale_actions(self.clock.now() - threshold)
            .await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed stale actions");
        }
        Ok(reclaimed.len())
    }

    /// Spawn the poll and reclaim loops
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.loops.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }

        info!(
            worker_id = %self.config.worker_id,
            action_types = ?self.registry.action_types(),
            "Starting action dispatcher"
        );

        let dispatcher = Arc::clone(self);
        let mut shutdown_rx = self.loops.subscribe();
        self.loops.spawn(async move {
            let mut backoff = Backoff::new(dispatcher.config.poller.clone());
            loop {
                match dispatcher.run_due().await {
                    Ok(report) => backoff.record(report.claimed),
                    Err(e) => {
                        error!("Poll error: {}", e);
                        backoff.record(0);
                    }
                }
                if backoff.wait(&mut shutdown_rx).await {
                    break;
                }
            }
            debug!("Dispatcher poll loop exited");
        });

        let dispatcher = Arc::clone(self);
        let interval = self.config.stale_reclaim_interval;
        let shutdown_rx = self.loops.subscribe();
        self.loops.spawn(async move {
            every(interval, shutdown_rx, move || {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    if let Err(e) = dispatcher.reclaim_stale().await {
                        error!("Stale action reclamation failed: {}", e);
                    }
                }
            })
            .await;
            debug!("Dispatcher reclaim loop exited");
        });

        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        info!(worker_id = %self.config.worker_id, "Stopping action dispatcher");
        self.loops.shutdown(self.config.shutdown_timeout).await
    }
}
