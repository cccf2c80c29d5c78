//! Escalation scheduler
//!
//! Owns every time-based transition. Wake-ups are rows in the store, so a
//! restart neither loses nor duplicates them; a worker claims a due timer
//! before firing it, so two schedulers never fire the same row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use flowgate_core::{Clock, EngineError};

use super::poller::{Backoff, PollerConfig};
use super::{env_millis, every, worker_id_from_env, LoopHandles, WorkerError};
use crate::persistence::{EngineStore, TimerRecord};

/// Result of handing a timer to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The timer drove a transition
    Fired,
    /// The step moved on since the timer was scheduled, or another worker
    /// took over the claim; nothing happened
    Stale,
}

/// Receives claimed timers; implemented by the engine
#[async_trait]
pub trait TimerHandler: Send + Sync + 'static {
    async fn handle_timer(&self, timer: &TimerRecord) -> Result<TimerOutcome, EngineError>;
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub poller: PollerConfig,
    /// How often claimed-but-abandoned timers are returned to pending
    pub stale_reclaim_interval: Duration,
    /// How long a claim may be held before it counts as abandoned
    pub stale_threshold: Duration,
    /// Claims after which a failing timer is dropped
    pub max_fire_attempts: u32,
    /// Delay before a failed timer is due again
    pub retry_delay: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("scheduler-{}", uuid::Uuid::now_v7()),
            poller: PollerConfig::default().with_max_interval(Duration::from_secs(2)),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            max_fire_attempts: 5,
            retry_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Environment variables:
    /// - `WORKER_ID`: worker id prefix
    /// - `SCHEDULER_POLL_MS`: minimum poll interval
    /// - `SCHEDULER_BATCH_SIZE`: timers claimed per poll
    pub fn from_env() -> Self {
        let mut config = Self {
            worker_id: worker_id_from_env("scheduler"),
            ..Self::default()
        };
        if let Some(interval) = env_millis("SCHEDULER_POLL_MS") {
            config.poller = config.poller.with_min_interval(interval);
        }
        if let Some(size) = std::env::var("SCHEDULER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.poller = config.poller.with_batch_size(size);
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

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_max_fire_attempts(mut self, attempts: u32) -> Self {
        self.max_fire_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Counts from one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerTick {
    pub claimed: usize,
    pub fired: usize,
    pub stale: usize,
    /// Released for another attempt after a transient error
    pub retried: usize,
    /// Given up on after a permanent error or too many attempts
    pub dropped: usize,
}

/// Durable timer worker
pub struct EscalationScheduler {
    store: Arc<dyn EngineStore>,
    handler: Arc<dyn TimerHandler>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    loops: LoopHandles,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<dyn EngineStore>,
        handler: Arc<dyn TimerHandler>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            handler,
            clock,
            config,
            loops: LoopHandles::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Claim and fire every timer due now
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_due(&self) -> Result<SchedulerTick, WorkerError> {
        let now = self.clock.now();
        let timers = self
            .store
            .claim_due_timers(&self.config.worker_id, now, self.config.poller.batch_size)
            .await?;

        let mut tick = SchedulerTick {
            claimed: timers.len(),
            ..SchedulerTick::default()
        };

        // Sequential: timers of one instance must not race each other
        for timer in timers {
            self.fire(timer, &mut tick).await?;
        }

        if tick.claimed > 0 {
            debug!(
                claimed = tick.claimed,
                fired = tick.fired,
                stale = tick.stale,
                retried = tick.retried,
                dropped = tick.dropped,
                "scheduler tick"
            );
        }
        Ok(tick)
    }

    async fn fire(&self, timer: TimerRecord, tick: &mut SchedulerTick) -> Result<(), WorkerError> {
        let worker_id = self.config.worker_id.as_str();
        match self.handler.handle_timer(&timer).await {
            Ok(TimerOutcome::Fired) => {
                // Usually already marked by the engine's commit
                self.store.complete_timer(timer.id, worker_id).await?;
                tick.fired += 1;
                info!(
                    timer_id = %timer.id,
                    instance_id = %timer.instance_id,
                    kind = timer.timer.kind.as_str(),
                    step_number = ?timer.timer.step_number,
                    "timer fired"
                );
            }
            Ok(TimerOutcome::Stale) => {
                self.store.cancel_timer(timer.id, worker_id).await?;
                tick.stale += 1;
                debug!(timer_id = %timer.id, instance_id = %timer.instance_id, "stale timer discarded");
            }
            Err(e) if is_transient(&e) && timer.attempts < self.config.max_fire_attempts => {
                let retry_at = self.clock.now()
                    + chrono::Duration::from_std(self.config.retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                warn!(
                    timer_id = %timer.id,
                    instance_id = %timer.instance_id,
                    attempts = timer.attempts,
                    "Timer handling failed, will retry: {}", e
                );
                self.store.release_timer(timer.id, worker_id, retry_at).await?;
                tick.retried += 1;
            }
            Err(e) => {
                error!(
                    timer_id = %timer.id,
                    instance_id = %timer.instance_id,
                    attempts = timer.attempts,
                    "Timer dropped: {}", e
                );
                self.store.cancel_timer(timer.id, worker_id).await?;
                tick.dropped += 1;
            }
        }
        Ok(())
    }

    /// Return abandoned claims to pending
    pub async fn reclaim_stale(&self) -> Result<usize, WorkerError> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let reclaimed = self
            .store
            .reclaim_stale_timers(self.clock.now() - threshold)
            .await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Reclaimed stale timers");
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
            batch_size = self.config.poller.batch_size,
            "Starting escalation scheduler"
        );

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.loops.subscribe();
        self.loops.spawn(async move {
            let mut backoff = Backoff::new(scheduler.config.poller.clone());
            loop {
                match scheduler.run_due().await {
                    Ok(tick) => backoff.record(tick.claimed),
                    Err(e) => {
                        error!("Poll error: {}", e);
                        backoff.record(0);
                    }
                }
                if backoff.wait(&mut shutdown_rx).await {
                    break;
                }
            }
            debug!("Scheduler poll loop exited");
        });

        let scheduler = Arc::clone(self);
        let interval = self.config.stale_reclaim_interval;
        let shutdown_rx = self.loops.subscribe();
        self.loops.spawn(async move {
            every(interval, shutdown_rx, move || {
                let scheduler = Arc::clone(&scheduler);
                async move {
                    if let Err(e) = scheduler.reclaim_stale().await {
                        error!("Stale timer reclamation failed: {}", e);
                    }
                }
            })
            .await;
            debug!("Scheduler reclaim loop exited");
        });

        Ok(())
    }

    /// Stop the loops; an in-flight timer finishes first
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        info!(worker_id = %self.config.worker_id, "Stopping escalation scheduler");
        self.loops.shutdown(self.config.shutdown_timeout).await
    }
}

fn is_transient(e: &EngineError) -> bool {
    e.is_retryable() || matches!(e, EngineError::Store(_))
}
