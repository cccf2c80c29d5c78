//! Background workers
//!
//! This module provides:
//! - [`EscalationScheduler`] - fires durable timers (reminders, escalation, terminal timeout)
//! - [`ActionDispatcher`] - executes queued actions with retry and dead-lettering
//! - [`PollerConfig`] - polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │     EscalationScheduler      │   │       ActionDispatcher       │
//! │  ┌────────┐  ┌────────────┐  │   │  ┌────────┐  ┌────────────┐  │
//! │  │ Poller │  │ Reclaimer  │  │   │  │ Poller │  │ Reclaimer  │  │
//! │  └───┬────┘  └────────────┘  │   │  └───┬────┘  └────────────┘  │
//! │      ▼                       │   │      ▼                       │
//! │  claim_due_timers            │   │  claim_actions               │
//! │      ▼                       │   │      ▼                       │
//! │  TimerHandler (engine)       │   │  HandlerRegistry             │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use flowgate_durable::worker::{ActionDispatcher, DispatcherConfig};
//!
//! let dispatcher = Arc::new(ActionDispatcher::new(store, registry, clock, DispatcherConfig::from_env()));
//! dispatcher.start()?;
//!
//! // Graceful shutdown
//! dispatcher.shutdown().await?;
//! ```

mod dispatcher;
mod poller;
mod scheduler;

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::persistence::StoreError;

pub use dispatcher::{ActionDispatcher, DispatchReport, DispatcherConfig, TaskResult};
pub use poller::{Backoff, PollerConfig};
pub use scheduler::{
    EscalationScheduler, SchedulerConfig, SchedulerTick, TimerHandler, TimerOutcome,
};

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker id from `WORKER_ID`, or a generated one
pub(crate) fn worker_id_from_env(prefix: &str) -> String {
    std::env::var("WORKER_ID")
        .map(|id| format!("{id}-{prefix}"))
        .unwrap_or_else(|_| format!("{prefix}-{}", uuid::Uuid::now_v7()))
}

pub(crate) fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Spawned loops plus the shutdown signal they watch
pub(crate) struct LoopHandles {
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopHandles {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(future));
    }

    /// Signal shutdown and wait for every loop to exit
    pub(crate) async fn shutdown(&self, timeout: Duration) -> Result<(), WorkerError> {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());

        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        // Allow a later start()
        self.shutdown_tx.send_replace(false);

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Worker loop ended abnormally: {}", e);
                    }
                }
                Ok(())
            }
            Err(_) => Err(WorkerError::ShutdownTimeout),
        }
    }
}

/// Periodic loop that stops on shutdown
pub(crate) async fn every<F, Fut>(
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            _ = shutdown_rx.changed() => break,
        }
    }
}
