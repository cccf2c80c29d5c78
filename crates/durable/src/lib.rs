//! # Durable Approval Runtime
//!
//! PostgreSQL-backed persistence and background workers for the approval engine.
//!
//! ## Features
//!
//! - **Optimistic instance commits**: every transition is written atomically with its audit
//!   entries, timers and queued actions, guarded by a revision counter
//! - **Durable timers**: reminders, escalation and terminal timeouts survive restarts and fire
//!   exactly once across competing schedulers
//! - **Action queue**: retryable actions back off exponentially; exhausted ones are
//!   dead-lettered and the instance is flagged as degraded
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (routes events and decisions, produces InstanceCommit)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        EngineStore                           │
//! │  (PostgreSQL: flowgate_instances, audit, timers, actions)   │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────┐  ┌───────────────────────────┐
//! │    EscalationScheduler     │  │     ActionDispatcher      │
//! │  (claims due timers)       │  │  (claims queued actions)  │
//! └───────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowgate_durable::prelude::*;
//!
//! let store = Arc::new(PostgresEngineStore::connect(&database_url).await?);
//! store.migrate().await?;
//!
//! let registry = HandlerRegistry::builder()
//!     .handler("notify", EmailNotifier::new(smtp))
//!     .build();
//! let dispatcher = Arc::new(ActionDispatcher::new(
//!     store.clone(),
//!     registry,
//!     Arc::new(SystemClock),
//!     DispatcherConfig::from_env(),
//! ));
//! dispatcher.start()?;
//! ```

pub mod actions;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::actions::{
        ActionHandler, ActionOutcome, ActionRequest, HandlerRegistry, LogActionHandler,
    };
    pub use crate::persistence::{
        ActionStatus, ActionTask, EngineStore, InMemoryEngineStore, InstanceCommit,
        NewActionTask, PostgresEngineStore, StoreError, TimerClaim, TimerRecord, TimerStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{
        ActionDispatcher, DispatcherConfig, EscalationScheduler, SchedulerConfig, TimerHandler,
        TimerOutcome, WorkerError,
    };
}

// Re-export key types at crate root
pub use actions::{ActionHandler, ActionOutcome, ActionRequest, HandlerRegistry, LogActionHandler};
pub use persistence::{
    EngineStore, InMemoryEngineStore, InstanceCommit, PostgresEngineStore, StoreError,
};
pub use reliability::RetryPolicy;
pub use worker::{
    ActionDispatcher, DispatcherConfig, EscalationScheduler, SchedulerConfig, TimerHandler,
    TimerOutcome, WorkerError,
};
