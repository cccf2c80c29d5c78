//! Persistence layer for the approval engine
//!
//! This module provides:
//! - [`EngineStore`] trait for definitions, instances, timers and actions
//! - [`InMemoryEngineStore`] for testing
//! - [`PostgresEngineStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryEngineStore;
pub use postgres::PostgresEngineStore;
pub use store::{
    ActionStatus, ActionTask, EngineStore, InstanceCommit, NewActionTask, StoreError,
    TimerClaim, TimerRecord, TimerStatus,
};
