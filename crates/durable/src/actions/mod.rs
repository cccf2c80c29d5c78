//! Side-effect action handlers
//!
//! This module provides:
//! - [`ActionHandler`] trait implemented by named executors
//! - [`HandlerRegistry`] mapping action types to handlers
//! - [`LogActionHandler`], a built-in handler that only logs

mod handler;
mod registry;

pub use handler::{ActionHandler, ActionOutcome, ActionRequest, LogActionHandler};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
