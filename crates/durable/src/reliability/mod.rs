//! Reliability primitives for side-effect execution

mod retry;

pub use retry::RetryPolicy;
