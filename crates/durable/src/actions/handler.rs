//! ActionHandler trait and the built-in log handler

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use flowgate_core::{ActionExecutionError, Phase};

use crate::persistence::ActionTask;

/// What a handler is asked to do
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action_id: Uuid,
    pub instance_id: Uuid,
    pub action_type: String,
    /// Opaque configuration from the definition
    pub config: Value,
    /// `None` for engine notices
    pub phase: Option<Phase>,
    /// Resolved instance context
    pub context: Value,
    /// 1-based attempt number
    pub attempt: u32,
}

impl From<&ActionTask> for ActionRequest {
    fn from(task: &ActionTask) -> Self {
        Self {
            action_id: task.id,
            instance_id: task.instance_id,
            action_type: task.action_type.clone(),
            config: task.config.clone(),
            phase: task.phase,
            context: task.context.clone(),
            attempt: task.attempt,
        }
    }
}

/// Result reported by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Ok,
    /// Transient failure; the dispatcher retries with backoff
    Retryable(String),
    /// Will never succeed; the action goes straight to dead
    Permanent(String),
}

impl ActionOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ActionOutcome::Ok)
    }
}

impl From<Result<(), ActionExecutionError>> for ActionOutcome {
    fn from(result: Result<(), ActionExecutionError>) -> Self {
        match result {
            Ok(()) => ActionOutcome::Ok,
            Err(e) if e.retryable => ActionOutcome::Retryable(e.message),
            Err(e) => ActionOutcome::Permanent(e.message),
        }
    }
}

/// A named side-effect executor
///
/// # Example
///
/// ```ignore
/// struct Webhook { client: HttpClient }
///
/// #[async_trait]
/// impl ActionHandler for Webhook {
///     async fn execute(&self, request: &ActionRequest) -> ActionOutcome {
///         match self.client.post(&request.config["url"], &request.context).await {
///             Ok(_) => ActionOutcome::Ok,
///             Err(e) if e.is_timeout() => ActionOutcome::Retryable(e.to_string()),
///             Err(e) => ActionOutcome::Permanent(e.to_string()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn execute(&self, request: &ActionRequest) -> ActionOutcome;
}

/// Logs the action and succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct LogActionHandler;

#[async_trait]
impl ActionHandler for LogActionHandler {
    async fn execute(&self, request: &ActionRequest) -> ActionOutcome {
        info!(
            instance_id = %request.instance_id,
            action_type = %request.action_type,
            phase = ?request.phase,
            attempt = request.attempt,
            config = %request.config,
            "action executed"
        );
        ActionOutcome::Ok
    }
}
