// Error types for the approval engine
//
// Authority-affecting failures (condition, resolution, permission) block
// progression. Side-effect failures (actions) are reported separately and
// never reverse a recorded decision.

use thiserror::Error;
use uuid::Uuid;

use crate::guard::Capability;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Malformed definition content, rejected before activation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("definition name must not be empty")]
    EmptyName,

    #[error("trigger must name both a module and an event type")]
    InvalidTrigger,

    #[error("definition must contain at least one approver rule")]
    NoApprovers,

    #[error("duplicate step number {0}")]
    DuplicateStep(u32),

    #[error("step {step}: {reason}")]
    InvalidRule { step: u32, reason: String },

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("versioning is disabled; deactivate the definition before editing it")]
    VersioningDisabled,

    #[error("rollback is disabled for this definition")]
    RollbackDisabled,

    #[error("simulation is disabled for this definition")]
    SimulationDisabled,
}

/// Condition evaluation failure (strict mode only)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("context field '{0}' is missing")]
    MissingField(String),
}

/// Approver resolution failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("step {step}: approver set for {approver_type} resolved empty")]
    EmptyApproverSet { step: u32, approver_type: String },

    #[error("step {step}: subject field '{field}' missing from context")]
    MissingSubject { step: u32, field: String },

    #[error("step {step}: {approver_type} requires a selector")]
    MissingSelector { step: u32, approver_type: String },

    #[error("no strategy registered for approver type {0}")]
    NoStrategy(String),

    #[error("identity directory error: {0}")]
    Directory(String),
}

/// Failure reported by an action handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("action '{action_type}' failed: {message}")]
pub struct ActionExecutionError {
    pub action_type: String,
    pub message: String,
    pub retryable: bool,
}

impl ActionExecutionError {
    pub fn retryable(action_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(action_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("permission denied: {principal} lacks {capability}")]
    PermissionDenied {
        principal: String,
        capability: Capability,
    },

    #[error("{caller} cannot record an action as {actor}")]
    ActorMismatch { caller: String, actor: String },

    #[error("concurrency conflict on instance {instance_id}")]
    ConcurrencyConflict { instance_id: Uuid },

    #[error(transparent)]
    ActionExecution(#[from] ActionExecutionError),

    #[error("definition not found: {0}")]
    DefinitionNotFound(Uuid),

    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("step {step} not found on instance {instance_id}")]
    StepNotFound { instance_id: Uuid, step: u32 },

    #[error("{principal} is not an approver for step {step}")]
    NotAnApprover { principal: String, step: u32 },

    #[error("{principal} already decided step {step}")]
    AlreadyDecided { principal: String, step: u32 },

    #[error("delegation not allowed: {0}")]
    DelegationNotAllowed(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Create an invalid transition error
    pub fn transition(msg: impl Into<String>) -> Self {
        EngineError::InvalidTransition(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        EngineError::Store(msg.into())
    }

    /// Whether the caller should retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict { .. })
    }
}
