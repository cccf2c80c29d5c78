// Approval Engine Core
//
// This crate provides a DB-agnostic implementation of a rule-driven
// approval state machine (definition → instance → steps → terminal status).
//
// Key design decisions:
// - Condition trees are tagged enums, validated when a definition is saved
// - Approver types map to pluggable ApproverStrategy implementations
// - Org-chart lookups go through the IdentityDirectory trait
// - The router returns a Transition (events, timers, actions) instead of
//   performing side effects, so callers can persist it atomically
// - Instance status is derived from step state plus an audited resolution
// - Time is injected through Clock so timers are testable

pub mod clock;
pub mod condition;
pub mod definition;
pub mod directory;
pub mod error;
pub mod guard;
pub mod instance;
pub mod resolver;
pub mod router;
pub mod telemetry;
pub mod trace;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{ConditionEvaluator, ConditionNode, EvaluationContext, Logic, Operator};
pub use definition::{
    Action, ApprovalMode, ApproverRule, ApproverType, DefinitionDraft, DefinitionPolicy,
    ExecuteOn, Phase, Quorum, ResolutionFailurePolicy, Routing, TriggerDescriptor,
    WorkflowDefinition,
};
pub use directory::{OrgChart, StaticDirectory};
pub use error::{
    ActionExecutionError, ConditionError, DefinitionError, EngineError, ResolutionError, Result,
};
pub use guard::{Capability, PermissionGuard, PermissionMatrix, Principal};
pub use instance::{
    Decision, DecisionRecord, InstanceResolution, InstanceStatus, ResolutionCause, StepOutcome,
    StepState, StepStatus, SubjectRef, WorkflowInstance,
};
pub use resolver::{
    ApproverResolver, ApproverStrategy, DirectoryQuery, IdentityDirectory, PrincipalId,
    ResolutionRequest,
};
pub use router::{
    ApprovalRouter, SystemNotice, TimerKind, TimerRequest, TimerScope, Transition,
    TriggeredAction,
};
pub use trace::{decision_trace, AuditEntry, TraceEvent};
