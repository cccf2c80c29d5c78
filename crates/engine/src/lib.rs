// Flowgate Workflow Engine
//
// The facade external modules call: event ingestion with trigger matching,
// decisions, delegation, override, cancellation, definition versioning and
// simulation. State changes are computed by the core router and persisted
// through the durable store; the engine also serves as the scheduler's
// timer handler.
//
// Example:
//
//   let engine = WorkflowEngine::builder(store, directory)
//       .clock(clock)
//       .dispatcher(dispatcher)
//       .build();
//   let outcome = engine.submit_event(&ctx, event).await?;

pub mod config;
pub mod context;
pub mod definitions;
pub mod engine;
pub mod event;
pub mod simulation;
pub mod trigger;

pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use definitions::{DeactivationMode, DeactivationReport};
pub use engine::{
    WorkflowEngine, WorkflowEngineBuilder, ERROR_ESCALATION_ACTION, REMINDER_ACTION,
};
pub use event::{DomainEvent, SubmitOutcome};
pub use simulation::{RecordedAction, SimulationRequest, SimulationStep, SimulationTrace};
pub use trigger::TriggerMatcher;
