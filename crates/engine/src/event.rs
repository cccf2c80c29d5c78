// Domain events ingested by the engine

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use flowgate_core::{EvaluationContext, SubjectRef};

/// Something happened to an entity in a business module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub module: String,
    pub event_type: String,
    pub entity_id: String,
    /// Fields of the triggering entity; nested objects are flattened
    #[serde(default)]
    pub context: Value,
}

impl DomainEvent {
    pub fn new(
        module: impl Into<String>,
        event_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            event_type: event_type.into(),
            entity_id: entity_id.into(),
            context: Value::Object(Default::default()),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn subject(&self) -> SubjectRef {
        SubjectRef::new(self.module.clone(), self.entity_id.clone())
    }

    pub fn evaluation_context(&self) -> EvaluationContext {
        EvaluationContext::from_json(&self.context)
    }
}

/// Result of `submit_event`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "instance_id", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created(Uuid),
    NoTriggerMatched,
}

impl SubmitOutcome {
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            SubmitOutcome::Created(id) => Some(*id),
            SubmitOutcome::NoTriggerMatched => None,
        }
    }
}
