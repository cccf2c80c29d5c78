// Trigger Matcher
//
// Selects the active definition an incoming event instantiates: the trigger
// must name the event's module and type, and the definition's condition
// must pass against the event context. Candidates are tried oldest first so
// the same event always lands on the same definition.

use tracing::debug;

use flowgate_core::{ConditionError, ConditionEvaluator, EvaluationContext, WorkflowDefinition};

use crate::event::DomainEvent;

#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Definitions whose trigger names the event, oldest first
    pub fn candidates<'a>(
        &self,
        definitions: &'a [WorkflowDefinition],
        event: &DomainEvent,
    ) -> Vec<&'a WorkflowDefinition> {
        let mut matching: Vec<&WorkflowDefinition> = definitions
            .iter()
            .filter(|d| d.active && d.trigger.matches(&event.module, &event.event_type))
            .collect();
        matching.sort_by_key(|d| (d.created_at, d.id));
        matching
    }

    /// Evaluate a definition's condition with its configured strictness
    pub fn condition_passes(
        &self,
        definition: &WorkflowDefinition,
        ctx: &EvaluationContext,
    ) -> Result<bool, ConditionError> {
        ConditionEvaluator::new(definition.policy.strict_conditions)
            .evaluate_opt(definition.condition.as_ref(), ctx)
    }

    /// First candidate whose condition passes
    ///
    /// A strict-mode condition error aborts matching instead of falling
    /// through to the next candidate.
    pub fn first_match<'a>(
        &self,
        definitions: &'a [WorkflowDefinition],
        event: &DomainEvent,
        ctx: &EvaluationContext,
    ) -> Result<Option<&'a WorkflowDefinition>, ConditionError> {
        for definition in self.candidates(definitions, event) {
            if self.condition_passes(definition, ctx)? {
                return Ok(Some(definition));
            }
            debug!(
                definition_id = %definition.id,
                version = definition.version,
                "condition did not match"
            );
        }
        Ok(None)
    }
}
