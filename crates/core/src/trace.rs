// Audit trail events
//
// The router emits these as the decision/condition trace of an instance.
// Action dispatch outcomes are appended later by the dispatcher and are
// excluded from trace comparisons between real and simulated runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::Phase;
use crate::instance::{Decision, InstanceStatus, SubjectRef};
use crate::resolver::PrincipalId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    InstanceCreated {
        definition_id: Uuid,
        definition_version: u32,
        subject: SubjectRef,
    },
    ConditionEvaluated {
        result: bool,
    },
    StepActivated {
        step_number: u32,
        escalation_level: u32,
        principals: Vec<PrincipalId>,
        deadline: Option<DateTime<Utc>>,
    },
    DecisionRecorded {
        step_number: u32,
        principal: PrincipalId,
        decision: Decision,
        comment: Option<String>,
        delegated_from: Option<PrincipalId>,
    },
    Delegated {
        step_number: u32,
        from: PrincipalId,
        to: PrincipalId,
        depth: u32,
    },
    StepSatisfied {
        step_number: u32,
    },
    StepFailed {
        step_number: u32,
    },
    StepEscalated {
        step_number: u32,
        from_level: u32,
        to_level: u32,
        principals: Vec<PrincipalId>,
        deadline: Option<DateTime<Utc>>,
    },
    EscalationExhausted {
        step_number: u32,
        level: u32,
    },
    ReminderDue {
        step_number: u32,
        offset_hours: u32,
        holders: Vec<PrincipalId>,
    },
    PhaseReached {
        phase: Phase,
    },
    ActionTriggered {
        action_type: String,
        phase: Phase,
    },
    StatusChanged {
        from: InstanceStatus,
        to: InstanceStatus,
    },
    Overridden {
        actor: PrincipalId,
        reason: String,
        final_status: InstanceStatus,
        bypassed_steps: Vec<u32>,
    },
    Cancelled {
        actor: PrincipalId,
        reason: String,
    },
    TerminalTimeout {
        final_status: InstanceStatus,
    },
    ResolutionFailed {
        step_number: u32,
        escalation_level: u32,
        reason: String,
    },
    ErrorRaised {
        reason: String,
        notify_roles: Vec<String>,
    },

    // Appended outside the router
    ActionRecorded {
        action_type: String,
        phase: Option<Phase>,
    },
    ActionSucceeded {
        action_type: String,
        attempt: u32,
    },
    ActionFailed {
        action_type: String,
        attempt: u32,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },
    ActionExhausted {
        action_type: String,
        attempts: u32,
        error: String,
    },
    ActionCancelled {
        action_type: String,
    },
    InstanceDegraded {
        action_type: String,
    },
}

impl TraceEvent {
    /// Part of the decision/condition trace (as opposed to dispatch bookkeeping)
    pub fn is_decision_trace(&self) -> bool {
        !matches!(
            self,
            TraceEvent::ActionRecorded { .. }
                | TraceEvent::ActionSucceeded { .. }
                | TraceEvent::ActionFailed { .. }
                | TraceEvent::ActionExhausted { .. }
                | TraceEvent::ActionCancelled { .. }
                | TraceEvent::InstanceDegraded { .. }
        )
    }

    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::InstanceCreated { .. } => "instance_created",
            TraceEvent::ConditionEvaluated { .. } => "condition_evaluated",
            TraceEvent::StepActivated { .. } => "step_activated",
            TraceEvent::DecisionRecorded { .. } => "decision_recorded",
            TraceEvent::Delegated { .. } => "delegated",
            TraceEvent::StepSatisfied { .. } => "step_satisfied",
            TraceEvent::StepFailed { .. } => "step_failed",
            TraceEvent::StepEscalated { .. } => "step_escalated",
            TraceEvent::EscalationExhausted { .. } => "escalation_exhausted",
            TraceEvent::ReminderDue { .. } => "reminder_due",
            TraceEvent::PhaseReached { .. } => "phase_reached",
            TraceEvent::ActionTriggered { .. } => "action_triggered",
            TraceEvent::StatusChanged { .. } => "status_changed",
            TraceEvent::Overridden { .. } => "overridden",
            TraceEvent::Cancelled { .. } => "cancelled",
            TraceEvent::TerminalTimeout { .. } => "terminal_timeout",
            TraceEvent::ResolutionFailed { .. } => "resolution_failed",
            TraceEvent::ErrorRaised { .. } => "error_raised",
            TraceEvent::ActionRecorded { .. } => "action_recorded",
            TraceEvent::ActionSucceeded { .. } => "action_succeeded",
            TraceEvent::ActionFailed { .. } => "action_failed",
            TraceEvent::ActionExhausted { .. } => "action_exhausted",
            TraceEvent::ActionCancelled { .. } => "action_cancelled",
            TraceEvent::InstanceDegraded { .. } => "instance_degraded",
        }
    }
}

/// A persisted trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub instance_id: Uuid,
    /// Monotonic per instance, starting at 1
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: TraceEvent,
}

/// Decision/condition events only, in order
pub fn decision_trace<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Vec<TraceEvent> {
    entries
        .into_iter()
        .map(|e| &e.event)
        .filter(|e| e.is_decision_trace())
        .cloned()
        .collect()
}
