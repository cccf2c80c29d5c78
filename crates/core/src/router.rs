// Approval Router
//
// The per-instance state machine. Every transition is driven by exactly one
// of: a decision, a delegation, a fired timer, an override or a cancel. The
// router mutates the instance in memory and returns a `Transition` listing
// the audit events, timers and actions the caller must persist in the same
// commit. It never performs I/O other than approver resolution.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::definition::{ApproverRule, Phase, ResolutionFailurePolicy, Routing, WorkflowDefinition};
use crate::error::{EngineError, ResolutionError};
use crate::instance::{
    Decision, DecisionRecord, InstanceStatus, ResolutionCause, StepOutcome, StepState, StepStatus,
    WorkflowInstance,
};
use crate::resolver::{ApproverResolver, PrincipalId};
use crate::trace::TraceEvent;

// ============================================================================
// Transition output
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerKind {
    Reminder { offset_hours: u32 },
    Escalation,
    TerminalTimeout,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Reminder { .. } => "reminder",
            TimerKind::Escalation => "escalation",
            TimerKind::TerminalTimeout => "terminal_timeout",
        }
    }
}

/// A wake-up the scheduler must persist
///
/// `escalation_level` and `deadline` are a fencing token: a timer whose
/// token no longer matches the step is stale and is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRequest {
    pub step_number: Option<u32>,
    pub kind: TimerKind,
    pub due_at: DateTime<Utc>,
    pub escalation_level: u32,
    pub deadline: Option<DateTime<Utc>>,
}

/// Which pending timers a commit cancels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerScope {
    Step(u32),
    Instance,
}

/// A definition action that matched the phase just reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredAction {
    pub action_type: String,
    pub config: Value,
    pub phase: Phase,
}

/// Engine-originated notification routed through the action path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SystemNotice {
    Reminder {
        step_number: u32,
        offset_hours: u32,
        holders: Vec<PrincipalId>,
    },
    ErrorEscalation {
        reason: String,
        roles: Vec<String>,
    },
}

/// Side effects of one router call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub events: Vec<TraceEvent>,
    pub actions: Vec<TriggeredAction>,
    pub notices: Vec<SystemNotice>,
    pub timers: Vec<TimerRequest>,
    /// Applied before `timers` are scheduled
    pub cancel_timers: Vec<TimerScope>,
    /// Cancel every queued action of the instance before enqueueing `actions`
    pub cancel_actions: bool,
}

// ============================================================================
// Router
// ============================================================================

#[derive(Clone)]
pub struct ApprovalRouter {
    resolver: ApproverResolver,
    error_recipients: Vec<String>,
}

impl ApprovalRouter {
    pub fn new(resolver: ApproverResolver) -> Self {
        Self {
            resolver,
            error_recipients: Vec::new(),
        }
    }

    /// Roles notified when an instance enters `error`
    pub fn with_error_recipients(mut self, roles: Vec<String>) -> Self {
        self.error_recipients = roles;
        self
    }

    pub fn resolver(&self) -> &ApproverResolver {
        &self.resolver
    }

    /// Activate the first step (sequential) or every step (parallel)
    #[instrument(skip_all, fields(instance_id = %instance.id, definition_id = %def.id))]
    pub async fn start(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        now: DateTime<Utc>,
    ) -> Transition {
        let mut tx = Transition::default();
        tx.events.push(TraceEvent::InstanceCreated {
            definition_id: def.id,
            definition_version: def.version,
            subject: instance.subject.clone(),
        });
        if def.condition.is_some() {
            tx.events.push(TraceEvent::ConditionEvaluated { result: true });
        }
        self.reach_phase(def, Phase::ConditionMet, &mut tx);

        let initial: Vec<u32> = match def.routing() {
            Routing::Parallel => def.approvers.iter().map(|r| r.step_number).collect(),
            Routing::Sequential => def.approvers.first().map(|r| r.step_number).into_iter().collect(),
        };
        for step_number in initial {
            if instance.resolution.is_some() {
                break;
            }
            self.activate_step(def, instance, step_number, now, &mut tx).await;
        }

        self.settle(def, instance, now, &mut tx);
        info!(status = %instance.status, "instance started");
        tx
    }

    /// Record an approve/reject and advance the step if its quorum is decided
    #[instrument(skip_all, fields(instance_id = %instance.id, step_number = step_number, principal = %principal))]
    pub async fn record_decision(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_number: u32,
        principal: &str,
        decision: Decision,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, EngineError> {
        if decision == Decision::Delegate {
            return Err(EngineError::transition(
                "delegation is recorded through delegate, not as a decision",
            ));
        }
        ensure_open(instance)?;
        let rule = def.rule(step_number).ok_or(EngineError::StepNotFound {
            instance_id: instance.id,
            step: step_number,
        })?;
        let instance_id = instance.id;

        let mut tx = Transition::default();
        let outcome = {
            let step = instance
                .step_mut(step_number)
                .ok_or(EngineError::StepNotFound {
                    instance_id,
                    step: step_number,
                })?;
            ensure_accepting(step)?;
            let seat = step
                .seat_of(principal)
                .ok_or_else(|| EngineError::NotAnApprover {
                    principal: principal.to_string(),
                    step: step_number,
                })?;
            if step.has_voted(principal) {
                return Err(EngineError::AlreadyDecided {
                    principal: principal.to_string(),
                    step: step_number,
                });
            }

            let delegated_from = (seat != principal).then_some(seat);
            step.decisions.push(DecisionRecord {
                principal: principal.to_string(),
                decision,
                comment: comment.clone(),
                escalation_level: step.escalation_level,
                decided_at: now,
                delegated_from: delegated_from.clone(),
                delegated_to: None,
            });
            tx.events.push(TraceEvent::DecisionRecorded {
                step_number,
                principal: principal.to_string(),
                decision,
                comment,
                delegated_from,
            });

            let outcome = step.evaluate(rule.approval_mode.quorum());
            match outcome {
                StepOutcome::Undecided => {}
                StepOutcome::Satisfied => {
                    step.status = StepStatus::Satisfied;
                    step.deadline = None;
                    tx.events.push(TraceEvent::StepSatisfied { step_number });
                    tx.cancel_timers.push(TimerScope::Step(step_number));
                }
                StepOutcome::Failed => {
                    step.status = StepStatus::Failed;
                    step.deadline = None;
                    tx.events.push(TraceEvent::StepFailed { step_number });
                    tx.cancel_timers.push(TimerScope::Step(step_number));
                }
            }
            outcome
        };
        debug!(?decision, ?outcome, "decision recorded");

        if outcome == StepOutcome::Satisfied && def.routing() == Routing::Sequential {
            if let Some(next) = def.next_rule(step_number) {
                self.activate_step(def, instance, next.step_number, now, &mut tx)
                    .await;
            }
        }

        self.settle(def, instance, now, &mut tx);
        Ok(tx)
    }

    /// Hand one principal's decision right to another
    #[instrument(skip_all, fields(instance_id = %instance.id, step_number = step_number, from = %from, to = %to))]
    pub fn delegate(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_number: u32,
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EngineError> {
        ensure_open(instance)?;
        let instance_id = instance.id;
        let rule = def.rule(step_number).ok_or(EngineError::StepNotFound {
            instance_id,
            step: step_number,
        })?;
        if !rule.can_delegate {
            return Err(EngineError::DelegationNotAllowed(format!(
                "step {step_number} does not allow delegation"
            )));
        }
        let step = instance
            .step_mut(step_number)
            .ok_or(EngineError::StepNotFound {
                instance_id,
                step: step_number,
            })?;
        ensure_accepting(step)?;

        let seat = step
            .seat_of(from)
            .ok_or_else(|| EngineError::NotAnApprover {
                principal: from.to_string(),
                step: step_number,
            })?;
        if step.has_voted(from) {
            return Err(EngineError::AlreadyDecided {
                principal: from.to_string(),
                step: step_number,
            });
        }
        if from == to {
            return Err(EngineError::DelegationNotAllowed(
                "cannot delegate to self".to_string(),
            ));
        }
        // A target already on any seat's path would merge two seats into one holder
        if step.in_delegation_path(to) {
            return Err(EngineError::DelegationNotAllowed(format!(
                "{to} already takes part in step {step_number}"
            )));
        }
        // Edges in the seat's chain once `to` is appended
        let depth = step.holder_chain(&seat).len() as u32;
        if depth > def.policy.max_delegation_depth {
            return Err(EngineError::DelegationNotAllowed(format!(
                "delegation depth limit of {} reached",
                def.policy.max_delegation_depth
            )));
        }

        step.decisions.push(DecisionRecord {
            principal: from.to_string(),
            decision: Decision::Delegate,
            comment: None,
            escalation_level: step.escalation_level,
            decided_at: now,
            delegated_from: (seat != from).then_some(seat),
            delegated_to: Some(to.to_string()),
        });
        instance.updated_at = now;
        info!(depth, "decision right delegated");

        Ok(Transition {
            events: vec![TraceEvent::Delegated {
                step_number,
                from: from.to_string(),
                to: to.to_string(),
                depth,
            }],
            ..Default::default()
        })
    }

    /// Handle a scheduler wake-up; `None` when the timer is stale
    #[instrument(skip_all, fields(instance_id = %instance.id, kind = timer.kind.as_str(), step_number = ?timer.step_number))]
    pub async fn fire_timer(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        timer: &TimerRequest,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if instance.is_terminal() {
            debug!("timer for terminal instance discarded");
            return None;
        }

        let mut tx = Transition::default();
        match timer.kind {
            TimerKind::Reminder { offset_hours } => {
                let step = fenced_step(instance, timer)?;
                let holders: Vec<PrincipalId> = step
                    .principals
                    .iter()
                    .filter(|seat| step.vote_of(seat).is_none())
                    .map(|seat| step.holder_of(seat))
                    .collect();
                let step_number = step.step_number;
                tx.events.push(TraceEvent::ReminderDue {
                    step_number,
                    offset_hours,
                    holders: holders.clone(),
                });
                tx.notices.push(SystemNotice::Reminder {
                    step_number,
                    offset_hours,
                    holders,
                });
            }
            TimerKind::Escalation => {
                let step_number = fenced_step(instance, timer)?.step_number;
                self.escalate_step(def, instance, step_number, now, &mut tx)
                    .await;
            }
            TimerKind::TerminalTimeout => {
                if !instance
                    .steps
                    .iter()
                    .any(|s| s.status == StepStatus::Escalated)
                {
                    debug!("terminal timeout no longer applies");
                    return None;
                }
                self.apply_terminal_policy(def, instance, timer.step_number, now, &mut tx);
            }
        }

        instance.updated_at = now;
        self.settle(def, instance, now, &mut tx);
        Some(tx)
    }

    /// Force a terminal status, bypassing the remaining steps
    #[instrument(skip_all, fields(instance_id = %instance.id, actor = %actor, final_status = %final_status))]
    pub fn override_status(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        actor: &str,
        final_status: InstanceStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EngineError> {
        ensure_open(instance)?;
        if !final_status.is_terminal() {
            return Err(EngineError::transition(format!(
                "override target {final_status} is not a terminal status"
            )));
        }
        if reason.trim().is_empty() {
            return Err(EngineError::transition("override requires a reason"));
        }

        let bypassed_steps = instance.open_steps();
        instance.resolve(
            final_status,
            ResolutionCause::Override {
                actor: actor.to_string(),
                reason: reason.to_string(),
                bypassed_steps: bypassed_steps.clone(),
            },
            now,
        );
        instance.updated_at = now;

        let mut tx = Transition::default();
        tx.events.push(TraceEvent::Overridden {
            actor: actor.to_string(),
            reason: reason.to_string(),
            final_status,
            bypassed_steps,
        });
        warn!("instance overridden");
        self.settle(def, instance, now, &mut tx);
        Ok(tx)
    }

    /// Cancel the instance; pending timers and queued actions are dropped
    #[instrument(skip_all, fields(instance_id = %instance.id, actor = %actor))]
    pub fn cancel(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, EngineError> {
        ensure_open(instance)?;
        instance.resolve(
            InstanceStatus::Cancelled,
            ResolutionCause::Cancelled {
                actor: actor.to_string(),
                reason: reason.to_string(),
            },
            now,
        );
        instance.updated_at = now;

        let mut tx = Transition::default();
        tx.events.push(TraceEvent::Cancelled {
            actor: actor.to_string(),
            reason: reason.to_string(),
        });
        info!("instance cancelled");
        self.settle(def, instance, now, &mut tx);
        Ok(tx)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn activate_step(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_number: u32,
        now: DateTime<Utc>,
        tx: &mut Transition,
    ) {
        let Some(rule) = def.rule(step_number) else {
            return;
        };
        match self.resolve_from(def, rule, instance, 1, tx).await {
            Ok((level, principals)) => {
                let deadline = place_step(def, instance, rule, level, principals.clone(), now, tx);
                tx.events.push(TraceEvent::StepActivated {
                    step_number,
                    escalation_level: level,
                    principals,
                    deadline: Some(deadline),
                });
                info!(step_number, level, "step activated");
            }
            Err(err) => self.fail(instance, err.to_string(), now, tx),
        }
    }

    async fn escalate_step(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_number: u32,
        now: DateTime<Utc>,
        tx: &mut Transition,
    ) {
        let Some(rule) = def.rule(step_number) else {
            return;
        };
        let Some(from_level) = instance.step(step_number).map(|s| s.escalation_level) else {
            return;
        };

        if from_level < def.policy.escalation_levels {
            match self.resolve_from(def, rule, instance, from_level + 1, tx).await {
                Ok((level, principals)) => {
                    tx.cancel_timers.push(TimerScope::Step(step_number));
                    let deadline =
                        place_step(def, instance, rule, level, principals.clone(), now, tx);
                    tx.events.push(TraceEvent::StepEscalated {
                        step_number,
                        from_level,
                        to_level: level,
                        principals,
                        deadline: Some(deadline),
                    });
                    info!(step_number, from_level, to_level = level, "step escalated");
                    self.reach_phase(def, Phase::Escalation, tx);
                }
                Err(err) => self.fail(instance, err.to_string(), now, tx),
            }
        } else {
            if let Some(step) = instance.step_mut(step_number) {
                step.status = StepStatus::Escalated;
                step.deadline = None;
            }
            tx.events.push(TraceEvent::EscalationExhausted {
                step_number,
                level: from_level,
            });
            warn!(step_number, level = from_level, "escalation levels exhausted");
            self.apply_terminal_policy(def, instance, Some(step_number), now, tx);
        }
    }

    /// Resolve approvers starting at `level`, honoring the resolution-failure policy
    async fn resolve_from(
        &self,
        def: &WorkflowDefinition,
        rule: &ApproverRule,
        instance: &WorkflowInstance,
        level: u32,
        tx: &mut Transition,
    ) -> Result<(u32, Vec<PrincipalId>), ResolutionError> {
        let max = def.policy.escalation_levels.max(level);
        let mut level = level;
        loop {
            match self.resolver.resolve(rule, &instance.context, level).await {
                Ok(principals) => return Ok((level, principals)),
                Err(err) => {
                    tx.events.push(TraceEvent::ResolutionFailed {
                        step_number: rule.step_number,
                        escalation_level: level,
                        reason: err.to_string(),
                    });
                    let escalate =
                        def.policy.on_resolution_failure == ResolutionFailurePolicy::Escalate;
                    if escalate && level < max {
                        warn!(step_number = rule.step_number, level, error = %err, "resolution failed, escalating");
                        level += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Apply auto-cancel/auto-complete measured from instance creation
    fn apply_terminal_policy(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        step_number: Option<u32>,
        now: DateTime<Utc>,
        tx: &mut Transition,
    ) {
        let policy = &def.policy;
        let terminal = policy
            .auto_cancel_after_days
            .map(|days| (days, InstanceStatus::Cancelled))
            .or(policy
                .auto_complete_after_days
                .map(|days| (days, InstanceStatus::Completed)));

        let Some((days, final_status)) = terminal else {
            self.reach_phase(def, Phase::Timeout, tx);
            return;
        };

        let due = (instance.created_at + Duration::days(i64::from(days))).trunc_subsecs(6);
        if now >= due {
            instance.resolve(final_status, ResolutionCause::TerminalTimeout, now);
            tx.events.push(TraceEvent::TerminalTimeout { final_status });
            info!(%final_status, "terminal timeout applied");
            self.reach_phase(def, Phase::Timeout, tx);
        } else {
            let level = step_number
                .and_then(|n| instance.step(n))
                .map(|s| s.escalation_level)
                .unwrap_or_default();
            tx.timers.push(TimerRequest {
                step_number,
                kind: TimerKind::TerminalTimeout,
                due_at: due,
                escalation_level: level,
                deadline: None,
            });
        }
    }

    fn fail(
        &self,
        instance: &mut WorkflowInstance,
        reason: String,
        now: DateTime<Utc>,
        tx: &mut Transition,
    ) {
        instance.resolve(
            InstanceStatus::Error,
            ResolutionCause::Error {
                reason: reason.clone(),
            },
            now,
        );
        tx.events.push(TraceEvent::ErrorRaised {
            reason: reason.clone(),
            notify_roles: self.error_recipients.clone(),
        });
        tx.notices.push(SystemNotice::ErrorEscalation {
            reason: reason.clone(),
            roles: self.error_recipients.clone(),
        });
        warn!(%reason, "instance moved to error");
    }

    fn reach_phase(&self, def: &WorkflowDefinition, phase: Phase, tx: &mut Transition) {
        tx.events.push(TraceEvent::PhaseReached { phase });
        for action in def.actions_for(phase) {
            tx.events.push(TraceEvent::ActionTriggered {
                action_type: action.action_type.clone(),
                phase,
            });
            tx.actions.push(TriggeredAction {
                action_type: action.action_type.clone(),
                config: action.config.clone(),
                phase,
            });
        }
    }

    /// Recompute status, record the change and fire approval/rejection actions
    fn settle(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        now: DateTime<Utc>,
        tx: &mut Transition,
    ) {
        let Some(from) = instance.refresh_status() else {
            return;
        };
        let to = instance.status;
        instance.updated_at = now;
        tx.events.push(TraceEvent::StatusChanged { from, to });
        info!(%from, %to, "instance status changed");

        if to.is_terminal() && !from.is_terminal() {
            tx.cancel_timers.push(TimerScope::Instance);
            if to == InstanceStatus::Cancelled {
                tx.cancel_actions = true;
            }
        }
        match to {
            InstanceStatus::Approved => self.reach_phase(def, Phase::Approval, tx),
            InstanceStatus::Rejected => self.reach_phase(def, Phase::Rejection, tx),
            _ => {}
        }
    }
}

fn ensure_open(instance: &WorkflowInstance) -> Result<(), EngineError> {
    if instance.is_terminal() {
        Err(EngineError::transition(format!(
            "instance {} is already {}",
            instance.id, instance.status
        )))
    } else {
        Ok(())
    }
}

fn ensure_accepting(step: &StepState) -> Result<(), EngineError> {
    if step.status.accepts_decisions() {
        Ok(())
    } else {
        Err(EngineError::transition(format!(
            "step {} is not accepting decisions ({:?})",
            step.step_number, step.status
        )))
    }
}

/// The step a reminder/escalation timer targets, if its fencing token still matches
fn fenced_step<'a>(instance: &'a WorkflowInstance, timer: &TimerRequest) -> Option<&'a StepState> {
    let step = instance.step(timer.step_number?)?;
    let current = step.status == StepStatus::Active
        && step.escalation_level == timer.escalation_level
        && step.deadline == timer.deadline;
    if current {
        Some(step)
    } else {
        debug!(
            step_number = step.step_number,
            level = step.escalation_level,
            timer_level = timer.escalation_level,
            "stale timer discarded"
        );
        None
    }
}

/// Mark a step active at `level` and schedule its escalation and reminders
fn place_step(
    def: &WorkflowDefinition,
    instance: &mut WorkflowInstance,
    rule: &ApproverRule,
    level: u32,
    principals: Vec<PrincipalId>,
    now: DateTime<Utc>,
    tx: &mut Transition,
) -> DateTime<Utc> {
    let deadline = (now + Duration::hours(i64::from(def.policy.timeout_for(rule)))).trunc_subsecs(6);
    if let Some(step) = instance.step_mut(rule.step_number) {
        step.status = StepStatus::Active;
        step.principals = principals;
        step.escalation_level = level;
        step.deadline = Some(deadline);
        step.activated_at = Some(now);
    }

    tx.timers.push(TimerRequest {
        step_number: Some(rule.step_number),
        kind: TimerKind::Escalation,
        due_at: deadline,
        escalation_level: level,
        deadline: Some(deadline),
    });
    for offset in &def.policy.reminder_offsets_hours {
        let due_at = deadline - Duration::hours(i64::from(*offset));
        if due_at > now {
            tx.timers.push(TimerRequest {
                step_number: Some(rule.step_number),
                kind: TimerKind::Reminder {
                    offset_hours: *offset,
                },
                due_at,
                escalation_level: level,
                deadline: Some(deadline),
            });
        }
    }
    deadline
}
