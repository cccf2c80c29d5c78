// Simulation
//
// Runs trigger matching, condition evaluation, approver resolution and the
// router against a hypothetical event without touching the store. Timers
// live in a virtual queue driven by a private manual clock, and actions are
// recorded instead of dispatched. The router is the same one real runs use,
// so the decision trace matches what a real run would audit.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use flowgate_core::{
    Capability, Clock, Decision, DefinitionError, InstanceStatus, ManualClock, Phase, Result,
    TimerRequest, TimerScope, TraceEvent, Transition, WorkflowDefinition, WorkflowInstance,
};

use crate::context::ExecutionContext;
use crate::engine::{notice_action_type, WorkflowEngine};
use crate::event::DomainEvent;

/// One scripted input applied after the instance starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SimulationStep {
    Decide {
        step_number: u32,
        principal: String,
        decision: Decision,
        #[serde(default)]
        comment: Option<String>,
    },
    Delegate {
        step_number: u32,
        from: String,
        to: String,
    },
    /// Move virtual time forward, firing every timer that falls due
    AdvanceHours { hours: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub definition_id: Uuid,
    /// Latest version when unset
    #[serde(default)]
    pub version: Option<u32>,
    pub event: DomainEvent,
    #[serde(default)]
    pub steps: Vec<SimulationStep>,
}

impl SimulationRequest {
    pub fn new(definition_id: Uuid, event: DomainEvent) -> Self {
        Self {
            definition_id,
            version: None,
            event,
            steps: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn decide(mut self, step_number: u32, principal: impl Into<String>, decision: Decision) -> Self {
        self.steps.push(SimulationStep::Decide {
            step_number,
            principal: principal.into(),
            decision,
            comment: None,
        });
        self
    }

    pub fn delegate(
        mut self,
        step_number: u32,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.steps.push(SimulationStep::Delegate {
            step_number,
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn advance_hours(mut self, hours: u32) -> Self {
        self.steps.push(SimulationStep::AdvanceHours { hours });
        self
    }
}

/// An action a real run would have dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub action_type: String,
    /// `None` for engine notices
    pub phase: Option<Phase>,
    pub config: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationTrace {
    pub definition_id: Uuid,
    pub definition_version: u32,
    pub trigger_matched: bool,
    /// `None` when the trigger did not match
    pub condition_result: Option<bool>,
    /// Decision/condition trace, identical to a real run's audit
    pub events: Vec<TraceEvent>,
    pub recorded_actions: Vec<RecordedAction>,
    /// Timers still waiting when the script ended
    pub pending_timers: Vec<TimerRequest>,
    pub instance: Option<WorkflowInstance>,
}

impl SimulationTrace {
    fn empty(definition: &WorkflowDefinition) -> Self {
        Self {
            definition_id: definition.id,
            definition_version: definition.version,
            trigger_matched: false,
            condition_result: None,
            events: Vec::new(),
            recorded_actions: Vec::new(),
            pending_timers: Vec::new(),
            instance: None,
        }
    }

    pub fn final_status(&self) -> Option<InstanceStatus> {
        self.instance.as_ref().map(|i| i.status)
    }

    pub fn actions_of(&self, action_type: &str) -> usize {
        self.recorded_actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }
}

/// In-memory stand-in for the store and scheduler
struct VirtualRun {
    instance: WorkflowInstance,
    clock: ManualClock,
    timers: Vec<TimerRequest>,
    events: Vec<TraceEvent>,
    recorded: Vec<RecordedAction>,
}

impl VirtualRun {
    /// Apply a transition the way a commit would
    fn absorb(&mut self, tx: Transition) {
        let now = self.clock.now();
        for scope in &tx.cancel_timers {
            self.timers.retain(|t| !in_scope(t, scope));
        }
        for timer in tx.timers {
            if !self.timers.contains(&timer) {
                self.timers.push(timer);
            }
        }
        self.events.extend(tx.events);
        for action in tx.actions {
            self.recorded.push(RecordedAction {
                action_type: action.action_type,
                phase: Some(action.phase),
                config: action.config,
                at: now,
            });
        }
        for notice in tx.notices {
            self.recorded.push(RecordedAction {
                action_type: notice_action_type(&notice).to_string(),
                phase: None,
                config: serde_json::to_value(&notice).unwrap_or_default(),
                at: now,
            });
        }
    }

    /// Earliest timer due at or before `until`
    fn next_due(&mut self, until: DateTime<Utc>) -> Option<TimerRequest> {
        let (index, _) = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due_at <= until)
            .min_by_key(|(_, t)| t.due_at)?;
        Some(self.timers.remove(index))
    }
}

fn in_scope(timer: &TimerRequest, scope: &TimerScope) -> bool {
    match scope {
        TimerScope::Instance => true,
        TimerScope::Step(n) => timer.step_number == Some(*n),
    }
}

impl WorkflowEngine {
    /// Dry-run a definition against a hypothetical event
    #[instrument(skip_all, fields(definition_id = %request.definition_id, caller = %ctx.principal.id))]
    pub async fn simulate(
        &self,
        ctx: &ExecutionContext,
        request: SimulationRequest,
    ) -> Result<SimulationTrace> {
        self.guard.check(&ctx.principal, Capability::Simulate)?;

        let def = self
            .load_definition(request.definition_id, request.version)
            .await?;
        if !def.policy.enable_simulation {
            return Err(DefinitionError::SimulationDisabled.into());
        }

        let mut trace = SimulationTrace::empty(&def);
        let event = &request.event;
        trace.trigger_matched = def.trigger.matches(&event.module, &event.event_type);
        if !trace.trigger_matched {
            debug!("simulated event does not match the trigger");
            return Ok(trace);
        }

        let eval_ctx = event.evaluation_context();
        let passed = self.matcher.condition_passes(&def, &eval_ctx)?;
        trace.condition_result = Some(passed);
        if !passed {
            return Ok(trace);
        }

        let clock = ManualClock::new(self.clock.now());
        let mut instance = WorkflowInstance::new(
            def.id,
            def.version,
            event.subject(),
            eval_ctx,
            def.approvers.iter().map(|r| r.step_number),
            clock.now(),
        );
        instance.sandboxed = true;
        let mut run = VirtualRun {
            instance,
            clock,
            timers: Vec::new(),
            events: Vec::new(),
            recorded: Vec::new(),
        };

        let tx = self
            .router
            .start(&def, &mut run.instance, run.clock.now())
            .await;
        run.absorb(tx);

        for step in request.steps {
            match step {
                SimulationStep::Decide {
                    step_number,
                    principal,
                    decision,
                    comment,
                } => {
                    let tx = self
                        .router
                        .record_decision(
                            &def,
                            &mut run.instance,
                            step_number,
                            &principal,
                            decision,
                            comment,
                            run.clock.now(),
                        )
                        .await?;
                    run.absorb(tx);
                }
                SimulationStep::Delegate {
                    step_number,
                    from,
                    to,
                } => {
                    let tx = self.router.delegate(
                        &def,
                        &mut run.instance,
                        step_number,
                        &from,
                        &to,
                        run.clock.now(),
                    )?;
                    run.absorb(tx);
                }
                SimulationStep::AdvanceHours { hours } => {
                    let until = run.clock.now() + Duration::hours(i64::from(hours));
                    while let Some(timer) = run.next_due(until) {
                        if timer.due_at > run.clock.now() {
                            run.clock.set(timer.due_at);
                        }
                        if let Some(tx) = self
                            .router
                            .fire_timer(&def, &mut run.instance, &timer, run.clock.now())
                            .await
                        {
                            run.absorb(tx);
                        }
                    }
                    run.clock.set(until);
                }
            }
        }

        debug!(
            status = %run.instance.status,
            events = run.events.len(),
            recorded_actions = run.recorded.len(),
            "simulation finished"
        );
        trace.events = run.events;
        trace.recorded_actions = run.recorded;
        trace.pending_timers = run.timers;
        trace.instance = Some(run.instance);
        Ok(trace)
    }
}
