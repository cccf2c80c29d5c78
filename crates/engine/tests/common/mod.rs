// Shared harness for engine integration tests
//
// Wires the engine to the in-memory store, a manual clock, a static org
// chart and a recording action handler, with a dispatcher for inline
// dispatch and a scheduler for timers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use flowgate_core::{
    Action, ApproverRule, AuditEntry, Clock, ConditionNode, DefinitionDraft, ExecuteOn,
    ManualClock, Operator, Principal, StaticDirectory, StepStatus, TraceEvent, TriggerDescriptor,
    WorkflowDefinition, WorkflowInstance,
};
use flowgate_durable::{
    ActionDispatcher, ActionHandler, ActionOutcome, ActionRequest, DispatcherConfig,
    EscalationScheduler, HandlerRegistry, InMemoryEngineStore, RetryPolicy, SchedulerConfig,
};
use flowgate_engine::{
    DomainEvent, EngineConfig, ExecutionContext, SubmitOutcome, WorkflowEngine,
    ERROR_ESCALATION_ACTION, REMINDER_ACTION,
};

/// Records every request; answers with scripted outcomes, then `Ok`
#[derive(Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<ActionRequest>>,
    script: Mutex<VecDeque<ActionOutcome>>,
}

impl RecordingHandler {
    pub fn fail_next(&self, outcomes: impl IntoIterator<Item = ActionOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn calls(&self) -> Vec<ActionRequest> {
        self.calls.lock().clone()
    }

    pub fn count(&self, action_type: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.action_type == action_type)
            .count()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn execute(&self, request: &ActionRequest) -> ActionOutcome {
        self.calls.lock().push(request.clone());
        self.script.lock().pop_front().unwrap_or(ActionOutcome::Ok)
    }
}

pub struct Harness {
    pub store: Arc<InMemoryEngineStore>,
    pub clock: ManualClock,
    pub directory: Arc<StaticDirectory>,
    pub recorder: Arc<RecordingHandler>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<EscalationScheduler>,
}

pub const ACTION_TYPES: [&str; 4] = ["notify_approved", "notify_rejected", "webhook", "audit_log"];

pub fn org_chart() -> StaticDirectory {
    StaticDirectory::new()
        .with_manager("alice", "bob")
        .with_manager("bob", "carol")
        .with_manager("carol", "dana")
        .with_role("finance", ["fin1"])
        .with_role("board", ["b1", "b2", "b3"])
        .with_role("committee", ["c1", "c2", "c3", "c4", "c5"])
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryEngineStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let directory = Arc::new(org_chart());
        let recorder = Arc::new(RecordingHandler::default());

        let mut registry = HandlerRegistry::new();
        for action_type in ACTION_TYPES
            .into_iter()
            .chain([REMINDER_ACTION, ERROR_ESCALATION_ACTION])
        {
            registry.register(action_type, recorder.clone() as Arc<dyn ActionHandler>);
        }

        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            registry,
            shared_clock.clone(),
            DispatcherConfig::default().with_worker_id("test-dispatcher"),
        ));

        let config = config
            .with_inline_dispatch_timeout(StdDuration::from_secs(5))
            .with_action_retry_policy(RetryPolicy::fixed(StdDuration::from_secs(10), 3));
        let engine = Arc::new(
            WorkflowEngine::builder(store.clone(), directory.clone())
                .clock(shared_clock.clone())
                .config(config)
                .dispatcher(dispatcher.clone())
                .build(),
        );
        let scheduler = Arc::new(EscalationScheduler::new(
            store.clone(),
            engine.clone(),
            shared_clock,
            SchedulerConfig::default().with_worker_id("test-scheduler"),
        ));

        Self {
            store,
            clock,
            directory,
            recorder,
            dispatcher,
            engine,
            scheduler,
        }
    }

    /// Create and activate a definition as admin
    pub async fn install(&self, draft: DefinitionDraft) -> WorkflowDefinition {
        let def = self.engine.create_definition(&admin(), draft).await.unwrap();
        self.engine
            .activate_definition(&admin(), def.id, None)
            .await
            .unwrap()
    }

    pub async fn submit(&self, ctx: &ExecutionContext, event: DomainEvent) -> Uuid {
        match self.engine.submit_event(ctx, event).await.unwrap() {
            SubmitOutcome::Created(id) => id,
            SubmitOutcome::NoTriggerMatched => panic!("expected an instance to be created"),
        }
    }

    pub async fn instance(&self, id: Uuid) -> WorkflowInstance {
        self.engine.get_instance(&admin(), id).await.unwrap()
    }

    pub async fn audit(&self, id: Uuid) -> Vec<AuditEntry> {
        self.engine.audit_trail(&admin(), id).await.unwrap()
    }

    /// Advance time and fire whatever became due
    pub async fn advance_hours(&self, hours: i64) {
        self.clock.advance(Duration::hours(hours));
        self.scheduler.run_due().await.unwrap();
    }
}

pub fn admin() -> ExecutionContext {
    ExecutionContext::new(Principal::new("admin-1").with_role("admin"))
}

pub fn employee(id: &str) -> ExecutionContext {
    ExecutionContext::new(Principal::new(id).with_role("employee"))
}

pub fn manager(id: &str) -> ExecutionContext {
    ExecutionContext::new(Principal::new(id).with_role("manager"))
}

pub fn finance(id: &str) -> ExecutionContext {
    ExecutionContext::new(Principal::new(id).with_role("finance"))
}

/// Manager then finance, for trips over 5000
pub fn trip_draft() -> DefinitionDraft {
    DefinitionDraft::new("Trip approval", TriggerDescriptor::new("travel", "trip_requested"))
        .with_condition(ConditionNode::leaf(
            "cost_center_budget",
            Operator::GreaterThan,
            5000,
        ))
        .with_approver(ApproverRule::direct_manager(1))
        .with_approver(ApproverRule::role(2, "finance"))
        .with_action(Action::new("notify_approved", ExecuteOn::Approval))
        .with_action(Action::new("notify_rejected", ExecuteOn::Rejection))
}

pub fn trip_event(budget: i64) -> DomainEvent {
    DomainEvent::new("travel", "trip_requested", format!("trip-{budget}")).with_context(json!({
        "requester_id": "alice",
        "cost_center_budget": budget,
    }))
}

pub fn kinds(entries: &[AuditEntry]) -> Vec<&'static str> {
    entries.iter().map(|e| e.event.kind()).collect()
}

pub fn count_kind(entries: &[AuditEntry], kind: &str) -> usize {
    entries.iter().filter(|e| e.event.kind() == kind).count()
}

pub fn escalations(entries: &[AuditEntry]) -> Vec<(u32, u32)> {
    entries
        .iter()
        .filter_map(|e| match &e.event {
            TraceEvent::StepEscalated {
                from_level,
                to_level,
                ..
            } => Some((*from_level, *to_level)),
            _ => None,
        })
        .collect()
}

pub fn active_steps(instance: &WorkflowInstance) -> Vec<u32> {
    instance
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Active)
        .map(|s| s.step_number)
        .collect()
}
