// Simulation tests
//
// A simulated run must produce the same decision trace a real sandboxed
// run audits for the same inputs, without writing anything.
//
// Run with: cargo test -p flowgate-engine --test simulation_test

mod common;

use common::*;
use flowgate_core::{
    decision_trace, Decision, DefinitionError, DefinitionPolicy, EngineError, InstanceStatus,
    Phase, Principal, TimerKind,
};
use flowgate_engine::{ExecutionContext, SimulationRequest, REMINDER_ACTION};

fn auditor() -> ExecutionContext {
    ExecutionContext::new(Principal::new("aud-1").with_role("auditor"))
}

#[tokio::test]
async fn test_simulation_matches_real_sandboxed_run() {
    let h = Harness::new();
    let def = h.install(trip_draft()).await;

    println!("Step 1: simulate escalation, approval by the escalated manager, finance rejection");
    let trace = h
        .engine
        .simulate(
            &auditor(),
            SimulationRequest::new(def.id, trip_event(6000))
                .advance_hours(24)
                .decide(1, "carol", Decision::Approve)
                .decide(2, "fin1", Decision::Reject),
        )
        .await
        .unwrap();
    assert!(trace.trigger_matched);
    assert_eq!(trace.condition_result, Some(true));
    assert_eq!(trace.final_status(), Some(InstanceStatus::Rejected));
    assert_eq!(trace.actions_of("notify_rejected"), 1);
    assert_eq!(trace.actions_of("notify_approved"), 0);
    assert!(trace.pending_timers.is_empty());

    // Nothing was persisted or dispatched
    assert_eq!(h.store.instance_count(), 0);
    assert!(h.recorder.calls().is_empty());

    println!("Step 2: replay the same inputs as a real sandboxed run");
    let id = h
        .submit(&employee("alice").sandboxed(), trip_event(6000))
        .await;
    h.advance_hours(24).await;
    h.engine
        .record_decision(&manager("carol"), id, 1, "carol", Decision::Approve, None)
        .await
        .unwrap();
    h.engine
        .record_decision(&finance("fin1"), id, 2, "fin1", Decision::Reject, None)
        .await
        .unwrap();

    let audit = h.audit(id).await;
    assert_eq!(decision_trace(&audit), trace.events);
    assert!(h.recorder.calls().is_empty());
}

#[tokio::test]
async fn test_simulation_of_inactive_definition() {
    let h = Harness::new();
    let draft = h
        .engine
        .create_definition(&admin(), trip_draft())
        .await
        .unwrap();
    assert!(!draft.active);

    let trace = h
        .engine
        .simulate(
            &admin(),
            SimulationRequest::new(draft.id, trip_event(6000))
                .decide(1, "bob", Decision::Approve)
                .decide(2, "fin1", Decision::Approve),
        )
        .await
        .unwrap();
    assert_eq!(trace.final_status(), Some(InstanceStatus::Approved));
    let approved = trace
        .recorded_actions
        .iter()
        .find(|a| a.action_type == "notify_approved")
        .unwrap();
    assert_eq!(approved.phase, Some(Phase::Approval));
}

#[tokio::test]
async fn test_simulation_condition_not_met() {
    let h = Harness::new();
    let def = h.install(trip_draft()).await;

    let trace = h
        .engine
        .simulate(&auditor(), SimulationRequest::new(def.id, trip_event(100)))
        .await
        .unwrap();
    assert!(trace.trigger_matched);
    assert_eq!(trace.condition_result, Some(false));
    assert!(trace.instance.is_none());
    assert!(trace.events.is_empty());
}

#[tokio::test]
async fn test_simulation_reports_pending_timers_and_reminders() {
    let h = Harness::new();
    let def = h
        .install(trip_draft().with_policy(DefinitionPolicy {
            reminder_offsets_hours: vec![4],
            ..Default::default()
        }))
        .await;

    let trace = h
        .engine
        .simulate(
            &auditor(),
            SimulationRequest::new(def.id, trip_event(6000)).advance_hours(21),
        )
        .await
        .unwrap();
    assert_eq!(trace.final_status(), Some(InstanceStatus::Pending));
    assert_eq!(trace.actions_of(REMINDER_ACTION), 1);
    let kinds: Vec<TimerKind> = trace.pending_timers.iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TimerKind::Escalation]);
}

#[tokio::test]
async fn test_simulation_permissions_and_policy() {
    let h = Harness::new();
    let def = h.install(trip_draft()).await;

    let err = h
        .engine
        .simulate(&manager("bob"), SimulationRequest::new(def.id, trip_event(6000)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied { .. }));

    let closed = h
        .install(trip_draft().with_policy(DefinitionPolicy {
            enable_simulation: false,
            ..Default::default()
        }))
        .await;
    let err = h
        .engine
        .simulate(&auditor(), SimulationRequest::new(closed.id, trip_event(6000)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Definition(DefinitionError::SimulationDisabled)
    ));
}

#[tokio::test]
async fn test_simulation_surfaces_routing_errors() {
    let h = Harness::new();
    let def = h.install(trip_draft()).await;

    let err = h
        .engine
        .simulate(
            &auditor(),
            SimulationRequest::new(def.id, trip_event(6000)).decide(1, "mallory", Decision::Approve),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAnApprover { .. }));
}
