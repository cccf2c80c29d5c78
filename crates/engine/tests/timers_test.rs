// Escalation, reminder and terminal timeout tests
//
// Time is driven by the harness's manual clock; timers fire through the
// durable scheduler exactly as they would in the worker.
//
// Run with: cargo test -p flowgate-engine --test timers_test

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::*;
use flowgate_core::{
    Action, Clock, Decision, DefinitionPolicy, ExecuteOn, InstanceStatus, StepStatus,
    TimerKind, TraceEvent,
};
use flowgate_durable::persistence::EngineStore;
use flowgate_durable::{EscalationScheduler, SchedulerConfig};
use flowgate_engine::REMINDER_ACTION;

#[tokio::test]
async fn test_unanswered_step_escalates_after_default_timeout() {
    let h = Harness::new();
    h.install(trip_draft()).await;
    let submitted_at = h.clock.now();
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    let step = h.instance(id).await.step(1).cloned().unwrap();
    assert_eq!(step.deadline, Some(submitted_at + Duration::hours(24)));

    println!("Step 1: one hour short of the deadline nothing fires");
    h.advance_hours(23).await;
    assert_eq!(h.instance(id).await.step(1).unwrap().escalation_level, 1);

    println!("Step 2: deadline passes, step moves to the next manager");
    h.advance_hours(1).await;
    let inst = h.instance(id).await;
    let step = inst.step(1).unwrap();
    assert_eq!(inst.status, InstanceStatus::Escalated);
    assert_eq!(step.escalation_level, 2);
    assert_eq!(step.principals, vec!["carol"]);
    assert_eq!(step.deadline, Some(submitted_at + Duration::hours(48)));

    let audit = h.audit(id).await;
    assert_eq!(escalations(&audit), vec![(1, 2)]);

    // The next level's timer is the only one pending for the step
    let pending = h.store.pending_timers(id).await.unwrap();
    let escalation_timers: Vec<_> = pending
        .iter()
        .filter(|t| t.timer.kind == TimerKind::Escalation)
        .collect();
    assert_eq!(escalation_timers.len(), 1);
    assert_eq!(escalation_timers[0].timer.escalation_level, 2);

    println!("Step 3: the escalated approver can decide");
    let status = h
        .engine
        .record_decision(&manager("carol"), id, 1, "carol", Decision::Approve, None)
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Pending);
    assert_eq!(active_steps(&h.instance(id).await), vec![2]);
}

#[tokio::test]
async fn test_decision_before_deadline_cancels_escalation() {
    let h = Harness::new();
    h.install(trip_draft()).await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    h.clock.advance(Duration::hours(2));
    h.engine
        .record_decision(&manager("bob"), id, 1, "bob", Decision::Approve, None)
        .await
        .unwrap();

    // Step 1's original deadline passes; step 2's is still two hours away
    h.advance_hours(22).await;
    let inst = h.instance(id).await;
    assert_eq!(inst.status, InstanceStatus::Pending);
    assert_eq!(inst.step(2).unwrap().escalation_level, 1);
    assert!(escalations(&h.audit(id).await).is_empty());

    h.advance_hours(2).await;
    assert_eq!(escalations(&h.audit(id).await), vec![(1, 2)]);
    assert_eq!(h.instance(id).await.step(2).unwrap().escalation_level, 2);
}

#[tokio::test]
async fn test_escalation_action_fires_per_level() {
    let h = Harness::new();
    h.install(trip_draft().with_action(Action::new("webhook", ExecuteOn::Escalation)))
        .await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    h.advance_hours(24).await;
    h.advance_hours(24).await;

    assert_eq!(escalations(&h.audit(id).await), vec![(1, 2), (2, 3)]);
    assert_eq!(h.recorder.count("webhook"), 2);
    assert_eq!(h.instance(id).await.step(1).unwrap().principals, vec!["dana"]);
}

#[tokio::test]
async fn test_exhaustion_then_terminal_timeout_cancels() {
    let h = Harness::new();
    h.install(
        trip_draft()
            .with_action(Action::new("webhook", ExecuteOn::Timeout))
            .with_policy(DefinitionPolicy {
                escalation_levels: 1,
                auto_cancel_after_days: Some(2),
                ..Default::default()
            }),
    )
    .await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    h.advance_hours(24).await;
    let inst = h.instance(id).await;
    assert_eq!(inst.step(1).unwrap().status, StepStatus::Escalated);
    assert_eq!(inst.status, InstanceStatus::Escalated);
    let audit = h.audit(id).await;
    assert_eq!(count_kind(&audit, "escalation_exhausted"), 1);
    assert_eq!(h.recorder.count("webhook"), 0);

    // Still accepts decisions while waiting for the terminal timeout
    assert!(inst.step(1).unwrap().status.accepts_decisions());

    h.advance_hours(24).await;
    let inst = h.instance(id).await;
    assert_eq!(inst.status, InstanceStatus::Cancelled);
    assert_eq!(h.recorder.count("webhook"), 1);
    assert!(h.audit(id).await.iter().any(|e| matches!(
        e.event,
        TraceEvent::TerminalTimeout {
            final_status: InstanceStatus::Cancelled
        }
    )));
    assert!(h.store.pending_timers(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reminder_before_deadline() {
    let h = Harness::new();
    h.install(trip_draft().with_policy(DefinitionPolicy {
        reminder_offsets_hours: vec![4],
        ..Default::default()
    }))
    .await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    h.advance_hours(19).await;
    assert_eq!(h.recorder.count(REMINDER_ACTION), 0);

    h.advance_hours(1).await;
    assert_eq!(h.recorder.count(REMINDER_ACTION), 1);
    let reminder = h
        .recorder
        .calls()
        .into_iter()
        .find(|r| r.action_type == REMINDER_ACTION)
        .unwrap();
    assert_eq!(reminder.phase, None);
    assert_eq!(reminder.config["holders"][0], "bob");

    assert!(h.audit(id).await.iter().any(|e| matches!(
        &e.event,
        TraceEvent::ReminderDue { step_number: 1, offset_hours: 4, holders } if holders == &vec!["bob".to_string()]
    )));
    // A reminder does not escalate
    assert_eq!(h.instance(id).await.step(1).unwrap().escalation_level, 1);
}

fn reminders_due(audit: &[flowgate_core::AuditEntry]) -> usize {
    audit
        .iter()
        .filter(|e| matches!(e.event, TraceEvent::ReminderDue { .. }))
        .count()
}

#[tokio::test]
async fn test_reminder_fired_before_crash_is_not_repeated() {
    let h = Harness::new();
    h.install(trip_draft().with_policy(DefinitionPolicy {
        reminder_offsets_hours: vec![4],
        ..Default::default()
    }))
    .await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;
    h.clock.advance(Duration::hours(20));

    // Fires, then dies before the scheduler would complete the row
    let claimed = h
        .store
        .claim_due_timers("crashed-worker", h.clock.now(), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let outcome = flowgate_durable::TimerHandler::handle_timer(h.engine.as_ref(), &claimed[0])
        .await
        .unwrap();
    assert_eq!(outcome, flowgate_durable::TimerOutcome::Fired);

    h.clock.advance(Duration::minutes(5));
    assert_eq!(h.scheduler.reclaim_stale().await.unwrap(), 0);
    assert_eq!(h.scheduler.run_due().await.unwrap().fired, 0);

    assert_eq!(reminders_due(&h.audit(id).await), 1);
    assert_eq!(h.recorder.count(REMINDER_ACTION), 1);
}

#[tokio::test]
async fn test_worker_that_lost_its_claim_does_not_fire() {
    let h = Harness::new();
    h.install(trip_draft().with_policy(DefinitionPolicy {
        reminder_offsets_hours: vec![4],
        ..Default::default()
    }))
    .await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;
    h.clock.advance(Duration::hours(20));

    let slow = h
        .store
        .claim_due_timers("slow-worker", h.clock.now(), 10)
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(5));
    assert_eq!(h.scheduler.reclaim_stale().await.unwrap(), 1);
    assert_eq!(h.scheduler.run_due().await.unwrap().fired, 1);

    // The original holder wakes up after the row moved on
    let outcome = flowgate_durable::TimerHandler::handle_timer(h.engine.as_ref(), &slow[0])
        .await
        .unwrap();
    assert_eq!(outcome, flowgate_durable::TimerOutcome::Stale);
    assert!(!h.store.cancel_timer(slow[0].id, "slow-worker").await.unwrap());

    assert_eq!(reminders_due(&h.audit(id).await), 1);
    assert_eq!(h.recorder.count(REMINDER_ACTION), 1);
}

#[tokio::test]
async fn test_manual_escalation_replaces_step_timer() {
    let h = Harness::new();
    h.install(trip_draft()).await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    let err = h.engine.escalate(&manager("bob"), id, 1).await.unwrap_err();
    assert!(matches!(err, flowgate_core::EngineError::PermissionDenied { .. }));

    let status = h.engine.escalate(&admin(), id, 1).await.unwrap();
    assert_eq!(status, InstanceStatus::Escalated);
    assert_eq!(h.instance(id).await.step(1).unwrap().principals, vec!["carol"]);

    let levels: Vec<u32> = h
        .store
        .pending_timers(id)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.timer.kind == TimerKind::Escalation && t.timer.step_number == Some(1))
        .map(|t| t.timer.escalation_level)
        .collect();
    assert_eq!(levels, vec![2]);

    // Inactive step cannot be escalated
    let err = h.engine.escalate(&admin(), id, 2).await.unwrap_err();
    assert!(matches!(err, flowgate_core::EngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_competing_schedulers_fire_once() {
    let h = Harness::new();
    h.install(trip_draft()).await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;
    h.clock.advance(Duration::hours(24));

    let clock: Arc<dyn Clock> = Arc::new(h.clock.clone());
    let other = EscalationScheduler::new(
        h.store.clone(),
        h.engine.clone(),
        clock,
        SchedulerConfig::default().with_worker_id("other-scheduler"),
    );

    let (a, b) = tokio::join!(h.scheduler.run_due(), other.run_due());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.fired + b.fired, 1);
    assert_eq!(escalations(&h.audit(id).await), vec![(1, 2)]);
}

#[tokio::test]
async fn test_abandoned_claim_is_reclaimed() {
    let h = Harness::new();
    h.install(trip_draft()).await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;
    h.clock.advance(Duration::hours(24));

    // A worker claims the timer and dies before firing it
    let claimed = h
        .store
        .claim_due_timers("crashed-worker", h.clock.now(), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(h.scheduler.run_due().await.unwrap().claimed, 0);

    h.clock.advance(Duration::minutes(5));
    assert_eq!(h.scheduler.reclaim_stale().await.unwrap(), 1);
    let tick = h.scheduler.run_due().await.unwrap();
    assert_eq!(tick.fired, 1);
    assert_eq!(escalations(&h.audit(id).await), vec![(1, 2)]);
}

#[tokio::test]
async fn test_timer_for_finished_instance_is_stale() {
    let h = Harness::new();
    h.install(trip_draft()).await;
    let id = h.submit(&employee("alice"), trip_event(6000)).await;

    // Claimed before the decision lands, so the commit cannot cancel it
    h.clock.advance(Duration::hours(24));
    let claimed = h
        .store
        .claim_due_timers("slow-worker", h.clock.now(), 10)
        .await
        .unwrap();
    h.engine
        .override_instance(&admin(), id, "admin-1", InstanceStatus::Rejected, "withdrawn")
        .await
        .unwrap();

    let outcome = flowgate_durable::TimerHandler::handle_timer(h.engine.as_ref(), &claimed[0])
        .await
        .unwrap();
    assert_eq!(outcome, flowgate_durable::TimerOutcome::Stale);
    assert!(escalations(&h.audit(id).await).is_empty());
}
