// Concurrent decision tests
//
// Several callers act on one instance at once; the optimistic commit loop
// must keep every vote and fire terminal actions exactly once.
//
// Run with: cargo test -p flowgate-engine --test concurrency_test

mod common;

use common::*;
use flowgate_core::{
    Action, ApprovalMode, ApproverRule, Decision, DefinitionDraft, EngineError, ExecuteOn,
    InstanceStatus, TriggerDescriptor,
};
use flowgate_engine::{DomainEvent, EngineConfig};
use serde_json::json;

fn committee_draft(mode: ApprovalMode) -> DefinitionDraft {
    DefinitionDraft::new("Committee", TriggerDescriptor::new("grants", "application_filed"))
        .with_approver(ApproverRule::role(1, "committee").with_mode(mode))
        .with_action(Action::new("notify_approved", ExecuteOn::Approval))
}

fn application() -> DomainEvent {
    DomainEvent::new("grants", "application_filed", "grant-11")
        .with_context(json!({ "requester_id": "alice" }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_votes_are_all_kept() {
    let h = Harness::with_config(EngineConfig::default().with_conflict_retries(10));
    h.install(committee_draft(ApprovalMode::AllRequired)).await;
    let id = h.submit(&employee("alice"), application()).await;

    let members = ["c1", "c2", "c3", "c4", "c5"];
    let handles: Vec<_> = members
        .into_iter()
        .map(|member| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .record_decision(&manager(member), id, 1, member, Decision::Approve, None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let inst = h.instance(id).await;
    assert_eq!(inst.status, InstanceStatus::Approved);
    assert_eq!(inst.step(1).unwrap().decisions.len(), 5);
    assert_eq!(count_kind(&h.audit(id).await, "decision_recorded"), 5);
    assert_eq!(h.recorder.count("notify_approved"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_any_one_votes_resolve_once() {
    let h = Harness::with_config(EngineConfig::default().with_conflict_retries(10));
    h.install(committee_draft(ApprovalMode::AnyOne)).await;
    let id = h.submit(&employee("alice"), application()).await;

    let handles: Vec<_> = ["c1", "c2", "c3"]
        .into_iter()
        .map(|member| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .record_decision(&manager(member), id, 1, member, Decision::Approve, None)
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(status) => {
                assert_eq!(status, InstanceStatus::Approved);
                accepted += 1;
            }
            // Lost the race after the step was already satisfied
            Err(EngineError::InvalidTransition(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(accepted >= 1);
    assert_eq!(h.instance(id).await.status, InstanceStatus::Approved);
    assert_eq!(h.recorder.count("notify_approved"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_approval() {
    let h = Harness::new();
    h.install(
        DefinitionDraft::new("Expense", TriggerDescriptor::new("expenses", "claim_submitted"))
            .with_approver(ApproverRule::direct_manager(1))
            .with_action(Action::new("notify_approved", ExecuteOn::Approval)),
    )
    .await;
    let id = h
        .submit(
            &employee("alice"),
            DomainEvent::new("expenses", "claim_submitted", "claim-4")
                .with_context(json!({ "requester_id": "alice" })),
        )
        .await;

    let approve = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .record_decision(&manager("bob"), id, 1, "bob", Decision::Approve, None)
                .await
        })
    };
    let cancel = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.cancel(&admin(), id, "admin-1", "withdrawn").await })
    };
    let (approve, cancel) = (approve.await.unwrap(), cancel.await.unwrap());

    // Exactly one of them wins; the loser sees a terminal instance
    let status = h.instance(id).await.status;
    match status {
        InstanceStatus::Approved => {
            assert!(approve.is_ok());
            assert!(matches!(cancel, Err(EngineError::InvalidTransition(_))));
            assert_eq!(h.recorder.count("notify_approved"), 1);
        }
        InstanceStatus::Cancelled => {
            assert!(cancel.is_ok());
            assert!(approve.is_err());
            assert_eq!(h.recorder.count("notify_approved"), 0);
        }
        other => panic!("unexpected status {other}"),
    }
}
