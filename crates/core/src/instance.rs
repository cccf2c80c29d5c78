// Workflow instances and step state
//
// An instance's status is derived from its steps plus an optional
// resolution (override, cancel, terminal timeout, error). Decisions are
// append-only; delegation adds a record rather than editing one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::EvaluationContext;
use crate::definition::Quorum;
use crate::resolver::PrincipalId;

/// The domain entity an instance is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRef {
    pub module: String,
    pub entity_id: String,
}

impl SubjectRef {
    pub fn new(module: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            entity_id: entity_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Escalated,
    Completed,
    Error,
}

impl InstanceStatus {
    /// No further routing happens once terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Approved
                | InstanceStatus::Rejected
                | InstanceStatus::Cancelled
                | InstanceStatus::Completed
                | InstanceStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Approved => "approved",
            InstanceStatus::Rejected => "rejected",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Escalated => "escalated",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Inactive,
    Active,
    Satisfied,
    Failed,
    /// Escalation levels exhausted; still accepts decisions
    Escalated,
}

impl StepStatus {
    pub fn accepts_decisions(&self) -> bool {
        matches!(self, StepStatus::Active | StepStatus::Escalated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Delegate,
}

/// One append-only entry in a step's decision log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub principal: PrincipalId,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub escalation_level: u32,
    pub decided_at: DateTime<Utc>,
    /// Seat this decision was delegated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_from: Option<PrincipalId>,
    /// Target of a `Delegate` record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_to: Option<PrincipalId>,
}

/// Evaluation of a step's quorum over its current decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Undecided,
    Satisfied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_number: u32,
    pub status: StepStatus,
    /// Resolved when the step becomes active, replaced on escalation
    pub principals: Vec<PrincipalId>,
    pub decisions: Vec<DecisionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub escalation_level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn inactive(step_number: u32) -> Self {
        Self {
            step_number,
            status: StepStatus::Inactive,
            principals: Vec::new(),
            decisions: Vec::new(),
            deadline: None,
            escalation_level: 1,
            activated_at: None,
        }
    }

    fn current_level(&self) -> impl Iterator<Item = &DecisionRecord> {
        let level = self.escalation_level;
        self.decisions
            .iter()
            .filter(move |d| d.escalation_level == level)
    }

    /// Delegation path for a seat at the current level, starting with the seat itself
    pub fn holder_chain(&self, seat: &str) -> Vec<PrincipalId> {
        let mut chain = vec![seat.to_string()];
        loop {
            let Some(current) = chain.last() else { break };
            let next = self
                .current_level()
                .find(|d| d.decision == Decision::Delegate && &d.principal == current)
                .and_then(|d| d.delegated_to.clone());
            match next {
                Some(next) if !chain.contains(&next) => chain.push(next),
                _ => break,
            }
        }
        chain
    }

    /// True when `principal` is a seat, a delegator or a holder at the current level
    pub fn in_delegation_path(&self, principal: &str) -> bool {
        self.principals
            .iter()
            .any(|seat| self.holder_chain(seat).iter().any(|p| p == principal))
            || self
                .current_level()
                .any(|d| d.decision == Decision::Delegate && d.principal == principal)
    }

    /// Whoever currently holds the decision right for a seat
    pub fn holder_of(&self, seat: &str) -> PrincipalId {
        self.holder_chain(seat)
            .pop()
            .unwrap_or_else(|| seat.to_string())
    }

    /// All current holders, in seat order
    pub fn holders(&self) -> Vec<PrincipalId> {
        self.principals.iter().map(|s| self.holder_of(s)).collect()
    }

    /// Seat held by `principal`, if any
    pub fn seat_of(&self, principal: &str) -> Option<PrincipalId> {
        self.principals
            .iter()
            .find(|seat| self.holder_of(seat) == principal)
            .cloned()
    }

    /// Approve/reject cast by the current holder of a seat
    pub fn vote_of(&self, seat: &str) -> Option<Decision> {
        let holder = self.holder_of(seat);
        self.current_level()
            .find(|d| d.principal == holder && d.decision != Decision::Delegate)
            .map(|d| d.decision)
    }

    /// Whether the principal has cast an approve/reject at the current level
    pub fn has_voted(&self, principal: &str) -> bool {
        self.current_level()
            .any(|d| d.principal == principal && d.decision != Decision::Delegate)
    }

    /// Approvals and rejections at the current level
    pub fn tally(&self) -> (usize, usize) {
        self.principals
            .iter()
            .filter_map(|seat| self.vote_of(seat))
            .fold((0, 0), |(a, r), vote| match vote {
                Decision::Approve => (a + 1, r),
                Decision::Reject => (a, r + 1),
                Decision::Delegate => (a, r),
            })
    }

    pub fn evaluate(&self, quorum: Quorum) -> StepOutcome {
        let n = self.principals.len();
        if n == 0 {
            return StepOutcome::Undecided;
        }
        let (approvals, rejections) = self.tally();
        match quorum {
            Quorum::AllRequired => {
                if rejections > 0 {
                    StepOutcome::Failed
                } else if approvals == n {
                    StepOutcome::Satisfied
                } else {
                    StepOutcome::Undecided
                }
            }
            Quorum::AnyOne => {
                if approvals > 0 {
                    StepOutcome::Satisfied
                } else if rejections == n {
                    StepOutcome::Failed
                } else {
                    StepOutcome::Undecided
                }
            }
            Quorum::Majority => {
                if approvals * 2 > n {
                    StepOutcome::Satisfied
                } else if (n - rejections) * 2 <= n {
                    // Even if every remaining seat approves there is no majority
                    StepOutcome::Failed
                } else {
                    StepOutcome::Undecided
                }
            }
        }
    }
}

/// Why an instance reached a status not derived from its steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum ResolutionCause {
    Override {
        actor: PrincipalId,
        reason: String,
        bypassed_steps: Vec<u32>,
    },
    Cancelled {
        actor: PrincipalId,
        reason: String,
    },
    TerminalTimeout,
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResolution {
    pub status: InstanceStatus,
    pub cause: ResolutionCause,
    pub resolved_at: DateTime<Utc>,
}

/// One running execution of a pinned definition version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: u32,
    pub subject: SubjectRef,
    pub context: EvaluationContext,
    pub status: InstanceStatus,
    pub steps: Vec<StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<InstanceResolution>,
    /// An action exhausted its retries; approval status is unaffected
    #[serde(default)]
    pub degraded: bool,
    /// Actions are recorded instead of dispatched
    #[serde(default)]
    pub sandboxed: bool,
    /// Optimistic concurrency counter, bumped by every commit
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        definition_id: Uuid,
        definition_version: u32,
        subject: SubjectRef,
        context: EvaluationContext,
        step_numbers: impl IntoIterator<Item = u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id,
            definition_version,
            subject,
            context,
            status: InstanceStatus::Pending,
            steps: step_numbers.into_iter().map(StepState::inactive).collect(),
            resolution: None,
            degraded: false,
            sandboxed: false,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_number: u32) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    pub fn step_mut(&mut self, step_number: u32) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.step_number == step_number)
    }

    pub fn active_steps(&self) -> impl Iterator<Item = &StepState> {
        self.steps.iter().filter(|s| s.status.accepts_decisions())
    }

    /// Steps that have not reached a final step status
    pub fn open_steps(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| !matches!(s.status, StepStatus::Satisfied | StepStatus::Failed))
            .map(|s| s.step_number)
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pure function of the steps and the resolution
    pub fn derive_status(&self) -> InstanceStatus {
        if let Some(resolution) = &self.resolution {
            return resolution.status;
        }
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            return InstanceStatus::Rejected;
        }
        if !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Satisfied)
        {
            return InstanceStatus::Approved;
        }
        let escalated = self.steps.iter().any(|s| {
            s.status == StepStatus::Escalated
                || (s.status == StepStatus::Active && s.escalation_level > 1)
        });
        if escalated {
            InstanceStatus::Escalated
        } else {
            InstanceStatus::Pending
        }
    }

    /// Recompute `status`; returns the previous value when it changed
    pub fn refresh_status(&mut self) -> Option<InstanceStatus> {
        let next = self.derive_status();
        if next == self.status {
            None
        } else {
            Some(std::mem::replace(&mut self.status, next))
        }
    }

    pub fn resolve(&mut self, status: InstanceStatus, cause: ResolutionCause, now: DateTime<Utc>) {
        self.resolution = Some(InstanceResolution {
            status,
            cause,
            resolved_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(principal: &str, decision: Decision, level: u32) -> DecisionRecord {
        DecisionRecord {
            principal: principal.to_string(),
            decision,
            comment: None,
            escalation_level: level,
            decided_at: Utc::now(),
            delegated_from: None,
            delegated_to: None,
        }
    }

    fn step(principals: &[&str]) -> StepState {
        StepState {
            principals: principals.iter().map(|p| p.to_string()).collect(),
            status: StepStatus::Active,
            ..StepState::inactive(1)
        }
    }

    #[test]
    fn test_majority_of_three() {
        let mut s = step(&["a", "b", "c"]);
        s.decisions.push(record("a", Decision::Approve, 1));
        s.decisions.push(record("b", Decision::Reject, 1));
        assert_eq!(s.evaluate(Quorum::Majority), StepOutcome::Undecided);
        s.decisions.push(record("c", Decision::Approve, 1));
        assert_eq!(s.evaluate(Quorum::Majority), StepOutcome::Satisfied);

        let mut s = step(&["a", "b", "c"]);
        s.decisions.push(record("a", Decision::Approve, 1));
        s.decisions.push(record("b", Decision::Reject, 1));
        s.decisions.push(record("c", Decision::Reject, 1));
        assert_eq!(s.evaluate(Quorum::Majority), StepOutcome::Failed);
    }

    #[test]
    fn test_all_required_fails_on_single_reject() {
        let mut s = step(&["a", "b", "c"]);
        s.decisions.push(record("b", Decision::Reject, 1));
        assert_eq!(s.evaluate(Quorum::AllRequired), StepOutcome::Failed);

        let mut s = step(&["a", "b"]);
        s.decisions.push(record("a", Decision::Approve, 1));
        assert_eq!(s.evaluate(Quorum::AllRequired), StepOutcome::Undecided);
        s.decisions.push(record("b", Decision::Approve, 1));
        assert_eq!(s.evaluate(Quorum::AllRequired), StepOutcome::Satisfied);
    }

    #[test]
    fn test_any_one() {
        let mut s = step(&["a", "b"]);
        s.decisions.push(record("a", Decision::Reject, 1));
        assert_eq!(s.evaluate(Quorum::AnyOne), StepOutcome::Undecided);
        s.decisions.push(record("b", Decision::Approve, 1));
        assert_eq!(s.evaluate(Quorum::AnyOne), StepOutcome::Satisfied);
    }

    #[test]
    fn test_only_current_level_counts() {
        let mut s = step(&["a"]);
        s.decisions.push(record("a", Decision::Approve, 1));
        s.escalation_level = 2;
        assert_eq!(s.evaluate(Quorum::AllRequired), StepOutcome::Undecided);
        assert!(!s.has_voted("a"));
    }

    #[test]
    fn test_delegated_vote_counts_for_seat() {
        let mut s = step(&["a", "b"]);
        let mut delegate = record("a", Decision::Delegate, 1);
        delegate.delegated_to = Some("d".to_string());
        s.decisions.push(delegate);

        assert_eq!(s.holders(), vec!["d".to_string(), "b".to_string()]);
        assert_eq!(s.seat_of("d"), Some("a".to_string()));
        assert_eq!(s.seat_of("a"), None);

        let mut vote = record("d", Decision::Approve, 1);
        vote.delegated_from = Some("a".to_string());
        s.decisions.push(vote);
        s.decisions.push(record("b", Decision::Approve, 1));
        assert_eq!(s.evaluate(Quorum::AllRequired), StepOutcome::Satisfied);
        assert_eq!(s.holder_chain("a"), vec!["a".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_status_derivation() {
        let now = Utc::now();
        let mut inst = WorkflowInstance::new(
            Uuid::now_v7(),
            1,
            SubjectRef::new("travel", "t1"),
            EvaluationContext::new(),
            [1, 2],
            now,
        );
        assert_eq!(inst.derive_status(), InstanceStatus::Pending);

        inst.steps[0].status = StepStatus::Active;
        inst.steps[0].escalation_level = 2;
        assert_eq!(inst.derive_status(), InstanceStatus::Escalated);

        inst.steps[0].status = StepStatus::Satisfied;
        inst.steps[1].status = StepStatus::Satisfied;
        assert_eq!(inst.refresh_status(), Some(InstanceStatus::Pending));
        assert_eq!(inst.status, InstanceStatus::Approved);

        inst.steps[1].status = StepStatus::Failed;
        assert_eq!(inst.derive_status(), InstanceStatus::Rejected);

        inst.resolve(
            InstanceStatus::Cancelled,
            ResolutionCause::Cancelled {
                actor: "admin".to_string(),
                reason: "dup".to_string(),
            },
            now,
        );
        assert_eq!(inst.derive_status(), InstanceStatus::Cancelled);
        assert!(inst.derive_status().is_terminal());
    }
}
