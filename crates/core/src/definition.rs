// Workflow definitions
//
// A definition is a versioned template: trigger, condition tree, ordered
// approver chain, actions and timing policy. Once a version is stored it is
// never mutated; edits produce a new version.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::condition::ConditionNode;
use crate::error::DefinitionError;

// ============================================================================
// Trigger
// ============================================================================

/// Which domain event starts an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub module: String,
    pub event_type: String,
}

impl TriggerDescriptor {
    pub fn new(module: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            event_type: event_type.into(),
        }
    }

    pub fn matches(&self, module: &str, event_type: &str) -> bool {
        self.module == module && self.event_type == event_type
    }
}

// ============================================================================
// Approver rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    DirectManager,
    RoleBased,
    SpecificUser,
    Dynamic,
}

impl ApproverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApproverType::DirectManager => "direct_manager",
            ApproverType::RoleBased => "role_based",
            ApproverType::SpecificUser => "specific_user",
            ApproverType::Dynamic => "dynamic",
        }
    }
}

impl std::fmt::Display for ApproverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Sequential,
    Parallel,
    AnyOne,
    AllRequired,
    Majority,
}

/// How steps are activated relative to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Sequential,
    Parallel,
}

/// When a step's principal set counts as satisfied or failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    AnyOne,
    AllRequired,
    Majority,
}

impl ApprovalMode {
    pub fn routing(&self) -> Routing {
        match self {
            ApprovalMode::Parallel => Routing::Parallel,
            _ => Routing::Sequential,
        }
    }

    pub fn quorum(&self) -> Quorum {
        match self {
            ApprovalMode::AnyOne => Quorum::AnyOne,
            ApprovalMode::Majority => Quorum::Majority,
            ApprovalMode::Sequential | ApprovalMode::Parallel | ApprovalMode::AllRequired => {
                Quorum::AllRequired
            }
        }
    }
}

/// One step of the approver chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproverRule {
    pub step_number: u32,
    pub approver_type: ApproverType,
    /// Role name, comma-separated user ids, or dynamic key depending on type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub can_delegate: bool,
    /// Overrides the definition's default timeout for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<u32>,
}

impl ApproverRule {
    pub fn new(step_number: u32, approver_type: ApproverType, approval_mode: ApprovalMode) -> Self {
        Self {
            step_number,
            approver_type,
            selector: None,
            approval_mode,
            can_delegate: false,
            timeout_hours: None,
        }
    }

    pub fn direct_manager(step_number: u32) -> Self {
        Self::new(step_number, ApproverType::DirectManager, ApprovalMode::Sequential)
    }

    pub fn role(step_number: u32, role: impl Into<String>) -> Self {
        Self::new(step_number, ApproverType::RoleBased, ApprovalMode::Sequential)
            .with_selector(role)
    }

    pub fn users(step_number: u32, users: impl Into<String>) -> Self {
        Self::new(step_number, ApproverType::SpecificUser, ApprovalMode::Sequential)
            .with_selector(users)
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_delegation(mut self) -> Self {
        self.can_delegate = true;
        self
    }

    pub fn with_timeout_hours(mut self, hours: u32) -> Self {
        self.timeout_hours = Some(hours);
        self
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Phase at which actions may fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteOn {
    Approval,
    Rejection,
    Timeout,
    Escalation,
    Always,
    ConditionMet,
}

/// A phase transition the router reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ConditionMet,
    Approval,
    Rejection,
    Timeout,
    Escalation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ConditionMet => "condition_met",
            Phase::Approval => "approval",
            Phase::Rejection => "rejection",
            Phase::Timeout => "timeout",
            Phase::Escalation => "escalation",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A side effect dispatched to a named handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: String,
    /// Opaque to the engine
    #[serde(default)]
    pub config: Value,
    pub execute_on: ExecuteOn,
}

impl Action {
    pub fn new(action_type: impl Into<String>, execute_on: ExecuteOn) -> Self {
        Self {
            action_type: action_type.into(),
            config: Value::Null,
            execute_on,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn fires_on(&self, phase: Phase) -> bool {
        match self.execute_on {
            ExecuteOn::Always => true,
            ExecuteOn::Approval => phase == Phase::Approval,
            ExecuteOn::Rejection => phase == Phase::Rejection,
            ExecuteOn::Timeout => phase == Phase::Timeout,
            ExecuteOn::Escalation => phase == Phase::Escalation,
            ExecuteOn::ConditionMet => phase == Phase::ConditionMet,
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// What to do when a step's approver set resolves empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionFailurePolicy {
    /// Move the instance to `error`
    #[default]
    Fail,
    /// Try the next escalation level; fail once levels are exhausted
    Escalate,
}

/// Timing and feature policy for a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionPolicy {
    pub default_timeout_hours: u32,
    /// Number of levels a step may reach; level 1 is the initial one
    pub escalation_levels: u32,
    /// Reminders fire this many hours before the deadline
    pub reminder_offsets_hours: Vec<u32>,
    pub auto_cancel_after_days: Option<u32>,
    pub auto_complete_after_days: Option<u32>,
    pub sandbox_mode: bool,
    pub enable_versioning: bool,
    pub enable_simulation: bool,
    pub enable_rollback: bool,
    pub strict_conditions: bool,
    pub on_resolution_failure: ResolutionFailurePolicy,
    pub max_delegation_depth: u32,
}

impl Default for DefinitionPolicy {
    fn default() -> Self {
        Self {
            default_timeout_hours: 24,
            escalation_levels: 3,
            reminder_offsets_hours: Vec::new(),
            auto_cancel_after_days: None,
            auto_complete_after_days: None,
            sandbox_mode: false,
            enable_versioning: true,
            enable_simulation: true,
            enable_rollback: false,
            strict_conditions: false,
            on_resolution_failure: ResolutionFailurePolicy::Fail,
            max_delegation_depth: 1,
        }
    }
}

impl DefinitionPolicy {
    pub fn timeout_for(&self, rule: &ApproverRule) -> u32 {
        rule.timeout_hours.unwrap_or(self.default_timeout_hours)
    }

    pub fn validate(&self, approvers: &[ApproverRule]) -> Result<(), DefinitionError> {
        if self.default_timeout_hours == 0 {
            return Err(DefinitionError::InvalidPolicy(
                "default_timeout_hours must be positive".to_string(),
            ));
        }
        if self.escalation_levels == 0 {
            return Err(DefinitionError::InvalidPolicy(
                "escalation_levels must be at least 1".to_string(),
            ));
        }
        if self.auto_cancel_after_days.is_some() && self.auto_complete_after_days.is_some() {
            return Err(DefinitionError::InvalidPolicy(
                "auto_cancel_after_days and auto_complete_after_days are mutually exclusive"
                    .to_string(),
            ));
        }
        if matches!(self.auto_cancel_after_days, Some(0))
            || matches!(self.auto_complete_after_days, Some(0))
        {
            return Err(DefinitionError::InvalidPolicy(
                "terminal timeout must be at least one day".to_string(),
            ));
        }
        for rule in approvers {
            let timeout = self.timeout_for(rule);
            if timeout == 0 {
                return Err(DefinitionError::InvalidRule {
                    step: rule.step_number,
                    reason: "timeout_hours must be positive".to_string(),
                });
            }
            if let Some(offset) = self.reminder_offsets_hours.iter().find(|o| **o >= timeout) {
                return Err(DefinitionError::InvalidRule {
                    step: rule.step_number,
                    reason: format!("reminder offset {offset}h is not before the {timeout}h deadline"),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Definition
// ============================================================================

/// Editable content of a definition, validated before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionDraft {
    pub name: String,
    pub module: String,
    pub trigger: TriggerDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionNode>,
    pub approvers: Vec<ApproverRule>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub policy: DefinitionPolicy,
}

impl DefinitionDraft {
    pub fn new(name: impl Into<String>, trigger: TriggerDescriptor) -> Self {
        Self {
            name: name.into(),
            module: trigger.module.clone(),
            trigger,
            condition: None,
            approvers: Vec::new(),
            actions: Vec::new(),
            policy: DefinitionPolicy::default(),
        }
    }

    pub fn with_condition(mut self, condition: ConditionNode) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_approver(mut self, rule: ApproverRule) -> Self {
        self.approvers.push(rule);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_policy(mut self, policy: DefinitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reject malformed content before it can be activated
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.trigger.module.trim().is_empty() || self.trigger.event_type.trim().is_empty() {
            return Err(DefinitionError::InvalidTrigger);
        }
        if self.approvers.is_empty() {
            return Err(DefinitionError::NoApprovers);
        }

        let mut seen = BTreeSet::new();
        for rule in &self.approvers {
            if !seen.insert(rule.step_number) {
                return Err(DefinitionError::DuplicateStep(rule.step_number));
            }
            let needs_selector = matches!(
                rule.approver_type,
                ApproverType::RoleBased | ApproverType::SpecificUser
            );
            let has_selector = rule
                .selector
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty());
            if needs_selector && !has_selector {
                return Err(DefinitionError::InvalidRule {
                    step: rule.step_number,
                    reason: format!("{} requires a selector", rule.approver_type),
                });
            }
        }

        if let Some(condition) = &self.condition {
            condition.validate()?;
        }

        for action in &self.actions {
            if action.action_type.trim().is_empty() {
                return Err(DefinitionError::InvalidAction(
                    "action_type must not be empty".to_string(),
                ));
            }
            if !(action.config.is_object() || action.config.is_null()) {
                return Err(DefinitionError::InvalidAction(format!(
                    "{}: config must be an object",
                    action.action_type
                )));
            }
        }

        self.policy.validate(&self.approvers)
    }
}

/// A stored, immutable definition version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub version: u32,
    pub active: bool,
    pub name: String,
    pub module: String,
    pub trigger: TriggerDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionNode>,
    pub approvers: Vec<ApproverRule>,
    pub actions: Vec<Action>,
    pub policy: DefinitionPolicy,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Build version 1 from a validated draft
    pub fn from_draft(draft: DefinitionDraft, now: DateTime<Utc>) -> Self {
        Self::versioned(Uuid::now_v7(), 1, draft, now)
    }

    pub fn versioned(id: Uuid, version: u32, draft: DefinitionDraft, now: DateTime<Utc>) -> Self {
        let mut approvers = draft.approvers;
        approvers.sort_by_key(|r| r.step_number);
        Self {
            id,
            version,
            active: false,
            name: draft.name,
            module: draft.module,
            trigger: draft.trigger,
            condition: draft.condition,
            approvers,
            actions: draft.actions,
            policy: draft.policy,
            created_at: now,
        }
    }

    pub fn to_draft(&self) -> DefinitionDraft {
        DefinitionDraft {
            name: self.name.clone(),
            module: self.module.clone(),
            trigger: self.trigger.clone(),
            condition: self.condition.clone(),
            approvers: self.approvers.clone(),
            actions: self.actions.clone(),
            policy: self.policy.clone(),
        }
    }

    /// Parallel iff any rule declares `parallel`
    pub fn routing(&self) -> Routing {
        if self
            .approvers
            .iter()
            .any(|r| r.approval_mode.routing() == Routing::Parallel)
        {
            Routing::Parallel
        } else {
            Routing::Sequential
        }
    }

    pub fn rule(&self, step_number: u32) -> Option<&ApproverRule> {
        self.approvers.iter().find(|r| r.step_number == step_number)
    }

    /// Rule following `step_number` in chain order
    pub fn next_rule(&self, step_number: u32) -> Option<&ApproverRule> {
        self.approvers.iter().find(|r| r.step_number > step_number)
    }

    pub fn actions_for(&self, phase: Phase) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(move |a| a.fires_on(phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Operator;
    use serde_json::json;

    fn draft() -> DefinitionDraft {
        DefinitionDraft::new("Trip approval", TriggerDescriptor::new("travel", "trip.submitted"))
            .with_condition(ConditionNode::leaf(
                "cost_center_budget",
                Operator::GreaterThan,
                5000,
            ))
            .with_approver(ApproverRule::direct_manager(1))
            .with_approver(ApproverRule::role(2, "finance"))
            .with_action(Action::new("notify", ExecuteOn::Rejection))
    }

    #[test]
    fn test_valid_draft() {
        assert_eq!(draft().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_missing_approvers_and_duplicates() {
        let mut d = draft();
        d.approvers.clear();
        assert_eq!(d.validate(), Err(DefinitionError::NoApprovers));

        let d = draft().with_approver(ApproverRule::direct_manager(2));
        assert_eq!(d.validate(), Err(DefinitionError::DuplicateStep(2)));
    }

    #[test]
    fn test_role_based_requires_selector() {
        let d = draft().with_approver(ApproverRule::new(
            3,
            ApproverType::RoleBased,
            ApprovalMode::Majority,
        ));
        assert!(matches!(
            d.validate(),
            Err(DefinitionError::InvalidRule { step: 3, .. })
        ));
    }

    #[test]
    fn test_rejects_malformed_action_and_condition() {
        let d = draft().with_action(Action::new("webhook", ExecuteOn::Always).with_config(json!(3)));
        assert!(matches!(d.validate(), Err(DefinitionError::InvalidAction(_))));

        let d = draft().with_condition(ConditionNode::or(vec![]));
        assert!(matches!(d.validate(), Err(DefinitionError::InvalidCondition(_))));
    }

    #[test]
    fn test_policy_validation() {
        let d = draft().with_policy(DefinitionPolicy {
            auto_cancel_after_days: Some(3),
            auto_complete_after_days: Some(3),
            ..Default::default()
        });
        assert!(matches!(d.validate(), Err(DefinitionError::InvalidPolicy(_))));

        let d = draft().with_policy(DefinitionPolicy {
            reminder_offsets_hours: vec![24],
            ..Default::default()
        });
        assert!(matches!(d.validate(), Err(DefinitionError::InvalidRule { .. })));
    }

    #[test]
    fn test_mode_mapping_and_routing() {
        assert_eq!(ApprovalMode::Majority.quorum(), Quorum::Majority);
        assert_eq!(ApprovalMode::Parallel.quorum(), Quorum::AllRequired);
        assert_eq!(ApprovalMode::AnyOne.routing(), Routing::Sequential);

        let def = WorkflowDefinition::from_draft(draft(), Utc::now());
        assert_eq!(def.routing(), Routing::Sequential);

        let parallel = draft().with_approver(
            ApproverRule::users(3, "u1").with_mode(ApprovalMode::Parallel),
        );
        let def = WorkflowDefinition::from_draft(parallel, Utc::now());
        assert_eq!(def.routing(), Routing::Parallel);
    }

    #[test]
    fn test_always_fires_on_every_phase() {
        let always = Action::new("audit_log", ExecuteOn::Always);
        let rejection = Action::new("notify", ExecuteOn::Rejection);
        assert!(always.fires_on(Phase::Approval));
        assert!(always.fires_on(Phase::Escalation));
        assert!(rejection.fires_on(Phase::Rejection));
        assert!(!rejection.fires_on(Phase::Approval));
    }

    #[test]
    fn test_approvers_sorted_by_step() {
        let d = DefinitionDraft::new("x", TriggerDescriptor::new("m", "e"))
            .with_approver(ApproverRule::role(5, "finance"))
            .with_approver(ApproverRule::direct_manager(2));
        let def = WorkflowDefinition::from_draft(d, Utc::now());
        assert_eq!(def.approvers[0].step_number, 2);
        assert_eq!(def.next_rule(2).map(|r| r.step_number), Some(5));
        assert!(def.next_rule(5).is_none());
    }

    #[test]
    fn test_policy_defaults_from_partial_json() {
        let policy: DefinitionPolicy =
            serde_json::from_value(json!({ "default_timeout_hours": 48 })).unwrap();
        assert_eq!(policy.default_timeout_hours, 48);
        assert_eq!(policy.escalation_levels, 3);
        assert_eq!(policy.max_delegation_depth, 1);
        assert!(policy.enable_versioning);
    }
}
