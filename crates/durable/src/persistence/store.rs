//! EngineStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowgate_core::{
    AuditEntry, EngineError, Phase, TimerRequest, TimerScope, TraceEvent, WorkflowDefinition,
    WorkflowInstance,
};

use crate::reliability::RetryPolicy;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition (or a specific version of it) not found
    #[error("definition not found: {id} (version {version:?})")]
    DefinitionNotFound { id: Uuid, version: Option<u32> },

    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Timer not found
    #[error("timer not found: {0}")]
    TimerNotFound(Uuid),

    /// The worker firing a timer no longer holds its claim
    #[error("timer claim lost: {0}")]
    TimerClaimLost(Uuid),

    /// Action task not found
    #[error("action not found: {0}")]
    ActionNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {instance_id}: expected revision {expected}, got {actual}")]
    ConcurrencyConflict {
        instance_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// Row already exists
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict { instance_id, .. } => {
                EngineError::ConcurrencyConflict { instance_id }
            }
            StoreError::InstanceNotFound(id) => EngineError::InstanceNotFound(id),
            StoreError::DefinitionNotFound { id, .. } => EngineError::DefinitionNotFound(id),
            other => EngineError::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// ============================================
// Timers
// ============================================

/// Timer status in the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Claimed,
    Fired,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Pending => "pending",
            TimerStatus::Claimed => "claimed",
            TimerStatus::Fired => "fired",
            TimerStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(TimerStatus::Pending),
            "claimed" => Ok(TimerStatus::Claimed),
            "fired" => Ok(TimerStatus::Fired),
            "cancelled" => Ok(TimerStatus::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown timer status: {other}"
            ))),
        }
    }
}

/// A persisted wake-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub timer: TimerRequest,
    pub status: TimerStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Number of times the timer has been claimed
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl TimerRecord {
    pub fn new(instance_id: Uuid, timer: TimerRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            timer,
            status: TimerStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            attempts: 0,
            created_at: now,
        }
    }

    pub fn in_scope(&self, scope: &TimerScope) -> bool {
        match scope {
            TimerScope::Instance => true,
            TimerScope::Step(n) => self.timer.step_number == Some(*n),
        }
    }

    /// The claim under which this record is being fired, if it is claimed
    pub fn claim(&self) -> Option<TimerClaim> {
        match (&self.status, &self.claimed_by) {
            (TimerStatus::Claimed, Some(worker_id)) => Some(TimerClaim {
                timer_id: self.id,
                worker_id: worker_id.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == TimerStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// A worker's hold on a timer row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerClaim {
    pub timer_id: Uuid,
    pub worker_id: String,
}

// ============================================
// Action queue
// ============================================

/// Action task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Claimed,
    Completed,
    Dead,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Claimed => "claimed",
            ActionStatus::Completed => "completed",
            ActionStatus::Dead => "dead",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "claimed" => Ok(ActionStatus::Claimed),
            "completed" => Ok(ActionStatus::Completed),
            "dead" => Ok(ActionStatus::Dead),
            "cancelled" => Ok(ActionStatus::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown action status: {other}"
            ))),
        }
    }
}

/// Definition of an action to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct NewActionTask {
    pub action_type: String,
    pub config: serde_json::Value,
    /// `None` for engine notices (reminders, error escalation)
    pub phase: Option<Phase>,
    /// Resolved context passed to the handler
    pub context: serde_json::Value,
    pub retry_policy: RetryPolicy,
}

/// A queued action
#[derive(Debug, Clone, PartialEq)]
pub struct ActionTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub action_type: String,
    pub config: serde_json::Value,
    pub phase: Option<Phase>,
    pub context: serde_json::Value,
    pub retry_policy: RetryPolicy,
    pub status: ActionStatus,
    /// Attempt currently (or last) executing, 1-based once claimed
    pub attempt: u32,
    pub visible_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActionTask {
    pub fn new(instance_id: Uuid, task: NewActionTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            action_type: task.action_type,
            config: task.config,
            phase: task.phase,
            context: task.context,
            retry_policy: task.retry_policy,
            status: ActionStatus::Pending,
            attempt: 0,
            visible_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts
    }
}

// ============================================
// Commits
// ============================================

/// Everything one state transition persists, atomically
#[derive(Debug, Clone)]
pub struct InstanceCommit {
    /// The instance after the transition
    pub instance: WorkflowInstance,
    /// Revision the transition was computed from (0 for creation)
    pub expected_revision: u64,
    pub audit: Vec<TraceEvent>,
    pub cancel_timers: Vec<TimerScope>,
    pub schedule_timers: Vec<TimerRequest>,
    pub cancel_actions: bool,
    pub enqueue_actions: Vec<NewActionTask>,
    /// Timer this transition fires; marked fired in the same commit, which
    /// fails with [`StoreError::TimerClaimLost`] if the claim is gone
    pub fired_timer: Option<TimerClaim>,
    pub recorded_at: DateTime<Utc>,
}

impl InstanceCommit {
    pub fn new(instance: WorkflowInstance, expected_revision: u64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            instance,
            expected_revision,
            audit: Vec::new(),
            cancel_timers: Vec::new(),
            schedule_timers: Vec::new(),
            cancel_actions: false,
            enqueue_actions: Vec::new(),
            fired_timer: None,
            recorded_at,
        }
    }
}

/// Persistence for definitions, instances, timers and the action queue
///
/// Implementations must apply an [`InstanceCommit`] atomically: the revision
/// check, instance document, audit entries, timer changes and action queue
/// changes all succeed or none do. Within a commit, cancellations are applied
/// before new timers/actions are added.
#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Store a new definition version
    async fn insert_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    /// Overwrite an existing version (only for versions no instance references)
    async fn replace_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn get_definition(&self, id: Uuid, version: u32) -> Result<WorkflowDefinition, StoreError>;

    async fn latest_definition(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError>;

    /// All versions, ascending
    async fn list_definition_versions(
        &self,
        id: Uuid,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Make `version` the only active version; `None` deactivates every version
    async fn set_definition_active(&self, id: Uuid, version: Option<u32>)
        -> Result<(), StoreError>;

    /// Active versions across all definitions, ordered by creation
    async fn active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    async fn count_instances(&self, definition_id: Uuid, version: u32) -> Result<u64, StoreError>;

    // =========================================================================
    // Instances
    // =========================================================================

    /// Insert a new instance with its initial audit, timers and actions
    async fn create_instance(&self, commit: InstanceCommit) -> Result<u64, StoreError>;

    async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Apply a transition; returns the new revision
    async fn commit(&self, commit: InstanceCommit) -> Result<u64, StoreError>;

    /// Non-terminal instances of any version of a definition
    async fn list_open_instances(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    async fn load_audit(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;

    /// Append entries without touching the instance document
    async fn append_audit(
        &self,
        instance_id: Uuid,
        events: Vec<TraceEvent>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set the degraded flag (bumping the revision) and append entries
    async fn mark_degraded(
        &self,
        instance_id: Uuid,
        events: Vec<TraceEvent>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    /// Atomically move due pending timers to claimed
    async fn claim_due_timers(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError>;

    /// Mark a timer fired; `false` when `worker_id` no longer holds the claim
    async fn complete_timer(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Return a claimed timer to pending, due again at `retry_at`
    async fn release_timer(
        &self,
        id: Uuid,
        worker_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Cancel a claimed timer; `false` when `worker_id` no longer holds the claim
    async fn cancel_timer(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Return timers claimed before `claimed_before` to pending
    async fn reclaim_stale_timers(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn pending_timers(&self, instance_id: Uuid) -> Result<Vec<TimerRecord>, StoreError>;

    // =========================================================================
    // Action queue
    // =========================================================================

    /// Atomically move visible pending actions to claimed, optionally for one instance
    async fn claim_actions(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
        instance_id: Option<Uuid>,
    ) -> Result<Vec<ActionTask>, StoreError>;

    async fn complete_action(&self, id: Uuid) -> Result<(), StoreError>;

    /// Requeue after a retryable failure
    async fn retry_action(
        &self,
        id: Uuid,
        error: &str,
        visible_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Move to dead after a permanent failure or exhausted retries
    async fn fail_action(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn cancel_action(&self, id: Uuid) -> Result<(), StoreError>;

    async fn reclaim_stale_actions(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<ActionTask>, StoreError>;
}
