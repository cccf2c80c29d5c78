//! In-memory implementation of EngineStore for testing

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use flowgate_core::{AuditEntry, TraceEvent, WorkflowDefinition, WorkflowInstance};

use super::store::*;

#[derive(Default)]
struct State {
    definitions: HashMap<Uuid, BTreeMap<u32, WorkflowDefinition>>,
    instances: HashMap<Uuid, WorkflowInstance>,
    audit: HashMap<Uuid, Vec<AuditEntry>>,
    timers: BTreeMap<Uuid, TimerRecord>,
    actions: BTreeMap<Uuid, ActionTask>,
}

impl State {
    fn append_audit(&mut self, instance_id: Uuid, events: Vec<TraceEvent>, at: DateTime<Utc>) {
        let log = self.audit.entry(instance_id).or_default();
        for event in events {
            let sequence = log.len() as u64 + 1;
            log.push(AuditEntry {
                instance_id,
                sequence,
                recorded_at: at,
                event,
            });
        }
    }

    /// Timer, action and audit side of a commit; the instance is already written
    fn apply(&mut self, commit: InstanceCommit) {
        let instance_id = commit.instance.id;

        if let Some(claim) = &commit.fired_timer {
            if let Some(timer) = self.timers.get_mut(&claim.timer_id) {
                timer.status = TimerStatus::Fired;
            }
        }

        for scope in &commit.cancel_timers {
            for timer in self.timers.values_mut() {
                if timer.instance_id == instance_id
                    && timer.status == TimerStatus::Pending
                    && timer.in_scope(scope)
                {
                    timer.status = TimerStatus::Cancelled;
                }
            }
        }

        for request in commit.schedule_timers {
            let duplicate = self.timers.values().any(|t| {
                t.instance_id == instance_id
                    && t.status == TimerStatus::Pending
                    && t.timer == request
            });
            if !duplicate {
                let record = TimerRecord::new(instance_id, request, commit.recorded_at);
                self.timers.insert(record.id, record);
            }
        }

        if commit.cancel_actions {
            for action in self.actions.values_mut() {
                if action.instance_id == instance_id && action.status == ActionStatus::Pending {
                    action.status = ActionStatus::Cancelled;
                }
            }
        }

        for task in commit.enqueue_actions {
            let task = ActionTask::new(instance_id, task, commit.recorded_at);
            self.actions.insert(task.id, task);
        }

        self.append_audit(instance_id, commit.audit, commit.recorded_at);
    }

    fn holds_claim(&self, claim: &TimerClaim) -> bool {
        self.timers
            .get(&claim.timer_id)
            .is_some_and(|t| t.is_claimed_by(&claim.worker_id))
    }
}

/// In-memory implementation of EngineStore
///
/// Every operation takes one write lock, so a commit is atomic in the same
/// way a PostgreSQL transaction is.
///
/// # Example
///
/// ```
/// use flowgate_durable::InMemoryEngineStore;
///
/// let store = InMemoryEngineStore::new();
/// ```
pub struct InMemoryEngineStore {
    state: RwLock<State>,
}

impl InMemoryEngineStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }

    /// Pending timers across all instances
    pub fn pending_timer_count(&self) -> usize {
        self.state
            .read()
            .timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending)
            .count()
    }

    /// Actions in a given status across all instances
    pub fn action_count(&self, status: ActionStatus) -> usize {
        self.state
            .read()
            .actions
            .values()
            .filter(|a| a.status == status)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.write() = State::default();
    }
}

impl Default for InMemoryEngineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineStore for InMemoryEngineStore {
    // =========================================================================
    // Definitions
    // =========================================================================

    async fn insert_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let versions = state.definitions.entry(definition.id).or_default();
        if versions.contains_key(&definition.version) {
            return Err(StoreError::Duplicate(format!(
                "definition {} version {}",
                definition.id, definition.version
            )));
        }
        versions.insert(definition.version, definition.clone());
        Ok(())
    }

    async fn replace_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let slot = state
            .definitions
            .get_mut(&definition.id)
            .and_then(|v| v.get_mut(&definition.version))
            .ok_or(StoreError::DefinitionNotFound {
                id: definition.id,
                version: Some(definition.version),
            })?;
        *slot = definition.clone();
        Ok(())
    }

    async fn get_definition(&self, id: Uuid, version: u32) -> Result<WorkflowDefinition, StoreError> {
        self.state
            .read()
            .definitions
            .get(&id)
            .and_then(|v| v.get(&version))
            .cloned()
            .ok_or(StoreError::DefinitionNotFound {
                id,
                version: Some(version),
            })
    }

    async fn latest_definition(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.state
            .read()
            .definitions
            .get(&id)
            .and_then(|v| v.values().next_back())
            .cloned()
            .ok_or(StoreError::DefinitionNotFound { id, version: None })
    }

    async fn list_definition_versions(
        &self,
        id: Uuid,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.state
            .read()
            .definitions
            .get(&id)
            .map(|v| v.values().cloned().collect())
            .ok_or(StoreError::DefinitionNotFound { id, version: None })
    }

    async fn set_definition_active(
        &self,
        id: Uuid,
        version: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let versions = state
            .definitions
            .get_mut(&id)
            .ok_or(StoreError::DefinitionNotFound { id, version })?;
        if let Some(v) = version {
            if !versions.contains_key(&v) {
                return Err(StoreError::DefinitionNotFound { id, version });
            }
        }
        for (v, def) in versions.iter_mut() {
            def.active = Some(*v) == version;
        }
        Ok(())
    }

    async fn active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let state = self.state.read();
        let mut active: Vec<WorkflowDefinition> = state
            .definitions
            .values()
            .flat_map(|v| v.values())
            .filter(|d| d.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn count_instances(&self, definition_id: Uuid, version: u32) -> Result<u64, StoreError> {
        Ok(self
            .state
            .read()
            .instances
            .values()
            .filter(|i| i.definition_id == definition_id && i.definition_version == version)
            .count() as u64)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    async fn create_instance(&self, mut commit: InstanceCommit) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let id = commit.instance.id;
        if state.instances.contains_key(&id) {
            return Err(StoreError::Duplicate(format!("instance {id}")));
        }
        commit.instance.revision = 1;
        state.instances.insert(id, commit.instance.clone());
        state.apply(commit);
        Ok(1)
    }

    async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.state
            .read()
            .instances
            .get(&id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(id))
    }

    async fn commit(&self, mut commit: InstanceCommit) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let id = commit.instance.id;
        let current = state
            .instances
            .get(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        if current.revision != commit.expected_revision {
            return Err(StoreError::ConcurrencyConflict {
                instance_id: id,
                expected: commit.expected_revision,
                actual: current.revision,
            });
        }
        if let Some(claim) = &commit.fired_timer {
            if !state.holds_claim(claim) {
                return Err(StoreError::TimerClaimLost(claim.timer_id));
            }
        }

        let revision = commit.expected_revision + 1;
        commit.instance.revision = revision;
        commit.instance.updated_at = commit.recorded_at;
        state.instances.insert(id, commit.instance.clone());
        state.apply(commit);
        Ok(revision)
    }

    async fn list_open_instances(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.state.read();
        let mut open: Vec<WorkflowInstance> = state
            .instances
            .values()
            .filter(|i| i.definition_id == definition_id && !i.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|i| i.id);
        Ok(open)
    }

    async fn load_audit(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let state = self.state.read();
        if !state.instances.contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        Ok(state.audit.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn append_audit(
        &self,
        instance_id: Uuid,
        events: Vec<TraceEvent>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.instances.contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        state.append_audit(instance_id, events, at);
        Ok(())
    }

    async fn mark_degraded(
        &self,
        instance_id: Uuid,
        events: Vec<TraceEvent>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let instance = state
            .instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        instance.degraded = true;
        instance.revision += 1;
        instance.updated_at = at;
        state.append_audit(instance_id, events, at);
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn claim_due_timers(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let mut state = self.state.write();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .timers
            .values()
            .filter(|t| t.status == TimerStatus::Pending && t.timer.due_at <= now)
            .map(|t| (t.timer.due_at, t.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(timer) = state.timers.get_mut(&id) {
                timer.status = TimerStatus::Claimed;
                timer.claimed_by = Some(worker_id.to_string());
                timer.claimed_at = Some(now);
                timer.attempts += 1;
                claimed.push(timer.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_timer(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let timer = state.timers.get_mut(&id).ok_or(StoreError::TimerNotFound(id))?;
        if !timer.is_claimed_by(worker_id) {
            return Ok(false);
        }
        timer.status = TimerStatus::Fired;
        Ok(true)
    }

    async fn release_timer(
        &self,
        id: Uuid,
        worker_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let timer = state.timers.get_mut(&id).ok_or(StoreError::TimerNotFound(id))?;
        if timer.is_claimed_by(worker_id) {
            timer.status = TimerStatus::Pending;
            timer.timer.due_at = retry_at;
            timer.claimed_by = None;
            timer.claimed_at = None;
        }
        Ok(())
    }

    async fn cancel_timer(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let timer = state.timers.get_mut(&id).ok_or(StoreError::TimerNotFound(id))?;
        if !timer.is_claimed_by(worker_id) {
            return Ok(false);
        }
        timer.status = TimerStatus::Cancelled;
        Ok(true)
    }

    async fn reclaim_stale_timers(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let mut reclaimed = vec![];
        for timer in state.timers.values_mut() {
            let stale = timer.status == TimerStatus::Claimed
                && timer.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                timer.status = TimerStatus::Pending;
                timer.claimed_by = None;
                timer.claimed_at = None;
                reclaimed.push(timer.id);
            }
        }
        Ok(reclaimed)
    }

    async fn pending_timers(&self, instance_id: Uuid) -> Result<Vec<TimerRecord>, StoreError> {
        let state = self.state.read();
        let mut pending: Vec<TimerRecord> = state
            .timers
            .values()
            .filter(|t| t.instance_id == instance_id && t.status == TimerStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.timer.due_at.cmp(&b.timer.due_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    // =========================================================================
    // Action queue
    // =========================================================================

    async fn claim_actions(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
        instance_id: Option<Uuid>,
    ) -> Result<Vec<ActionTask>, StoreError> {
        let mut state = self.state.write();
        let mut visible: Vec<(DateTime<Utc>, Uuid)> = state
            .actions
            .values()
            .filter(|a| {
                a.status == ActionStatus::Pending
                    && a.visible_at <= now
                    && instance_id.map_or(true, |id| a.instance_id == id)
            })
            .map(|a| (a.visible_at, a.id))
            .collect();
        visible.sort();
        visible.truncate(limit);

        let mut claimed = Vec::with_capacity(visible.len());
        for (_, id) in visible {
            if let Some(action) = state.actions.get_mut(&id) {
                action.status = ActionStatus::Claimed;
                action.claimed_by = Some(worker_id.to_string());
                action.claimed_at = Some(now);
                action.attempt += 1;
                claimed.push(action.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_action(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let action = state.actions.get_mut(&id).ok_or(StoreError::ActionNotFound(id))?;
        action.status = ActionStatus::Completed;
        action.claimed_by = None;
        Ok(())
    }

    async fn retry_action(
        &self,
        id: Uuid,
        error: &str,
        visible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let action = state.actions.get_mut(&id).ok_or(StoreError::ActionNotFound(id))?;
        action.status = ActionStatus::Pending;
        action.visible_at = visible_at;
        action.claimed_by = None;
        action.claimed_at = None;
        action.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail_action(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let action = state.actions.get_mut(&id).ok_or(StoreError::ActionNotFound(id))?;
        action.status = ActionStatus::Dead;
        action.claimed_by = None;
        action.last_error = Some(error.to_string());
        Ok(())
    }

    async fn cancel_action(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let action = state.actions.get_mut(&id).ok_or(StoreError::ActionNotFound(id))?;
        action.status = ActionStatus::Cancelled;
        action.claimed_by = None;
        Ok(())
    }

    async fn reclaim_stale_actions(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let mut reclaimed = vec![];
        for action in state.actions.values_mut() {
            let stale = action.status == ActionStatus::Claimed
                && action.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                action.status = ActionStatus::Pending;
                action.claimed_by = None;
                action.claimed_at = None;
                reclaimed.push(action.id);
            }
        }
        Ok(reclaimed)
    }

    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<ActionTask>, StoreError> {
        let state = self.state.read();
        Ok(state
            .actions
            .values()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use chrono::Duration;
    use flowgate_core::{
        ApproverRule, DefinitionDraft, EvaluationContext, Phase, SubjectRef, TimerKind,
        TimerRequest, TimerScope, TriggerDescriptor,
    };

    fn definition() -> WorkflowDefinition {
        let draft = DefinitionDraft::new(
            "Trip approval",
            TriggerDescriptor::new("travel", "trip_requested"),
        )
        .with_approver(ApproverRule::direct_manager(1));
        WorkflowDefinition::from_draft(draft, Utc::now())
    }

    fn instance(now: DateTime<Utc>) -> WorkflowInstance {
        WorkflowInstance::new(
            Uuid::now_v7(),
            1,
            SubjectRef::new("travel", "trip-1"),
            EvaluationContext::default(),
            [1, 2],
            now,
        )
    }

    fn escalation(step: u32, due_at: DateTime<Utc>) -> TimerRequest {
        TimerRequest {
            step_number: Some(step),
            kind: TimerKind::Escalation,
            due_at,
            escalation_level: 1,
            deadline: Some(due_at),
        }
    }

    fn notify() -> NewActionTask {
        NewActionTask {
            action_type: "notify".to_string(),
            config: serde_json::json!({}),
            phase: Some(Phase::Approval),
            context: serde_json::json!({}),
            retry_policy: RetryPolicy::exponential(),
        }
    }

    #[tokio::test]
    async fn test_definition_versions_and_activation() {
        let store = InMemoryEngineStore::new();
        let v1 = definition();
        let mut v2 = v1.clone();
        v2.version = 2;

        store.insert_definition(&v1).await.unwrap();
        store.insert_definition(&v2).await.unwrap();
        assert!(matches!(
            store.insert_definition(&v1).await,
            Err(StoreError::Duplicate(_))
        ));

        assert_eq!(store.latest_definition(v1.id).await.unwrap().version, 2);

        store.set_definition_active(v1.id, Some(2)).await.unwrap();
        let active = store.active_definitions().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version, 2);

        store.set_definition_active(v1.id, None).await.unwrap();
        assert!(store.active_definitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_checks_revision() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);
        let id = inst.id;

        let rev = store
            .create_instance(InstanceCommit::new(inst.clone(), 0, now))
            .await
            .unwrap();
        assert_eq!(rev, 1);

        let loaded = store.get_instance(id).await.unwrap();
        assert_eq!(loaded.revision, 1);

        let rev = store
            .commit(InstanceCommit::new(loaded.clone(), 1, now))
            .await
            .unwrap();
        assert_eq!(rev, 2);

        // Stale snapshot
        let err = store
            .commit(InstanceCommit::new(loaded, 1, now))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_timer_claim_is_exclusive() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);

        let mut commit = InstanceCommit::new(inst, 0, now);
        commit.schedule_timers = vec![escalation(1, now), escalation(1, now)];
        store.create_instance(commit).await.unwrap();

        // Identical pending timers collapse into one
        assert_eq!(store.pending_timer_count(), 1);

        let first = store.claim_due_timers("w1", now, 10).await.unwrap();
        let second = store.claim_due_timers("w2", now, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(first[0].attempts, 1);
        assert_eq!(first[0].claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_timer_not_due_yet() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let mut commit = InstanceCommit::new(instance(now), 0, now);
        commit.schedule_timers = vec![escalation(1, now + Duration::hours(24))];
        store.create_instance(commit).await.unwrap();

        assert!(store.claim_due_timers("w1", now, 10).await.unwrap().is_empty());
        let later = now + Duration::hours(24);
        assert_eq!(store.claim_due_timers("w1", later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_cancels_step_timers() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);
        let id = inst.id;

        let mut commit = InstanceCommit::new(inst.clone(), 0, now);
        commit.schedule_timers = vec![escalation(1, now), escalation(2, now)];
        store.create_instance(commit).await.unwrap();

        let mut commit = InstanceCommit::new(inst, 1, now);
        commit.cancel_timers = vec![TimerScope::Step(1)];
        store.commit(commit).await.unwrap();

        let pending = store.pending_timers(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].timer.step_number, Some(2));
    }

    #[tokio::test]
    async fn test_reclaim_stale_timers() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let mut commit = InstanceCommit::new(instance(now), 0, now);
        commit.schedule_timers = vec![escalation(1, now)];
        store.create_instance(commit).await.unwrap();

        store.claim_due_timers("w1", now, 10).await.unwrap();
        assert!(store
            .reclaim_stale_timers(now - Duration::minutes(5))
            .await
            .unwrap()
            .is_empty());

        let reclaimed = store
            .reclaim_stale_timers(now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(store.pending_timer_count(), 1);
    }

    #[tokio::test]
    async fn test_timer_completion_requires_current_claim() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let mut commit = InstanceCommit::new(instance(now), 0, now);
        commit.schedule_timers = vec![escalation(1, now)];
        store.create_instance(commit).await.unwrap();

        let first = store.claim_due_timers("w1", now, 10).await.unwrap();
        store
            .reclaim_stale_timers(now + Duration::minutes(5))
            .await
            .unwrap();
        store.claim_due_timers("w2", now, 10).await.unwrap();

        let id = first[0].id;
        assert!(!store.complete_timer(id, "w1").await.unwrap());
        assert!(!store.cancel_timer(id, "w1").await.unwrap());
        assert!(store.complete_timer(id, "w2").await.unwrap());
        assert!(!store.cancel_timer(id, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_fires_timer_under_its_claim() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);
        let mut commit = InstanceCommit::new(inst.clone(), 0, now);
        commit.schedule_timers = vec![escalation(1, now)];
        store.create_instance(commit).await.unwrap();

        let claimed = store.claim_due_timers("w1", now, 10).await.unwrap();
        let claim = claimed[0].claim().unwrap();

        // A claim held by someone else aborts the whole commit
        let mut commit = InstanceCommit::new(inst.clone(), 1, now);
        commit.fired_timer = Some(TimerClaim {
            worker_id: "w2".to_string(),
            ..claim.clone()
        });
        commit.audit = vec![TraceEvent::ActionCancelled {
            action_type: "x".to_string(),
        }];
        let err = store.commit(commit).await.unwrap_err();
        assert!(matches!(err, StoreError::TimerClaimLost(_)));
        assert!(store.load_audit(inst.id).await.unwrap().is_empty());

        let mut commit = InstanceCommit::new(inst.clone(), 1, now);
        commit.fired_timer = Some(claim);
        store.commit(commit).await.unwrap();

        // Fired rows are never reclaimed
        let reclaimed = store
            .reclaim_stale_timers(now + Duration::minutes(5))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
        assert!(store.claim_due_timers("w3", now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_action_queue_lifecycle() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);

        let mut commit = InstanceCommit::new(inst.clone(), 0, now);
        commit.enqueue_actions = vec![notify()];
        store.create_instance(commit).await.unwrap();

        let claimed = store.claim_actions("w1", now, 10, None).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);

        let retry_at = now + Duration::seconds(1);
        store
            .retry_action(claimed[0].id, "timeout", retry_at)
            .await
            .unwrap();
        assert!(store.claim_actions("w1", now, 10, None).await.unwrap().is_empty());

        let claimed = store
            .claim_actions("w1", retry_at, 10, Some(inst.id))
            .await
            .unwrap();
        assert_eq!(claimed[0].attempt, 2);

        store.fail_action(claimed[0].id, "gave up").await.unwrap();
        assert_eq!(store.action_count(ActionStatus::Dead), 1);
    }

    #[tokio::test]
    async fn test_cancel_actions_in_commit() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);

        let mut commit = InstanceCommit::new(inst.clone(), 0, now);
        commit.enqueue_actions = vec![notify()];
        store.create_instance(commit).await.unwrap();

        let mut commit = InstanceCommit::new(inst.clone(), 1, now);
        commit.cancel_actions = true;
        commit.enqueue_actions = vec![notify()];
        store.commit(commit).await.unwrap();

        // The older action is cancelled; the one enqueued with the cancel survives
        assert_eq!(store.action_count(ActionStatus::Cancelled), 1);
        assert_eq!(store.action_count(ActionStatus::Pending), 1);
    }

    #[tokio::test]
    async fn test_mark_degraded_bumps_revision() {
        let store = InMemoryEngineStore::new();
        let now = Utc::now();
        let inst = instance(now);
        store
            .create_instance(InstanceCommit::new(inst.clone(), 0, now))
            .await
            .unwrap();

        store
            .mark_degraded(
                inst.id,
                vec![TraceEvent::InstanceDegraded {
                    action_type: "notify".to_string(),
                }],
                now,
            )
            .await
            .unwrap();

        let loaded = store.get_instance(inst.id).await.unwrap();
        assert!(loaded.degraded);
        assert_eq!(loaded.revision, 2);

        let audit = store.load_audit(inst.id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].sequence, 1);
    }
}
