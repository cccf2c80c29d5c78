//! Workflow Engine facade
//!
//! The only entry point external modules call. Each operation:
//! 1. checks the caller's capability through the [`PermissionGuard`]
//! 2. loads the instance and its pinned definition version
//! 3. lets the [`ApprovalRouter`] compute a [`Transition`]
//! 4. persists the transition as one [`InstanceCommit`], recomputing it on
//!    a revision conflict
//! 5. optionally dispatches the instance's queued actions with a bounded wait

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use flowgate_core::{
    ApprovalRouter, ApproverResolver, AuditEntry, Capability, Clock, Decision, EngineError,
    IdentityDirectory, InstanceStatus, PermissionGuard, Result, SystemClock, SystemNotice,
    TimerKind, TimerRequest, TraceEvent, Transition, WorkflowDefinition, WorkflowInstance,
};
use flowgate_durable::persistence::{
    EngineStore, InstanceCommit, NewActionTask, StoreError, TimerClaim, TimerRecord,
};
use flowgate_durable::worker::{ActionDispatcher, TimerHandler, TimerOutcome};
use flowgate_durable::RetryPolicy;

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::event::{DomainEvent, SubmitOutcome};
use crate::trigger::TriggerMatcher;

/// Management levels above the requester that `view_team` reaches
const TEAM_VISIBILITY_TIERS: u32 = 8;

/// Action type used for reminder notices
pub const REMINDER_ACTION: &str = "system.reminder";

/// Action type used to notify audit/configure holders of an `error` instance
pub const ERROR_ESCALATION_ACTION: &str = "system.error_escalation";

pub(crate) fn notice_action_type(notice: &SystemNotice) -> &'static str {
    match notice {
        SystemNotice::Reminder { .. } => REMINDER_ACTION,
        SystemNotice::ErrorEscalation { .. } => ERROR_ESCALATION_ACTION,
    }
}

/// A state change applied through the commit loop
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Decide {
        step_number: u32,
        principal: String,
        decision: Decision,
        comment: Option<String>,
    },
    Delegate {
        step_number: u32,
        from: String,
        to: String,
    },
    Override {
        actor: String,
        final_status: InstanceStatus,
        reason: String,
    },
    Cancel {
        actor: String,
        reason: String,
    },
    Escalate {
        step_number: u32,
    },
    /// Fired under the scheduler's claim on the timer row
    Fire {
        timer: TimerRequest,
        claim: TimerClaim,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Decide { .. } => "decide",
            Command::Delegate { .. } => "delegate",
            Command::Override { .. } => "override",
            Command::Cancel { .. } => "cancel",
            Command::Escalate { .. } => "escalate",
            Command::Fire { .. } => "fire_timer",
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct WorkflowEngine {
    pub(crate) store: Arc<dyn EngineStore>,
    pub(crate) router: ApprovalRouter,
    pub(crate) guard: PermissionGuard,
    pub(crate) matcher: TriggerMatcher,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    dispatcher: Option<Arc<ActionDispatcher>>,
}

impl WorkflowEngine {
    pub fn builder(
        store: Arc<dyn EngineStore>,
        directory: Arc<dyn IdentityDirectory>,
    ) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(store, directory)
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn guard(&self) -> &PermissionGuard {
        &self.guard
    }

    // ========================================================================
    // Event ingestion
    // ========================================================================

    /// Match an event against active definitions and start an instance
    #[instrument(skip_all, fields(module = %event.module, event_type = %event.event_type, entity_id = %event.entity_id))]
    pub async fn submit_event(
        &self,
        ctx: &ExecutionContext,
        event: DomainEvent,
    ) -> Result<SubmitOutcome> {
        self.guard.check(&ctx.principal, Capability::Trigger)?;

        let definitions = self.store.active_definitions().await?;
        let eval_ctx = event.evaluation_context();
        let Some(def) = self.matcher.first_match(&definitions, &event, &eval_ctx)? else {
            debug!("no trigger matched");
            return Ok(SubmitOutcome::NoTriggerMatched);
        };

        let now = self.clock.now();
        let mut instance = WorkflowInstance::new(
            def.id,
            def.version,
            event.subject(),
            eval_ctx,
            def.approvers.iter().map(|r| r.step_number),
            now,
        );
        instance.sandboxed = ctx.sandbox || def.policy.sandbox_mode;
        let instance_id = instance.id;

        let tx = self.router.start(def, &mut instance, now).await;
        let (commit, dispatch) = self.build_commit(instance, 0, tx, now);
        let status = commit.instance.status;
        self.store.create_instance(commit).await?;

        info!(
            instance_id = %instance_id,
            definition_id = %def.id,
            version = def.version,
            status = %status,
            sandboxed = ctx.sandbox,
            "instance created"
        );
        if dispatch {
            self.dispatch_inline(instance_id).await;
        }
        Ok(SubmitOutcome::Created(instance_id))
    }

    // ========================================================================
    // Instance operations
    // ========================================================================

    /// Record an approve or reject; returns the resulting instance status
    #[instrument(skip(self, ctx, comment), fields(caller = %ctx.principal.id))]
    pub async fn record_decision(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
        step_number: u32,
        principal: &str,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<InstanceStatus> {
        let capability = match decision {
            Decision::Approve => Capability::Approve,
            Decision::Reject => Capability::Reject,
            Decision::Delegate => {
                return Err(EngineError::transition(
                    "delegation is recorded through delegate, not as a decision",
                ))
            }
        };
        self.guard.check(&ctx.principal, capability)?;
        self.ensure_acting_as(ctx, principal)?;

        let instance = self
            .mutate(
                instance_id,
                Command::Decide {
                    step_number,
                    principal: principal.to_string(),
                    decision,
                    comment,
                },
            )
            .await?;
        Ok(instance.status)
    }

    /// Hand `from`'s decision right on a step to `to`
    #[instrument(skip(self, ctx), fields(caller = %ctx.principal.id))]
    pub async fn delegate(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
        step_number: u32,
        from: &str,
        to: &str,
    ) -> Result<WorkflowInstance> {
        self.guard.check(&ctx.principal, Capability::Delegate)?;
        self.ensure_acting_as(ctx, from)?;

        self.mutate(
            instance_id,
            Command::Delegate {
                step_number,
                from: from.to_string(),
                to: to.to_string(),
            },
        )
        .await
    }

    /// Force a terminal status; always audited with actor and reason
    #[instrument(skip(self, ctx, reason), fields(caller = %ctx.principal.id))]
    pub async fn override_instance(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
        actor: &str,
        final_status: InstanceStatus,
        reason: &str,
    ) -> Result<InstanceStatus> {
        self.guard.check(&ctx.principal, Capability::Override)?;
        ensure_caller_is(ctx, actor)?;

        let instance = self
            .mutate(
                instance_id,
                Command::Override {
                    actor: actor.to_string(),
                    final_status,
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(instance.status)
    }

    /// Cancel an instance; its timers and queued actions stop
    #[instrument(skip(self, ctx, reason), fields(caller = %ctx.principal.id))]
    pub async fn cancel(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> Result<InstanceStatus> {
        self.guard.check(&ctx.principal, Capability::Cancel)?;
        ensure_caller_is(ctx, actor)?;

        let instance = self
            .mutate(
                instance_id,
                Command::Cancel {
                    actor: actor.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(instance.status)
    }

    /// Escalate an active step now instead of waiting for its deadline
    #[instrument(skip(self, ctx), fields(caller = %ctx.principal.id))]
    pub async fn escalate(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
        step_number: u32,
    ) -> Result<InstanceStatus> {
        self.guard.check(&ctx.principal, Capability::Escalate)?;

        let instance = self
            .mutate(instance_id, Command::Escalate { step_number })
            .await?;
        Ok(instance.status)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn instance_status(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
    ) -> Result<InstanceStatus> {
        Ok(self.get_instance(ctx, instance_id).await?.status)
    }

    pub async fn get_instance(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
    ) -> Result<WorkflowInstance> {
        self.guard.check_any(
            &ctx.principal,
            &[
                Capability::ViewAll,
                Capability::ViewTeam,
                Capability::ViewOwn,
                Capability::Audit,
            ],
        )?;
        let instance = self.store.get_instance(instance_id).await?;
        self.ensure_can_view(ctx, &instance).await?;
        Ok(instance)
    }

    /// Every decision, escalation and action entry, in order
    pub async fn audit_trail(
        &self,
        ctx: &ExecutionContext,
        instance_id: Uuid,
    ) -> Result<Vec<AuditEntry>> {
        self.guard
            .check_any(&ctx.principal, &[Capability::Audit, Capability::ViewAll])?;
        // Unknown ids are an error, not an empty trail
        self.store.get_instance(instance_id).await?;
        Ok(self.store.load_audit(instance_id).await?)
    }

    // ========================================================================
    // Commit loop
    // ========================================================================

    /// `view_own` covers the requester and the instance's approvers;
    /// `view_team` covers anyone the caller manages
    async fn ensure_can_view(&self, ctx: &ExecutionContext, instance: &WorkflowInstance) -> Result<()> {
        let principal = &ctx.principal;
        if self.guard.allows(principal, Capability::ViewAll)
            || self.guard.allows(principal, Capability::Audit)
        {
            return Ok(());
        }

        let caller = principal.id.as_str();
        let resolver = self.router.resolver();
        let requester = resolver.requester(&instance.context);
        if self.guard.allows(principal, Capability::ViewOwn)
            && (requester.as_deref() == Some(caller) || participates(instance, caller))
        {
            return Ok(());
        }
        if self.guard.allows(principal, Capability::ViewTeam) {
            if let Some(requester) = &requester {
                if resolver.manages(caller, requester, TEAM_VISIBILITY_TIERS).await? {
                    return Ok(());
                }
            }
        }

        debug!(instance_id = %instance.id, caller, "instance outside caller's view");
        Err(EngineError::PermissionDenied {
            principal: caller.to_string(),
            capability: Capability::ViewAll,
        })
    }

    /// Acting for someone else requires `override`
    fn ensure_acting_as(&self, ctx: &ExecutionContext, principal: &str) -> Result<()> {
        if ctx.principal.id == principal {
            Ok(())
        } else {
            self.guard.check(&ctx.principal, Capability::Override)
        }
    }

    /// Apply a command that must produce a transition
    pub(crate) async fn mutate(
        &self,
        instance_id: Uuid,
        command: Command,
    ) -> Result<WorkflowInstance> {
        let name = command.name();
        self.try_mutate(instance_id, command).await?.ok_or_else(|| {
            EngineError::transition(format!("{name} had no effect on instance {instance_id}"))
        })
    }

    /// Load, transition and commit; `None` when the command is stale
    ///
    /// A revision conflict means another transition committed first. The
    /// command is recomputed against the fresh snapshot so no decision is
    /// lost and quorum checks always see every vote.
    async fn try_mutate(
        &self,
        instance_id: Uuid,
        command: Command,
    ) -> Result<Option<WorkflowInstance>> {
        let mut conflicts = 0;
        loop {
            let mut instance = self.store.get_instance(instance_id).await?;
            let def = self
                .store
                .get_definition(instance.definition_id, instance.definition_version)
                .await?;
            let expected = instance.revision;
            let now = self.clock.now();

            let Some(tx) = self.apply(&def, &mut instance, &command, now).await? else {
                return Ok(None);
            };
            let (mut commit, dispatch) = self.build_commit(instance, expected, tx, now);
            if let Command::Fire { claim, .. } = &command {
                commit.fired_timer = Some(claim.clone());
            }
            let mut committed = commit.instance.clone();

            match self.store.commit(commit).await {
                Ok(revision) => {
                    committed.revision = revision;
                    if dispatch {
                        self.dispatch_inline(instance_id).await;
                    }
                    return Ok(Some(committed));
                }
                Err(StoreError::TimerClaimLost(timer_id)) => {
                    debug!(instance_id = %instance_id, %timer_id, "timer claim lost, not firing");
                    return Ok(None);
                }
                Err(StoreError::ConcurrencyConflict { actual, .. })
                    if conflicts < self.config.conflict_retries =>
                {
                    conflicts += 1;
                    debug!(
                        instance_id = %instance_id,
                        command = command.name(),
                        expected,
                        actual,
                        conflicts,
                        "revision conflict, recomputing transition"
                    );
                }
                Err(e) => {
                    if matches!(e, StoreError::ConcurrencyConflict { .. }) {
                        warn!(
                            instance_id = %instance_id,
                            command = command.name(),
                            "conflict retries exhausted"
                        );
                    }
                    return Err(e.into());
                }
            }
        }
    }

    async fn apply(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        command: &Command,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        match command {
            Command::Decide {
                step_number,
                principal,
                decision,
                comment,
            } => self
                .router
                .record_decision(
                    def,
                    instance,
                    *step_number,
                    principal,
                    *decision,
                    comment.clone(),
                    now,
                )
                .await
                .map(Some),
            Command::Delegate {
                step_number,
                from,
                to,
            } => self
                .router
                .delegate(def, instance, *step_number, from, to, now)
                .map(Some),
            Command::Override {
                actor,
                final_status,
                reason,
            } => self
                .router
                .override_status(def, instance, actor, *final_status, reason, now)
                .map(Some),
            Command::Cancel { actor, reason } => self
                .router
                .cancel(def, instance, actor, reason, now)
                .map(Some),
            Command::Escalate { step_number } => {
                let timer = manual_escalation(instance, *step_number, now)?;
                Ok(self.router.fire_timer(def, instance, &timer, now).await)
            }
            Command::Fire { timer, .. } => {
                Ok(self.router.fire_timer(def, instance, timer, now).await)
            }
        }
    }

    /// Turn a transition into a commit; the flag says whether actions were enqueued
    pub(crate) fn build_commit(
        &self,
        instance: WorkflowInstance,
        expected_revision: u64,
        tx: Transition,
        now: DateTime<Utc>,
    ) -> (InstanceCommit, bool) {
        let Transition {
            events,
            actions,
            notices,
            timers,
            cancel_timers,
            cancel_actions,
        } = tx;
        let sandboxed = instance.sandboxed;
        let context = instance.context.as_json();

        let mut commit = InstanceCommit::new(instance, expected_revision, now);
        commit.audit = events;
        commit.cancel_timers = cancel_timers;
        commit.schedule_timers = timers;
        commit.cancel_actions = cancel_actions;

        for action in actions {
            if sandboxed {
                commit.audit.push(TraceEvent::ActionRecorded {
                    action_type: action.action_type,
                    phase: Some(action.phase),
                });
            } else {
                commit.enqueue_actions.push(NewActionTask {
                    action_type: action.action_type,
                    config: action.config,
                    phase: Some(action.phase),
                    context: context.clone(),
                    retry_policy: self.config.action_retry_policy.clone(),
                });
            }
        }
        for notice in notices {
            let action_type = notice_action_type(&notice).to_string();
            if sandboxed {
                commit.audit.push(TraceEvent::ActionRecorded {
                    action_type,
                    phase: None,
                });
            } else {
                commit.enqueue_actions.push(NewActionTask {
                    action_type,
                    config: serde_json::to_value(&notice).unwrap_or_default(),
                    phase: None,
                    context: context.clone(),
                    retry_policy: RetryPolicy::no_retry(),
                });
            }
        }

        let dispatch = !commit.enqueue_actions.is_empty();
        (commit, dispatch)
    }

    /// Run the instance's queued actions, waiting at most `inline_dispatch_timeout`
    ///
    /// Whatever is still running after the wait continues in the background;
    /// failures are retried by the dispatcher's own poll loop.
    async fn dispatch_inline(&self, instance_id: Uuid) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return;
        };
        if !self.config.inline_dispatch {
            return;
        }

        let handle = tokio::spawn(async move { dispatcher.run_for_instance(instance_id).await });
        match tokio::time::timeout(self.config.inline_dispatch_timeout, handle).await {
            Ok(Ok(Ok(report))) => debug!(
                instance_id = %instance_id,
                succeeded = report.succeeded,
                retried = report.retried,
                dead = report.dead,
                "inline dispatch finished"
            ),
            Ok(Ok(Err(e))) => warn!(instance_id = %instance_id, "Inline dispatch failed: {}", e),
            Ok(Err(e)) => warn!(instance_id = %instance_id, "Inline dispatch task failed: {}", e),
            Err(_) => debug!(
                instance_id = %instance_id,
                "inline dispatch still running, continuing in background"
            ),
        }
    }
}

fn participates(instance: &WorkflowInstance, principal: &str) -> bool {
    instance.steps.iter().any(|step| {
        step.principals.iter().any(|p| p == principal)
            || step.holders().iter().any(|h| h == principal)
            || step.decisions.iter().any(|d| d.principal == principal)
    })
}

/// Override and cancel are audited under their actor, which must be the caller
fn ensure_caller_is(ctx: &ExecutionContext, actor: &str) -> Result<()> {
    if ctx.principal.id == actor {
        Ok(())
    } else {
        Err(EngineError::ActorMismatch {
            caller: ctx.principal.id.clone(),
            actor: actor.to_string(),
        })
    }
}

/// Synthetic escalation timer carrying the step's current fencing token
fn manual_escalation(
    instance: &WorkflowInstance,
    step_number: u32,
    now: DateTime<Utc>,
) -> Result<TimerRequest> {
    if instance.is_terminal() {
        return Err(EngineError::transition(format!(
            "instance {} is already {}",
            instance.id, instance.status
        )));
    }
    let step = instance.step(step_number).ok_or(EngineError::StepNotFound {
        instance_id: instance.id,
        step: step_number,
    })?;
    if !step.status.accepts_decisions() {
        return Err(EngineError::transition(format!(
            "step {step_number} is not active"
        )));
    }
    Ok(TimerRequest {
        step_number: Some(step_number),
        kind: TimerKind::Escalation,
        due_at: now,
        escalation_level: step.escalation_level,
        deadline: step.deadline,
    })
}

// ============================================================================
// Scheduler callback
// ============================================================================

#[async_trait]
impl TimerHandler for WorkflowEngine {
    async fn handle_timer(&self, timer: &TimerRecord) -> std::result::Result<TimerOutcome, EngineError> {
        let Some(claim) = timer.claim() else {
            warn!(timer_id = %timer.id, status = timer.status.as_str(), "unclaimed timer not fired");
            return Ok(TimerOutcome::Stale);
        };
        let command = Command::Fire {
            timer: timer.timer.clone(),
            claim,
        };
        match self.try_mutate(timer.instance_id, command).await?
        {
            Some(instance) => {
                debug!(
                    instance_id = %timer.instance_id,
                    kind = timer.timer.kind.as_str(),
                    status = %instance.status,
                    "timer fired"
                );
                Ok(TimerOutcome::Fired)
            }
            None => Ok(TimerOutcome::Stale),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct WorkflowEngineBuilder {
    store: Arc<dyn EngineStore>,
    directory: Arc<dyn IdentityDirectory>,
    resolver: Option<ApproverResolver>,
    guard: PermissionGuard,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    dispatcher: Option<Arc<ActionDispatcher>>,
}

impl WorkflowEngineBuilder {
    pub fn new(store: Arc<dyn EngineStore>, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self {
            store,
            directory,
            resolver: None,
            guard: PermissionGuard::default(),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            dispatcher: None,
        }
    }

    /// Replace the default resolver (custom strategies, subject field)
    pub fn resolver(mut self, resolver: ApproverResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn guard(mut self, guard: PermissionGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Dispatcher used for inline dispatch after commits
    pub fn dispatcher(mut self, dispatcher: Arc<ActionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let resolver = self
            .resolver
            .unwrap_or_else(|| ApproverResolver::new(self.directory));
        let router = ApprovalRouter::new(resolver).with_error_recipients(error_recipients(&self.guard));

        WorkflowEngine {
            store: self.store,
            router,
            guard: self.guard,
            matcher: TriggerMatcher::new(),
            clock: self.clock,
            config: self.config,
            dispatcher: self.dispatcher,
        }
    }
}

/// Roles holding `audit` or `configure`, excluding the internal system role
fn error_recipients(guard: &PermissionGuard) -> Vec<String> {
    let matrix = guard.matrix();
    let mut roles: Vec<String> = matrix
        .roles_with(Capability::Audit)
        .into_iter()
        .chain(matrix.roles_with(Capability::Configure))
        .filter(|r| r != "system")
        .collect();
    roles.sort();
    roles.dedup();
    roles
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::{PermissionMatrix, StaticDirectory};
    use flowgate_durable::InMemoryEngineStore;

    #[test]
    fn test_error_recipients_from_matrix() {
        assert_eq!(
            error_recipients(&PermissionGuard::default()),
            vec!["admin".to_string(), "auditor".to_string()]
        );

        let matrix = PermissionMatrix::new()
            .grant("ops", [Capability::Configure])
            .grant("compliance", [Capability::Audit])
            .grant("employee", [Capability::Trigger]);
        assert_eq!(
            error_recipients(&PermissionGuard::new(matrix)),
            vec!["compliance".to_string(), "ops".to_string()]
        );
    }

    #[test]
    fn test_notice_action_types() {
        let reminder = SystemNotice::Reminder {
            step_number: 1,
            offset_hours: 4,
            holders: vec![],
        };
        assert_eq!(notice_action_type(&reminder), REMINDER_ACTION);
        let error = SystemNotice::ErrorEscalation {
            reason: "empty".to_string(),
            roles: vec![],
        };
        assert_eq!(notice_action_type(&error), ERROR_ESCALATION_ACTION);
    }

    #[tokio::test]
    async fn test_sandboxed_commit_records_instead_of_enqueueing() {
        let engine = WorkflowEngine::builder(
            Arc::new(InMemoryEngineStore::new()),
            Arc::new(StaticDirectory::new()),
        )
        .build();
        let now = Utc::now();
        let mut instance = WorkflowInstance::new(
            Uuid::now_v7(),
            1,
            flowgate_core::SubjectRef::new("travel", "trip-1"),
            Default::default(),
            [1],
            now,
        );
        let tx = Transition {
            actions: vec![flowgate_core::TriggeredAction {
                action_type: "notify".to_string(),
                config: serde_json::json!({}),
                phase: flowgate_core::Phase::Approval,
            }],
            notices: vec![SystemNotice::ErrorEscalation {
                reason: "empty".to_string(),
                roles: vec!["admin".to_string()],
            }],
            ..Default::default()
        };

        let (commit, dispatch) = engine.build_commit(instance.clone(), 0, tx.clone(), now);
        assert!(dispatch);
        assert_eq!(commit.enqueue_actions.len(), 2);
        assert_eq!(commit.enqueue_actions[1].retry_policy, RetryPolicy::no_retry());

        instance.sandboxed = true;
        let (commit, dispatch) = engine.build_commit(instance, 0, tx, now);
        assert!(!dispatch);
        assert!(commit.enqueue_actions.is_empty());
        assert_eq!(
            commit.audit,
            vec![
                TraceEvent::ActionRecorded {
                    action_type: "notify".to_string(),
                    phase: Some(flowgate_core::Phase::Approval),
                },
                TraceEvent::ActionRecorded {
                    action_type: ERROR_ESCALATION_ACTION.to_string(),
                    phase: None,
                },
            ]
        );
    }
}
