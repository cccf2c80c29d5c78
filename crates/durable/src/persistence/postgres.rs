//! PostgreSQL implementation of EngineStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency via a per-instance revision checked under `FOR UPDATE`
//! - One transaction per [`InstanceCommit`]
//! - Timer and action claiming with `FOR UPDATE SKIP LOCKED`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use flowgate_core::{
    AuditEntry, Phase, TimerKind, TimerRequest, TraceEvent, WorkflowDefinition, WorkflowInstance,
};

use super::store::*;
use crate::reliability::RetryPolicy;

/// PostgreSQL implementation of EngineStore
///
/// # Example
///
/// ```ignore
/// use flowgate_durable::PostgresEngineStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowgate").await?;
/// let store = PostgresEngineStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a default pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            db(e)
        })?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

// ============================================
// Row mapping
// ============================================

fn definition_from_row(row: &PgRow) -> Result<WorkflowDefinition, StoreError> {
    let document: serde_json::Value = row.get("document");
    let mut definition: WorkflowDefinition = serde_json::from_value(document)?;
    definition.active = row.get("active");
    Ok(definition)
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let document: serde_json::Value = row.get("document");
    let mut instance: WorkflowInstance = serde_json::from_value(document)?;
    instance.revision = row.get::<i64, _>("revision") as u64;
    Ok(instance)
}

fn timer_from_row(row: &PgRow) -> Result<TimerRecord, StoreError> {
    let kind: TimerKind = serde_json::from_value(row.get("kind"))?;
    let status: String = row.get("status");
    Ok(TimerRecord {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        timer: TimerRequest {
            step_number: row.get::<Option<i32>, _>("step_number").map(|n| n as u32),
            kind,
            due_at: row.get("due_at"),
            escalation_level: row.get::<i32, _>("escalation_level") as u32,
            deadline: row.get("deadline"),
        },
        status: TimerStatus::parse(&status)?,
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        attempts: row.get::<i32, _>("attempts") as u32,
        created_at: row.get("created_at"),
    })
}

fn action_from_row(row: &PgRow) -> Result<ActionTask, StoreError> {
    let phase = row
        .get::<Option<String>, _>("phase")
        .map(|p| serde_json::from_value::<Phase>(serde_json::Value::String(p)))
        .transpose()?;
    let retry_policy: RetryPolicy = serde_json::from_value(row.get("retry_policy"))?;
    let status: String = row.get("status");
    Ok(ActionTask {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        action_type: row.get("action_type"),
        config: row.get("config"),
        phase,
        context: row.get("context"),
        retry_policy,
        status: ActionStatus::parse(&status)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        visible_at: row.get("visible_at"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

// ============================================
// Transaction helpers
// ============================================

async fn insert_audit(
    conn: &mut PgConnection,
    instance_id: Uuid,
    events: Vec<TraceEvent>,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    if events.is_empty() {
        return Ok(());
    }

    let last: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(sequence), 0) FROM flowgate_audit WHERE instance_id = $1",
    )
    .bind(instance_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db)?;

    for (i, event) in events.into_iter().enumerate() {
        let data = serde_json::to_value(&event)?;
        sqlx::query(
            r#"
            INSERT INTO flowgate_audit (instance_id, sequence, event_type, event, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(instance_id)
        .bind(last + 1 + i as i64)
        .bind(event.kind())
        .bind(&data)
        .bind(at)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }
    Ok(())
}

/// Lock the instance row and return its revision
async fn lock_revision(conn: &mut PgConnection, instance_id: Uuid) -> Result<u64, StoreError> {
    let revision: Option<i64> =
        sqlx::query_scalar("SELECT revision FROM flowgate_instances WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db)?;
    revision
        .map(|r| r as u64)
        .ok_or(StoreError::InstanceNotFound(instance_id))
}

/// Timer, action and audit side of a commit
async fn apply_commit(conn: &mut PgConnection, commit: InstanceCommit) -> Result<(), StoreError> {
    let instance_id = commit.instance.id;

    if let Some(claim) = &commit.fired_timer {
        let fired = sqlx::query(
            r#"
            UPDATE flowgate_timers
            SET status = 'fired'
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(claim.timer_id)
        .bind(&claim.worker_id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
        // The caller drops the transaction, rolling back the instance update
        if fired.rows_affected() == 0 {
            return Err(StoreError::TimerClaimLost(claim.timer_id));
        }
    }

    for scope in &commit.cancel_timers {
        let step = match scope {
            flowgate_core::TimerScope::Step(n) => Some(*n as i32),
            flowgate_core::TimerScope::Instance => None,
        };
        sqlx::query(
            r#"
            UPDATE flowgate_timers
            SET status = 'cancelled'
            WHERE instance_id = $1
              AND status = 'pending'
              AND ($2::INTEGER IS NULL OR step_number = $2)
            "#,
        )
        .bind(instance_id)
        .bind(step)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }

    for request in commit.schedule_timers {
        let kind = serde_json::to_value(&request.kind)?;
        sqlx::query(
            r#"
            INSERT INTO flowgate_timers
                (id, instance_id, step_number, kind, due_at, escalation_level, deadline,
                 status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(instance_id)
        .bind(request.step_number.map(|n| n as i32))
        .bind(&kind)
        .bind(request.due_at)
        .bind(request.escalation_level as i32)
        .bind(request.deadline)
        .bind(commit.recorded_at)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }

    if commit.cancel_actions {
        sqlx::query(
            "UPDATE flowgate_actions SET status = 'cancelled' WHERE instance_id = $1 AND status = 'pending'",
        )
        .bind(instance_id)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }

    for task in commit.enqueue_actions {
        let task = ActionTask::new(instance_id, task, commit.recorded_at);
        let retry_policy = serde_json::to_value(&task.retry_policy)?;
        sqlx::query(
            r#"
            INSERT INTO flowgate_actions
                (id, instance_id, action_type, config, phase, context, retry_policy,
                 status, attempt, visible_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $8)
            "#,
        )
        .bind(task.id)
        .bind(instance_id)
        .bind(&task.action_type)
        .bind(&task.config)
        .bind(task.phase.map(|p| p.as_str()))
        .bind(&task.context)
        .bind(&retry_policy)
        .bind(task.visible_at)
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    }

    insert_audit(conn, instance_id, commit.audit, commit.recorded_at).await
}

#[async_trait]
impl EngineStore for PostgresEngineStore {
    // =========================================================================
    // Definitions
    // =========================================================================

    #[instrument(skip(self, definition), fields(definition_id = %definition.id, version = definition.version))]
    async fn insert_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let document = serde_json::to_value(definition)?;
        let result = sqlx::query(
            r#"
            INSERT INTO flowgate_definitions
                (id, version, active, module, event_type, document, created_at)
            VALUES ($1, $2, FALSE, $3, $4, $5, $6)
            ON CONFLICT (id, version) DO NOTHING
            "#,
        )
        .bind(definition.id)
        .bind(definition.version as i32)
        .bind(&definition.trigger.module)
        .bind(&definition.trigger.event_type)
        .bind(&document)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert definition: {}", e);
            db(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!(
                "definition {} version {}",
                definition.id, definition.version
            )));
        }
        if definition.active {
            self.set_definition_active(definition.id, Some(definition.version))
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, definition), fields(definition_id = %definition.id, version = definition.version))]
    async fn replace_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let document = serde_json::to_value(definition)?;
        let result = sqlx::query(
            r#"
            UPDATE flowgate_definitions
            SET module = $3, event_type = $4, document = $5
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(definition.id)
        .bind(definition.version as i32)
        .bind(&definition.trigger.module)
        .bind(&definition.trigger.event_type)
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DefinitionNotFound {
                id: definition.id,
                version: Some(definition.version),
            });
        }
        Ok(())
    }

    async fn get_definition(&self, id: Uuid, version: u32) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(
            "SELECT active, document FROM flowgate_definitions WHERE id = $1 AND version = $2",
        )
        .bind(id)
        .bind(version as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(StoreError::DefinitionNotFound {
            id,
            version: Some(version),
        })?;
        definition_from_row(&row)
    }

    async fn latest_definition(&self, id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT active, document FROM flowgate_definitions
            WHERE id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(StoreError::DefinitionNotFound { id, version: None })?;
        definition_from_row(&row)
    }

    async fn list_definition_versions(
        &self,
        id: Uuid,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT active, document FROM flowgate_definitions WHERE id = $1 ORDER BY version",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        if rows.is_empty() {
            return Err(StoreError::DefinitionNotFound { id, version: None });
        }
        rows.iter().map(definition_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn set_definition_active(
        &self,
        id: Uuid,
        version: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM flowgate_definitions WHERE id = $1 AND ($2::INTEGER IS NULL OR version = $2))",
        )
        .bind(id)
        .bind(version.map(|v| v as i32))
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        if !exists {
            return Err(StoreError::DefinitionNotFound { id, version });
        }

        // Deactivate first so the one-active index never sees two rows
        sqlx::query("UPDATE flowgate_definitions SET active = FALSE WHERE id = $1 AND active")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        if let Some(v) = version {
            sqlx::query("UPDATE flowgate_definitions SET active = TRUE WHERE id = $1 AND version = $2")
                .bind(id)
                .bind(v as i32)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }

        tx.commit().await.map_err(db)?;
        debug!(%id, ?version, "definition activation changed");
        Ok(())
    }

    async fn active_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(
            "SELECT active, document FROM flowgate_definitions WHERE active ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(definition_from_row).collect()
    }

    async fn count_instances(&self, definition_id: Uuid, version: u32) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM flowgate_instances WHERE definition_id = $1 AND definition_version = $2",
        )
        .bind(definition_id)
        .bind(version as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        Ok(count as u64)
    }

    // =========================================================================
    // Instances
    // =========================================================================

    #[instrument(skip(self, commit), fields(instance_id = %commit.instance.id))]
    async fn create_instance(&self, mut commit: InstanceCommit) -> Result<u64, StoreError> {
        commit.instance.revision = 1;
        let document = serde_json::to_value(&commit.instance)?;

        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO flowgate_instances
                (id, definition_id, definition_version, status, revision, document,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $6, $6)
            "#,
        )
        .bind(commit.instance.id)
        .bind(commit.instance.definition_id)
        .bind(commit.instance.definition_version as i32)
        .bind(commit.instance.status.as_str())
        .bind(&document)
        .bind(commit.instance.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create instance: {}", e);
            db(e)
        })?;

        apply_commit(&mut tx, commit).await?;
        tx.commit().await.map_err(db)?;
        Ok(1)
    }

    async fn get_instance(&self, id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query("SELECT revision, document FROM flowgate_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or(StoreError::InstanceNotFound(id))?;
        instance_from_row(&row)
    }

    #[instrument(skip(self, commit), fields(instance_id = %commit.instance.id, expected = commit.expected_revision))]
    async fn commit(&self, mut commit: InstanceCommit) -> Result<u64, StoreError> {
        let id = commit.instance.id;
        let mut tx = self.pool.begin().await.map_err(db)?;

        let actual = lock_revision(&mut tx, id).await?;
        if actual != commit.expected_revision {
            return Err(StoreError::ConcurrencyConflict {
                instance_id: id,
                expected: commit.expected_revision,
                actual,
            });
        }

        let revision = actual + 1;
        commit.instance.revision = revision;
        commit.instance.updated_at = commit.recorded_at;
        let document = serde_json::to_value(&commit.instance)?;

        sqlx::query(
            r#"
            UPDATE flowgate_instances
            SET status = $2, revision = $3, document = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(commit.instance.status.as_str())
        .bind(revision as i64)
        .bind(&document)
        .bind(commit.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        apply_commit(&mut tx, commit).await?;
        tx.commit().await.map_err(|e| {
            error!("Failed to commit instance transition: {}", e);
            db(e)
        })?;

        debug!(%id, revision, "committed transition");
        Ok(revision)
    }

    async fn list_open_instances(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT revision, document FROM flowgate_instances
            WHERE definition_id = $1 AND status IN ('pending', 'escalated')
            ORDER BY id
            "#,
        )
        .bind(definition_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn load_audit(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        // Distinguish "no entries" from "no instance"
        self.get_instance(instance_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT sequence, event, recorded_at FROM flowgate_audit
            WHERE instance_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;

        rows.iter()
            .map(|row| -> Result<AuditEntry, StoreError> {
                Ok(AuditEntry {
                    instance_id,
                    sequence: row.get::<i64, _>("sequence") as u64,
                    recorded_at: row.get("recorded_at"),
                    event: serde_json::from_value(row.get("event"))?,
                })
            })
            .collect()
    }

    async fn append_audit(
        &self,
        instance_id: Uuid,
        events: Vec<TraceEvent>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        // Row lock serializes sequence allocation with commits
        lock_revision(&mut tx, instance_id).await?;
        insert_audit(&mut tx, instance_id, events, at).await?;
        tx.commit().await.map_err(db)
    }

    #[instrument(skip(self, events))]
    async fn mark_degraded(
        &self,
        instance_id: Uuid,
        events: Vec<TraceEvent>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        lock_revision(&mut tx, instance_id).await?;

        sqlx::query(
            r#"
            UPDATE flowgate_instances
            SET document = jsonb_set(document, '{degraded}', 'true'::jsonb),
                revision = revision + 1,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        insert_audit(&mut tx, instance_id, events, at).await?;
        tx.commit().await.map_err(db)
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
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM flowgate_timers
                WHERE status = 'pending'
                  AND due_at <= $1
                ORDER BY due_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE flowgate_timers t
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = $1,
                attempts = attempts + 1
            FROM due d
            WHERE t.id = d.id
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim timers: {}", e);
            db(e)
        })?;

        let mut claimed = rows
            .iter()
            .map(timer_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.timer.due_at.cmp(&b.timer.due_at).then(a.id.cmp(&b.id)));

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed timers");
        }
        Ok(claimed)
    }

    async fn complete_timer(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowgate_timers
            SET status = 'fired'
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_timer(
        &self,
        id: Uuid,
        worker_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE flowgate_timers
            SET status = 'pending', due_at = $3, claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn cancel_timer(&self, id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowgate_timers
            SET status = 'cancelled'
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reclaim_stale_timers(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE flowgate_timers
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(ids)
    }

    async fn pending_timers(&self, instance_id: Uuid) -> Result<Vec<TimerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM flowgate_timers
            WHERE instance_id = $1 AND status = 'pending'
            ORDER BY due_at, id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(timer_from_row).collect()
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
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM flowgate_actions
                WHERE status = 'pending'
                  AND visible_at <= $1
                  AND ($4::UUID IS NULL OR instance_id = $4)
                ORDER BY visible_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE flowgate_actions a
            SET status = 'claimed',
                claimed_by = $3,
                claimed_at = $1,
                attempt = attempt + 1
            FROM claimable c
            WHERE a.id = c.id
            RETURNING a.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim actions: {}", e);
            db(e)
        })?;

        let mut claimed = rows
            .iter()
            .map(action_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.visible_at.cmp(&b.visible_at).then(a.id.cmp(&b.id)));

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed actions");
        }
        Ok(claimed)
    }

    async fn complete_action(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE flowgate_actions SET status = 'completed', claimed_by = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(id));
        }
        Ok(())
    }

    async fn retry_action(
        &self,
        id: Uuid,
        error: &str,
        visible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flowgate_actions
            SET status = 'pending', visible_at = $2, last_error = $3,
                claimed_by = NULL, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(visible_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(id));
        }
        Ok(())
    }

    async fn fail_action(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE flowgate_actions SET status = 'dead', last_error = $2, claimed_by = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(id));
        }
        Ok(())
    }

    async fn cancel_action(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE flowgate_actions SET status = 'cancelled', claimed_by = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ActionNotFound(id));
        }
        Ok(())
    }

    async fn reclaim_stale_actions(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE flowgate_actions
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'claimed' AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(ids)
    }

    async fn list_actions(&self, instance_id: Uuid) -> Result<Vec<ActionTask>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM flowgate_actions WHERE instance_id = $1 ORDER BY created_at, id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(action_from_row).collect()
    }
}
