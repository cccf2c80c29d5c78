// Definition management
//
// Stored versions are immutable once something depends on them. Editing a
// definition that is active or referenced by any instance writes version
// N+1; instances created under version N keep reading version N. Only an
// inactive, never-instantiated version is rewritten in place.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use flowgate_core::{
    Capability, DefinitionDraft, DefinitionError, EngineError, Result, WorkflowDefinition,
};

use crate::context::ExecutionContext;
use crate::engine::{Command, WorkflowEngine};

/// What happens to running instances when a definition is deactivated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationMode {
    /// Stop matching new events; running instances finish normally
    #[default]
    Drain,
    /// Stop matching and cancel every running instance
    CancelInstances,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeactivationReport {
    pub open_instances: usize,
    pub cancelled: usize,
}

impl WorkflowEngine {
    /// Validate and store version 1 (inactive)
    #[instrument(skip_all, fields(name = %draft.name))]
    pub async fn create_definition(
        &self,
        ctx: &ExecutionContext,
        draft: DefinitionDraft,
    ) -> Result<WorkflowDefinition> {
        self.guard.check_any(
            &ctx.principal,
            &[Capability::Configure, Capability::CreateTemplates],
        )?;
        draft.validate()?;

        let definition = WorkflowDefinition::from_draft(draft, self.clock.now());
        self.store.insert_definition(&definition).await?;
        info!(definition_id = %definition.id, "definition created");
        Ok(definition)
    }

    /// Edit a definition; returns the version that now holds the edit
    #[instrument(skip(self, ctx, draft), fields(caller = %ctx.principal.id))]
    pub async fn update_definition(
        &self,
        ctx: &ExecutionContext,
        definition_id: Uuid,
        draft: DefinitionDraft,
    ) -> Result<WorkflowDefinition> {
        self.guard.check(&ctx.principal, Capability::Configure)?;
        draft.validate()?;

        let latest = self.store.latest_definition(definition_id).await?;
        let referenced = self
            .store
            .count_instances(definition_id, latest.version)
            .await?
            > 0;
        let now = self.clock.now();

        if !latest.active && !referenced {
            let definition = WorkflowDefinition::versioned(definition_id, latest.version, draft, now);
            self.store.replace_definition(&definition).await?;
            info!(version = definition.version, "definition edited in place");
            return Ok(definition);
        }

        if !latest.policy.enable_versioning {
            return Err(DefinitionError::VersioningDisabled.into());
        }
        let definition =
            WorkflowDefinition::versioned(definition_id, latest.version + 1, draft, now);
        self.publish_version(definition, latest.active).await
    }

    /// Activate a version (the latest when `None`); any other version is deactivated
    #[instrument(skip(self, ctx), fields(caller = %ctx.principal.id))]
    pub async fn activate_definition(
        &self,
        ctx: &ExecutionContext,
        definition_id: Uuid,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition> {
        self.guard.check(&ctx.principal, Capability::Configure)?;

        let mut definition = self.load_definition(definition_id, version).await?;
        self.store
            .set_definition_active(definition_id, Some(definition.version))
            .await?;
        definition.active = true;
        info!(version = definition.version, "definition activated");
        Ok(definition)
    }

    /// Stop matching events; optionally cancel running instances
    #[instrument(skip(self, ctx), fields(caller = %ctx.principal.id))]
    pub async fn deactivate_definition(
        &self,
        ctx: &ExecutionContext,
        definition_id: Uuid,
        mode: DeactivationMode,
    ) -> Result<DeactivationReport> {
        self.guard.check(&ctx.principal, Capability::Configure)?;
        if mode == DeactivationMode::CancelInstances {
            self.guard.check(&ctx.principal, Capability::Cancel)?;
        }

        // Fails with DefinitionNotFound for unknown ids
        self.store.latest_definition(definition_id).await?;
        self.store.set_definition_active(definition_id, None).await?;

        let open = self.store.list_open_instances(definition_id).await?;
        let mut report = DeactivationReport {
            open_instances: open.len(),
            cancelled: 0,
        };

        if mode == DeactivationMode::CancelInstances {
            for instance in open {
                let command = Command::Cancel {
                    actor: ctx.principal.id.clone(),
                    reason: "definition deactivated".to_string(),
                };
                match self.mutate(instance.id, command).await {
                    Ok(_) => report.cancelled += 1,
                    // Reached a terminal status on its own in the meantime
                    Err(EngineError::InvalidTransition(reason)) => {
                        warn!(instance_id = %instance.id, %reason, "instance not cancelled");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            open_instances = report.open_instances,
            cancelled = report.cancelled,
            ?mode,
            "definition deactivated"
        );
        Ok(report)
    }

    /// Publish an older version's content as a new version
    #[instrument(skip(self, ctx), fields(caller = %ctx.principal.id))]
    pub async fn rollback_definition(
        &self,
        ctx: &ExecutionContext,
        definition_id: Uuid,
        to_version: u32,
    ) -> Result<WorkflowDefinition> {
        self.guard.check(&ctx.principal, Capability::Configure)?;

        let latest = self.store.latest_definition(definition_id).await?;
        if !latest.policy.enable_rollback {
            return Err(DefinitionError::RollbackDisabled.into());
        }
        let target = self.store.get_definition(definition_id, to_version).await?;
        let definition = WorkflowDefinition::versioned(
            definition_id,
            latest.version + 1,
            target.to_draft(),
            self.clock.now(),
        );
        self.publish_version(definition, latest.active).await
    }

    pub async fn get_definition(
        &self,
        ctx: &ExecutionContext,
        definition_id: Uuid,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition> {
        self.guard.check_any(
            &ctx.principal,
            &[
                Capability::Configure,
                Capability::CreateTemplates,
                Capability::ViewAll,
                Capability::Audit,
            ],
        )?;
        self.load_definition(definition_id, version).await
    }

    pub async fn list_definition_versions(
        &self,
        ctx: &ExecutionContext,
        definition_id: Uuid,
    ) -> Result<Vec<WorkflowDefinition>> {
        self.guard.check_any(
            &ctx.principal,
            &[
                Capability::Configure,
                Capability::CreateTemplates,
                Capability::ViewAll,
                Capability::Audit,
            ],
        )?;
        Ok(self.store.list_definition_versions(definition_id).await?)
    }

    pub(crate) async fn load_definition(
        &self,
        definition_id: Uuid,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition> {
        let definition = match version {
            Some(v) => self.store.get_definition(definition_id, v).await?,
            None => self.store.latest_definition(definition_id).await?,
        };
        Ok(definition)
    }

    /// Insert a new version; it takes over the active flag if the previous one held it
    async fn publish_version(
        &self,
        mut definition: WorkflowDefinition,
        activate: bool,
    ) -> Result<WorkflowDefinition> {
        self.store.insert_definition(&definition).await?;
        if activate {
            self.store
                .set_definition_active(definition.id, Some(definition.version))
                .await?;
            definition.active = true;
        }
        info!(
            definition_id = %definition.id,
            version = definition.version,
            active = definition.active,
            "definition version published"
        );
        Ok(definition)
    }
}
