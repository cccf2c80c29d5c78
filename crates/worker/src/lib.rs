// Flowgate worker runtime
//
// Assembles the store, org-chart directory, action handlers, dispatcher,
// engine and escalation scheduler from the environment, and owns their
// background loops.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use flowgate_core::{Clock, IdentityDirectory, StaticDirectory, SystemClock};
use flowgate_durable::persistence::EngineStore;
use flowgate_durable::{
    ActionDispatcher, DispatcherConfig, EscalationScheduler, HandlerRegistry, InMemoryEngineStore,
    LogActionHandler, PostgresEngineStore, SchedulerConfig,
};
use flowgate_engine::{EngineConfig, WorkflowEngine, ERROR_ESCALATION_ACTION, REMINDER_ACTION};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; in-memory store when unset
    pub database_url: Option<String>,
    /// JSON org chart loaded into the static directory
    pub org_chart_path: Option<String>,
    /// Action types served by the logging handler besides the system ones
    pub log_action_types: Vec<String>,
    pub engine: EngineConfig,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
}

impl WorkerConfig {
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `ORG_CHART_PATH`: path to an org chart JSON file
    /// - `LOG_ACTION_TYPES`: comma-separated action types to log and acknowledge
    ///
    /// Engine, dispatcher and scheduler settings come from their own `from_env`.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            org_chart_path: std::env::var("ORG_CHART_PATH").ok(),
            log_action_types: std::env::var("LOG_ACTION_TYPES")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            engine: EngineConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// =============================================================================
// Runtime
// =============================================================================

pub struct FlowgateWorker {
    engine: Arc<WorkflowEngine>,
    dispatcher: Arc<ActionDispatcher>,
    scheduler: Arc<EscalationScheduler>,
}

impl FlowgateWorker {
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        let store = open_store(config.database_url.as_deref()).await?;
        let directory = load_directory(config.org_chart_path.as_deref()).await?;
        Ok(Self::assemble(store, directory, Arc::new(SystemClock), config))
    }

    /// Wire the components around an existing store and directory
    pub fn assemble(
        store: Arc<dyn EngineStore>,
        directory: Arc<dyn IdentityDirectory>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let registry = handler_registry(&config.log_action_types);
        info!(action_types = ?registry.action_types(), "action handlers registered");

        let dispatcher = Arc::new(ActionDispatcher::new(
            store.clone(),
            registry,
            clock.clone(),
            config.dispatcher,
        ));
        let engine = Arc::new(
            WorkflowEngine::builder(store.clone(), directory)
                .clock(clock.clone())
                .config(config.engine)
                .dispatcher(dispatcher.clone())
                .build(),
        );
        let scheduler = Arc::new(EscalationScheduler::new(
            store,
            engine.clone(),
            clock,
            config.scheduler,
        ));

        Self {
            engine,
            dispatcher,
            scheduler,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Spawn the dispatcher and scheduler loops
    pub fn start(&self) -> Result<()> {
        self.dispatcher
            .start()
            .context("Failed to start action dispatcher")?;
        self.scheduler
            .start()
            .context("Failed to start escalation scheduler")?;
        info!(
            dispatcher = %self.dispatcher.worker_id(),
            scheduler = %self.scheduler.worker_id(),
            "worker loops started"
        );
        Ok(())
    }

    /// Stop both loops, waiting for in-flight work
    pub async fn shutdown(&self) -> Result<()> {
        let (scheduler, dispatcher) =
            tokio::join!(self.scheduler.shutdown(), self.dispatcher.shutdown());
        scheduler.context("Escalation scheduler shutdown failed")?;
        dispatcher.context("Action dispatcher shutdown failed")?;
        Ok(())
    }
}

async fn open_store(database_url: Option<&str>) -> Result<Arc<dyn EngineStore>> {
    match database_url {
        Some(url) => {
            let store = PostgresEngineStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            info!("Using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store; state is lost on exit");
            Ok(Arc::new(InMemoryEngineStore::new()))
        }
    }
}

async fn load_directory(path: Option<&str>) -> Result<Arc<dyn IdentityDirectory>> {
    let Some(path) = path else {
        warn!("ORG_CHART_PATH not set, approver resolution starts with an empty org chart");
        return Ok(Arc::new(StaticDirectory::new()));
    };
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read org chart {path}"))?;
    let directory =
        StaticDirectory::from_json(&json).with_context(|| format!("Invalid org chart {path}"))?;
    info!(%path, "org chart loaded");
    Ok(Arc::new(directory))
}

fn handler_registry(log_action_types: &[String]) -> HandlerRegistry {
    let mut builder = HandlerRegistry::builder()
        .handler(REMINDER_ACTION, LogActionHandler)
        .handler(ERROR_ESCALATION_ACTION, LogActionHandler);
    for action_type in log_action_types {
        builder = builder.handler(action_type.clone(), LogActionHandler);
    }
    builder.build()
}
