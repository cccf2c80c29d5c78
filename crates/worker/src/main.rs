use anyhow::Result;
use flowgate_core::telemetry::{init_tracing, TelemetryConfig};
use flowgate_worker::{FlowgateWorker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - SERVICE_NAME: Service name (default: "flowgate-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "flowgate=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "flowgate" {
        telemetry_config.service_name = "flowgate-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config = telemetry_config
            .with_filter("flowgate_worker=info,flowgate_engine=info,flowgate_durable=info");
    }
    init_tracing(telemetry_config);

    tracing::info!("flowgate-worker starting...");

    let worker = FlowgateWorker::new(WorkerConfig::from_env()).await?;
    worker.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = worker.shutdown().await {
        tracing::error!(error = %e, "Worker shutdown error");
        return Err(e);
    }
    tracing::info!("Worker shutdown complete");
    Ok(())
}
