//! Keel broker worker: consumes committed events and runs their handlers.

use std::error::Error;
use std::sync::Arc;

use keel_api::{runtime, telemetry};
use keel_broker::BrokerConfig;
use keel_broker::nats::NatsBroker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let telemetry = telemetry::init("keel-worker")?;

    tracing::info!("Starting Keel worker");

    let config = BrokerConfig::from_env()?;
    let broker = NatsBroker::connect(config).await?;
    let registry = Arc::new(runtime::build_registry()?);
    tracing::info!(topics = ?registry.topics(), "handlers registered");

    let shutdown = CancellationToken::new();
    let signal_task = runtime::cancel_on_signal(shutdown.clone());
    let consumer_task = runtime::spawn_consumer(&broker, registry, shutdown.clone()).await?;

    let consumed = runtime::join_consumer(consumer_task).await;
    shutdown.cancel();
    signal_task.abort();
    tracing::info!("Keel worker stopped");
    telemetry.shutdown();
    consumed?;
    Ok(())
}
