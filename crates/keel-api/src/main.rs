//! Keel API server entry point.
//!
//! Serves HTTP and, on background tasks sharing one cancellation token,
//! runs the broker consumer and the publication reconciler.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use keel_api::config::AppConfig;
use keel_api::state::AppState;
use keel_api::{build_router, runtime, telemetry};
use keel_broker::nats::NatsBroker;
use keel_broker::transport::MessageSink;
use keel_broker::{BrokerPublisher, PublicationReconciler};
use keel_core::event::SystemClock;
use keel_core::publisher::EventPublisher;
use keel_event_store::{PgPublicationLedger, PgSessionFactory};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let telemetry = telemetry::init("keel-api")?;

    tracing::info!("Starting Keel API server");

    let config = AppConfig::from_env()?;
    let pool = runtime::connect_database(&config.database_url, config.database_max_connections).await?;
    let broker = NatsBroker::connect(config.broker.clone()).await?;

    let sink: Arc<dyn MessageSink> = Arc::new(broker.clone());
    let publisher: Arc<dyn EventPublisher> =
        Arc::new(BrokerPublisher::new(sink, config.broker.flush_timeout()));
    let ledger = Arc::new(PgPublicationLedger::new(pool.clone()));

    let app_state = AppState::new(
        Arc::new(PgSessionFactory::new(pool)),
        Arc::clone(&publisher),
        Arc::new(SystemClock),
    )
    .with_ledger(ledger.clone());

    let shutdown = CancellationToken::new();
    let signal_task = runtime::cancel_on_signal(shutdown.clone());

    let registry = Arc::new(runtime::build_registry()?);
    let consumer_task = runtime::spawn_consumer(&broker, registry, shutdown.clone()).await?;
    let reconciler_task = config.reconcile_interval.map(|interval| {
        let reconciler = PublicationReconciler::new(ledger, publisher, config.reconcile_grace);
        tokio::spawn(reconciler.run(interval, shutdown.clone()))
    });

    let app = build_router(app_state);

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .map_err(|e| format!("invalid HOST:PORT combination: {e}"))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let drain = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain.cancelled().await })
        .await;
    shutdown.cancel();

    let consumed = runtime::join_consumer(consumer_task).await;
    let reconciled = match reconciler_task {
        Some(task) => Some(task.await),
        None => None,
    };
    if let Some(Err(err)) = reconciled {
        tracing::error!(error = %err, "reconciler task panicked");
    }
    signal_task.abort();
    tracing::info!("Keel API server stopped");
    telemetry.shutdown();

    served?;
    consumed?;
    Ok(())
}
