//! Process wiring shared by the server and worker binaries.

use std::sync::Arc;

use keel_broker::nats::NatsBroker;
use keel_broker::{BrokerError, ConsumerStats, EventConsumer, HandlerRegistry};
use keel_iam::application::event_handlers;
use keel_iam::infrastructure::mailer::LoggingMailer;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AppError;

/// Opens the connection pool and applies pending migrations.
///
/// # Errors
///
/// Returns `AppError::Database` or `AppError::Migration`.
pub async fn connect_database(url: &str, max_connections: u32) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    Ok(pool)
}

/// Builds the registry of every broker-side handler.
///
/// # Errors
///
/// Returns `BrokerError::KindConflict` if two contexts claim one kind.
pub fn build_registry() -> Result<HandlerRegistry, BrokerError> {
    let mut registry = HandlerRegistry::new();
    event_handlers::register_handlers(&mut registry, Arc::new(LoggingMailer))?;
    Ok(registry)
}

/// Starts the consumer loop on its own task. If the loop stops with an
/// error, `shutdown` is cancelled so the whole process winds down.
///
/// # Errors
///
/// Returns the broker's error if the durable consumer cannot be set up.
pub async fn spawn_consumer(
    broker: &NatsBroker,
    registry: Arc<HandlerRegistry>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<Result<ConsumerStats, BrokerError>>, AppError> {
    let source = broker.source().await?;
    let consumer = EventConsumer::new(source, registry, broker.config().poll_timeout());
    let stop = shutdown.clone();
    Ok(tokio::spawn(async move {
        let outcome = consumer.run(shutdown).await;
        if outcome.is_err() {
            stop.cancel();
        }
        outcome
    }))
}

/// Waits for the consumer task and logs how it ended.
///
/// # Errors
///
/// Returns the loop's error, or `AppError::Task` if the task panicked.
pub async fn join_consumer(
    task: JoinHandle<Result<ConsumerStats, BrokerError>>,
) -> Result<ConsumerStats, AppError> {
    match task.await {
        Ok(Ok(stats)) => {
            info!(?stats, "consumer stopped");
            Ok(stats)
        }
        Ok(Err(err)) => {
            error!(error = %err, "consumer stopped with an error");
            Err(err.into())
        }
        Err(err) => {
            error!(error = %err, "consumer task panicked");
            Err(err.into())
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

/// Cancels `token` once a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => token.cancel(),
            () = token.cancelled() => {},
        }
    })
}
