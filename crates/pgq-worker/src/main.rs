// Standalone queue worker
// Decision: Handler only logs payloads; real deployments embed the library with their own handler
// Decision: Configuration comes from PGQ_* variables, connection from DATABASE_URL

use anyhow::{Context, Result};
use pgq_worker::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgq_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let worker_id = match std::env::var("PGQ_WORKER_ID") {
        Ok(raw) => raw.parse::<Uuid>().context("PGQ_WORKER_ID must be a UUID")?,
        Err(_) => Uuid::now_v7(),
    };

    tracing::info!(%worker_id, queue = %config.queue_name, "pgq-worker starting...");

    let handler = handler_fn(|payload, ctx| async move {
        tracing::info!(msg_id = ctx.msg_id, attempt = ctx.attempt, %payload, "received message");
        Ok(())
    });

    let pool = pgq_worker::pg::connect(&database_url, &config).await?;
    PostgresWorkerRegistry::new(pool.clone())
        .migrate()
        .await
        .context("failed to apply worker registry migration")?;

    let worker = Worker::from_pool(pool, config, handler)?;
    worker.start(worker_id).await?;

    tracing::info!("Worker ready, waiting for shutdown signal...");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown signal received, draining");
        }
        exit = worker.closed() => match exit {
            Ok(exit) => tracing::warn!(?exit, "Polling ended, shutting down"),
            Err(e) => tracing::error!(error = %e, "Polling failed, shutting down"),
        },
    }

    // A fatal store error is returned here and exits non-zero
    worker.stop().await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
