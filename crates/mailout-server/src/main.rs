//! Mailout - Mass mail scheduler entry point

use anyhow::{Context, Result};
use mailout_api::AppState;
use mailout_common::config::{Config, LoggingConfig};
use mailout_common::Error;
use mailout_core::{
    acquire_leadership, notifier_from_config, AdvisoryLeaderLock, LeaderLock, LocalLeaderLock,
    SendScheduler, SmtpTransport, StoredMessageRenderer,
};
use mailout_storage::{DatabasePool, MailoutStore, MemoryStore, PgMailoutStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging);

    info!(hostname = %config.server.hostname, "Starting Mailout...");

    // Initialize the store and the matching leader lock
    let (store, lock): (Arc<dyn MailoutStore>, Box<dyn LeaderLock>) =
        match config.database.backend.as_str() {
            "memory" => {
                warn!("Using the in-memory store, nothing survives a restart");
                (
                    Arc::new(MemoryStore::new()),
                    Box::new(LocalLeaderLock::new(config.scheduler.lock_key)),
                )
            }
            "postgres" => {
                let db_pool = DatabasePool::new(&config.database).await?;
                db_pool.migrate().await?;
                let lock = AdvisoryLeaderLock::new(db_pool.pool().clone(), config.scheduler.lock_key);
                (Arc::new(PgMailoutStore::new(db_pool)), Box::new(lock))
            }
            other => {
                return Err(Error::Config(format!("Unknown database backend {}", other)).into());
            }
        };

    // Start API server; it serves unsubscribe links even while waiting for leadership
    let api_handle = {
        let app = mailout_api::create_router(AppState::new(
            store.clone(),
            config.unsubscribe.redirect_url.clone(),
        ));
        let addr = format!("{}:{}", config.server.bind_address, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server on {}", addr))?;
        info!(%addr, "Starting API server");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server error");
            }
        })
    };

    // Only one scheduler may run per deployment
    let retry = Duration::from_secs(config.scheduler.lease_retry_secs);
    tokio::select! {
        acquired = acquire_leadership(lock.as_ref(), retry) => acquired?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received before leadership");
            api_handle.abort();
            return Ok(());
        }
    }

    let renderer = Arc::new(StoredMessageRenderer::new(store.clone())?);
    let notifier = notifier_from_config(&config.notifications)?;
    let scheduler = SendScheduler::new(
        store,
        renderer,
        Arc::new(SmtpTransport::default()),
        notifier,
        config.scheduler.clone(),
        config.unsubscribe.base_url.clone(),
    )?;

    info!("Mailout started successfully");

    // Run until the shutdown signal
    tokio::select! {
        _ = scheduler.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    // Cleanup
    if let Err(e) = lock.release().await {
        warn!(error = %e, "Failed to release scheduler leadership");
    }
    api_handle.abort();

    info!("Mailout shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "text" {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    }
}
