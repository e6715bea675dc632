//! Marketpost daemon - Main Entry Point
//! Worker loop + maintenance loop over the shared SQLite store

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use marketpost_core::application::{
    LeaseManager, MaintenanceScheduler, PostingDispatcher, RateLimiter, RecoveryService,
    ResilientClient, Worker,
};
use marketpost_core::application::worker::shutdown_channel;
use marketpost_core::port::id_provider::UuidProvider;
use marketpost_core::port::time_provider::SystemTimeProvider;
use marketpost_core::port::{HttpTransport, TokioSleeper, VersionedStore};
use marketpost_daemon::logging::init_logging;
use marketpost_daemon::{ApiPublisher, Settings};
use marketpost_infra_http::ReqwestTransport;
use marketpost_infra_sqlite::{create_pool, run_migrations, SqliteMaintenance, SqliteRecordStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration, then logging
    let settings = Settings::load()?;
    let _log_guard = init_logging(&settings.logging)?;

    info!("Marketpost daemon v{} starting...", VERSION);

    // 2. Database
    let database_url = settings.database_url()?;
    info!(database_url = %database_url, "Initializing database...");
    let pool = create_pool(&database_url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 3. Dependencies (DI wiring)
    let time_provider = Arc::new(SystemTimeProvider);
    let id_provider = Arc::new(UuidProvider);
    let store: Arc<dyn VersionedStore> = Arc::new(SqliteRecordStore::new(pool.clone()));

    // 4. Crash recovery: subjects pointing at jobs that no longer exist
    match RecoveryService::new(store.clone(), time_provider.clone())
        .repair_dangling_subjects()
        .await
    {
        Ok(count) => info!(repaired_subjects = count, "Crash recovery completed"),
        Err(e) => error!(error = ?e, "Crash recovery failed"),
    }

    // 5. Marketplace client
    let environment = settings.api_environment()?;
    let transport: Arc<dyn HttpTransport> = Arc::new(match &settings.api.base_url {
        Some(base_url) => ReqwestTransport::with_base_url(base_url.clone())?,
        None => ReqwestTransport::new(environment)?,
    });
    let tokens = settings.token_manager(store.clone(), time_provider.clone())?;
    if let Some(refresh_token) = &settings.oauth.refresh_token {
        let seeded = tokens
            .seed_refresh_token(refresh_token)
            .await
            .context("Failed to seed refresh token")?;
        if !seeded {
            info!("Token record already present; configured refresh token ignored (use `marketpost auth set-refresh-token` to replace it)");
        }
    }
    let client = Arc::new(ResilientClient::new(
        transport,
        tokens,
        Arc::new(TokioSleeper),
        time_provider.clone(),
        settings.client_config(),
    ));

    // 6. Posting pipeline
    let rate_limiter = Arc::new(RateLimiter::new(
        store.clone(),
        time_provider.clone(),
        id_provider.clone(),
        settings.rate_limits(),
    ));
    let mut dispatcher = PostingDispatcher::new(rate_limiter)
        .with_duplicate_window_ms(settings.api.duplicate_window_ms);
    for (destination, target) in &settings.destinations {
        info!(destination = %destination, path = %target.path, "Registering publisher");
        dispatcher = dispatcher.with_publisher(
            destination.clone(),
            Arc::new(ApiPublisher::new(client.clone(), target.method, &target.path)),
        );
    }

    let leases = Arc::new(
        LeaseManager::new(store.clone(), time_provider.clone(), id_provider)
            .with_lease_duration(settings.worker.lease_duration_ms),
    );

    // 7. Worker
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let worker = Worker::new(&settings.worker.id, leases, Arc::new(dispatcher))
        .with_attempt_policy(settings.attempt_policy())
        .with_poll_interval(settings.poll_interval());

    info!(worker_id = %settings.worker.id, "Starting worker...");
    let worker_handle = tokio::spawn(async move {
        if let Err(e) = worker.run(shutdown_rx).await {
            error!(error = ?e, "Worker failed");
        }
    });

    // 8. Maintenance scheduler
    let maintenance_handle = if settings.maintenance.enabled {
        info!("Starting maintenance scheduler...");
        let maintenance = Arc::new(SqliteMaintenance::new(pool, time_provider));
        let scheduler = MaintenanceScheduler::new(
            maintenance,
            settings.maintenance_config(),
            settings.maintenance.interval_hours,
        );
        Some(tokio::spawn(scheduler.run(shutdown_tx.token())))
    } else {
        None
    };

    info!("System ready. Press Ctrl+C to shutdown");

    // 9. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 10. Graceful shutdown; an in-flight job keeps its lease and is reclaimed later
    shutdown_tx.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, worker_handle).await.is_err() {
        warn!("Worker did not stop within the grace period");
    }
    if let Some(handle) = maintenance_handle {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
    }

    info!("Shutdown complete.");
    Ok(())
}
