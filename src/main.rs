use mtbridge::application::actors::snapshot_poller::SnapshotPoller;
use mtbridge::application::actors::watchdog_actor::WatchdogActor;
use mtbridge::application::handlers::bridge_handler::router;
use mtbridge::application::services::bridge_service::BridgeService;
use mtbridge::application::services::recovery_orchestrator::RecoveryOrchestrator;
use mtbridge::config::BridgeConfig;
use mtbridge::domain::entities::snapshot::staleness_window;
use mtbridge::domain::repositories::terminal::TerminalController;
use mtbridge::domain::services::account_registry::AccountRegistry;
use mtbridge::infrastructure::snapshot_reader::SnapshotReader;
use mtbridge::infrastructure::snapshot_store::SnapshotStore;
use mtbridge::infrastructure::terminal_process::{ProcessTerminalController, TerminalProcessConfig};
use mtbridge::persistence::recovery_audit::SqliteRecoveryAuditRepository;
use mtbridge::persistence::{init_database, DatabaseConfig};
use mtbridge::rate_limit::{create_rate_limiter, RateLimiterConfig};
use mtbridge::secrets::EnvCredentialSource;
use mtbridge::task_runner::CircuitBreakerConfig;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Request bodies are tiny; the only POST takes none
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mtbridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::from_env();
    info!("MT bridge starting on {}", config.bind_addr);

    let registry = Arc::new(AccountRegistry::load(&config.registry_path)?);
    info!(
        "Monitoring {} account(s) across brokers: {}",
        registry.enabled().count(),
        registry.brokers().join(", ")
    );
    if config.terminal_executables.is_empty() {
        warn!("TERMINAL_EXECUTABLES is not set, recovery jobs will fail at the start step");
    }

    let store = Arc::new(SnapshotStore::new());
    let reader = Arc::new(SnapshotReader::new(
        config.snapshot_dir.clone(),
        config.snapshot_file_pattern.clone(),
        registry.clone(),
        store.clone(),
    ));
    let terminal: Arc<dyn TerminalController> = Arc::new(ProcessTerminalController::new(
        TerminalProcessConfig::from(&config),
    ));

    let mut orchestrator = RecoveryOrchestrator::new(
        registry.clone(),
        store.clone(),
        terminal.clone(),
        reader.clone(),
        Arc::new(EnvCredentialSource),
        config.recovery_plan(),
    )
    .with_history_limit(config.job_history_limit);

    if let Some(url) = &config.audit_database_url {
        match init_database(&DatabaseConfig::with_url(url.clone())).await {
            Ok(pool) => {
                orchestrator =
                    orchestrator.with_audit(Arc::new(SqliteRecoveryAuditRepository::new(pool)));
            }
            Err(e) => warn!("Audit database unavailable, continuing without it: {}", e),
        }
    }
    let orchestrator = Arc::new(orchestrator);
    if let Err(e) = orchestrator.restore_history().await {
        warn!("Could not restore recovery history: {}", e);
    }

    let stale_after = staleness_window(config.staleness_threshold());
    let poller = Arc::new(SnapshotPoller::new(reader.clone(), config.poll_interval));
    let mut service = BridgeService::new(
        registry.clone(),
        store.clone(),
        terminal,
        orchestrator.clone(),
        stale_after,
    )
    .with_reader(reader)
    .with_poller(poller.clone());

    // The poller backs off and keeps going; only a panic ends it
    let poller_task = poller.spawn(CircuitBreakerConfig::default());
    let mut watchdog_task = None;
    if config.watchdog_enabled {
        let watchdog = Arc::new(WatchdogActor::new(
            registry,
            store,
            orchestrator,
            config.debounce_cycles,
            stale_after,
            config.watchdog_interval,
        ));
        service = service.with_watchdog(watchdog.clone());
        watchdog_task = Some(watchdog.spawn(CircuitBreakerConfig::default()));
    } else {
        warn!("Watchdog disabled, recovery only runs on external trigger");
    }

    let limiter = create_rate_limiter(RateLimiterConfig {
        requests_per_minute: config.restart_requests_per_minute,
    });
    let app = router(Arc::new(service), limiter)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);

    // A watchdog that gives up, or any background panic, takes the process down
    let (failed_tx, mut failed_rx) = oneshot::channel::<String>();
    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
            result = poller_task => {
                let reason = match result {
                    Ok(()) => "snapshot poller exited".to_string(),
                    Err(e) => format!("snapshot poller panicked: {}", e),
                };
                error!("{}", reason);
                let _ = failed_tx.send(reason);
            }
            result = async move {
                match watchdog_task {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => {
                let reason = match result {
                    Ok(aborted) => aborted.to_string(),
                    Err(e) => format!("watchdog panicked: {}", e),
                };
                error!("{}", reason);
                let _ = failed_tx.send(reason);
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    if let Ok(reason) = failed_rx.try_recv() {
        return Err(reason.into());
    }
    info!("Shutdown complete");
    Ok(())
}
