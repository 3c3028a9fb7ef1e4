use dotenv::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use uzpay_backend::api::{self, AppState};
use uzpay_backend::commerce::{CommerceBackend, InMemoryCommerceBackend};
use uzpay_backend::config::AppConfig;
use uzpay_backend::health::HealthChecker;
use uzpay_backend::logging::init_tracing;
use uzpay_backend::otp::{LogOnlySender, MemoryOtpStore, OtpService, OtpStore};
use uzpay_backend::payments::providers::{ClickOfdClient, FiscalSubmitter};
use uzpay_backend::payments::{ClickHandler, OrderCompleter, PaymeHandler, SessionLocks};
use uzpay_backend::workers::order_reconciliation::OrderReconciliationWorker;

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

type Externals = (Arc<dyn OtpStore>, Arc<dyn CommerceBackend>);

#[cfg(all(feature = "database", feature = "cache"))]
async fn connect_externals(config: &AppConfig) -> anyhow::Result<Externals> {
    use uzpay_backend::cache::{self, init_cache_pool};
    use uzpay_backend::commerce::MedusaCommerceBackend;
    use uzpay_backend::database::init_pool_from_config;
    use uzpay_backend::database::payment_session_repository::PaymentSessionRepository;
    use uzpay_backend::otp::RedisOtpStore;

    info!("Initializing database connection pool");
    let db_pool = init_pool_from_config(&config.database).await?;
    info!(
        max_connections = db_pool.options().get_max_connections(),
        "Database connection pool initialized"
    );

    info!("Initializing Redis connection pool");
    let redis_pool = init_cache_pool(cache::CacheConfig {
        redis_url: config.cache.redis_url.clone(),
        max_connections: config.cache.max_connections,
        ..cache::CacheConfig::default()
    })
    .await?;

    let backend = MedusaCommerceBackend::new(
        PaymentSessionRepository::new(db_pool),
        config.commerce.clone(),
    )?;
    Ok((Arc::new(RedisOtpStore::new(redis_pool)), Arc::new(backend)))
}

#[cfg(not(all(feature = "database", feature = "cache")))]
async fn connect_externals(_config: &AppConfig) -> anyhow::Result<Externals> {
    anyhow::bail!("built without the database and cache features; set SKIP_EXTERNALS=true")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        skip_externals = config.skip_externals,
        "Starting uzpay backend service"
    );

    let (otp_store, backend): Externals = if config.skip_externals {
        info!("Using in-memory OTP store and commerce backend (SKIP_EXTERNALS=true)");
        (
            Arc::new(MemoryOtpStore::new()),
            Arc::new(InMemoryCommerceBackend::new()),
        )
    } else {
        connect_externals(&config).await?
    };

    let otp = Arc::new(OtpService::new(
        otp_store,
        Arc::new(LogOnlySender),
        config.otp.clone(),
    ));

    let locks = SessionLocks::new();
    let mut completer = OrderCompleter::new(backend.clone(), config.commerce.timeout)
        .with_max_attempts(config.reconciliation.max_attempts);
    if config.click.ofd_enabled() {
        let submitter: Arc<dyn FiscalSubmitter> = Arc::new(ClickOfdClient::new(config.click.clone())?);
        completer = completer.with_fiscal_submitter(submitter, config.fiscal.clone());
        info!("Click OFD submission enabled");
    }

    let payme = PaymeHandler::new(
        config.payme.clone(),
        backend.clone(),
        locks.clone(),
        completer.clone(),
        config.fiscal.clone(),
    );

    let click = ClickHandler::new(
        config.click.clone(),
        backend.clone(),
        locks.clone(),
        completer.clone(),
    );

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let reconciliation = OrderReconciliationWorker::new(
        completer,
        locks,
        config.reconciliation.clone(),
    );
    let reconcile_handle = tokio::spawn(reconciliation.run(worker_shutdown_rx));

    let state = AppState {
        health_checker: HealthChecker::new(otp.clone(), backend.clone()),
        otp,
        payme: Arc::new(payme),
        click: Arc::new(click),
        backend,
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), reconcile_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for reconciliation worker shutdown");
    }

    info!("Server shutdown complete");
    Ok(())
}
