use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notely_api::services::{CachedSpaceReader, RedisCache};
use notely_api::{router, AppConfig, AppState, Producer};
use notely_core::Broker;
use notely_db::{log_pool_metrics, Database, PgBroker, PoolConfig};
use notely_search::ElasticIndex;
use notely_worker::WorkerBuilder;

/// How often acknowledged broker messages are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "notely_api=debug,notely_worker=debug,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("notely-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    let config = AppConfig::from_env();
    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        version = %config.build.version,
        "Logging initialized"
    );

    // Relational store and broker
    info!("Connecting to database...");
    let db = Database::connect_with_config(&config.database_url, PoolConfig::from_env()).await?;
    info!("Database connected");

    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");
    log_pool_metrics(&db.pool);

    // Search index
    let index = Arc::new(ElasticIndex::new(config.search.clone())?);
    if let Err(e) = index.ensure_index().await {
        warn!(error = %e, "Search index not ready, writes will be retried by the worker");
    }

    // Read path
    let cache = RedisCache::connect(&config.cache).await;
    let spaces = CachedSpaceReader::new(
        Arc::new(db.spaces.clone()),
        Arc::new(cache),
        config.cache.ttl,
    );

    let broker: Arc<dyn Broker> = Arc::new(db.broker.clone());
    let producer = Producer::new(
        broker.clone(),
        Arc::new(db.notes.clone()),
        Arc::new(spaces.clone()),
        config.producer.clone(),
    );

    // Worker
    let worker = WorkerBuilder::new(broker, Arc::new(db.writer.clone()), index.clone())
        .with_config(config.worker.clone())
        .build()
        .start();

    // Broker retention
    let (stop_tx, stop_rx) = watch::channel(false);
    let purge = tokio::spawn(purge_acked_loop(
        db.broker.clone(),
        config.broker_retention,
        stop_rx,
    ));

    let state = AppState {
        producer,
        notes: Arc::new(db.notes.clone()),
        spaces,
        search: index,
        build: config.build.clone(),
    };
    let app = router(state, &config.allowed_origins);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining worker");
    if let Err(e) = worker.shutdown().await {
        warn!(error = %e, "Worker already stopped");
    }
    worker.join().await;
    let _ = stop_tx.send(true);
    if let Err(e) = purge.await {
        error!(error = ?e, "Purge task panicked");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn purge_acked_loop(broker: PgBroker, retention: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match broker.purge_acked(retention).await {
                    Ok(0) => {}
                    Ok(n) => info!(subsystem = "broker", purged = n, "Purged acknowledged messages"),
                    Err(e) => warn!(subsystem = "broker", error = %e, "Purge failed"),
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
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
    info!("Shutdown signal received");
}
