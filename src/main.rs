use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oracle_feeder::chain::{ChainClient, ChainHeightTracker, KeyringSigner};
use oracle_feeder::config::{parse_duration, Config};
use oracle_feeder::handlers::{self, AppState};
use oracle_feeder::Oracle;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: oracle-feeder <config-file>")?;
    let cfg = Config::load(&config_path)?;
    info!("✓ configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    let signer = Arc::new(KeyringSigner::from_config(&cfg.keyring)?);

    let height = ChainHeightTracker::new(
        &cfg.rpc.tmrpc_endpoint,
        cfg.rpc_timeout_duration(),
        shutdown_rx.clone(),
    )
    .await?;
    info!("✓ chain height tracker initialized");

    let chain = Arc::new(ChainClient::new(
        cfg.account.chain_id.clone(),
        cfg.account.address.clone(),
        cfg.account.validator.clone(),
        &cfg.rpc.tmrpc_endpoint,
        &cfg.rpc.grpc_endpoint,
        cfg.rpc_timeout_duration(),
        cfg.gas_adjustment,
        &cfg.fees,
        signer,
        height,
        shutdown_rx.clone(),
    )?);

    let oracle = Arc::new(Oracle::new(
        chain,
        cfg.provider_pairs(),
        cfg.provider_timeout_duration(),
        cfg.deviation_map(),
        cfg.endpoints_map(),
        shutdown_rx.clone(),
    ));
    info!("✓ oracle initialized");

    let state = Arc::new(AppState {
        oracle: Arc::clone(&oracle),
    });
    let write_timeout =
        parse_duration(&cfg.server.write_timeout).expect("validated at config load");
    let app = Router::new()
        .route("/api/v1/prices", get(handlers::get_prices))
        .route("/api/v1/prices/providers", get(handlers::get_provider_prices))
        .route("/api/v1/healthz", get(handlers::healthz))
        .layer(CorsLayer::new().allow_origin(Any))
        .layer(TimeoutLayer::new(write_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.listen_addr))?;
    info!("🚀 status API listening on {}", cfg.server.listen_addr);

    let oracle_task = tokio::spawn({
        let oracle = Arc::clone(&oracle);
        async move { oracle.run().await }
    });

    let mut server_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
        info!("shutting down status API");
    });

    let result = server.await;

    // Whether we got here via signal or server failure, stop everything
    // and give in-flight work a bounded grace period.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, oracle_task).await;

    result.context("status API server failed")?;
    info!("shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received interrupt; shutting down..."),
                _ = sigterm.recv() => info!("received SIGTERM; shutting down..."),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt; shutting down...");
        }
        let _ = shutdown_tx.send(true);
    });
}
