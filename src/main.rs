mod admin;
mod auth;
mod circuit_breaker;
mod config;
mod context;
mod error;
mod gateway;
mod health;
mod metrics;
mod middleware;
mod ratelimit;
mod router;
mod upstream;

use std::{
    future::IntoFuture,
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    routing::any,
};
use gateway::Gateway;
use tokio::{
    net::TcpListener,
    signal,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{GatewayConfig, LoggingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(&cfg.logging);

    let bind_addr = cfg.bind_addr;
    let drain = cfg.shutdown_drain;
    let backends = cfg.backends.len();

    let gateway = Arc::new(Gateway::from_config(cfg).context("failed to initialise gateway")?);

    let background = CancellationToken::new();
    let tasks = gateway.spawn_background(background.clone());

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, backends, "storefront gateway listening");

    let draining = CancellationToken::new();
    let server = axum::serve(
        listener,
        app(gateway).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(draining.clone()))
    .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.context("gateway server error")?,
        _ = draining.cancelled() => {
            match tokio::time::timeout(drain, &mut server).await {
                Ok(result) => result.context("gateway server error")?,
                Err(_) => tracing::warn!(
                    drain_seconds = drain.as_secs(),
                    "drain timeout reached, abandoning in-flight requests"
                ),
            }
        }
    }

    background.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task ended abnormally");
        }
    }

    tracing::info!("gateway shutdown complete");
    Ok(())
}

fn app(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(any(proxy_handler)).with_state(gateway)
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

/// Resolves on Ctrl-C or SIGTERM and marks the start of the drain window.
async fn shutdown_signal(draining: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "shutdown requested, draining"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "shutdown requested, draining"),
    }
    draining.cancel();
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,reqwest=warn", cfg.level)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if cfg.json {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }
}
