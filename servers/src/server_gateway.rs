//! # Realtime Gateway Server
//!
//! Serves the site's WebSocket channels:
//!
//! - `/ws/public`: visitors. Presence events, sub-topic membership and
//!   public broadcasts.
//! - `/ws/admin`: token-gated dashboard connections. Admin broadcasts and
//!   live log tails.
//!
//! Several instances can run behind a load balancer; broadcasts reach every
//! instance's clients through Redis pub/sub.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use lib_gateway::configs::load_config;
use lib_gateway::loggers::{LogBroadcaster, setup_logging};
use lib_gateway::{Hub, HubDeps};

mod gateway_logic;
use gateway_logic::{backends, downstream};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("loading configuration")?;

    let broadcaster = LogBroadcaster::new();
    let _guard = setup_logging(
        &config.log_dir(),
        config.log_prefix(),
        config.log_level(),
        broadcaster.clone(),
    )
    .context("initializing logging")?;

    let shutdown = CancellationToken::new();
    let backends = backends::connect(&config).await;
    let hub = Hub::start(
        config.hub_config(),
        HubDeps {
            bus: backends.bus,
            stats: backends.stats,
            validator: config.token_validator(),
            logs: broadcaster,
        },
        shutdown.clone(),
    );

    let state = Arc::new(downstream::GatewayState {
        hub,
        outbound_buffer: config.outbound_buffer(),
        shutdown: shutdown.clone(),
    });
    let app = downstream::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Gateway listening on {}", addr);

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing connections.");
            signal_token.cancel();
        })
        .await
        .context("serving http")?;

    shutdown.cancel();
    info!("Shutdown complete.");
    Ok(())
}

/// Resolves on `CTRL+C` or, on unix, `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
