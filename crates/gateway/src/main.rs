//! Meeting Gateway Binary
//!
//! Entry point for the meeting gateway service.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meet_gateway::{
    config::Config,
    router::Router,
    server::GatewayServer,
    session::SessionTable,
    signaling::SignalingClient,
    users::{ConfigUserRepository, UserService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting meeting gateway...");

    // Load configuration: explicit path via GATEWAY_CONFIG, otherwise
    // gateway.toml if present, otherwise built-in defaults.
    let config = match std::env::var("GATEWAY_CONFIG") {
        Ok(path) => Config::load(&path)?,
        Err(_) if std::path::Path::new("gateway.toml").exists() => Config::load("gateway.toml")?,
        Err(_) => {
            tracing::info!("no config file, using defaults");
            Config::default()
        }
    };

    tracing::info!(
        "Configuration: listen={}, gateway={}:{}, max_sessions={}",
        config.server_addr(),
        config.gateway.host,
        config.gateway.port,
        config.sessions.max_sessions
    );

    // Session table with its background sweep
    let sessions = Arc::new(SessionTable::new(config.sessions.max_sessions));
    sessions.clone().spawn_cleanup();

    // Signaling client; a gateway that is down at startup leaves the
    // client not ready and signaling requests fail fast until a restart.
    let signaling = Arc::new(SignalingClient::new(
        &config.gateway.host,
        config.gateway.port,
        &config.gateway.plugin,
    )?);
    if let Err(e) = signaling.clone().init().await {
        tracing::error!("signaling gateway unavailable: {}", e);
    }

    // Credential store seeded from config
    let users = UserService::new(Box::new(ConfigUserRepository::new(config.seed_users()?)));

    let router = Arc::new(Router::new(sessions.clone(), signaling.clone(), users));

    let server = Arc::new(GatewayServer::new());
    server
        .clone()
        .start(&config.server_addr(), router)
        .await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, initiating graceful shutdown...");

    server.stop().await;
    signaling.stop().await;
    sessions.stop().await;

    tracing::info!("Meeting gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
