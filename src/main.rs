//! Gateway entry point: configuration, tracing, HTTP server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use termgate::api::{self, AppState};
use termgate::auth::TokenValidator;
use termgate::clients::Collaborators;
use termgate::config::Config;
use termgate::session::SessionRegistry;
use termgate::ssh::KnownHostsStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("termgate=info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let known_hosts = match KnownHostsStore::open(config.known_hosts_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Cannot open known_hosts store: {}", e);
            std::process::exit(1);
        }
    };

    let validator = Arc::new(TokenValidator::new(&config));
    let collaborators = Arc::new(Collaborators::new(&config));
    let registry = Arc::new(SessionRegistry::new(
        config.clone(),
        known_hosts,
        collaborators.clone(),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        registry: registry.clone(),
        collaborators,
        validator,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!(
        "Terminal gateway listening on {} (max {} sessions)",
        addr, config.max_sessions
    );

    let app = api::router(state);
    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Give every live session a final status event before exiting
    registry.shutdown().await;

    if let Err(e) = serve_result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Clean shutdown");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Failed to install SIGINT handler");
        // Fall through: without a signal handler the future never
        // resolves and the server runs until killed externally
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
