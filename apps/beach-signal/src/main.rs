mod auth;
mod cli;
mod config;
mod envelope;
mod handlers;
mod registry;
mod relay;
#[cfg(test)]
mod test_support;
mod websocket;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    auth::Admission,
    cli::{Cli, Commands},
    config::Config,
    handlers::build_router,
    relay::Relay,
    websocket::AppState,
};
use clap::Parser;

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Debug {
            url,
            identity,
            token,
            token_via,
            command,
        }) => {
            if let Err(e) = cli::run_debug_client(url, identity, token, token_via, command).await {
                error!("Debug client error: {}", e);
                std::process::exit(1);
            }
            return;
        }
        Some(Commands::Users { url }) => {
            if let Err(e) = cli::list_users(url).await {
                error!("Failed to list users: {}", e);
                std::process::exit(1);
            }
            return;
        }
        None => {}
    }

    // Otherwise, run as server
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(mode) = cli.auth_mode {
        config.auth_mode = mode;
    }
    info!("Starting Beach Signal relay on port {}", config.port);

    let admission = match Admission::from_config(&config) {
        Ok(admission) => admission,
        Err(e) => {
            error!("Invalid admission configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Admission mode: {}", admission.mode());
    if let Some(url) = &config.jwks_url {
        info!("Key set URL: {}", url);
    }

    // One registry for the whole process, shared by sockets and debug routes
    let state = AppState::new(Relay::new(), admission);
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Beach Signal listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
