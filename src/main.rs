//! # PaperMinder Server
//!
//! Coordination server between human-facing web clients and networked
//! thermal printers: message delivery with offline caching, bitmap
//! dispatch, and phased firmware rollouts over long-lived WebSockets.

use anyhow::Result;
use axum::http::HeaderValue;
use clap::Parser;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paperminder_server::config::Settings;
use paperminder_server::handlers::api_router;
use paperminder_server::scheduler::Scheduler;
use paperminder_server::state::{AppState, SharedState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Database URL (overrides DATABASE_URL)
    #[arg(short, long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,paperminder_server=debug")),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    if let Some(url) = args.database_url {
        settings.database_url = url;
    }

    info!("Starting PaperMinder server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", settings.database_url);
    info!("Base URL: {}", settings.base_url);

    let state: SharedState = Arc::new(AppState::new(settings.clone()).await?);

    let cors = if settings.cors_allow_any() {
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = settings
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring unparsable CORS origin");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_origin(origins)
    };

    let app = api_router(state.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let scheduler = Scheduler::start(state.clone());

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight scheduler work finishes before exit
    scheduler.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
