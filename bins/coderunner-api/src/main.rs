mod handlers;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use coderunner_common::config::AppConfig;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub result_ttl_secs: u64,
}

fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/grade", post(handlers::submit_grading))
        .route("/grade/:job_id", get(handlers::get_grading_result))
        .route("/health", get(handlers::health_check))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("CodeRunner API booting...");

    let config = AppConfig::from_env().context("Invalid API configuration")?;

    // Connect to Redis
    let client = redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    info!("Connected to Redis: {}", config.redis_url);

    let state = Arc::new(AppState {
        redis: redis_conn,
        result_ttl_secs: config.result_ttl_secs,
    });

    // Build router
    let app = routes().with_state(state);

    // Start server
    let listener = TcpListener::bind(config.api_bind_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_bind_addr))?;

    info!("HTTP server listening on {}", config.api_bind_addr);
    info!("Ready to accept grading jobs");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
