//! Keygate binary entry point

use std::net::SocketAddr;
use std::time::Duration;

use keygate::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging from the `logging` section
/// 3. Register metrics
/// 4. Initialize AppState
/// 5. Start background pruning
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    init_tracing(&config.logging);
    tracing::info!("Starting Keygate...");
    config.log_summary();

    // 3. Initialize metrics
    keygate::metrics::init_metrics();

    // 4. Initialize application state
    let state = AppState::new(config.clone())?;

    // 5. Start background tasks
    spawn_prune_task(state.clone());

    // 6. Start HTTP server
    let app = keygate::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter_directive().into());

    if logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

/// Spawn background task pruning the actor cache and idle breakers
fn spawn_prune_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        // The first tick completes immediately; nothing to prune yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            state.actor_store.prune_expired().await;
            state.breaker.prune_old().await;
        }
    });

    tracing::info!("Prune task spawned");
}
