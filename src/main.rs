//! Licita Radar — Binary Entrypoint
//! Boots the Axum HTTP server, wiring the search service, shared
//! coordination, and middleware.
//!
//! See `README.md` for quickstart.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use licita_radar::api::{create_router, AppState};
use licita_radar::config::AggregatorConfig;
use licita_radar::metrics::Metrics;

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR SHUTTLE_ENV in {local, development, dev})
///   - RADAR_DEV_LOG=1
fn enable_dev_tracing() {
    let dev_flag = std::env::var("RADAR_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("SHUTTLE_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("licita_radar=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    // This enables AGGREGATOR_CONFIG_PATH / TRANSPARENCIA_API_KEY /
    // COORDINATION_TOKEN from .env.
    let _ = dotenvy::dotenv();

    // Initialize dev tracing early (no-op in production).
    enable_dev_tracing();

    let cfg = AggregatorConfig::load_default().expect("Failed to load aggregator config");
    let metrics = Metrics::init(cfg.cache.shared_ttl_secs);

    let state = AppState::from_config(cfg).expect("Failed to wire search service");
    let router = create_router(state).merge(metrics.router());

    Ok(router.into())
}
