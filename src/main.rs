// =============================================================================
// Aurora Fusion — Main Entry Point
// =============================================================================
//
// Loads the fusion configuration (defaults only when the file is absent),
// builds the engine (fatal on an unreadable or invalid configuration and on
// mismatched weights), starts the idle-session sweep and serves the REST API
// until Ctrl+C.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aurora_fusion::api;
use aurora_fusion::app_state::AppState;
use aurora_fusion::engine::FusionEngine;
use aurora_fusion::runtime_config::RuntimeConfig;

/// Seconds between idle-session sweeps.
const EVICTION_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Aurora Fusion engine starting up");

    let config_path =
        std::env::var("AURORA_FUSION_CONFIG").unwrap_or_else(|_| "fusion_config.json".into());
    let config = RuntimeConfig::load_or_default(&config_path)
        .with_context(|| format!("invalid fusion configuration file {config_path}"))?;

    info!(
        windows = ?config.tracks.iter().map(|t| (t.track.as_str(), t.window_len)).collect::<Vec<_>>(),
        feature_dim = config.feature_dim,
        staleness_threshold_secs = config.staleness_threshold_secs,
        "Configured tracks"
    );

    // ── 2. Engine & shared state ─────────────────────────────────────────
    let engine = FusionEngine::new(config).context("invalid fusion configuration")?;

    let api_token = std::env::var("AURORA_FUSION_TOKEN").ok();
    if api_token.as_deref().map_or(true, str::is_empty) {
        warn!("AURORA_FUSION_TOKEN is not set; authenticated endpoints will reject every request");
    }
    let state = Arc::new(AppState::new(engine, api_token));

    // ── 3. Idle-session sweep ────────────────────────────────────────────
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(EVICTION_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let evicted = sweep_state.engine.evict_idle(chrono::Utc::now());
            if evicted > 0 {
                sweep_state.increment_version();
            }
        }
    });

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("AURORA_FUSION_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, api::rest::router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Shutdown signal received, stopping gracefully");
            }
        })
        .await
        .context("API server failed")?;

    info!("Aurora Fusion shut down complete.");
    Ok(())
}
