// =============================================================================
// Aurora Synth -- Main Entry Point
// =============================================================================
//
// Reads price and news feeds (file or stdin), keeps every component warm,
// synthesises signals on a cadence and serves them over HTTP. State is
// persisted on shutdown and restored on the next start.
// =============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use aurora_synth::api;
use aurora_synth::engine::SynthesisEngine;
use aurora_synth::market_data::{feed, FeedSource};
use aurora_synth::persistence::EngineSnapshot;
use aurora_synth::runtime_config::EngineConfig;

const CONFIG_PATH: &str = "engine_config.json";

/// Bounded so a fast file replay applies backpressure to the readers.
const INGEST_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Synth -- Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    info!(symbols = ?config.symbols, "Configured symbols");

    // ── 2. Build the engine (validates config) ───────────────────────────
    let engine = Arc::new(SynthesisEngine::new(config.clone()).context("invalid engine configuration")?);

    // ── 3. Restore persisted state ───────────────────────────────────────
    if config.persistence.enabled && Path::new(&config.persistence.path).exists() {
        match EngineSnapshot::load(&config.persistence.path) {
            Ok(snapshot) => {
                snapshot.restore_into(&engine);
            }
            Err(e) => warn!(error = %e, "Persisted state unusable -- starting empty"),
        }
    }

    // ── 4. Feed readers & ingest worker ──────────────────────────────────
    let (tx, rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);

    let feeds = [
        ("market", config.server.market_feed.clone()),
        ("news", config.server.news_feed.clone()),
    ];
    for (name, spec) in feeds {
        let Some(spec) = spec else { continue };
        let source = FeedSource::parse(&spec);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = feed::run_feed(name, source, tx).await {
                error!(feed = %name, error = %e, "Feed reader failed");
            }
        });
    }
    drop(tx);

    tokio::spawn(engine.clone().run_ingest(rx));

    // ── 5. Synthesis cadence ─────────────────────────────────────────────
    let synth_engine = engine.clone();
    tokio::spawn(async move {
        let period = Duration::from_millis(synth_engine.config().scheduler.synthesis_interval_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            for symbol in synth_engine.symbols() {
                synth_engine.signal(&symbol).await;
            }
            let purged = synth_engine.scheduler().cache().purge_expired();
            if purged > 0 {
                debug!(purged, "expired cache entries dropped");
            }
        }
    });

    // ── 6. Forecast cadence ──────────────────────────────────────────────
    let forecast_engine = engine.clone();
    tokio::spawn(async move {
        let period = Duration::from_millis(forecast_engine.config().forecast.cadence_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let worker = forecast_engine.clone();
            let refreshed = tokio::task::spawn_blocking(move || {
                worker
                    .symbols()
                    .iter()
                    .filter(|s| worker.refresh_forecast(s).is_ok())
                    .count()
            })
            .await;
            match refreshed {
                Ok(n) => debug!(refreshed = n, "forecast cadence"),
                Err(e) => warn!(error = %e, "forecast worker failed"),
            }
        }
    });

    // ── 7. Retrain cadence ───────────────────────────────────────────────
    let retrain_engine = engine.clone();
    tokio::spawn(async move {
        let period = Duration::from_millis(retrain_engine.config().forecast.retrain_cadence_ms);
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let worker = retrain_engine.clone();
            let retrained = tokio::task::spawn_blocking(move || {
                worker
                    .symbols()
                    .iter()
                    .filter(|s| worker.retrain(s).is_ok())
                    .count()
            })
            .await;
            match retrained {
                Ok(n) => info!(retrained = n, "retrain cadence"),
                Err(e) => warn!(error = %e, "retrain worker failed"),
            }
        }
    });

    // ── 8. API server ────────────────────────────────────────────────────
    let bind_addr = config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::router(engine.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received -- stopping gracefully");

    let flushed = engine.flush_all();
    info!(flushed, "held events flushed");

    if config.persistence.enabled {
        if let Err(e) = EngineSnapshot::capture(&engine).save(&config.persistence.path) {
            error!(error = %e, "Failed to persist engine state on shutdown");
        }
    }

    info!("Aurora Synth shut down complete.");
    Ok(())
}
