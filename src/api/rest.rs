// =============================================================================
// REST API Endpoints -- Axum 0.7
// =============================================================================
//
// Read-only presentation layer. All endpoints live under `/api/v1/` and
// return JSON. Nothing here mutates engine state except that requesting a
// signal may trigger a (coalesced, cached) synthesis.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::SynthesisEngine;
use crate::types::normalize_symbol;

type EngineState = State<Arc<SynthesisEngine>>;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(engine: Arc<SynthesisEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/warnings", get(warnings))
        .route("/api/v1/symbols", get(symbols))
        .route("/api/v1/risk", get(market_risk))
        // ── Per-symbol ──────────────────────────────────────────────
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/signals/:symbol", get(signal))
        .route("/api/v1/signals/:symbol/history", get(signal_history))
        .route("/api/v1/forecasts/:symbol", get(forecast))
        .route("/api/v1/indicators/:symbol", get(indicators))
        .route("/api/v1/sentiment/:symbol", get(sentiment))
        .route("/api/v1/narrative/:symbol", get(narrative))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(engine)
}

fn not_found(what: &str, symbol: &str) -> Response {
    let body = serde_json::json!({
        "error": "not_found",
        "message": format!("no {what} available for {symbol}"),
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn json_or_404<T: Serialize>(value: Option<T>, what: &str, symbol: &str) -> Response {
    match value {
        Some(v) => Json(v).into_response(),
        None => not_found(what, symbol),
    }
}

// =============================================================================
// Health & stats
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    watermark: i64,
    server_time: i64,
}

async fn health(State(engine): EngineState) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: engine.current_state_version(),
        watermark: engine.watermark(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn stats(State(engine): EngineState) -> impl IntoResponse {
    Json(engine.stats())
}

async fn warnings(State(engine): EngineState) -> impl IntoResponse {
    Json(engine.recent_warnings())
}

async fn symbols(State(engine): EngineState) -> impl IntoResponse {
    Json(engine.symbols())
}

async fn market_risk(State(engine): EngineState) -> impl IntoResponse {
    Json(engine.market_risk())
}

// =============================================================================
// Signals
// =============================================================================

/// Latest signal per symbol, highest confidence first, with risk level and
/// volume ratio.
async fn signals(State(engine): EngineState) -> impl IntoResponse {
    Json(engine.ranked_signals())
}

/// Current signal for one symbol, computed on demand if nothing is cached.
async fn signal(State(engine): EngineState, Path(symbol): Path<String>) -> Response {
    let symbol = normalize_symbol(&symbol);
    if !engine.symbols().contains(&symbol) {
        return not_found("signal", &symbol);
    }
    let signal = engine.signal(&symbol).await;
    Json((*signal).clone()).into_response()
}

async fn signal_history(State(engine): EngineState, Path(symbol): Path<String>) -> impl IntoResponse {
    let symbol = normalize_symbol(&symbol);
    let history: Vec<_> = engine
        .recent_signals(&symbol)
        .into_iter()
        .map(|s| (*s).clone())
        .collect();
    Json(history)
}

// =============================================================================
// Component outputs
// =============================================================================

async fn forecast(State(engine): EngineState, Path(symbol): Path<String>) -> Response {
    let symbol = normalize_symbol(&symbol);
    json_or_404(engine.latest_forecast(&symbol), "forecast", &symbol)
}

async fn indicators(State(engine): EngineState, Path(symbol): Path<String>) -> Response {
    let symbol = normalize_symbol(&symbol);
    json_or_404(engine.latest_indicators(&symbol), "indicator snapshot", &symbol)
}

async fn sentiment(State(engine): EngineState, Path(symbol): Path<String>) -> Response {
    let symbol = normalize_symbol(&symbol);
    json_or_404(engine.sentiment_now(&symbol), "sentiment", &symbol)
}

async fn narrative(State(engine): EngineState, Path(symbol): Path<String>) -> Response {
    let symbol = normalize_symbol(&symbol);
    json_or_404(engine.narrative(&symbol), "narrative brief", &symbol)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::runtime_config::EngineConfig;

    const T0: i64 = 1_700_000_000_000;

    fn engine() -> Arc<SynthesisEngine> {
        let mut cfg = EngineConfig::default();
        cfg.normalizer.out_of_order_tolerance_ms = 0;
        let engine = SynthesisEngine::new(cfg).unwrap();
        for i in 0..40 {
            engine
                .ingest_line(&format!(
                    r#"{{"kind":"tick","symbol":"AAPL","timestamp":{},"price":{}}}"#,
                    T0 + i * 60_000,
                    150.0 + i as f64 * 0.25
                ))
                .unwrap();
        }
        Arc::new(engine)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_watermark() {
        let (status, body) = get_json(router(engine()), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["watermark"], T0 + 39 * 60_000);
    }

    #[tokio::test]
    async fn signal_is_computed_on_demand() {
        let e = engine();
        let (status, body) = get_json(router(e.clone()), "/api/v1/signals/aapl").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "AAPL");
        assert_eq!(body["factors"].as_array().map(Vec::len), Some(3));
        assert_eq!(e.recent_signals("AAPL").len(), 1);

        let (_, listed) = get_json(router(e), "/api/v1/signals").await;
        assert_eq!(listed[0]["symbol"], "AAPL");
        // Constant +0.25 steps: tiny but non-zero realised volatility.
        assert_eq!(listed[0]["risk_level"], "LOW");
        assert_eq!(listed[0]["unusual_volume"], false);
    }

    #[tokio::test]
    async fn market_risk_is_served() {
        let (status, body) = get_json(router(engine()), "/api/v1/risk").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["risk_level"], "LOW");
        assert_eq!(body["high_volatility_count"], 0);
        assert!(body["market_count"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn unknown_symbol_is_404() {
        let app = router(engine());
        let (status, body) = get_json(app.clone(), "/api/v1/signals/NOPE").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = get_json(app, "/api/v1/forecasts/AAPL").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn indicator_snapshot_is_served() {
        let (status, body) = get_json(router(engine()), "/api/v1/indicators/AAPL").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sample_count"], 40);
        assert_eq!(body["values"]["sma_20"]["status"], "ready");
    }
}
