//! HTTP surface end to end: boot, simulate, gate, promote, withdraw.

use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use phasegate_backend::{
    api::{create_router, AppState},
    config::EngineConfig,
    feed::ConfidenceModel,
    models::MetricsSnapshot,
    optimizer::MemoryOptimizerStore,
    orchestrator::{PaperSettlement, PhaseOrchestrator},
    provider::ScriptedProvider,
};

const ADDR: &str = "0x00000000000000000000000000000000000000aa";

struct StepModel(Arc<Mutex<f64>>);

impl ConfidenceModel for StepModel {
    fn next_efficiency(&self, _history: &[MetricsSnapshot]) -> f64 {
        *self.0.lock()
    }

    fn name(&self) -> &'static str {
        "step"
    }
}

struct TestApp {
    router: Router,
    provider: Arc<ScriptedProvider>,
    efficiency: Arc<Mutex<f64>>,
}

fn test_app(account_address: Option<&str>) -> TestApp {
    let mut cfg = EngineConfig::default();
    cfg.account_address = account_address.map(str::to_string);
    cfg.live_mode_enabled = true;
    cfg.sim_tick_ms = 10;
    cfg.boot_stage_delay_ms = 0;
    cfg.optimizer_fast_ms = 20;
    cfg.optimizer_slow_ms = 60_000;
    cfg.preflight_min_free_memory_mb = 0;

    let provider = Arc::new(ScriptedProvider::new(40.0, 3_000.0));
    let efficiency = Arc::new(Mutex::new(0.10));
    let orchestrator = PhaseOrchestrator::new(
        cfg,
        provider.clone(),
        Arc::new(MemoryOptimizerStore::new()),
        Arc::new(PaperSettlement::new()),
        Arc::new(StepModel(efficiency.clone())),
    );

    TestApp {
        router: create_router(AppState {
            orchestrator,
            rpc: None,
        }),
        provider,
        efficiency,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn poll<F>(app: &Router, uri: &str, pred: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = call(app, "GET", uri, None).await;
            if status == StatusCode::OK && pred(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out polling {}", uri))
}

#[tokio::test]
async fn test_full_lifecycle_over_http() {
    let app = test_app(Some(ADDR));
    app.provider.set_balance(1.5);

    let (status, body) = call(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    // Metrics are absent until the feed has ticked
    let (status, _) = call(&app.router, "GET", "/api/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app.router, "POST", "/api/session/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["state"], "idle");

    // A second start is refused
    let (status, body) = call(&app.router, "POST", "/api/session/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    poll(&app.router, "/api/session", |v| v["state"] == "ready").await;

    let (status, body) = call(&app.router, "POST", "/api/simulation/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "simulating");

    poll(&app.router, "/api/metrics", |v| v["seq"].as_u64().unwrap_or(0) >= 1).await;

    let (status, body) = call(&app.router, "POST", "/api/live/confirm", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "rejected");
    assert_eq!(body["threshold"], 85.0);

    // Withdrawals need a live session
    let (status, _) = call(
        &app.router,
        "POST",
        "/api/live/withdraw",
        Some(json!({ "amount": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    *app.efficiency.lock() = 0.9;
    poll(&app.router, "/api/session", |v| {
        v["confidence"].as_f64().map(|c| (c - 90.0).abs() < 1e-6).unwrap_or(false)
    })
    .await;

    let (status, body) = call(&app.router, "POST", "/api/live/confirm", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "promoted");

    let session = poll(&app.router, "/api/session", |v| v["state"] == "live").await;
    assert!((session["balance_eth"].as_f64().unwrap() - 1.5).abs() < 1e-9);

    let (status, body) = call(&app.router, "POST", "/api/live/confirm", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "already_live");

    let (status, body) = call(
        &app.router,
        "POST",
        "/api/live/withdraw",
        Some(json!({ "amount": 5.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!((body["applied"].as_f64().unwrap() - 1.5).abs() < 1e-9);
    assert_eq!(body["balance_eth"], 0.0);

    let (status, body) = call(&app.router, "GET", "/api/optimizer", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["weights"].is_object());

    let (status, body) = call(&app.router, "POST", "/api/session/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "idle");
}

#[tokio::test]
async fn test_wallet_pause_resolution_over_http() {
    let app = test_app(None);

    let (status, _) = call(&app.router, "POST", "/api/session/start", None).await;
    assert_eq!(status, StatusCode::OK);

    let paused = poll(&app.router, "/api/session", |v| v["paused"] == true).await;
    assert_eq!(paused["missing_requirement"], "wallet");
    assert_eq!(paused["state"], "booting");

    let (status, body) = call(
        &app.router,
        "POST",
        "/api/session/resolve/wallet",
        Some(json!({ "address": "not-an-address" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = call(
        &app.router,
        "POST",
        "/api/session/resolve/wallet",
        Some(json!({ "address": ADDR })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let ready = poll(&app.router, "/api/session", |v| v["state"] == "ready").await;
    assert_eq!(ready["account_address"], ADDR);
    assert_eq!(ready["paused"], false);
}

#[tokio::test]
async fn test_preflight_endpoints() {
    let app = test_app(Some(ADDR));

    let (status, _) = call(&app.router, "GET", "/api/preflight", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, report) = call(&app.router, "POST", "/api/preflight/run", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["passed"], true);
    assert_eq!(report["checks"].as_array().unwrap().len(), 5);

    let (status, stored) = call(&app.router, "GET", "/api/preflight", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["ran_at"], report["ran_at"]);

    // Offline runs expose no endpoint health
    let (status, body) = call(&app.router, "GET", "/api/provider/endpoints", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}
