use axum::http::StatusCode;
use fillrelay::api::{self, AppState};
use fillrelay::datasource::MockDataSource;
use fillrelay::db::MemoryCheckpointStore;
use fillrelay::domain::{Address, Coin, ConnectionState, Decimal, Direction, FillRecord, Side, TimeMs};
use fillrelay::orchestration::{BulkFetcher, Reconciler, ReconcilerConfig, ReconcilerInput, RecoveryScan};
use fillrelay::retry::RetryPolicy;
use fillrelay::sink::MemorySink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

fn fill(time_ms: i64, tid: i64) -> FillRecord {
    FillRecord {
        symbol: Coin::new("BTC".to_string()),
        side: Side::Buy,
        size: Decimal::from_str_canonical("0.1").unwrap(),
        price: Decimal::from_str_canonical("50000").unwrap(),
        time_ms: TimeMs::new(time_ms),
        direction: Direction::OpenLong,
        realized_pnl: Decimal::zero(),
        fee: Decimal::zero(),
        fee_asset: "USDC".to_string(),
        order_id: tid,
        trade_id: tid,
        tx_hash: String::new(),
        crossed_spread: true,
        liquidation: false,
        builder_fee: None,
        start_position: None,
    }
}

fn test_reconciler(fills: Vec<FillRecord>) -> Reconciler {
    let user = Address::new("0x1111111111111111111111111111111111111111".to_string());
    let policy = RetryPolicy {
        base: Duration::from_millis(1),
        factor: 2.0,
        cap: Duration::from_millis(2),
        max_attempts: Some(2),
    };
    let fetcher = BulkFetcher::new(
        Arc::new(MockDataSource::new().with_fills(fills)),
        user.clone(),
        policy,
        RecoveryScan::EarlyStop,
    );
    Reconciler::new(
        user,
        ReconcilerConfig {
            sink_retry: policy,
            sweep_interval: None,
            ..ReconcilerConfig::default()
        },
        Arc::new(fetcher),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemorySink::new()),
    )
}

async fn request(app: axum::Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_is_always_ok() {
    let reconciler = test_reconciler(vec![]);
    let (tx, _rx) = mpsc::channel(4);
    let app = api::create_router(AppState::new(reconciler.subscribe_status(), tx));

    let (status, body) = request(app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ready_tracks_subscription() {
    let mut reconciler = test_reconciler(vec![]);
    let (tx, _rx) = mpsc::channel(4);
    let app = api::create_router(AppState::new(reconciler.subscribe_status(), tx));

    let (status, body) = request(app.clone(), "GET", "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["connection"], "disconnected");

    reconciler
        .handle_input(ReconcilerInput::Connection(ConnectionState::Connecting))
        .await;
    reconciler
        .handle_input(ReconcilerInput::Connection(ConnectionState::Subscribed))
        .await;

    let (status, body) = request(app, "GET", "/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_status_reports_checkpoint_and_recovery() {
    let mut reconciler = test_reconciler(vec![fill(100, 1), fill(200, 2)]);
    let (tx, _rx) = mpsc::channel(4);
    let app = api::create_router(AppState::new(reconciler.subscribe_status(), tx));

    reconciler.bootstrap().await.unwrap();
    let (_, body) = request(app.clone(), "GET", "/v1/status").await;
    assert_eq!(body["recovery_in_flight"], true);

    reconciler.settle_recovery().await;
    let (status, body) = request(app, "GET", "/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"], "0x1111111111111111111111111111111111111111");
    assert_eq!(body["last_processed_time_ms"], 200);
    assert_eq!(body["fingerprint_count"], 2);
    assert_eq!(body["delivered"], 2);
    assert_eq!(body["pending_delivery"], serde_json::Value::Null);
    assert_eq!(body["paused"], serde_json::Value::Null);
    assert_eq!(body["recovery_in_flight"], false);
    assert_eq!(body["last_recovery"]["outcome"], "completed");
    assert_eq!(body["last_recovery"]["selected"], 2);
}

#[tokio::test]
async fn test_recover_endpoint_enqueues_request() {
    let reconciler = test_reconciler(vec![]);
    let (tx, mut rx) = mpsc::channel(4);
    let app = api::create_router(AppState::new(reconciler.subscribe_status(), tx));

    let (status, body) = request(app, "POST", "/v1/recover").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert!(matches!(
        rx.try_recv(),
        Ok(ReconcilerInput::RecoveryRequested)
    ));
}

#[tokio::test]
async fn test_recover_endpoint_unavailable_when_reconciler_gone() {
    let reconciler = test_reconciler(vec![]);
    let (tx, rx) = mpsc::channel(4);
    drop(rx);
    let app = api::create_router(AppState::new(reconciler.subscribe_status(), tx));

    let (status, body) = request(app, "POST", "/v1/recover").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("reconciler"));
}
