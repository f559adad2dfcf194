//! Black-box tests: the full HTTP surface over in-memory stores, simulated
//! payments and a stub upstream platform.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use flowbridge_api::app::{build_app, AppServices};
use flowbridge_core::Network;
use flowbridge_engine::{LivePlatform, PollingScheduler, RunOrchestrator, SchedulerConfig, SchedulerHandle};
use flowbridge_payments::{MockPaymentService, PaymentService};
use flowbridge_storage::{InMemoryRunStore, InMemorySessionStore, RunStore};
use flowbridge_upstream::{FlowCatalog, FlowCatalogConfig, SessionConfig, SessionManager, UpstreamClient};

async fn stub_upstream() -> String {
    let app = Router::new()
        .route(
            "/flow",
            get(|| async {
                Json(json!({
                    "items": [{"url": "/demo", "summary": "Demo", "description": "demo flow"}]
                }))
            }),
        )
        .route(
            "/demo",
            get(|| async { Json(json!({"schema": {"q": "string"}})) })
                .post(|| async { Json(json!({"result": "up-1"})) }),
        )
        .route(
            "/outputs/status/:run_id",
            get(|| async {
                Json(json!({"status": "finished", "final": "{\"output\":\"42\"}"}))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn serve_api() -> (String, SchedulerHandle) {
    let upstream_url = stub_upstream().await;

    let session = SessionManager::new(
        SessionConfig::default()
            .with_base_url(&upstream_url)
            .with_api_key("test-key"),
        Arc::new(InMemorySessionStore::new()),
    );
    let client = UpstreamClient::new(session.clone());
    let catalog = Arc::new(FlowCatalog::new(client.clone(), FlowCatalogConfig::default()));
    let platform = Arc::new(LivePlatform::new(client, catalog.clone()));

    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
    let payments: Arc<dyn PaymentService> =
        Arc::new(MockPaymentService::new(Duration::from_millis(50)));

    let orchestrator = RunOrchestrator::new(store, platform, payments, Network::Preprod);
    let scheduler = PollingScheduler::new(
        orchestrator.clone(),
        SchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(200))
            .with_batch_delay(Duration::ZERO),
    );
    let handle = scheduler.spawn();

    let app = build_app(Arc::new(AppServices {
        orchestrator,
        catalog,
        session,
    }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

#[tokio::test]
async fn health_and_availability_respond() {
    let (base, handle) = serve_api().await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let availability: Value = client
        .get(format!("{}/availability", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(availability["upstream"]["is_healthy"].as_bool().unwrap());

    handle.shutdown().await;
}

#[tokio::test]
async fn flows_and_schema_are_exposed() {
    let (base, handle) = serve_api().await;
    let client = reqwest::Client::new();

    let flows: Value = client
        .get(format!("{}/flows", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(flows[0]["key"], "demo");

    let schema: Value = client
        .get(format!("{}/flows/demo/input_schema", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(schema["schema"]["q"], "string");

    handle.shutdown().await;
}

#[tokio::test]
async fn start_job_runs_to_completion() {
    let (base, handle) = serve_api().await;
    let client = reqwest::Client::new();

    let started: Value = client
        .post(format!("{}/flows/demo/start_job", base))
        .json(&json!({
            "identifier_from_purchaser": "buyer-1",
            "input_data": {"q": "hi"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(started["status"], "awaiting_payment");
    let job_id = started["job_id"].as_str().unwrap().to_string();
    assert!(started["payment_id"].as_str().unwrap().starts_with("test_block_"));

    // Payment confirms, the run launches, the scheduler reconciles it.
    let mut last = json!(null);
    for _ in 0..100 {
        last = client
            .get(format!("{}/flows/demo/status?job_id={}", base, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if last["status"] == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(last["status"], "completed", "job never completed: {}", last);
    assert_eq!(last["result"], "42");

    handle.shutdown().await;
}

#[tokio::test]
async fn bad_requests_get_stable_errors() {
    let (base, handle) = serve_api().await;
    let client = reqwest::Client::new();

    // Unknown flow.
    let resp = client
        .post(format!("{}/flows/nope/start_job", base))
        .json(&json!({"identifier_from_purchaser": "b", "input_data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Missing purchaser identifier.
    let resp = client
        .post(format!("{}/flows/demo/start_job", base))
        .json(&json!({"identifier_from_purchaser": "", "input_data": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Malformed job id.
    let resp = client
        .get(format!("{}/flows/demo/status?job_id=not-a-uuid", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown job id.
    let resp = client
        .get(format!(
            "{}/flows/demo/status?job_id={}",
            base,
            uuid::Uuid::now_v7()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    handle.shutdown().await;
}
