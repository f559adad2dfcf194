//! End-to-end engine tests over a stubbed platform and simulated payments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowbridge_core::{FlowDescriptor, FlowRun, FlowRunStatus, Network, RunId};
use flowbridge_engine::{FlowPlatform, PollingScheduler, RunOrchestrator, SchedulerConfig};
use flowbridge_payments::{MockPaymentService, PaymentService};
use flowbridge_storage::{InMemoryRunStore, RunStore};
use flowbridge_upstream::{CatalogError, LaunchOutcome, StatusDocument, UpstreamError};

/// Scripted platform: per-run status documents are served in order, the last
/// one repeating; a `__fail` body simulates an upstream 503.
struct StubPlatform {
    flows: HashMap<String, FlowDescriptor>,
    statuses: Mutex<HashMap<String, VecDeque<Value>>>,
    launch_results: Mutex<VecDeque<Result<String, UpstreamError>>>,
    launch_count: AtomicU32,
    status_calls: AtomicU32,
}

impl StubPlatform {
    fn new() -> Arc<Self> {
        let mut flows = HashMap::new();
        flows.insert(
            "demo".to_string(),
            FlowDescriptor {
                path: "/demo".to_string(),
                name: "Demo".to_string(),
                description: String::new(),
                version: String::new(),
                author: String::new(),
                tags: Vec::new(),
            },
        );
        Arc::new(Self {
            flows,
            statuses: Mutex::new(HashMap::new()),
            launch_results: Mutex::new(VecDeque::new()),
            launch_count: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        })
    }

    fn script_statuses(&self, upstream_id: &str, bodies: Vec<Value>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(upstream_id.to_string(), bodies.into());
    }

    fn script_launch_failure(&self, error: UpstreamError) {
        self.launch_results.lock().unwrap().push_back(Err(error));
    }

    fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowPlatform for StubPlatform {
    async fn resolve_flow(&self, flow_key: &str) -> Result<FlowDescriptor, CatalogError> {
        self.flows.get(flow_key).cloned().ok_or_else(|| {
            CatalogError::Domain(flowbridge_core::DomainError::unknown_flow(flow_key))
        })
    }

    async fn launch_flow(
        &self,
        _flow_path: &str,
        _inputs: &Value,
    ) -> Result<LaunchOutcome, UpstreamError> {
        if let Some(result) = self.launch_results.lock().unwrap().pop_front() {
            return result.map(|run_id| LaunchOutcome { run_id });
        }
        let n = self.launch_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(LaunchOutcome {
            run_id: format!("up-{}", n),
        })
    }

    async fn run_status(
        &self,
        _flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().unwrap();
        let queue = statuses.get_mut(run_id).ok_or_else(|| UpstreamError::Status {
            status: 404,
            body: format!("unknown run {}", run_id),
            retry_after: None,
        })?;

        let body = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or(Value::Null)
        };

        if body.get("__fail").is_some() {
            return Err(UpstreamError::Status {
                status: 503,
                body: "unavailable".to_string(),
                retry_after: None,
            });
        }
        Ok(StatusDocument::parse(&body))
    }

    async fn run_events(
        &self,
        _flow_path: &str,
        _run_id: &str,
    ) -> Result<StatusDocument, UpstreamError> {
        Ok(StatusDocument::parse(&json!({
            "elements": [{"kind": "status", "payload": "running"}]
        })))
    }
}

struct Harness {
    store: Arc<InMemoryRunStore>,
    platform: Arc<StubPlatform>,
    payments: Arc<MockPaymentService>,
    orchestrator: Arc<RunOrchestrator>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryRunStore::new());
    let platform = StubPlatform::new();
    let payments = Arc::new(MockPaymentService::new(Duration::ZERO));

    let run_store: Arc<dyn RunStore> = store.clone();
    let flow_platform: Arc<dyn FlowPlatform> = platform.clone();
    let payment_service: Arc<dyn PaymentService> = payments.clone();
    let orchestrator =
        RunOrchestrator::new(run_store, flow_platform, payment_service, Network::Preprod);

    Harness {
        store,
        platform,
        payments,
        orchestrator,
    }
}

/// Poll the store until the run reaches `expected`. Generous bound: under
/// the paused clock this spans several 30s scheduler cycles.
async fn wait_for_status(store: &InMemoryRunStore, id: RunId, expected: FlowRunStatus) -> FlowRun {
    for _ in 0..3000 {
        if let Some(run) = store.get(id).await.unwrap() {
            if run.status == expected {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("run {} never reached {:?}", id, expected);
}

#[tokio::test(start_paused = true)]
async fn happy_path_finishes_and_settles_exactly_once() {
    let h = harness();
    h.platform.script_statuses(
        "up-1",
        vec![
            json!({"status": "starting"}),
            json!({"status": "running"}),
            json!({"status": "finished", "final": "{\"output\":\"42\"}"}),
        ],
    );

    let run = h
        .orchestrator
        .create_run("demo", json!({"q": "hi"}), "buyer-1")
        .await
        .unwrap();
    assert_eq!(run.status, FlowRunStatus::PendingPayment);
    assert!(run.timeout_at.is_some());

    // Payment auto-confirms and the waiter launches the run upstream.
    wait_for_status(&h.store, run.id, FlowRunStatus::Starting).await;

    let scheduler = PollingScheduler::new(
        h.orchestrator.clone(),
        SchedulerConfig::default().with_poll_interval(Duration::from_secs(30)),
    );
    let handle = scheduler.spawn();

    let finished = wait_for_status(&h.store, run.id, FlowRunStatus::Finished).await;
    handle.shutdown().await;

    assert_eq!(finished.result, Some(json!({"output": "42"})));
    assert!(finished.error_message.is_none());
    assert!(finished.completed_at.is_some());

    // Settlement happened exactly once, with the run's snapshot data.
    let completions = h.payments.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].run_id, run.id);
    assert_eq!(completions[0].purchaser_identifier, "buyer-1");
}

#[tokio::test]
async fn past_deadline_times_out_without_querying_upstream() {
    let h = harness();

    let mut run = FlowRun::new("/demo", "Demo", json!({}));
    run.mark_payment_confirmed().unwrap();
    run.mark_starting("up-9").unwrap();
    run.extend_deadline(chrono::Utc::now() - chrono::Duration::hours(1));
    h.store.create(&run).await.unwrap();

    h.orchestrator.refresh(&mut run).await.unwrap();

    assert_eq!(run.status, FlowRunStatus::TimedOut);
    assert_eq!(h.platform.status_calls(), 0);

    let stored = h.store.get(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, FlowRunStatus::TimedOut);
    assert!(stored.error_message.is_some());
}

#[tokio::test]
async fn refresh_on_a_finished_run_is_a_no_op() {
    let h = harness();

    let mut run = FlowRun::new("/demo", "Demo", json!({}));
    run.mark_payment_confirmed().unwrap();
    run.mark_starting("up-5").unwrap();
    run.mark_finished(json!({"output": "done"})).unwrap();
    h.store.create(&run).await.unwrap();

    let before = run.clone();
    h.orchestrator.refresh(&mut run).await.unwrap();
    h.orchestrator.refresh(&mut run).await.unwrap();

    assert_eq!(h.platform.status_calls(), 0);
    assert_eq!(run, before);
}

#[tokio::test]
async fn failed_payment_request_marks_the_run_error() {
    let h = harness();
    h.payments.fail_creations();

    let result = h
        .orchestrator
        .create_run("demo", json!({"q": "hi"}), "buyer-1")
        .await;
    assert!(result.is_err());

    let runs = h.store.list_by_flow("/demo", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, FlowRunStatus::Error);
    assert!(runs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("payment request failed"));
}

#[tokio::test]
async fn unknown_flow_is_rejected_before_anything_persists() {
    let h = harness();

    let result = h
        .orchestrator
        .create_run("missing", json!({}), "buyer-1")
        .await;
    assert!(result.is_err());
    assert!(h.store.list_by_flow("/missing", 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_payment_fails_the_run() {
    let h = harness();
    h.payments.fail_confirmations();

    let run = h
        .orchestrator
        .create_run("demo", json!({}), "buyer-1")
        .await
        .unwrap();

    let failed = wait_for_status(&h.store, run.id, FlowRunStatus::Error).await;
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("payment failed"));
}

#[tokio::test(start_paused = true)]
async fn rejected_launch_fails_the_run_with_the_upstream_message() {
    let h = harness();
    h.platform
        .script_launch_failure(UpstreamError::LaunchRejected("field q is required".to_string()));

    let run = h
        .orchestrator
        .create_run("demo", json!({}), "buyer-1")
        .await
        .unwrap();

    let failed = wait_for_status(&h.store, run.id, FlowRunStatus::Error).await;
    let message = failed.error_message.unwrap();
    assert!(message.contains("launch failed"));
    assert!(message.contains("field q is required"));
}

#[tokio::test]
async fn one_failing_run_does_not_abort_the_cycle() {
    let h = harness();

    let mut broken = FlowRun::new("/demo", "Demo", json!({}));
    broken.mark_payment_confirmed().unwrap();
    broken.mark_starting("up-broken").unwrap();
    h.store.create(&broken).await.unwrap();
    h.platform
        .script_statuses("up-broken", vec![json!({"__fail": true})]);

    let mut healthy = FlowRun::new("/demo", "Demo", json!({}));
    healthy.mark_payment_confirmed().unwrap();
    healthy.mark_starting("up-ok").unwrap();
    h.store.create(&healthy).await.unwrap();
    h.platform.script_statuses(
        "up-ok",
        vec![json!({"status": "finished", "final": "{\"n\":1}"})],
    );

    let scheduler = PollingScheduler::new(
        h.orchestrator.clone(),
        SchedulerConfig::default().with_batch_delay(Duration::ZERO),
    );
    let outcome = scheduler.run_once().await.unwrap();

    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(outcome.failed, 1);

    let broken = h.store.get(broken.id).await.unwrap().unwrap();
    assert_eq!(broken.status, FlowRunStatus::Error);
    assert!(broken.error_message.as_deref().unwrap().contains("refresh failed"));

    let healthy = h.store.get(healthy.id).await.unwrap().unwrap();
    assert_eq!(healthy.status, FlowRunStatus::Finished);
}

#[tokio::test(start_paused = true)]
async fn resume_monitoring_reattaches_pending_runs() {
    let h = harness();
    h.platform.script_statuses("up-1", vec![json!({"status": "starting"})]);

    // A pending-payment run persisted by a previous process life.
    let mut run = FlowRun::new("/demo", "Demo", json!({"q": "hi"}));
    run.attach_payment(flowbridge_core::PaymentSnapshot {
        payment_id: "test_block_recovered".to_string(),
        purchaser_identifier: "buyer-1".to_string(),
        input_hash: None,
        amounts: Vec::new(),
        pay_by: None,
        submit_result_by: None,
        unlock_at: None,
    });
    h.store.create(&run).await.unwrap();

    // And one whose flow disappeared from the catalog.
    let mut orphan = FlowRun::new("/gone", "Gone", json!({}));
    orphan.attach_payment(flowbridge_core::PaymentSnapshot {
        payment_id: "test_block_orphan".to_string(),
        purchaser_identifier: "buyer-2".to_string(),
        input_hash: None,
        amounts: Vec::new(),
        pay_by: None,
        submit_result_by: None,
        unlock_at: None,
    });
    h.store.create(&orphan).await.unwrap();

    let resumed = h.orchestrator.resume_monitoring().await.unwrap();
    assert_eq!(resumed, 1);

    // The recovered run confirms and launches; the orphan is marked failed.
    wait_for_status(&h.store, run.id, FlowRunStatus::Starting).await;
    let orphan = h.store.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, FlowRunStatus::Error);
    assert!(orphan
        .error_message
        .as_deref()
        .unwrap()
        .contains("no longer available"));
}
