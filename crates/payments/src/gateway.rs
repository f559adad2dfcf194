//! HTTP client for the payment gateway.
//!
//! All calls run through a looser rate-limited executor than the flow
//! platform's (the gateway tolerates more traffic), with a shorter backoff.
//! Confirmation subscriptions poll the gateway on a fixed cadence and feed
//! the run's notification channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowbridge_core::{Network, PaymentAmount, PaymentSnapshot, RunId};
use flowbridge_upstream::{Backoff, RateLimiter, RequestExecutor, UpstreamError};

use crate::service::{
    ConfirmationOutcome, ConfirmationReceiver, PaymentError, PaymentService, PaymentStatus,
};

/// Payment gateway configuration.
#[derive(Debug, Clone)]
pub struct PaymentGatewayConfig {
    /// Gateway base URL, no trailing slash.
    pub base_url: String,
    pub api_key: String,
    /// Identifier this seller is registered under at the gateway.
    pub agent_identifier: String,
    pub network: Network,
    /// Price of one run, in `payment_unit`.
    pub payment_amount: u64,
    pub payment_unit: String,
    /// Cadence of the confirmation polling loop.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            api_key: String::new(),
            agent_identifier: String::new(),
            network: Network::Preprod,
            payment_amount: 3_000_000,
            payment_unit: "lovelace".to_string(),
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PaymentGatewayConfig {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_agent_identifier(mut self, id: impl Into<String>) -> Self {
        self.agent_identifier = id.into();
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_amount(mut self, amount: u64, unit: impl Into<String>) -> Self {
        self.payment_amount = amount;
        self.payment_unit = unit.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Gateway-backed [`PaymentService`].
pub struct PaymentGatewayClient {
    config: PaymentGatewayConfig,
    http: reqwest::Client,
    executor: RequestExecutor,
    watchers: Mutex<HashMap<RunId, JoinHandle<()>>>,
}

impl PaymentGatewayClient {
    pub fn new(config: PaymentGatewayConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            http,
            executor: RequestExecutor::new(
                RateLimiter::payment_default(),
                Backoff::new(3, Duration::from_millis(500), Duration::from_secs(15)),
            ),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, PaymentError> {
        let url = format!("{}{}", self.config.base_url, path);
        let http = self.http.clone();
        let api_key = self.config.api_key.clone();

        let value = self
            .executor
            .execute(move || {
                let http = http.clone();
                let method = method.clone();
                let url = url.clone();
                let api_key = api_key.clone();
                let body = body.clone();
                async move {
                    let mut req = http.request(method, &url).bearer_auth(&api_key);
                    if let Some(json) = &body {
                        req = req.json(json);
                    }
                    let resp = req
                        .send()
                        .await
                        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

                    let status = resp.status();
                    if !status.is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(UpstreamError::Status {
                            status: status.as_u16(),
                            body,
                            retry_after: None,
                        });
                    }
                    resp.json::<Value>()
                        .await
                        .map_err(|e| UpstreamError::Transport(e.to_string()))
                }
            })
            .await?;
        Ok(value)
    }

    fn parse_snapshot(
        &self,
        purchaser_identifier: &str,
        body: &Value,
    ) -> Result<PaymentSnapshot, PaymentError> {
        let data = body.get("data").unwrap_or(body);
        let payment_id = data
            .get("blockchainIdentifier")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PaymentError::UnexpectedResponse(format!(
                    "payment response has no blockchainIdentifier: {}",
                    body
                ))
            })?;

        Ok(PaymentSnapshot {
            payment_id: payment_id.to_string(),
            purchaser_identifier: purchaser_identifier.to_string(),
            input_hash: body
                .get("input_hash")
                .and_then(Value::as_str)
                .map(str::to_string),
            amounts: vec![PaymentAmount {
                amount: self.config.payment_amount,
                unit: self.config.payment_unit.clone(),
            }],
            pay_by: data.get("payByTime").and_then(Value::as_i64),
            submit_result_by: data.get("submitResultTime").and_then(Value::as_i64),
            unlock_at: data.get("unlockTime").and_then(Value::as_i64),
        })
    }
}

#[async_trait]
impl PaymentService for PaymentGatewayClient {
    async fn create_payment_request(
        &self,
        purchaser_identifier: &str,
        inputs: &Value,
        run_id: RunId,
    ) -> Result<PaymentSnapshot, PaymentError> {
        info!(%run_id, purchaser = purchaser_identifier, "creating payment request");

        let body = json!({
            "agentIdentifier": self.config.agent_identifier,
            "network": self.config.network.to_string(),
            "identifierFromPurchaser": purchaser_identifier,
            "inputData": inputs,
            "amounts": [{
                "amount": self.config.payment_amount,
                "unit": self.config.payment_unit,
            }],
        });

        let response = self
            .call(reqwest::Method::POST, "/payment", Some(body))
            .await?;
        let snapshot = self.parse_snapshot(purchaser_identifier, &response)?;
        info!(%run_id, payment_id = %snapshot.payment_id, "payment request created");
        Ok(snapshot)
    }

    async fn subscribe_confirmation(
        &self,
        run_id: RunId,
        payment_id: &str,
    ) -> Result<ConfirmationReceiver, PaymentError> {
        let (tx, rx) = oneshot::channel();

        let payment_id = payment_id.to_string();
        let poll_interval = self.config.poll_interval;
        let base_url = self.config.base_url.clone();
        let api_key = self.config.api_key.clone();
        let http = self.http.clone();

        let handle = tokio::spawn(async move {
            let mut tx = Some(tx);
            loop {
                tokio::time::sleep(poll_interval).await;
                if tx.as_ref().map_or(true, |t| t.is_closed()) {
                    return;
                }

                let url = format!("{}/payment/{}", base_url, payment_id);
                let status = match http.get(&url).bearer_auth(&api_key).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<Value>().await {
                            Ok(body) => body
                                .get("data")
                                .unwrap_or(&body)
                                .get("status")
                                .and_then(Value::as_str)
                                .map(PaymentStatus::parse),
                            Err(e) => {
                                warn!(payment_id = %payment_id, error = %e, "confirmation poll returned bad JSON");
                                None
                            }
                        }
                    }
                    Ok(resp) => {
                        warn!(payment_id = %payment_id, status = %resp.status(), "confirmation poll failed");
                        None
                    }
                    Err(e) => {
                        warn!(payment_id = %payment_id, error = %e, "confirmation poll transport error");
                        None
                    }
                };

                match status {
                    Some(PaymentStatus::Confirmed) => {
                        info!(payment_id = %payment_id, "payment confirmed");
                        let _ = tx.take().unwrap().send(ConfirmationOutcome::Confirmed);
                        return;
                    }
                    Some(PaymentStatus::Failed) => {
                        let _ = tx
                            .take()
                            .unwrap()
                            .send(ConfirmationOutcome::Failed("payment failed".to_string()));
                        return;
                    }
                    Some(PaymentStatus::Expired) => {
                        let _ = tx
                            .take()
                            .unwrap()
                            .send(ConfirmationOutcome::Failed("payment expired".to_string()));
                        return;
                    }
                    // Pending, or a transient poll failure: keep watching.
                    Some(PaymentStatus::Pending) | None => {}
                }
            }
        });

        let mut watchers = self.watchers.lock().unwrap();
        if let Some(old) = watchers.insert(run_id, handle) {
            debug!(%run_id, "replacing existing confirmation watcher");
            old.abort();
        }
        Ok(rx)
    }

    async fn check_status(&self, payment_id: &str) -> Result<PaymentStatus, PaymentError> {
        let path = format!("/payment/{}", payment_id);
        let body = self.call(reqwest::Method::GET, &path, None).await?;
        let raw = body
            .get("data")
            .unwrap_or(&body)
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PaymentError::UnexpectedResponse(format!("status response has no status: {}", body))
            })?;
        Ok(PaymentStatus::parse(raw))
    }

    async fn complete_payment(
        &self,
        run_id: RunId,
        payment_id: &str,
        purchaser_identifier: &str,
        output: &Value,
    ) -> Result<(), PaymentError> {
        info!(%run_id, payment_id, "completing payment");
        let path = format!("/payment/{}/complete", payment_id);
        let body = json!({
            "identifierFromPurchaser": purchaser_identifier,
            "result": output,
        });
        self.call(reqwest::Method::POST, &path, Some(body)).await?;
        info!(%run_id, payment_id, "payment completed");
        Ok(())
    }

    fn unsubscribe(&self, run_id: RunId) {
        if let Some(handle) = self.watchers.lock().unwrap().remove(&run_id) {
            handle.abort();
        }
    }
}

impl Drop for PaymentGatewayClient {
    fn drop(&mut self) {
        for (_, handle) in self.watchers.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
