//! Flow run storage abstraction.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use flowbridge_core::{FlowRun, RunId};

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),
    #[error("run already exists: {0}")]
    AlreadyExists(RunId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Run store abstraction.
///
/// Updates are whole-row: the orchestrator mutates a `FlowRun` in memory and
/// persists it atomically, relying on the backend's single-row atomicity.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a newly created run.
    async fn create(&self, run: &FlowRun) -> Result<(), StoreError>;

    /// Fetch a run by id.
    async fn get(&self, id: RunId) -> Result<Option<FlowRun>, StoreError>;

    /// Fetch the run a payment identifier belongs to.
    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<FlowRun>, StoreError>;

    /// Persist the current state of a run.
    async fn update(&self, run: &FlowRun) -> Result<(), StoreError>;

    /// All runs the polling scheduler should drive
    /// (pending payment, starting, running).
    async fn list_pollable(&self) -> Result<Vec<FlowRun>, StoreError>;

    /// Runs still awaiting payment confirmation (startup recovery).
    async fn list_pending_payment(&self) -> Result<Vec<FlowRun>, StoreError>;

    /// Recent runs of one flow, newest first.
    async fn list_by_flow(&self, flow_path: &str, limit: usize) -> Result<Vec<FlowRun>, StoreError>;
}

/// In-memory run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, FlowRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &FlowRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().unwrap();
        if runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<FlowRun>, StoreError> {
        Ok(self.runs.read().unwrap().get(&id).cloned())
    }

    async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<FlowRun>, StoreError> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .values()
            .find(|r| r.payment_id.as_deref() == Some(payment_id))
            .cloned())
    }

    async fn update(&self, run: &FlowRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().unwrap();
        if !runs.contains_key(&run.id) {
            return Err(StoreError::NotFound(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn list_pollable(&self) -> Result<Vec<FlowRun>, StoreError> {
        let runs = self.runs.read().unwrap();
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.status.is_pollable())
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn list_pending_payment(&self) -> Result<Vec<FlowRun>, StoreError> {
        let runs = self.runs.read().unwrap();
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.status == flowbridge_core::FlowRunStatus::PendingPayment)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn list_by_flow(&self, flow_path: &str, limit: usize) -> Result<Vec<FlowRun>, StoreError> {
        let runs = self.runs.read().unwrap();
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.flow_path == flow_path)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }
}
