//! The engine's view of the flow-execution platform.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use flowbridge_core::FlowDescriptor;
use flowbridge_upstream::{
    CatalogError, FlowCatalog, LaunchOutcome, StatusDocument, UpstreamClient, UpstreamError,
};

/// What the orchestrator needs from the platform: flow resolution, launch,
/// and run status/events. Backed by [`LivePlatform`] in production and by
/// stubs in tests.
#[async_trait]
pub trait FlowPlatform: Send + Sync {
    async fn resolve_flow(&self, flow_key: &str) -> Result<FlowDescriptor, CatalogError>;

    async fn launch_flow(
        &self,
        flow_path: &str,
        inputs: &Value,
    ) -> Result<LaunchOutcome, UpstreamError>;

    async fn run_status(
        &self,
        flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError>;

    async fn run_events(
        &self,
        flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError>;
}

/// The real platform: typed client plus cached catalog.
pub struct LivePlatform {
    client: UpstreamClient,
    catalog: Arc<FlowCatalog>,
}

impl LivePlatform {
    pub fn new(client: UpstreamClient, catalog: Arc<FlowCatalog>) -> Self {
        Self { client, catalog }
    }
}

#[async_trait]
impl FlowPlatform for LivePlatform {
    async fn resolve_flow(&self, flow_key: &str) -> Result<FlowDescriptor, CatalogError> {
        self.catalog.resolve(flow_key).await
    }

    async fn launch_flow(
        &self,
        flow_path: &str,
        inputs: &Value,
    ) -> Result<LaunchOutcome, UpstreamError> {
        self.client.launch_flow(flow_path, inputs).await
    }

    async fn run_status(
        &self,
        flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError> {
        self.client.run_status(flow_path, run_id).await
    }

    async fn run_events(
        &self,
        flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError> {
        self.client.run_events(flow_path, run_id).await
    }
}
