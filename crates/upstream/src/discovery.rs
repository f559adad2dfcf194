//! Cached flow discovery.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use flowbridge_core::{DomainError, FlowDescriptor};

use crate::client::UpstreamClient;
use crate::error::UpstreamError;

/// Flow catalog configuration.
#[derive(Debug, Clone)]
pub struct FlowCatalogConfig {
    /// How long a refreshed listing stays fresh.
    pub ttl: Duration,
    /// Bound on one refresh round-trip.
    pub refresh_timeout: Duration,
}

impl Default for FlowCatalogConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    flows: HashMap<String, FlowDescriptor>,
    refreshed_at: Option<Instant>,
}

/// Flow listing cache keyed by flow key, refreshed at most once per TTL.
///
/// The refresh runs behind an async lock with a double-check so concurrent
/// cache misses trigger a single upstream listing.
pub struct FlowCatalog {
    client: UpstreamClient,
    config: FlowCatalogConfig,
    state: Mutex<CatalogState>,
}

impl FlowCatalog {
    pub fn new(client: UpstreamClient, config: FlowCatalogConfig) -> Self {
        Self {
            client,
            config,
            state: Mutex::new(CatalogState::default()),
        }
    }

    /// All known flows, refreshing the cache when stale.
    ///
    /// Staleness is re-checked after the lock is acquired, so concurrent
    /// cache misses trigger exactly one upstream listing.
    pub async fn flows(&self) -> Result<HashMap<String, FlowDescriptor>, UpstreamError> {
        let mut state = self.state.lock().await;
        if self.is_stale(&state) {
            self.refresh_locked(&mut state).await?;
        }
        Ok(state.flows.clone())
    }

    /// Look up one flow by key.
    pub async fn get(&self, flow_key: &str) -> Result<Option<FlowDescriptor>, UpstreamError> {
        Ok(self.flows().await?.get(flow_key).cloned())
    }

    /// Resolve a flow key or fail with the domain's unknown-flow error.
    pub async fn resolve(&self, flow_key: &str) -> Result<FlowDescriptor, CatalogError> {
        self.get(flow_key)
            .await?
            .ok_or_else(|| CatalogError::Domain(DomainError::unknown_flow(flow_key)))
    }

    /// Input schema of a flow, fetched through its descriptor.
    pub async fn schema(&self, flow_key: &str) -> Result<Value, CatalogError> {
        let flow = self.resolve(flow_key).await?;
        Ok(self.client.flow_schema(&flow.path).await?)
    }

    fn is_stale(&self, state: &CatalogState) -> bool {
        match state.refreshed_at {
            Some(at) => at.elapsed() > self.config.ttl,
            None => true,
        }
    }

    async fn refresh_locked(&self, state: &mut CatalogState) -> Result<(), UpstreamError> {
        let listing = tokio::time::timeout(self.config.refresh_timeout, self.client.list_flows())
            .await
            .map_err(|_| UpstreamError::Transport("flow listing timed out".to_string()));

        match listing {
            Ok(Ok(flows)) => {
                state.flows = flows.into_iter().map(|f| (f.key(), f)).collect();
                state.refreshed_at = Some(Instant::now());
                info!(flow_count = state.flows.len(), "refreshed flow catalog");
                Ok(())
            }
            Ok(Err(e)) | Err(e) => {
                // A stale catalog beats none: keep serving the old listing
                // and let the session layer's recovery deal with the channel.
                if state.flows.is_empty() {
                    Err(e)
                } else {
                    warn!(error = %e, "flow refresh failed, serving stale catalog");
                    state.refreshed_at = Some(Instant::now());
                    Ok(())
                }
            }
        }
    }
}

/// Catalog lookup failure: either the channel or the flow key itself.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}
