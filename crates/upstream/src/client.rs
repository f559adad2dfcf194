//! Typed operations against the flow-execution platform.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use flowbridge_core::FlowDescriptor;

use crate::error::UpstreamError;
use crate::session::SessionManager;
use crate::status::StatusDocument;

/// Safety cap on paginated flow listing; bounds pathological pagination.
const FLOW_PAGE_CAP: usize = 1000;

/// Result of launching a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    /// The run id the platform assigned.
    pub run_id: String,
}

/// Client for the upstream platform's flow API, built on the session manager.
#[derive(Clone)]
pub struct UpstreamClient {
    session: Arc<SessionManager>,
}

impl UpstreamClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// List every available flow, following pagination while the platform
    /// returns an offset and full pages, up to the safety cap.
    pub async fn list_flows(&self) -> Result<Vec<FlowDescriptor>, UpstreamError> {
        let mut flows = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let path = match &offset {
                Some(o) => format!("/flow?offset={}", o),
                None => "/flow".to_string(),
            };
            let body = self.session.request(Method::GET, &path, None).await?;

            let items = body
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let page_len = items.len();

            for item in &items {
                if let Some(flow) = parse_flow(item) {
                    flows.push(flow);
                }
            }

            if flows.len() >= FLOW_PAGE_CAP {
                warn!(count = flows.len(), "flow listing hit the safety cap");
                flows.truncate(FLOW_PAGE_CAP);
                break;
            }

            offset = body
                .get("offset")
                .and_then(Value::as_str)
                .map(str::to_string);
            if offset.is_none() || page_len == 0 {
                break;
            }
        }

        debug!(count = flows.len(), "listed upstream flows");
        Ok(flows)
    }

    /// Fetch the input-schema document a flow publishes.
    pub async fn flow_schema(&self, flow_path: &str) -> Result<Value, UpstreamError> {
        self.session.request(Method::GET, flow_path, None).await
    }

    /// Launch a run of the flow at `flow_path` with the given inputs.
    ///
    /// Success returns the platform's run id; a response carrying `errors`
    /// and no run id is an upstream validation failure.
    pub async fn launch_flow(
        &self,
        flow_path: &str,
        inputs: &Value,
    ) -> Result<LaunchOutcome, UpstreamError> {
        let body = self
            .session
            .request(Method::POST, flow_path, Some(inputs))
            .await?;

        if let Some(run_id) = body.get("result").and_then(Value::as_str) {
            return Ok(LaunchOutcome {
                run_id: run_id.to_string(),
            });
        }

        if let Some(errors) = body.get("errors") {
            return Err(UpstreamError::LaunchRejected(errors.to_string()));
        }

        Err(UpstreamError::UnexpectedResponse(format!(
            "launch returned neither a run id nor errors: {}",
            body
        )))
    }

    /// Fetch the status document of a run: the outputs endpoint first, and
    /// the legacy per-flow query as a fallback when it is not there.
    pub async fn run_status(
        &self,
        flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError> {
        let preferred = format!("/outputs/status/{}", run_id);
        match self.session.request(Method::GET, &preferred, None).await {
            Ok(body) => Ok(StatusDocument::parse(&body)),
            Err(UpstreamError::Status { status: 404, .. }) => {
                debug!(run_id, "outputs endpoint missing, using legacy status query");
                let legacy = format!("{}?run_id={}", flow_path, run_id);
                let body = self.session.request(Method::GET, &legacy, None).await?;
                Ok(StatusDocument::parse(&body))
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the full event log of a run via the legacy endpoint.
    pub async fn run_events(
        &self,
        flow_path: &str,
        run_id: &str,
    ) -> Result<StatusDocument, UpstreamError> {
        let legacy = format!("{}?run_id={}", flow_path, run_id);
        let body = self.session.request(Method::GET, &legacy, None).await?;
        Ok(StatusDocument::parse(&body))
    }
}

fn parse_flow(item: &Value) -> Option<FlowDescriptor> {
    let path = item.get("url").and_then(Value::as_str)?;
    if path.is_empty() {
        return None;
    }
    Some(FlowDescriptor {
        path: path.to_string(),
        name: item
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or(path)
            .to_string(),
        description: item
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        version: item
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author: item
            .get("author")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tags: item
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flow_items_without_a_url_are_skipped() {
        assert!(parse_flow(&json!({ "summary": "nameless" })).is_none());
        assert!(parse_flow(&json!({ "url": "" })).is_none());

        let flow = parse_flow(&json!({
            "url": "/team/demo",
            "summary": "Demo",
            "tags": ["a", "b"]
        }))
        .unwrap();
        assert_eq!(flow.path, "/team/demo");
        assert_eq!(flow.name, "Demo");
        assert_eq!(flow.tags, vec!["a", "b"]);
        assert_eq!(flow.key(), "team_demo");
    }
}
