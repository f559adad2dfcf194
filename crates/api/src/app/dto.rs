//! Request/response DTOs and their mapping from domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowbridge_core::{FlowDescriptor, FlowRun, FlowRunStatus};

/// Caller-visible job status. Internal recovery and retries never show up
/// here; a caller only ever sees these five.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerStatus {
    AwaitingPayment,
    Pending,
    Running,
    Completed,
    Failed,
}

impl From<FlowRunStatus> for CallerStatus {
    fn from(status: FlowRunStatus) -> Self {
        match status {
            FlowRunStatus::PendingPayment => CallerStatus::AwaitingPayment,
            FlowRunStatus::PaymentConfirmed => CallerStatus::Pending,
            FlowRunStatus::Starting | FlowRunStatus::Running => CallerStatus::Running,
            FlowRunStatus::Finished => CallerStatus::Completed,
            FlowRunStatus::Error | FlowRunStatus::Cancelled | FlowRunStatus::TimedOut => {
                CallerStatus::Failed
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub identifier_from_purchaser: String,
    #[serde(default)]
    pub input_data: Value,
}

#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
    pub status: CallerStatus,
    pub payment_id: Option<String>,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl StartJobResponse {
    pub fn from_run(run: &FlowRun) -> Self {
        Self {
            job_id: run.id.to_string(),
            status: run.status.into(),
            payment_id: run.payment_id.clone(),
            timeout_at: run.timeout_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JobStatusQuery {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: CallerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl JobStatusResponse {
    pub fn from_run(run: &FlowRun) -> Self {
        let status = CallerStatus::from(run.status);
        let message = match status {
            CallerStatus::AwaitingPayment => Some("waiting for payment confirmation".to_string()),
            CallerStatus::Running | CallerStatus::Pending => {
                Some("job is being processed".to_string())
            }
            CallerStatus::Failed => run.error_message.clone(),
            CallerStatus::Completed => None,
        };
        let result = match status {
            CallerStatus::Completed => run.result.as_ref().map(format_result),
            _ => None,
        };
        Self {
            job_id: run.id.to_string(),
            status,
            message,
            result,
        }
    }
}

/// Flatten an opaque output payload into a display string: well-known keys
/// first, pretty JSON as the fallback.
pub fn format_result(result: &Value) -> String {
    if let Value::Object(map) = result {
        for key in ["output", "result", "content"] {
            if let Some(value) = map.get(key) {
                return match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }
        return serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
    }
    match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct FlowSummary {
    pub key: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl From<&FlowDescriptor> for FlowSummary {
    fn from(flow: &FlowDescriptor) -> Self {
        Self {
            key: flow.key(),
            name: flow.name.clone(),
            description: flow.description.clone(),
            tags: flow.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn caller_status_collapses_internal_states() {
        assert_eq!(
            CallerStatus::from(FlowRunStatus::Starting),
            CallerStatus::Running
        );
        assert_eq!(
            CallerStatus::from(FlowRunStatus::TimedOut),
            CallerStatus::Failed
        );
        assert_eq!(
            CallerStatus::from(FlowRunStatus::PendingPayment),
            CallerStatus::AwaitingPayment
        );
    }

    #[test]
    fn result_formatting_prefers_known_keys() {
        assert_eq!(format_result(&json!({"output": "42"})), "42");
        assert_eq!(format_result(&json!({"result": 7})), "7");
        assert_eq!(format_result(&json!({"content": "text"})), "text");
        assert_eq!(format_result(&json!("bare")), "bare");

        let fallback = format_result(&json!({"other": true}));
        assert!(fallback.contains("\"other\""));
    }
}
