//! Tolerant interpretation of upstream run-status documents.
//!
//! The platform has shipped two response shapes over time: a summary form
//! carrying a `status` field (and the final output once finished), and a
//! legacy form carrying a list of event `elements`. Both are modeled
//! explicitly and mapped by a total function; anything ambiguous reads as
//! still running — never as completed.

use serde_json::Value;

use flowbridge_core::RunEvent;

/// Coarse run phase as reported by upstream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Starting,
    Running,
    Finished,
    Failed,
}

/// A parsed upstream status document.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusDocument {
    /// Current shape: `{"status": "...", "final": "..."}`.
    Summary {
        status: Option<String>,
        /// JSON-encoded final output, present once the run finished.
        final_output: Option<String>,
    },
    /// Legacy shape: `{"elements": [...]}`.
    Elements { elements: Vec<RunEvent> },
}

impl StatusDocument {
    /// Parse a raw response body into one of the two known shapes.
    ///
    /// A body matching neither shape becomes an empty `Summary`, which
    /// interprets as `Running`.
    pub fn parse(body: &Value) -> Self {
        if let Some(elements) = body.get("elements").and_then(Value::as_array) {
            let elements = elements.iter().map(parse_element).collect();
            return StatusDocument::Elements { elements };
        }

        StatusDocument::Summary {
            status: body
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            final_output: body
                .get("final")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Map the document onto a run phase. Total: unknown statuses and
    /// shapeless documents fall back to `Running` rather than guessing
    /// completion.
    pub fn interpret(&self) -> RunPhase {
        match self {
            StatusDocument::Summary { status, .. } => match status.as_deref() {
                Some(s) => match s.to_ascii_lowercase().as_str() {
                    "finished" | "completed" | "done" => RunPhase::Finished,
                    "error" | "failed" | "crashed" => RunPhase::Failed,
                    "starting" | "pending" | "queued" | "created" => RunPhase::Starting,
                    "running" | "active" => RunPhase::Running,
                    _ => RunPhase::Running,
                },
                None => RunPhase::Running,
            },
            StatusDocument::Elements { elements } => {
                if elements
                    .iter()
                    .any(|e| matches!(e.kind.as_str(), "final" | "result"))
                {
                    RunPhase::Finished
                } else if elements.iter().any(RunEvent::is_error) {
                    RunPhase::Failed
                } else {
                    RunPhase::Running
                }
            }
        }
    }

    /// The final output as a JSON value, when the document carries one.
    ///
    /// The summary form encodes it as a JSON string; a string that fails to
    /// parse is kept verbatim.
    pub fn final_output(&self) -> Option<Value> {
        match self {
            StatusDocument::Summary { final_output, .. } => {
                final_output.as_ref().map(|raw| {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
                })
            }
            StatusDocument::Elements { elements } => elements
                .iter()
                .rev()
                .find(|e| matches!(e.kind.as_str(), "final" | "result"))
                .map(|e| e.body.clone()),
        }
    }

    /// Event fragments carried by the document (legacy shape only).
    pub fn events(&self) -> Vec<RunEvent> {
        match self {
            StatusDocument::Summary { .. } => Vec::new(),
            StatusDocument::Elements { elements } => elements.clone(),
        }
    }
}

fn parse_element(raw: &Value) -> RunEvent {
    RunEvent {
        timestamp: raw
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        kind: raw
            .get("kind")
            .or_else(|| raw.get("event"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        body: raw.get("payload").cloned().unwrap_or_else(|| raw.clone()),
    }
}
