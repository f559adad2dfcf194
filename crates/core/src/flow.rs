//! Flow descriptors and flow-key derivation.

use serde::{Deserialize, Serialize};

/// A flow as advertised by the upstream execution platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    /// Upstream path the flow is launched at (e.g. `/team/flow`).
    pub path: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FlowDescriptor {
    /// The stable key callers address this flow by.
    pub fn key(&self) -> String {
        flow_key_from_path(&self.path)
    }
}

/// Derive a flow key from an upstream path: strip the leading slash and
/// replace the remaining separators (`/team/flow` -> `team_flow`).
pub fn flow_key_from_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation_strips_and_joins() {
        assert_eq!(flow_key_from_path("/team/flow"), "team_flow");
        assert_eq!(flow_key_from_path("flow"), "flow");
        assert_eq!(flow_key_from_path("/a/b/c"), "a_b_c");
    }

    #[test]
    fn descriptor_key_matches_path() {
        let flow = FlowDescriptor {
            path: "/demo".to_string(),
            name: "Demo".to_string(),
            description: String::new(),
            version: String::new(),
            author: String::new(),
            tags: Vec::new(),
        };
        assert_eq!(flow.key(), "demo");
    }
}
