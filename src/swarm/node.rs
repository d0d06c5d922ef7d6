//! Nodes and daemon-level information

use super::ObjectVersion;
use serde::{Deserialize, Serialize};

/// Swarm node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub version: ObjectVersion,
    #[serde(default)]
    pub description: NodeDescription,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeDescription {
    #[serde(default)]
    pub hostname: String,
}

/// Subset of `GET /info`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemInfo {
    #[serde(default)]
    pub swarm: SwarmInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SwarmInfo {
    #[serde(rename = "NodeID", default)]
    pub node_id: String,
    /// `inactive`, `pending`, `active`, `error` or `locked`
    #[serde(default)]
    pub local_node_state: String,
    #[serde(default)]
    pub control_available: bool,
}

impl SystemInfo {
    pub fn is_manager(&self) -> bool {
        self.swarm.control_available
    }
}

/// `GET /version`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerVersion {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

/// Compare dotted API versions (`1.25` < `1.30`)
pub fn version_less_than(a: &str, b: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }
    parts(a) < parts(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_detection() {
        let info: SystemInfo = serde_json::from_str(
            r#"{"Swarm":{"NodeID":"n","LocalNodeState":"active","ControlAvailable":true}}"#,
        )
        .unwrap();
        assert!(info.is_manager());
        let worker: SystemInfo =
            serde_json::from_str(r#"{"Swarm":{"LocalNodeState":"active"}}"#).unwrap();
        assert!(!worker.is_manager());
    }

    #[test]
    fn test_version_compare() {
        assert!(version_less_than("1.24", "1.25"));
        assert!(version_less_than("1.9", "1.25"));
        assert!(!version_less_than("1.41", "1.30"));
        assert!(!version_less_than("1.25", "1.25"));
    }
}
