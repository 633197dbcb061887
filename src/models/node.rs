use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cluster::{Action, Target};
use crate::runtime::{NodeRole, PortBinding};

/// A node container projected into the lifecycle model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub cluster: String,
    pub state: String,
    pub running: bool,
    pub created: String,
    pub memory: String,
    pub image: String,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub env: Vec<String>,
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    /// Creation batch this node was added with
    #[serde(default)]
    pub batch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub cluster: String,
    pub role: NodeRole,
    pub state: String,
    pub running: bool,
}

impl From<&Node> for NodeStatus {
    fn from(node: &Node) -> Self {
        Self {
            node: node.name.clone(),
            cluster: node.cluster.clone(),
            role: node.role,
            state: node.state.clone(),
            running: node.running,
        }
    }
}

/// Nodes `{name}-{i}` for `i` in `start_from..count`, added to an existing cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBatch {
    pub name: String,
    /// Taken from the route when created over HTTP
    #[serde(default)]
    pub cluster: String,
    #[serde(default = "default_role")]
    pub role: NodeRole,
    pub count: u32,
    #[serde(default)]
    pub start_from: u32,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Batch label value; generated from the creation time when absent
    #[serde(default)]
    pub batch: Option<String>,
}

fn default_role() -> NodeRole {
    NodeRole::Agent
}

/// Start/stop request for nodes of one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAction {
    pub target: Target,
    pub action: Action,
}
