use serde::{Deserialize, Serialize};

/// Kubeconfig of one cluster, base64 encoded unless requested plain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeconfigEntry {
    pub cluster: String,
    pub kubeconfig: String,
}
