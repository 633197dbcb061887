//! Container runtime capability
//!
//! Everything the lifecycle managers know about the world comes through the
//! [`Runtime`] trait. Implementations:
//! - [`DockerRuntime`]: drives the docker CLI
//! - [`MemoryRuntime`]: in-process state with fault injection, used by tests
//!   and by `RUNTIME=memory`

mod docker;
mod memory;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[cfg(test)]
use mockall::automock;

use crate::error::AppResult;

pub use docker::DockerRuntime;
pub use memory::{Fault, MemoryRuntime};

/// Label carrying the owning cluster's name
pub const LABEL_CLUSTER: &str = "k3d.cluster";
/// Label carrying the node role
pub const LABEL_ROLE: &str = "k3d.role";
/// Creation-batch label (creation timestamp of a node batch)
pub const LABEL_BATCH: &str = "k3d.batch";
/// Unique per creation call; rollback only touches containers carrying it
pub const LABEL_CREATION_ID: &str = "k3d.batch.creation";
pub const LABEL_CLUSTER_TOKEN: &str = "k3d.cluster.token";
pub const LABEL_CLUSTER_NETWORK: &str = "k3d.cluster.network";
pub const LABEL_NETWORK_EXTERNAL: &str = "k3d.cluster.network.external";
pub const LABEL_IMAGE_VOLUME: &str = "k3d.cluster.imageVolume";
pub const LABEL_SERVER_API_HOST: &str = "k3d.server.api.host";
pub const LABEL_SERVER_API_PORT: &str = "k3d.server.api.port";
pub const LABEL_REGISTRY_HOST: &str = "k3d.registry.host";
pub const LABEL_REGISTRY_HOST_IP: &str = "k3d.registry.hostIP";
pub const LABEL_REGISTRY_HOST_PORT: &str = "k3d.registry.hostPort";
pub const LABEL_REGISTRY_PROTOCOL: &str = "k3d.registry.protocol";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const MANAGED_BY: &str = "k3d-lifecycle";

/// Role a container plays in a cluster
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeRole {
    Server,
    Agent,
    LoadBalancer,
    Registry,
}

/// Typed label selector. Every association query (node to cluster, node to
/// batch, registry role) goes through this one predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub role: Option<NodeRole>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub batch: Option<String>,
}

impl LabelSelector {
    /// Selector matching every container
    pub fn any() -> Self {
        Self::default()
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            cluster: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn role(role: NodeRole) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn batch(batch: impl Into<String>) -> Self {
        Self {
            batch: Some(batch.into()),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: NodeRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_batch(mut self, batch: impl Into<String>) -> Self {
        self.batch = Some(batch.into());
        self
    }

    /// Runtime label pairs this selector requires
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if let Some(role) = self.role {
            labels.insert(LABEL_ROLE.to_string(), role.to_string());
        }
        if let Some(cluster) = &self.cluster {
            labels.insert(LABEL_CLUSTER.to_string(), cluster.clone());
        }
        if let Some(batch) = &self.batch {
            labels.insert(LABEL_BATCH.to_string(), batch.clone());
        }
        labels
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.to_labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Host side of a published port
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerState {
    /// Engine status string (running, exited, created, ...)
    pub status: String,
    pub running: bool,
}

/// A container as currently recorded by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    pub created: String,
    /// Memory limit as given at creation, empty when unlimited
    pub memory: String,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    pub env: Vec<String>,
    /// `"6443/tcp"` -> host bindings
    pub ports: BTreeMap<String, Vec<PortBinding>>,
}

impl Container {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn role(&self) -> Option<NodeRole> {
        self.label(LABEL_ROLE).and_then(|r| r.parse().ok())
    }

    pub fn cluster(&self) -> Option<&str> {
        self.label(LABEL_CLUSTER).filter(|c| !c.is_empty())
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|e| {
            e.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// Host and port the cluster API is published on. Prefers the load
/// balancer's binding, falling back to a server's. The host comes from the
/// servers' API host label when set.
pub fn api_endpoint(members: &[Container]) -> Option<(String, String)> {
    let binding = |role: NodeRole| {
        members
            .iter()
            .filter(|c| c.role() == Some(role))
            .find_map(|c| c.ports.get("6443/tcp").and_then(|b| b.first()))
    };
    let binding = binding(NodeRole::LoadBalancer).or_else(|| binding(NodeRole::Server))?;
    let host = members
        .iter()
        .find_map(|c| c.label(LABEL_SERVER_API_HOST))
        .unwrap_or(binding.host_ip.as_str())
        .to_string();
    Some((host, binding.host_port.clone()))
}

/// Published port request, `[host_ip:]host_port:container_port[/protocol]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub host_port: Option<String>,
    pub container_port: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortSpec {
    pub fn to_publish_arg(&self) -> String {
        let container = format!("{}/{}", self.container_port, self.protocol);
        match (&self.host_ip, &self.host_port) {
            (Some(ip), Some(port)) => format!("{}:{}:{}", ip, port, container),
            (Some(ip), None) => format!("{}::{}", ip, container),
            (None, Some(port)) => format!("{}:{}", port, container),
            (None, None) => container,
        }
    }

    pub fn port_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// What to create
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    /// `source:destination` bind or volume mounts
    pub volumes: Vec<String>,
    pub ports: Vec<PortSpec>,
    pub network: Option<String>,
    pub memory: Option<String>,
    /// `host:ip` entries for /etc/hosts
    pub extra_hosts: Vec<String>,
    pub restart: bool,
    pub privileged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateOptions {
    /// Block until every container reports running
    pub wait: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub force: bool,
    pub remove_volumes: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            force: true,
            remove_volumes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportOptions {
    /// Keep the exported image tarball after the import
    pub keep_tarball: bool,
}

/// Container engine operations the lifecycle layer is built on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>) -> AppResult<()>;

    async fn delete_network(&self, name: &str) -> AppResult<()>;

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> AppResult<()>;

    async fn delete_volume(&self, name: &str) -> AppResult<()>;

    /// Create and start a set of containers as one call
    async fn create_containers(
        &self,
        specs: &[ContainerSpec],
        options: CreateOptions,
    ) -> AppResult<()>;

    /// Containers matching the selector; an empty selector lists everything
    async fn list_containers(&self, selector: &LabelSelector) -> AppResult<Vec<Container>>;

    async fn get_container(&self, name: &str) -> AppResult<Container>;

    async fn start_container(&self, name: &str) -> AppResult<()>;

    async fn stop_container(&self, name: &str) -> AppResult<()>;

    async fn delete_container(&self, name: &str, options: DeleteOptions) -> AppResult<()>;

    async fn attach_network(&self, container: &str, network: &str) -> AppResult<()>;

    async fn detach_network(&self, container: &str, network: &str) -> AppResult<()>;

    /// Run a registry container and return its record
    async fn run_registry(&self, spec: &ContainerSpec) -> AppResult<Container>;

    /// Admin kubeconfig of a cluster, named `k3d-<cluster>`
    async fn kubeconfig(&self, cluster: &str) -> AppResult<Kubeconfig>;

    /// Load images into the given node containers
    async fn import_images(
        &self,
        nodes: &[String],
        images: &[String],
        options: ImportOptions,
    ) -> AppResult<()>;
}
