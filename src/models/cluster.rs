use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::registry::RegistryRequest;

/// A cluster as derived from the containers carrying its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub network: String,
    #[serde(default, skip_serializing)]
    pub token: String,
    /// Member node names, sorted
    pub nodes: Vec<String>,
    pub servers_count: usize,
    pub servers_running: usize,
    pub agents_count: usize,
    pub agents_running: usize,
    pub image_volume: String,
    pub has_loadbalancer: bool,
}

/// Which entities an operation applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    All,
    Names(Vec<String>),
}

impl Target {
    /// Build a target from the `all` / `names=a,b` query convention
    pub fn from_query(all: bool, names: Option<&str>) -> Self {
        if all {
            return Self::All;
        }
        Self::Names(split_names(names))
    }
}

/// Split a comma separated name list, dropping blanks
pub fn split_names(names: Option<&str>) -> Vec<String> {
    names
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
}

/// Start/stop request for clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAction {
    pub target: Target,
    pub action: Action,
}

/// Declarative description of a cluster to create
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub name: String,
    #[serde(default = "default_servers")]
    pub servers: u32,
    #[serde(default)]
    pub agents: u32,
    /// Node image, defaults to the configured k3s image
    #[serde(default)]
    pub image: Option<String>,
    /// Existing network to join instead of creating `k3d-<name>`
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub kube_api: KubeApiOptions,
    #[serde(default)]
    pub volumes: Vec<VolumeWithFilters>,
    #[serde(default)]
    pub ports: Vec<PortWithFilters>,
    #[serde(default)]
    pub env: Vec<EnvWithFilters>,
    /// k3s node labels
    #[serde(default)]
    pub labels: Vec<LabelWithFilters>,
    #[serde(default)]
    pub k3s_args: Vec<ArgWithFilters>,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default)]
    pub registries: RegistriesOptions,
    #[serde(default)]
    pub k3d: K3dOptions,
    #[serde(default)]
    pub kubeconfig: KubeconfigOptions,
    #[serde(default)]
    pub runtime: RuntimeOptions,
}

fn default_servers() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeApiOptions {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeWithFilters {
    /// `source:destination[:mode]`
    pub volume: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortWithFilters {
    /// `[host_ip:][host_port:]container_port[/protocol]`
    pub port: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvWithFilters {
    /// `KEY=value`
    pub env: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelWithFilters {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgWithFilters {
    pub arg: String,
    #[serde(default)]
    pub node_filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistriesOptions {
    /// Registry created for and owned by this cluster
    #[serde(default)]
    pub create: Option<RegistryRequest>,
    /// Existing registries to connect
    #[serde(default, rename = "use")]
    pub use_existing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K3dOptions {
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub disable_loadbalancer: bool,
    #[serde(default)]
    pub disable_image_volume: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeconfigOptions {
    #[serde(default)]
    pub update_default: bool,
    #[serde(default)]
    pub switch_context: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub servers_memory: Option<String>,
    #[serde(default)]
    pub agents_memory: Option<String>,
    /// Container labels
    #[serde(default)]
    pub labels: Vec<LabelWithFilters>,
}
