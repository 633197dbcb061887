//! Container specs for clusters, node batches and registries
//!
//! Everything here is a pure function of the request: no runtime calls, so
//! validation failures surface before anything is created.

use std::collections::BTreeMap;
use std::str::FromStr;

use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Cluster, ClusterTopology, Expose, NodeBatch, ProxyConfig, RegistryRequest};
use crate::runtime::{
    ContainerSpec, NodeRole, PortSpec, LABEL_BATCH, LABEL_CLUSTER, LABEL_CLUSTER_NETWORK,
    LABEL_CLUSTER_TOKEN, LABEL_CREATION_ID, LABEL_IMAGE_VOLUME, LABEL_MANAGED_BY, LABEL_NETWORK_EXTERNAL,
    LABEL_REGISTRY_HOST, LABEL_REGISTRY_HOST_IP, LABEL_REGISTRY_HOST_PORT,
    LABEL_REGISTRY_PROTOCOL, LABEL_ROLE, LABEL_SERVER_API_HOST, LABEL_SERVER_API_PORT,
    MANAGED_BY,
};

use super::projection::{ENV_PROXY_PASSWORD, ENV_PROXY_REMOTE_URL, ENV_PROXY_USERNAME};

pub const API_PORT: &str = "6443";
pub const REGISTRY_PORT: &str = "5000";
const IMAGE_VOLUME_MOUNT: &str = "/k3d/images";
const MAX_NAME_LEN: usize = 32;
/// Upper bound on servers, agents or batch nodes in one request
pub const MAX_NODES: u32 = 256;

/// Images used when a request does not name one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefaults {
    pub node: String,
    pub loadbalancer: String,
    pub registry: String,
}

impl ImageDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            node: config.node_image(),
            loadbalancer: config.loadbalancer_image.clone(),
            registry: config.registry_image.clone(),
        }
    }
}

pub fn server_name(cluster: &str, index: usize) -> String {
    format!("k3d-{}-server-{}", cluster, index)
}

pub fn agent_name(cluster: &str, index: usize) -> String {
    format!("k3d-{}-agent-{}", cluster, index)
}

pub fn loadbalancer_name(cluster: &str) -> String {
    format!("k3d-{}-serverlb", cluster)
}

pub fn default_network(cluster: &str) -> String {
    format!("k3d-{}", cluster)
}

pub fn image_volume_name(cluster: &str) -> String {
    format!("k3d-{}-images", cluster)
}

/// URL nodes use to join the cluster through its first server
pub fn join_url(first_server: &str) -> String {
    format!("https://{}:{}", first_server, API_PORT)
}

/// Cluster and node names become container hostnames
pub fn validate_name(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(AppError::validation(format!(
            "name '{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    let valid_chars = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(AppError::validation(format!(
            "name '{}' is not a valid hostname",
            name
        )));
    }
    Ok(())
}

/// Parse a human readable memory size (`512m`, `1.5GiB`, `2g`) into bytes
pub fn parse_memory(value: &str) -> AppResult<u64> {
    let invalid = || AppError::validation(format!("provided memory limit '{}' is invalid", value));

    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number: f64 = number.parse().map_err(|_| invalid())?;

    let unit = unit.trim_start().to_ascii_lowercase();
    let unit = unit.strip_suffix('b').unwrap_or(&unit);
    let unit = unit.strip_suffix('i').unwrap_or(unit);
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        _ => return Err(invalid()),
    };
    Ok((number * multiplier as f64) as u64)
}

fn validate_memory(value: Option<&str>) -> AppResult<()> {
    match value {
        Some(v) if !v.is_empty() => parse_memory(v).map(|_| ()),
        _ => Ok(()),
    }
}

/// Index selection inside a node filter. Ranges are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indices {
    Any,
    Ranges(Vec<(usize, usize)>),
}

impl Indices {
    fn contains(&self, index: usize) -> bool {
        match self {
            Self::Any => true,
            Self::Ranges(ranges) => ranges.iter().any(|&(start, end)| (start..=end).contains(&index)),
        }
    }

    /// Highest index named explicitly
    fn max(&self) -> Option<usize> {
        match self {
            Self::Any => None,
            Self::Ranges(ranges) => ranges.iter().map(|&(_, end)| end).max(),
        }
    }
}

/// k3d style node filter: `all`, `loadbalancer`, `server:0`, `agent:*`,
/// `agents:0,2`, `server:0-2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFilter {
    All,
    LoadBalancer,
    Role { role: NodeRole, indices: Indices },
}

impl FromStr for NodeFilter {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| AppError::validation(format!("node filter '{}': {}", s, why));
        let s = s.trim();
        match s {
            "all" => return Ok(Self::All),
            "loadbalancer" => return Ok(Self::LoadBalancer),
            _ => {}
        }

        let (role, spec) = s.split_once(':').unwrap_or((s, "*"));
        let role = match role {
            "server" | "servers" => NodeRole::Server,
            "agent" | "agents" => NodeRole::Agent,
            _ => return Err(invalid("unknown node group")),
        };

        if spec == "*" {
            return Ok(Self::Role {
                role,
                indices: Indices::Any,
            });
        }

        let mut ranges = Vec::new();
        for part in spec.split(',') {
            let parse = |n: &str| n.trim().parse::<usize>().map_err(|_| invalid("bad index"));
            let range = match part.split_once('-') {
                Some((start, end)) => (parse(start)?, parse(end)?),
                None => {
                    let index = parse(part)?;
                    (index, index)
                }
            };
            if range.0 > range.1 {
                return Err(invalid("empty range"));
            }
            ranges.push(range);
        }
        Ok(Self::Role {
            role,
            indices: Indices::Ranges(ranges),
        })
    }
}

impl NodeFilter {
    pub fn selects(&self, role: NodeRole, index: usize) -> bool {
        match self {
            Self::All => true,
            Self::LoadBalancer => role == NodeRole::LoadBalancer,
            Self::Role {
                role: wanted,
                indices,
            } => *wanted == role && indices.contains(index),
        }
    }
}

/// A node position in the planned cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    role: NodeRole,
    index: usize,
}

/// Parsed node filters of one request item. An empty list selects the
/// fallback set.
struct Filters {
    parsed: Vec<NodeFilter>,
}

impl Filters {
    fn parse(raw: &[String], what: &str, slots: &[Slot]) -> AppResult<Self> {
        let parsed = raw
            .iter()
            .map(|f| f.parse::<NodeFilter>())
            .collect::<AppResult<Vec<_>>>()?;
        for (filter, text) in parsed.iter().zip(raw) {
            if let NodeFilter::Role { role, indices } = filter {
                let available = slots.iter().filter(|s| s.role == *role).count();
                if indices.max().map_or(false, |max| max >= available) {
                    return Err(AppError::validation(format!(
                        "node filter '{}' of {} names an index beyond the {} {} node(s)",
                        text, what, available, role
                    )));
                }
            }
            if !slots.iter().any(|s| filter.selects(s.role, s.index)) {
                return Err(AppError::validation(format!(
                    "node filter '{}' of {} matches no node",
                    text, what
                )));
            }
        }
        Ok(Self { parsed })
    }

    fn selects(&self, slot: Slot, fallback: &[NodeFilter]) -> bool {
        let filters = if self.parsed.is_empty() {
            fallback
        } else {
            &self.parsed
        };
        filters.iter().any(|f| f.selects(slot.role, slot.index))
    }
}

/// Parse `[host_ip:][host_port:]container_port[/protocol]`
pub fn parse_port(value: &str) -> AppResult<PortSpec> {
    let invalid = || AppError::validation(format!("port mapping '{}' is invalid", value));
    let (mapping, protocol) = match value.rsplit_once('/') {
        Some((m, p)) if p == "tcp" || p == "udp" => (m, p),
        Some(_) => return Err(invalid()),
        None => (value, "tcp"),
    };

    let parts: Vec<&str> = mapping.split(':').collect();
    let (host_ip, host_port, container_port) = match parts.as_slice() {
        [c] => (None, None, *c),
        [h, c] => (None, Some(*h), *c),
        [ip, h, c] => (Some(*ip), Some(*h).filter(|h| !h.is_empty()), *c),
        _ => return Err(invalid()),
    };

    let is_port = |p: &str| p.parse::<u16>().map(|n| n > 0).unwrap_or(false);
    if !is_port(container_port) || host_port.map(|h| !is_port(h)).unwrap_or(false) {
        return Err(invalid());
    }

    Ok(PortSpec {
        host_ip: host_ip.map(str::to_string),
        host_port: host_port.map(str::to_string),
        container_port: container_port.to_string(),
        protocol: protocol.to_string(),
    })
}

/// A topology expanded into everything the runtime has to create
#[derive(Debug, Clone)]
pub struct ClusterPlan {
    pub name: String,
    pub network: String,
    /// The network was named by the caller and is not owned by the cluster
    pub network_external: bool,
    pub image_volume: Option<String>,
    pub token: String,
    pub labels: BTreeMap<String, String>,
    /// Servers, then agents, then the load balancer
    pub nodes: Vec<ContainerSpec>,
}

/// Expand and validate a topology
pub fn plan_cluster(topology: &ClusterTopology, images: &ImageDefaults) -> AppResult<ClusterPlan> {
    let name = topology.name.as_str();
    validate_name(name)?;
    if topology.servers == 0 {
        return Err(AppError::validation("a cluster needs at least one server"));
    }
    if topology.servers > MAX_NODES || topology.agents > MAX_NODES {
        return Err(AppError::validation(format!(
            "a cluster takes at most {} servers and {} agents",
            MAX_NODES, MAX_NODES
        )));
    }
    validate_memory(topology.runtime.servers_memory.as_deref())?;
    validate_memory(topology.runtime.agents_memory.as_deref())?;

    let servers = topology.servers as usize;
    let agents = topology.agents as usize;
    let with_lb = !topology.k3d.disable_loadbalancer;

    let mut slots: Vec<Slot> = (0..servers)
        .map(|index| Slot {
            role: NodeRole::Server,
            index,
        })
        .chain((0..agents).map(|index| Slot {
            role: NodeRole::Agent,
            index,
        }))
        .collect();
    if with_lb {
        slots.push(Slot {
            role: NodeRole::LoadBalancer,
            index: 0,
        });
    }

    let volumes = topology
        .volumes
        .iter()
        .map(|v| Ok((v.volume.clone(), Filters::parse(&v.node_filters, "volume", &slots)?)))
        .collect::<AppResult<Vec<_>>>()?;
    let ports = topology
        .ports
        .iter()
        .map(|p| Ok((parse_port(&p.port)?, Filters::parse(&p.node_filters, "port", &slots)?)))
        .collect::<AppResult<Vec<_>>>()?;
    let env = topology
        .env
        .iter()
        .map(|e| {
            if !e.env.contains('=') {
                return Err(AppError::validation(format!("env '{}' is not KEY=value", e.env)));
            }
            Ok((e.env.clone(), Filters::parse(&e.node_filters, "env", &slots)?))
        })
        .collect::<AppResult<Vec<_>>>()?;
    let node_labels = topology
        .labels
        .iter()
        .map(|l| Ok((format!("{}={}", l.key, l.value), Filters::parse(&l.node_filters, "label", &slots)?)))
        .collect::<AppResult<Vec<_>>>()?;
    let k3s_args = topology
        .k3s_args
        .iter()
        .map(|a| Ok((a.arg.clone(), Filters::parse(&a.node_filters, "k3s arg", &slots)?)))
        .collect::<AppResult<Vec<_>>>()?;
    let runtime_labels = topology
        .runtime
        .labels
        .iter()
        .map(|l| Ok((l.key.clone(), l.value.clone(), Filters::parse(&l.node_filters, "runtime label", &slots)?)))
        .collect::<AppResult<Vec<_>>>()?;

    let network = topology
        .network
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default_network(name));
    let network_external = topology.network.as_deref().map_or(false, |n| !n.is_empty());
    let image_volume = (!topology.k3d.disable_image_volume).then(|| image_volume_name(name));
    let token = topology
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let node_image = topology
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| images.node.clone());

    let api_host_ip = topology
        .kube_api
        .host_ip
        .clone()
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let api_host = topology
        .kube_api
        .host
        .clone()
        .unwrap_or_else(|| api_host_ip.clone());
    let api_port = PortSpec {
        host_ip: Some(api_host_ip),
        host_port: topology.kube_api.host_port.clone(),
        container_port: API_PORT.to_string(),
        protocol: "tcp".to_string(),
    };

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_CLUSTER.to_string(), name.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());

    let all = [NodeFilter::All];
    let port_fallback = if with_lb {
        vec![NodeFilter::LoadBalancer]
    } else {
        vec![NodeFilter::Role {
            role: NodeRole::Server,
            indices: Indices::Ranges(vec![(0, 0)]),
        }]
    };
    let first_server = server_name(name, 0);
    let extra_hosts: Vec<String> = topology
        .host_aliases
        .iter()
        .flat_map(|a| a.hostnames.iter().map(move |h| format!("{}:{}", h, a.ip)))
        .collect();

    let mut nodes = Vec::with_capacity(slots.len());
    for slot in &slots {
        let mut spec = ContainerSpec {
            network: Some(network.clone()),
            extra_hosts: extra_hosts.clone(),
            restart: true,
            ..Default::default()
        };
        spec.labels = labels.clone();
        spec.labels.insert(LABEL_ROLE.to_string(), slot.role.to_string());
        spec.labels.insert(LABEL_CLUSTER_TOKEN.to_string(), token.clone());
        spec.labels.insert(LABEL_CLUSTER_NETWORK.to_string(), network.clone());
        spec.labels.insert(LABEL_NETWORK_EXTERNAL.to_string(), network_external.to_string());
        if let Some(volume) = &image_volume {
            spec.labels.insert(LABEL_IMAGE_VOLUME.to_string(), volume.clone());
        }
        for (key, value, filters) in &runtime_labels {
            if filters.selects(*slot, &all) {
                spec.labels.insert(key.clone(), value.clone());
            }
        }

        match slot.role {
            NodeRole::LoadBalancer => {
                spec.name = loadbalancer_name(name);
                spec.image = images.loadbalancer.clone();
                let server_names: Vec<String> = (0..servers).map(|i| server_name(name, i)).collect();
                spec.env.push(format!("SERVERS={}", server_names.join(",")));
                spec.env.push(format!("PORTS={}", API_PORT));
                spec.ports.push(api_port.clone());
            }
            role => {
                let is_server = role == NodeRole::Server;
                spec.name = if is_server {
                    server_name(name, slot.index)
                } else {
                    agent_name(name, slot.index)
                };
                spec.image = node_image.clone();
                spec.privileged = true;
                spec.env.push(format!("K3S_TOKEN={}", token));
                let memory = if is_server {
                    &topology.runtime.servers_memory
                } else {
                    &topology.runtime.agents_memory
                };
                spec.memory = memory.clone().filter(|m| !m.is_empty());

                spec.cmd.push(role.to_string());
                if is_server {
                    spec.labels.insert(LABEL_SERVER_API_HOST.to_string(), api_host.clone());
                    if let Some(port) = &topology.kube_api.host_port {
                        spec.labels.insert(LABEL_SERVER_API_PORT.to_string(), port.clone());
                    }
                    spec.cmd.push("--tls-san".to_string());
                    spec.cmd.push(api_host.clone());
                    if slot.index == 0 && servers > 1 {
                        spec.cmd.push("--cluster-init".to_string());
                    }
                    if !with_lb && slot.index == 0 {
                        spec.ports.push(api_port.clone());
                    }
                }
                if !is_server || slot.index > 0 {
                    spec.env.push(format!("K3S_URL={}", join_url(&first_server)));
                }
                if let Some(volume) = &image_volume {
                    spec.volumes.push(format!("{}:{}", volume, IMAGE_VOLUME_MOUNT));
                }
                for (label, filters) in &node_labels {
                    if filters.selects(*slot, &all) {
                        spec.cmd.push("--node-label".to_string());
                        spec.cmd.push(label.clone());
                    }
                }
                for (arg, filters) in &k3s_args {
                    if filters.selects(*slot, &all) {
                        spec.cmd.push(arg.clone());
                    }
                }
            }
        }

        for (volume, filters) in &volumes {
            if filters.selects(*slot, &all) {
                spec.volumes.push(volume.clone());
            }
        }
        for (kv, filters) in &env {
            if filters.selects(*slot, &all) {
                spec.env.push(kv.clone());
            }
        }
        for (port, filters) in &ports {
            if filters.selects(*slot, &port_fallback) {
                spec.ports.push(port.clone());
            }
        }
        nodes.push(spec);
    }

    Ok(ClusterPlan {
        name: name.to_string(),
        network,
        network_external,
        image_volume,
        token,
        labels,
        nodes,
    })
}

/// Validate a node batch before anything touches the runtime
pub fn validate_batch(batch: &NodeBatch) -> AppResult<()> {
    validate_name(&batch.name)?;
    if !matches!(batch.role, NodeRole::Server | NodeRole::Agent) {
        return Err(AppError::validation(format!(
            "nodes can only be added as server or agent, not {}",
            batch.role
        )));
    }
    if batch.count > MAX_NODES {
        return Err(AppError::validation(format!(
            "a batch adds at most {} nodes, not {}",
            MAX_NODES, batch.count
        )));
    }
    if batch.start_from >= batch.count {
        return Err(AppError::validation(format!(
            "start_from {} leaves no node to create out of {}",
            batch.start_from, batch.count
        )));
    }
    validate_memory(batch.memory.as_deref())
}

/// Names of the nodes a batch will create
pub fn batch_node_names(batch: &NodeBatch) -> Vec<String> {
    (batch.start_from..batch.count)
        .map(|i| format!("{}-{}", batch.name, i))
        .collect()
}

/// Container specs joining a batch of nodes to an existing cluster
pub fn node_batch_specs(
    batch: &NodeBatch,
    cluster: &Cluster,
    first_server: &str,
    batch_label: &str,
    creation_id: &str,
    images: &ImageDefaults,
) -> Vec<ContainerSpec> {
    let image = batch
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| images.node.clone());

    batch_node_names(batch)
        .into_iter()
        .map(|name| {
            let mut labels = BTreeMap::new();
            labels.insert(LABEL_CLUSTER.to_string(), cluster.name.clone());
            labels.insert(LABEL_ROLE.to_string(), batch.role.to_string());
            labels.insert(LABEL_BATCH.to_string(), batch_label.to_string());
            labels.insert(LABEL_CREATION_ID.to_string(), creation_id.to_string());
            labels.insert(LABEL_CLUSTER_TOKEN.to_string(), cluster.token.clone());
            labels.insert(LABEL_CLUSTER_NETWORK.to_string(), cluster.network.clone());
            labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());

            let mut volumes = Vec::new();
            if !cluster.image_volume.is_empty() {
                labels.insert(LABEL_IMAGE_VOLUME.to_string(), cluster.image_volume.clone());
                volumes.push(format!("{}:{}", cluster.image_volume, IMAGE_VOLUME_MOUNT));
            }

            ContainerSpec {
                name,
                image: image.clone(),
                labels,
                env: vec![
                    format!("K3S_TOKEN={}", cluster.token),
                    format!("K3S_URL={}", join_url(first_server)),
                ],
                cmd: vec![batch.role.to_string()],
                volumes,
                ports: Vec::new(),
                network: Some(cluster.network.clone()),
                memory: batch.memory.clone().filter(|m| !m.is_empty()),
                extra_hosts: Vec::new(),
                restart: true,
                privileged: true,
            }
        })
        .collect()
}

/// Registry container spec. `proxy` must already be vetted for completeness.
pub fn registry_spec(
    request: &RegistryRequest,
    expose: &Expose,
    proxy: Option<&ProxyConfig>,
    images: &ImageDefaults,
) -> AppResult<ContainerSpec> {
    validate_name(&request.name)?;
    let host = request
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| request.name.clone());

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_ROLE.to_string(), NodeRole::Registry.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_REGISTRY_HOST.to_string(), host);
    labels.insert(LABEL_REGISTRY_HOST_IP.to_string(), expose.host_ip.clone());
    labels.insert(LABEL_REGISTRY_HOST_PORT.to_string(), expose.host_port.clone());
    labels.insert(LABEL_REGISTRY_PROTOCOL.to_string(), request.protocol.clone());
    if let Some(cluster) = request.cluster.as_ref().filter(|c| !c.is_empty()) {
        labels.insert(LABEL_CLUSTER.to_string(), cluster.clone());
    }

    let mut env = Vec::new();
    if let Some(proxy) = proxy {
        env.push(format!("{}={}", ENV_PROXY_REMOTE_URL, proxy.remote_url));
        env.push(format!("{}={}", ENV_PROXY_USERNAME, proxy.username));
        env.push(format!("{}={}", ENV_PROXY_PASSWORD, proxy.password));
    }

    Ok(ContainerSpec {
        name: request.name.clone(),
        image: request
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| images.registry.clone()),
        labels,
        env,
        ports: vec![PortSpec {
            host_ip: Some(expose.host_ip.clone()),
            host_port: Some(expose.host_port.clone()),
            container_port: REGISTRY_PORT.to_string(),
            protocol: "tcp".to_string(),
        }],
        restart: true,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{K3dOptions, PortWithFilters, VolumeWithFilters};

    fn images() -> ImageDefaults {
        ImageDefaults {
            node: "rancher/k3s:v1.28.8-k3s1".to_string(),
            loadbalancer: "ghcr.io/k3d-io/k3d-proxy:5.6.0".to_string(),
            registry: "docker.io/library/registry:2".to_string(),
        }
    }

    fn topology(name: &str, servers: u32, agents: u32) -> ClusterTopology {
        ClusterTopology {
            name: name.to_string(),
            servers,
            agents,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m").unwrap(), 512 << 20);
        assert_eq!(parse_memory("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_memory("1.5g").unwrap(), 3 << 29);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("10x").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn test_node_filters() {
        let f: NodeFilter = "agent:*".parse().unwrap();
        assert!(f.selects(NodeRole::Agent, 3));
        assert!(!f.selects(NodeRole::Server, 0));

        let f: NodeFilter = "servers:0,2-3".parse().unwrap();
        assert!(f.selects(NodeRole::Server, 0));
        assert!(!f.selects(NodeRole::Server, 1));
        assert!(f.selects(NodeRole::Server, 3));

        assert!("loadbalancer".parse::<NodeFilter>().unwrap().selects(NodeRole::LoadBalancer, 0));
        assert!("worker:0".parse::<NodeFilter>().is_err());
        assert!("server:x".parse::<NodeFilter>().is_err());
    }

    #[test]
    fn test_parse_port() {
        let p = parse_port("0.0.0.0:8080:80/tcp").unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("0.0.0.0"));
        assert_eq!(p.host_port.as_deref(), Some("8080"));
        assert_eq!(p.container_port, "80");

        let p = parse_port("9000:9000/udp").unwrap();
        assert_eq!(p.protocol, "udp");
        assert!(parse_port("80/sctp").is_err());
        assert!(parse_port("0:80").is_err());
    }

    #[test]
    fn test_plan_names_and_join_wiring() {
        let plan = plan_cluster(&topology("dev", 2, 1), &images()).unwrap();
        let names: Vec<_> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "k3d-dev-server-0",
                "k3d-dev-server-1",
                "k3d-dev-agent-0",
                "k3d-dev-serverlb"
            ]
        );
        assert_eq!(plan.network, "k3d-dev");
        assert!(!plan.network_external);
        assert_eq!(plan.image_volume.as_deref(), Some("k3d-dev-images"));

        let s0 = &plan.nodes[0];
        assert!(s0.cmd.contains(&"--cluster-init".to_string()));
        assert!(!s0.env.iter().any(|e| e.starts_with("K3S_URL=")));

        let s1 = &plan.nodes[1];
        assert!(s1
            .env
            .contains(&"K3S_URL=https://k3d-dev-server-0:6443".to_string()));

        let lb = &plan.nodes[3];
        assert_eq!(lb.ports[0].container_port, API_PORT);
        assert_eq!(lb.labels[LABEL_ROLE], "loadbalancer");
    }

    #[test]
    fn test_plan_without_loadbalancer_exposes_first_server() {
        let mut t = topology("solo", 1, 0);
        t.k3d = K3dOptions {
            disable_loadbalancer: true,
            disable_image_volume: true,
            ..Default::default()
        };
        t.ports.push(PortWithFilters {
            port: "8080:80".to_string(),
            node_filters: vec![],
        });
        let plan = plan_cluster(&t, &images()).unwrap();
        assert_eq!(plan.nodes.len(), 1);
        assert!(plan.image_volume.is_none());
        let ports: Vec<_> = plan.nodes[0].ports.iter().map(|p| p.port_key()).collect();
        assert_eq!(ports, vec!["6443/tcp", "80/tcp"]);
    }

    #[test]
    fn test_plan_rejects_bad_input() {
        assert!(plan_cluster(&topology("", 1, 0), &images()).is_err());
        assert!(plan_cluster(&topology("Bad_Name", 1, 0), &images()).is_err());
        assert!(plan_cluster(&topology("dev", 0, 1), &images()).is_err());

        let mut t = topology("dev", 1, 0);
        t.runtime.agents_memory = Some("plenty".to_string());
        assert!(plan_cluster(&t, &images()).is_err());

        let mut t = topology("dev", 1, 1);
        t.volumes.push(VolumeWithFilters {
            volume: "/tmp:/data".to_string(),
            node_filters: vec!["agent:4".to_string()],
        });
        let err = plan_cluster(&t, &images()).unwrap_err();
        assert!(err.to_string().contains("beyond the 1 agent node(s)"));

        let mut t = topology("dev", 1, 0);
        t.volumes.push(VolumeWithFilters {
            volume: "/tmp:/data".to_string(),
            node_filters: vec!["agent:*".to_string()],
        });
        let err = plan_cluster(&t, &images()).unwrap_err();
        assert!(err.to_string().contains("matches no node"));
    }

    #[test]
    fn test_huge_ranges_and_counts_rejected() {
        let f: NodeFilter = "server:0-4000000000".parse().unwrap();
        assert!(f.selects(NodeRole::Server, 3_999_999_999));

        let mut t = topology("dev", 1, 0);
        t.volumes.push(VolumeWithFilters {
            volume: "/tmp:/data".to_string(),
            node_filters: vec!["server:0-4000000000".to_string()],
        });
        assert!(matches!(
            plan_cluster(&t, &images()),
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            plan_cluster(&topology("dev", 1, u32::MAX), &images()),
            Err(AppError::Validation(_))
        ));

        let batch = NodeBatch {
            name: "extra".to_string(),
            cluster: "dev".to_string(),
            role: NodeRole::Agent,
            count: u32::MAX,
            start_from: 0,
            image: None,
            memory: None,
            wait: false,
            timeout_secs: None,
            batch: None,
        };
        assert!(matches!(validate_batch(&batch), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_batch_names_start_from() {
        let batch = NodeBatch {
            name: "extra".to_string(),
            cluster: "dev".to_string(),
            role: NodeRole::Agent,
            count: 4,
            start_from: 2,
            image: None,
            memory: None,
            wait: false,
            timeout_secs: None,
            batch: None,
        };
        assert_eq!(batch_node_names(&batch), vec!["extra-2", "extra-3"]);
        assert!(validate_batch(&batch).is_ok());

        let lb = NodeBatch {
            role: NodeRole::LoadBalancer,
            ..batch.clone()
        };
        assert!(validate_batch(&lb).is_err());
    }
}
