//! Pure projections from runtime containers to lifecycle entities
//!
//! Clusters are never stored: every read regroups the containers carrying
//! `k3d.cluster=<name>`. Registries are containers with `k3d.role=registry`.

use std::collections::BTreeSet;

use crate::models::{Cluster, ConnectionState, Expose, Node, ProxyConfig, Registry, RegistryStatus};
use crate::runtime::{
    Container, NodeRole, LABEL_BATCH, LABEL_CLUSTER_NETWORK, LABEL_CLUSTER_TOKEN,
    LABEL_IMAGE_VOLUME, LABEL_REGISTRY_HOST, LABEL_REGISTRY_HOST_IP, LABEL_REGISTRY_HOST_PORT,
    LABEL_REGISTRY_PROTOCOL,
};

pub const ENV_PROXY_REMOTE_URL: &str = "REGISTRY_PROXY_REMOTEURL";
pub const ENV_PROXY_USERNAME: &str = "REGISTRY_PROXY_USERNAME";
pub const ENV_PROXY_PASSWORD: &str = "REGISTRY_PROXY_PASSWORD";

/// Project a container into a node. Containers without a role label are not
/// k3d nodes.
pub fn node_from_container(container: &Container) -> Option<Node> {
    let role = container.role()?;
    Some(Node {
        name: container.name.clone(),
        role,
        cluster: container.cluster().unwrap_or_default().to_string(),
        state: container.state.status.clone(),
        running: container.state.running,
        created: container.created.clone(),
        memory: container.memory.clone(),
        image: container.image.clone(),
        volumes: container.volumes.clone(),
        networks: container.networks.clone(),
        env: container.env.clone(),
        ports: container.ports.clone(),
        batch: container.label(LABEL_BATCH).map(str::to_string),
    })
}

fn first_label(members: &[&Container], key: &str) -> String {
    members
        .iter()
        .find_map(|c| c.label(key))
        .unwrap_or_default()
        .to_string()
}

/// Build one cluster from its member containers. Registries are never
/// members, even when labelled with the cluster they were created for.
pub fn cluster_from_containers(name: &str, containers: &[Container]) -> Option<Cluster> {
    let mut members: Vec<&Container> = containers
        .iter()
        .filter(|c| c.cluster() == Some(name))
        .filter(|c| !matches!(c.role(), Some(NodeRole::Registry) | None))
        .collect();
    if members.is_empty() {
        return None;
    }
    members.sort_by(|a, b| a.name.cmp(&b.name));

    let tier = |role: NodeRole| {
        let nodes: Vec<_> = members.iter().filter(|c| c.role() == Some(role)).collect();
        let running = nodes.iter().filter(|c| c.state.running).count();
        (nodes.len(), running)
    };
    let (servers_count, servers_running) = tier(NodeRole::Server);
    let (agents_count, agents_running) = tier(NodeRole::Agent);

    let mut network = first_label(&members, LABEL_CLUSTER_NETWORK);
    if network.is_empty() {
        network = members
            .iter()
            .find_map(|c| c.networks.first().cloned())
            .unwrap_or_default();
    }

    Some(Cluster {
        name: name.to_string(),
        network,
        token: first_label(&members, LABEL_CLUSTER_TOKEN),
        nodes: members.iter().map(|c| c.name.clone()).collect(),
        servers_count,
        servers_running,
        agents_count,
        agents_running,
        image_volume: first_label(&members, LABEL_IMAGE_VOLUME),
        has_loadbalancer: members
            .iter()
            .any(|c| c.role() == Some(NodeRole::LoadBalancer)),
    })
}

/// Group every labelled container into clusters, sorted by name
pub fn group_clusters(containers: &[Container]) -> Vec<Cluster> {
    let names: BTreeSet<&str> = containers
        .iter()
        .filter(|c| !matches!(c.role(), Some(NodeRole::Registry) | None))
        .filter_map(Container::cluster)
        .collect();
    names
        .into_iter()
        .filter_map(|name| cluster_from_containers(name, containers))
        .collect()
}

pub fn registry_from_container(container: &Container) -> Registry {
    let proxy = container
        .env_value(ENV_PROXY_REMOTE_URL)
        .filter(|url| !url.is_empty())
        .map(|url| ProxyConfig {
            remote_url: url.to_string(),
            username: container
                .env_value(ENV_PROXY_USERNAME)
                .unwrap_or_default()
                .to_string(),
            password: container
                .env_value(ENV_PROXY_PASSWORD)
                .unwrap_or_default()
                .to_string(),
        });

    Registry {
        name: container.name.clone(),
        image: container.image.clone(),
        cluster: container.cluster().map(str::to_string),
        protocol: container
            .label(LABEL_REGISTRY_PROTOCOL)
            .unwrap_or("http")
            .to_string(),
        host: container
            .label(LABEL_REGISTRY_HOST)
            .unwrap_or(container.name.as_str())
            .to_string(),
        expose: Expose {
            host_ip: container
                .label(LABEL_REGISTRY_HOST_IP)
                .unwrap_or_default()
                .to_string(),
            host_port: container
                .label(LABEL_REGISTRY_HOST_PORT)
                .unwrap_or_default()
                .to_string(),
        },
        proxy,
        networks: container.networks.clone(),
        state: container.state.status.clone(),
    }
}

/// Connected iff the cluster network is among the registry's networks
pub fn registry_status(registry: &Registry, cluster: &Cluster) -> RegistryStatus {
    let state = if registry.networks.iter().any(|n| *n == cluster.network) {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    };
    RegistryStatus {
        registry: registry.name.clone(),
        cluster: cluster.name.clone(),
        state,
    }
}

/// Keep items whose name is in `names`
pub fn retain_named<T, F>(items: Vec<T>, names: &[String], name_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    items
        .into_iter()
        .filter(|item| names.iter().any(|n| n == name_of(item)))
        .collect()
}
