//! In-memory runtime
//!
//! Keeps containers, networks and volumes in process memory with the same
//! uniqueness and membership rules the docker engine enforces. Faults can be
//! queued to make the next matching call fail.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Utc;
use kube::config::Kubeconfig;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    api_endpoint, Container, ContainerSpec, ContainerState, CreateOptions, DeleteOptions,
    ImportOptions, LabelSelector, NodeRole, PortBinding, Runtime,
};
use crate::error::{AppError, AppResult};

const DEFAULT_NETWORK: &str = "bridge";
const FIRST_HOST_PORT: u16 = 40000;

/// One-shot failure injected into the next matching call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    CreateNetwork,
    /// Create the first `after` containers of the batch, then fail
    CreateContainers { after: usize },
    StartContainer(String),
    StopContainer(String),
    DeleteContainer(String),
    DeleteNetwork,
    AttachNetwork(String),
    DetachNetwork(String),
    RunRegistry,
    Kubeconfig(String),
    ImportImages,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, Container>,
    networks: BTreeMap<String, BTreeMap<String, String>>,
    volumes: BTreeSet<String>,
    images: BTreeMap<String, Vec<String>>,
    faults: Vec<Fault>,
    next_port: u16,
}

impl State {
    fn take_fault(&mut self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let idx = self.faults.iter().position(pred)?;
        Some(self.faults.remove(idx))
    }

    fn allocate_port(&mut self) -> AppResult<String> {
        if self.next_port < FIRST_HOST_PORT {
            self.next_port = FIRST_HOST_PORT;
        }
        let port = self.next_port;
        self.next_port = port
            .checked_add(1)
            .ok_or_else(|| AppError::runtime("no free host ports left"))?;
        Ok(port.to_string())
    }

    fn container_mut(&mut self, name: &str) -> AppResult<&mut Container> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| AppError::not_found(format!("container {}", name)))
    }

    fn build(&mut self, spec: &ContainerSpec) -> AppResult<Container> {
        let mut ports: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
        for port in &spec.ports {
            let binding = PortBinding {
                host_ip: port.host_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                host_port: match &port.host_port {
                    Some(p) => p.clone(),
                    None => self.allocate_port()?,
                },
            };
            ports.entry(port.port_key()).or_default().push(binding);
        }

        Ok(Container {
            name: spec.name.clone(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
            state: ContainerState {
                status: "running".to_string(),
                running: true,
            },
            created: Utc::now().to_rfc3339(),
            memory: spec.memory.clone().unwrap_or_default(),
            volumes: spec.volumes.clone(),
            networks: vec![spec
                .network
                .clone()
                .unwrap_or_else(|| DEFAULT_NETWORK.to_string())],
            env: spec.env.clone(),
            ports,
        })
    }
}

/// Runtime backed by process memory
#[derive(Default)]
pub struct MemoryRuntime {
    state: RwLock<State>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .networks
            .insert(DEFAULT_NETWORK.to_string(), BTreeMap::new());
        Self {
            state: RwLock::new(state),
        }
    }

    /// Queue a fault; it fires once on the next matching call
    pub async fn inject(&self, fault: Fault) {
        self.state.write().await.faults.push(fault);
    }

    pub async fn network_exists(&self, name: &str) -> bool {
        self.state.read().await.networks.contains_key(name)
    }

    pub async fn volume_exists(&self, name: &str) -> bool {
        self.state.read().await.volumes.contains(name)
    }

    pub async fn container_names(&self) -> Vec<String> {
        self.state.read().await.containers.keys().cloned().collect()
    }

    /// Images imported into a node so far
    pub async fn images_on(&self, node: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .images
            .get(node)
            .cloned()
            .unwrap_or_default()
    }
}

fn injected(op: &str) -> AppError {
    AppError::runtime(format!("injected failure: {}", op))
}

#[async_trait]
impl Runtime for MemoryRuntime {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.take_fault(|f| *f == Fault::CreateNetwork).is_some() {
            return Err(injected("create network"));
        }
        if state.networks.contains_key(name) {
            return Err(AppError::already_exists(format!("network {}", name)));
        }
        state.networks.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.take_fault(|f| *f == Fault::DeleteNetwork).is_some() {
            return Err(injected("delete network"));
        }
        if !state.networks.contains_key(name) {
            return Err(AppError::not_found(format!("network {}", name)));
        }
        let in_use = state
            .containers
            .values()
            .any(|c| c.networks.iter().any(|n| n == name));
        if in_use {
            return Err(AppError::runtime(format!(
                "network {} has active endpoints",
                name
            )));
        }
        state.networks.remove(name);
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> AppResult<()> {
        self.state.write().await.volumes.insert(name.to_string());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> AppResult<()> {
        if self.state.write().await.volumes.remove(name) {
            Ok(())
        } else {
            Err(AppError::not_found(format!("volume {}", name)))
        }
    }

    async fn create_containers(
        &self,
        specs: &[ContainerSpec],
        _options: CreateOptions,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let budget = match state.take_fault(|f| matches!(f, Fault::CreateContainers { .. })) {
            Some(Fault::CreateContainers { after }) => Some(after),
            _ => None,
        };

        for (idx, spec) in specs.iter().enumerate() {
            if budget == Some(idx) {
                return Err(injected(&format!("create container {}", spec.name)));
            }
            if state.containers.contains_key(&spec.name) {
                return Err(AppError::already_exists(format!("container {}", spec.name)));
            }
            if let Some(network) = &spec.network {
                if !state.networks.contains_key(network) {
                    return Err(AppError::not_found(format!("network {}", network)));
                }
            }
            let container = state.build(spec)?;
            debug!(container = %spec.name, "created container");
            state.containers.insert(spec.name.clone(), container);
        }
        Ok(())
    }

    async fn list_containers(&self, selector: &LabelSelector) -> AppResult<Vec<Container>> {
        Ok(self
            .state
            .read()
            .await
            .containers
            .values()
            .filter(|c| selector.matches(&c.labels))
            .cloned()
            .collect())
    }

    async fn get_container(&self, name: &str) -> AppResult<Container> {
        self.state
            .read()
            .await
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("container {}", name)))
    }

    async fn start_container(&self, name: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state
            .take_fault(|f| *f == Fault::StartContainer(name.to_string()))
            .is_some()
        {
            return Err(injected(&format!("start {}", name)));
        }
        let container = state.container_mut(name)?;
        container.state = ContainerState {
            status: "running".to_string(),
            running: true,
        };
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state
            .take_fault(|f| *f == Fault::StopContainer(name.to_string()))
            .is_some()
        {
            return Err(injected(&format!("stop {}", name)));
        }
        let container = state.container_mut(name)?;
        container.state = ContainerState {
            status: "exited".to_string(),
            running: false,
        };
        Ok(())
    }

    async fn delete_container(&self, name: &str, options: DeleteOptions) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state
            .take_fault(|f| *f == Fault::DeleteContainer(name.to_string()))
            .is_some()
        {
            return Err(injected(&format!("delete {}", name)));
        }
        let running = state.container_mut(name)?.state.running;
        if running && !options.force {
            return Err(AppError::runtime(format!(
                "container {} is running, stop it first or force removal",
                name
            )));
        }
        state.containers.remove(name);
        state.images.remove(name);
        Ok(())
    }

    async fn attach_network(&self, container: &str, network: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state
            .take_fault(|f| *f == Fault::AttachNetwork(container.to_string()))
            .is_some()
        {
            return Err(injected(&format!("attach {}", container)));
        }
        if !state.networks.contains_key(network) {
            return Err(AppError::not_found(format!("network {}", network)));
        }
        let entry = state.container_mut(container)?;
        if entry.networks.iter().any(|n| n == network) {
            return Err(AppError::already_exists(format!(
                "endpoint {} in network {}",
                container, network
            )));
        }
        entry.networks.push(network.to_string());
        Ok(())
    }

    async fn detach_network(&self, container: &str, network: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state
            .take_fault(|f| *f == Fault::DetachNetwork(container.to_string()))
            .is_some()
        {
            return Err(injected(&format!("detach {}", container)));
        }
        let entry = state.container_mut(container)?;
        let before = entry.networks.len();
        entry.networks.retain(|n| n != network);
        if entry.networks.len() == before {
            return Err(AppError::not_found(format!(
                "endpoint {} in network {}",
                container, network
            )));
        }
        Ok(())
    }

    async fn run_registry(&self, spec: &ContainerSpec) -> AppResult<Container> {
        {
            let mut state = self.state.write().await;
            if state.take_fault(|f| *f == Fault::RunRegistry).is_some() {
                return Err(injected("run registry"));
            }
        }
        self.create_containers(std::slice::from_ref(spec), CreateOptions::default())
            .await?;
        self.get_container(&spec.name).await
    }

    async fn kubeconfig(&self, cluster: &str) -> AppResult<Kubeconfig> {
        let mut state = self.state.write().await;
        if state
            .take_fault(|f| *f == Fault::Kubeconfig(cluster.to_string()))
            .is_some()
        {
            return Err(injected(&format!("kubeconfig {}", cluster)));
        }

        let members: Vec<Container> = state
            .containers
            .values()
            .filter(|c| c.cluster() == Some(cluster))
            .cloned()
            .collect();
        if !members.iter().any(|c| c.role() == Some(NodeRole::Server)) {
            return Err(AppError::not_found(format!("server node of cluster {}", cluster)));
        }
        let (host, port) =
            api_endpoint(&members).unwrap_or_else(|| ("0.0.0.0".to_string(), "6443".to_string()));

        let name = format!("k3d-{}", cluster);
        let user = format!("admin@{}", name);
        let doc = format!(
            r#"apiVersion: v1
kind: Config
clusters:
- name: {name}
  cluster:
    server: https://{host}:{port}
    certificate-authority-data: bWVtb3J5LWNh
contexts:
- name: {name}
  context:
    cluster: {name}
    user: {user}
users:
- name: {user}
  user:
    client-certificate-data: bWVtb3J5LWNlcnQ=
    client-key-data: bWVtb3J5LWtleQ==
current-context: {name}
preferences: {{}}
"#
        );
        Kubeconfig::from_yaml(&doc).map_err(|e| AppError::kubeconfig(e.to_string()))
    }

    async fn import_images(
        &self,
        nodes: &[String],
        images: &[String],
        _options: ImportOptions,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if state.take_fault(|f| *f == Fault::ImportImages).is_some() {
            return Err(injected("import images"));
        }
        for node in nodes {
            if !state.containers.contains_key(node) {
                return Err(AppError::not_found(format!("container {}", node)));
            }
        }
        for node in nodes {
            let loaded = state.images.entry(node.clone()).or_default();
            for image in images {
                if !loaded.contains(image) {
                    loaded.push(image.clone());
                }
            }
        }
        Ok(())
    }
}
