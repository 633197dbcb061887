use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::config::Kubeconfig;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    api_endpoint, Container, ContainerSpec, ContainerState, CreateOptions, DeleteOptions,
    ImportOptions, LabelSelector, NodeRole, PortBinding, Runtime,
};
use crate::error::{AppError, AppResult};

const K3S_KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";
const NODE_TARBALL: &str = "/tmp/k3d-images.tar";
const DEFAULT_WAIT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime driving the docker CLI
#[derive(Clone)]
pub struct DockerRuntime {
    bin: String,
}

impl DockerRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Run one docker command, returning stdout. `subject` names the object
    /// for error classification.
    async fn run<I, S>(&self, subject: &str, args: I) -> AppResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        debug!(command = ?cmd.as_std(), "docker");

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            Ok(stdout.to_string())
        } else {
            Err(classify(subject, &stderr))
        }
    }

    async fn inspect(&self, ids: &[String]) -> AppResult<Vec<Container>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string(), "--type".to_string(), "container".to_string()];
        args.extend(ids.iter().cloned());
        let raw = self.run(&format!("container {}", ids.join(",")), &args).await?;
        let records: Vec<InspectRecord> = serde_json::from_str(&raw)?;
        Ok(records.into_iter().map(Container::from).collect())
    }

    async fn wait_running(&self, names: &[String], timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        for name in names {
            loop {
                let container = self.get_container(name).await?;
                if container.state.running {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(AppError::runtime(format!(
                        "container {} not running after {:?}",
                        name, timeout
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        Ok(())
    }
}

/// Map docker CLI stderr onto the crate's error kinds
fn classify(subject: &str, stderr: &str) -> AppError {
    let msg = stderr.trim();
    if msg.contains("No such") || msg.contains("not found") || msg.contains("is not connected") {
        AppError::not_found(subject.to_string())
    } else if msg.contains("already exists") || msg.contains("is already in use") {
        AppError::already_exists(subject.to_string())
    } else {
        AppError::runtime(format!("{}: {}", subject, msg))
    }
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    for (k, v) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", k, v));
    }
    for env in &spec.env {
        args.push("--env".to_string());
        args.push(env.clone());
    }
    for volume in &spec.volumes {
        args.push("--volume".to_string());
        args.push(volume.clone());
    }
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(port.to_publish_arg());
    }
    for host in &spec.extra_hosts {
        args.push("--add-host".to_string());
        args.push(host.clone());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(memory) = &spec.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if spec.restart {
        args.push("--restart".to_string());
        args.push("unless-stopped".to_string());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    name: String,
    created: String,
    config: InspectConfig,
    state: InspectState,
    #[serde(default)]
    host_config: InspectHostConfig,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
    #[serde(default)]
    mounts: Vec<InspectMount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    memory: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<InspectPort>>>>,
}

#[derive(Debug, Deserialize)]
struct InspectPort {
    #[serde(rename = "HostIp")]
    host_ip: String,
    #[serde(rename = "HostPort")]
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source: String,
    destination: String,
}

impl From<InspectRecord> for Container {
    fn from(r: InspectRecord) -> Self {
        let ports = r
            .network_settings
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|(key, bindings)| {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| PortBinding {
                        host_ip: b.host_ip,
                        host_port: b.host_port,
                    })
                    .collect();
                (key, bindings)
            })
            .collect();

        let volumes = r
            .mounts
            .into_iter()
            .map(|m| {
                let source = m.name.filter(|n| !n.is_empty()).unwrap_or(m.source);
                format!("{}:{}", source, m.destination)
            })
            .collect();

        Container {
            name: r.name.trim_start_matches('/').to_string(),
            image: r.config.image,
            labels: r.config.labels.unwrap_or_default(),
            state: ContainerState {
                status: r.state.status,
                running: r.state.running,
            },
            created: r.created,
            memory: if r.host_config.memory > 0 {
                r.host_config.memory.to_string()
            } else {
                String::new()
            },
            volumes,
            networks: r.network_settings.networks.into_keys().collect(),
            env: r.config.env.unwrap_or_default(),
            ports,
        }
    }
}

/// Set `path` below `value`, creating missing mappings on the way. Any
/// other node type on the path is an error.
fn set_path(value: &mut Value, path: &[&str], to: &str) -> AppResult<()> {
    let mut node = value;
    for key in path {
        if node.is_null() {
            *node = Value::Mapping(Mapping::new());
        }
        let map = node.as_mapping_mut().ok_or_else(|| {
            AppError::kubeconfig(format!("k3s kubeconfig entry above '{}' is not a mapping", key))
        })?;
        node = map
            .entry(Value::from(*key))
            .or_insert(Value::Null);
    }
    *node = Value::from(to);
    Ok(())
}

/// Rename the k3s admin kubeconfig to `k3d-<cluster>` and point it at the
/// exposed API endpoint.
fn rewrite_kubeconfig(doc: &str, cluster: &str, server: &str) -> AppResult<Value> {
    let mut value: Value = serde_yaml::from_str(doc)?;
    let name = format!("k3d-{}", cluster);
    let user = format!("admin@{}", name);

    // keep the first entry of `key`; it has to be a mapping
    fn first<'a>(value: &'a mut Value, key: &str) -> AppResult<&'a mut Value> {
        let seq = value
            .get_mut(key)
            .and_then(Value::as_sequence_mut)
            .filter(|seq| !seq.is_empty())
            .ok_or_else(|| AppError::kubeconfig(format!("k3s kubeconfig has no {}", key)))?;
        seq.truncate(1);
        let entry = &mut seq[0];
        if !entry.is_mapping() {
            return Err(AppError::kubeconfig(format!(
                "first entry of {} in the k3s kubeconfig is not a mapping",
                key
            )));
        }
        Ok(entry)
    }

    let entry = first(&mut value, "clusters")?;
    set_path(entry, &["name"], &name)?;
    set_path(entry, &["cluster", "server"], server)?;

    let entry = first(&mut value, "contexts")?;
    set_path(entry, &["name"], &name)?;
    set_path(entry, &["context", "cluster"], &name)?;
    set_path(entry, &["context", "user"], &user)?;

    let entry = first(&mut value, "users")?;
    set_path(entry, &["name"], &user)?;

    set_path(&mut value, &["current-context"], &name)?;
    Ok(value)
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, labels))]
    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>) -> AppResult<()> {
        let mut args = vec!["network".to_string(), "create".to_string()];
        for (k, v) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(name.to_string());
        self.run(&format!("network {}", name), &args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_network(&self, name: &str) -> AppResult<()> {
        self.run(&format!("network {}", name), ["network", "rm", name])
            .await?;
        Ok(())
    }

    #[instrument(skip(self, labels))]
    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> AppResult<()> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        for (k, v) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(name.to_string());
        self.run(&format!("volume {}", name), &args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, name: &str) -> AppResult<()> {
        self.run(&format!("volume {}", name), ["volume", "rm", "-f", name])
            .await?;
        Ok(())
    }

    #[instrument(skip(self, specs), fields(count = specs.len()))]
    async fn create_containers(&self, specs: &[ContainerSpec], options: CreateOptions) -> AppResult<()> {
        for spec in specs {
            self.run(&format!("container {}", spec.name), create_args(spec))
                .await?;
            self.run(&format!("container {}", spec.name), ["start", spec.name.as_str()])
                .await?;
            info!(container = %spec.name, "started container");
        }
        if options.wait {
            let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
            self.wait_running(&names, options.timeout.unwrap_or(DEFAULT_WAIT))
                .await?;
        }
        Ok(())
    }

    async fn list_containers(&self, selector: &LabelSelector) -> AppResult<Vec<Container>> {
        let mut args = vec!["ps".to_string(), "-a".to_string(), "-q".to_string()];
        for (k, v) in selector.to_labels() {
            args.push("--filter".to_string());
            args.push(format!("label={}={}", k, v));
        }
        let out = self.run("containers", &args).await?;
        let ids: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        self.inspect(&ids).await
    }

    async fn get_container(&self, name: &str) -> AppResult<Container> {
        self.inspect(&[name.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::not_found(format!("container {}", name)))
    }

    #[instrument(skip(self))]
    async fn start_container(&self, name: &str) -> AppResult<()> {
        self.run(&format!("container {}", name), ["start", name]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, name: &str) -> AppResult<()> {
        self.run(&format!("container {}", name), ["stop", name]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_container(&self, name: &str, options: DeleteOptions) -> AppResult<()> {
        let mut args = vec!["rm"];
        if options.force {
            args.push("--force");
        }
        if options.remove_volumes {
            args.push("--volumes");
        }
        args.push(name);
        self.run(&format!("container {}", name), args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn attach_network(&self, container: &str, network: &str) -> AppResult<()> {
        self.run(
            &format!("endpoint {} in network {}", container, network),
            ["network", "connect", network, container],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn detach_network(&self, container: &str, network: &str) -> AppResult<()> {
        self.run(
            &format!("endpoint {} in network {}", container, network),
            ["network", "disconnect", network, container],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, spec), fields(registry = %spec.name))]
    async fn run_registry(&self, spec: &ContainerSpec) -> AppResult<Container> {
        self.create_containers(std::slice::from_ref(spec), CreateOptions::default())
            .await?;
        self.get_container(&spec.name).await
    }

    #[instrument(skip(self))]
    async fn kubeconfig(&self, cluster: &str) -> AppResult<Kubeconfig> {
        let members = self.list_containers(&LabelSelector::cluster(cluster)).await?;
        let server = members
            .iter()
            .filter(|c| c.role() == Some(NodeRole::Server))
            .min_by(|a, b| a.name.cmp(&b.name))
            .ok_or_else(|| AppError::not_found(format!("server node of cluster {}", cluster)))?;

        let doc = self
            .run(
                &format!("container {}", server.name),
                ["exec", server.name.as_str(), "cat", K3S_KUBECONFIG],
            )
            .await?;

        let (host, port) = api_endpoint(&members).ok_or_else(|| {
            AppError::kubeconfig(format!("cluster {} does not publish its API port", cluster))
        })?;
        let value = rewrite_kubeconfig(&doc, cluster, &format!("https://{}:{}", host, port))?;
        Ok(serde_yaml::from_value(value)?)
    }

    #[instrument(skip(self, nodes, images), fields(nodes = nodes.len(), images = images.len()))]
    async fn import_images(
        &self,
        nodes: &[String],
        images: &[String],
        options: ImportOptions,
    ) -> AppResult<()> {
        let tarball: PathBuf = std::env::temp_dir().join(format!("k3d-images-{}.tar", Uuid::new_v4()));
        let tarball_arg = tarball.to_string_lossy().to_string();

        let mut save = vec!["save".to_string(), "-o".to_string(), tarball_arg.clone()];
        save.extend(images.iter().cloned());
        self.run("images", &save).await?;

        let result = async {
            for node in nodes {
                let subject = format!("container {}", node);
                let dest = format!("{}:{}", node, NODE_TARBALL);
                self.run(&subject, ["cp", tarball_arg.as_str(), dest.as_str()])
                    .await?;
                self.run(&subject, ["exec", node.as_str(), "ctr", "image", "import", NODE_TARBALL])
                    .await?;
                self.run(&subject, ["exec", node.as_str(), "rm", "-f", NODE_TARBALL])
                    .await?;
                info!(node = %node, "imported images");
            }
            Ok::<(), AppError>(())
        }
        .await;

        if options.keep_tarball {
            info!(path = %tarball_arg, "kept image tarball");
        } else if let Err(e) = tokio::fs::remove_file(&tarball).await {
            warn!(path = %tarball_arg, error = %e, "failed to remove image tarball");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"[{
        "Name": "/k3d-dev-server-0",
        "Created": "2024-05-01T10:00:00.000Z",
        "Config": {
            "Image": "rancher/k3s:v1.28.8-k3s1",
            "Labels": {"k3d.cluster": "dev", "k3d.role": "server"},
            "Env": ["K3S_TOKEN=secret"]
        },
        "State": {"Status": "running", "Running": true},
        "HostConfig": {"Memory": 536870912},
        "NetworkSettings": {
            "Networks": {"k3d-dev": {}},
            "Ports": {"6443/tcp": [{"HostIp": "0.0.0.0", "HostPort": "6550"}], "8472/udp": null}
        },
        "Mounts": [{"Type": "volume", "Name": "k3d-dev-images", "Source": "/var/lib/docker/volumes/x", "Destination": "/k3d/images"}]
    }]"#;

    #[test]
    fn test_inspect_decodes_into_container() {
        let records: Vec<InspectRecord> = serde_json::from_str(INSPECT).unwrap();
        let c = Container::from(records.into_iter().next().unwrap());

        assert_eq!(c.name, "k3d-dev-server-0");
        assert_eq!(c.role(), Some(NodeRole::Server));
        assert_eq!(c.cluster(), Some("dev"));
        assert!(c.state.running);
        assert_eq!(c.memory, "536870912");
        assert_eq!(c.networks, vec!["k3d-dev".to_string()]);
        assert_eq!(c.volumes, vec!["k3d-dev-images:/k3d/images".to_string()]);
        assert_eq!(c.ports["6443/tcp"][0].host_port, "6550");
        assert!(c.ports["8472/udp"].is_empty());
    }

    #[test]
    fn test_classify_stderr() {
        assert!(classify("container x", "Error: No such container: x").is_not_found());
        assert!(classify(
            "container x",
            "Conflict. The container name \"/x\" is already in use by container"
        )
        .is_already_exists());
        assert!(classify("network n", "network with name n already exists").is_already_exists());
        assert!(matches!(
            classify("container x", "permission denied"),
            AppError::Runtime(_)
        ));
    }

    #[test]
    fn test_create_args_order() {
        let spec = ContainerSpec {
            name: "k3d-dev-agent-0".to_string(),
            image: "rancher/k3s:v1.28.8-k3s1".to_string(),
            network: Some("k3d-dev".to_string()),
            memory: Some("1g".to_string()),
            cmd: vec!["agent".to_string()],
            restart: true,
            ..Default::default()
        };
        let args = create_args(&spec);
        assert_eq!(args[..3], ["create", "--name", "k3d-dev-agent-0"]);
        assert!(args.windows(2).any(|w| w == ["--network", "k3d-dev"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "1g"]));
        assert_eq!(args[args.len() - 2..], ["rancher/k3s:v1.28.8-k3s1", "agent"]);
    }

    #[test]
    fn test_rewrite_kubeconfig() {
        let doc = r#"
apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    server: https://127.0.0.1:6443
    certificate-authority-data: Y2E=
contexts:
- name: default
  context:
    cluster: default
    user: default
users:
- name: default
  user:
    client-certificate-data: Y2VydA==
    client-key-data: a2V5
current-context: default
"#;
        let value = rewrite_kubeconfig(doc, "dev", "https://0.0.0.0:6550").unwrap();
        assert_eq!(value["clusters"][0]["name"], Value::from("k3d-dev"));
        assert_eq!(value["clusters"][0]["cluster"]["server"], Value::from("https://0.0.0.0:6550"));
        assert_eq!(value["contexts"][0]["context"]["user"], Value::from("admin@k3d-dev"));
        assert_eq!(value["current-context"], Value::from("k3d-dev"));

        let kubeconfig: Kubeconfig = serde_yaml::from_value(value).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("k3d-dev"));
    }

    #[test]
    fn test_rewrite_kubeconfig_rejects_malformed_entries() {
        let doc = r#"
clusters:
- just-a-string
contexts:
- name: default
users:
- name: default
"#;
        let err = rewrite_kubeconfig(doc, "dev", "https://0.0.0.0:6550").unwrap_err();
        assert!(matches!(err, AppError::KubeConfig(_)));

        let doc = r#"
clusters:
- name: default
  cluster: 42
contexts:
- name: default
users:
- name: default
"#;
        let err = rewrite_kubeconfig(doc, "dev", "https://0.0.0.0:6550").unwrap_err();
        assert!(matches!(err, AppError::KubeConfig(_)));

        // missing nested mappings are created
        let doc = "clusters:\n- name: a\ncontexts:\n- name: a\nusers:\n- name: a\n";
        let value = rewrite_kubeconfig(doc, "dev", "https://0.0.0.0:6550").unwrap();
        assert_eq!(value["contexts"][0]["context"]["cluster"], Value::from("k3d-dev"));
    }
}
