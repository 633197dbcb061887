use anyhow::Result;
use serde::Deserialize;
use strum::{Display, EnumString};

/// Which container runtime the service drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_runtime")]
    pub runtime: RuntimeKind,

    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    #[serde(default = "default_k3s_registry")]
    pub k3s_registry: String,

    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,

    #[serde(default = "default_registry_image")]
    pub registry_image: String,

    #[serde(default = "default_loadbalancer_image")]
    pub loadbalancer_image: String,

    /// Overrides the default kubeconfig location
    #[serde(default)]
    pub kubeconfig_path: Option<String>,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

fn default_port() -> u16 {
    8080
}

fn default_runtime() -> RuntimeKind {
    RuntimeKind::Docker
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_k3s_registry() -> String {
    "rancher/k3s".to_string()
}

fn default_kubernetes_version() -> String {
    "v1.28.8-k3s1".to_string()
}

fn default_registry_image() -> String {
    "docker.io/library/registry:2".to_string()
}

fn default_loadbalancer_image() -> String {
    "ghcr.io/k3d-io/k3d-proxy:5.6.0".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Default node image, `<k3s_registry>:<kubernetes_version>`
    pub fn node_image(&self) -> String {
        format!("{}:{}", self.k3s_registry, self.kubernetes_version)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            runtime: default_runtime(),
            docker_bin: default_docker_bin(),
            k3s_registry: default_k3s_registry(),
            kubernetes_version: default_kubernetes_version(),
            registry_image: default_registry_image(),
            loadbalancer_image: default_loadbalancer_image(),
            kubeconfig_path: None,
            log_format: default_log_format(),
        }
    }
}
