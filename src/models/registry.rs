use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const DEFAULT_EXPOSE_HOST_IP: &str = "0.0.0.0";
pub const DEFAULT_EXPOSE_HOST_PORT: &str = "5200";

/// Pull-through proxy settings of a registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub remote_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl ProxyConfig {
    /// Proxy settings are applied only when every field is set
    pub fn is_complete(&self) -> bool {
        !self.remote_url.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Host binding of a registry port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expose {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

impl Expose {
    /// Fall back to `0.0.0.0:5200` unless both parts are given
    pub fn or_default(expose: Option<&Expose>) -> Self {
        match expose {
            Some(e) if !e.host_ip.is_empty() && !e.host_port.is_empty() => e.clone(),
            _ => Self {
                host_ip: DEFAULT_EXPOSE_HOST_IP.to_string(),
                host_port: DEFAULT_EXPOSE_HOST_PORT.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryRequest {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    /// Cluster to connect right after creation
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub expose: Option<Expose>,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_protocol() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub name: String,
    pub image: String,
    pub cluster: Option<String>,
    pub protocol: String,
    pub host: String,
    pub expose: Expose,
    pub proxy: Option<ProxyConfig>,
    pub networks: Vec<String>,
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub registry: String,
    pub cluster: String,
    pub state: ConnectionState,
}

/// Registry selection, optionally scoped to one cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryQuery {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub registries: Vec<String>,
    pub cluster: String,
    pub action: ConnectionAction,
}
