pub mod clusters;
pub mod health;
pub mod images;
pub mod kubeconfig;
pub mod metrics;
pub mod nodes;
pub mod registries;

use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use crate::config::Config;
use crate::k3d::resources::ImageDefaults;
use crate::k3d::{ClusterManager, ImageLoader, KubeconfigExporter, NodeManager, RegistryManager};
use crate::models::Target;
use crate::runtime::Runtime;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub runtime: Arc<dyn Runtime>,
    pub clusters: Arc<ClusterManager>,
    pub nodes: Arc<NodeManager>,
    pub registries: Arc<RegistryManager>,
    pub kubeconfig: Arc<KubeconfigExporter>,
    pub images: Arc<ImageLoader>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(runtime: Arc<dyn Runtime>, config: Config) -> Self {
        let images = ImageDefaults::from_config(&config);
        let kubeconfig_path = config.kubeconfig_path.as_ref().map(PathBuf::from);
        Self {
            clusters: Arc::new(ClusterManager::new(
                runtime.clone(),
                images.clone(),
                kubeconfig_path.clone(),
            )),
            nodes: Arc::new(NodeManager::new(runtime.clone(), images.clone())),
            registries: Arc::new(RegistryManager::new(runtime.clone(), images)),
            kubeconfig: Arc::new(KubeconfigExporter::new(runtime.clone(), kubeconfig_path)),
            images: Arc::new(ImageLoader::new(runtime.clone())),
            runtime,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// `?names=a,b&all=true` selection shared by the list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct SelectionQuery {
    #[serde(default)]
    pub names: Option<String>,
    #[serde(default)]
    pub all: bool,
}

impl SelectionQuery {
    pub fn target(&self) -> Target {
        Target::from_query(self.all, self.names.as_deref())
    }
}
