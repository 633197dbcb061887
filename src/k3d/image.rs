use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::cluster::resolve_target;
use super::record;
use crate::error::{AppError, AppResult};
use crate::models::{ImageLoadRequest, LoadedImages};
use crate::runtime::{ImportOptions, LabelSelector, NodeRole, Runtime};

/// Loads container images into the nodes of clusters
pub struct ImageLoader {
    runtime: Arc<dyn Runtime>,
}

impl ImageLoader {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime }
    }

    /// Import the images into every server and agent of each targeted
    /// cluster. Each cluster is attempted; failures come back as one error.
    #[instrument(skip(self, request), fields(images = request.images.len()))]
    pub async fn load(&self, request: &ImageLoadRequest) -> AppResult<Vec<LoadedImages>> {
        let result = self.load_images(request).await;
        record("image_load", &result);
        result
    }

    async fn load_images(&self, request: &ImageLoadRequest) -> AppResult<Vec<LoadedImages>> {
        if request.images.iter().all(|i| i.trim().is_empty()) {
            return Err(AppError::validation("no images to load"));
        }
        let clusters = resolve_target(self.runtime.as_ref(), &request.target).await?;
        let options = ImportOptions {
            keep_tarball: request.keep_tarball,
        };

        let mut loaded = Vec::new();
        let mut failures = Vec::new();
        for cluster in clusters {
            let nodes: Vec<String> = self
                .runtime
                .list_containers(&LabelSelector::cluster(&cluster.name))
                .await?
                .into_iter()
                .filter(|c| matches!(c.role(), Some(NodeRole::Server | NodeRole::Agent)))
                .map(|c| c.name)
                .collect();

            match self
                .runtime
                .import_images(&nodes, &request.images, options)
                .await
            {
                Ok(()) => {
                    info!(cluster = %cluster.name, nodes = nodes.len(), "images loaded");
                    loaded.push(LoadedImages {
                        cluster: cluster.name,
                        images: request.images.clone(),
                    });
                }
                Err(e) => {
                    warn!(cluster = %cluster.name, error = %e, "loading images failed");
                    failures.push(format!("{}: {}", cluster.name, e));
                }
            }
        }

        match AppError::aggregate("loading images", failures) {
            Some(err) => Err(err),
            None => Ok(loaded),
        }
    }
}
