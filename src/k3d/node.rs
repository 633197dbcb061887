use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::cluster::get_cluster;
use super::projection::{node_from_container, retain_named};
use super::record;
use super::resources::{node_batch_specs, validate_batch, ImageDefaults};
use crate::error::{AppError, AppResult};
use crate::models::{Action, Node, NodeBatch, NodeStatus, Target};
use crate::runtime::{
    CreateOptions, DeleteOptions, LabelSelector, NodeRole, Runtime, LABEL_CREATION_ID,
};

/// Manages nodes inside existing clusters
pub struct NodeManager {
    runtime: Arc<dyn Runtime>,
    images: ImageDefaults,
}

impl NodeManager {
    pub fn new(runtime: Arc<dyn Runtime>, images: ImageDefaults) -> Self {
        Self { runtime, images }
    }

    /// Add a batch of nodes to a cluster. On failure every node this call
    /// put into the runtime is removed again.
    #[instrument(skip(self, batch), fields(cluster = %batch.cluster, node = %batch.name))]
    pub async fn create_batch(&self, batch: &NodeBatch) -> AppResult<Vec<Node>> {
        let result = self.create_nodes(batch).await;
        record("node_create", &result);
        result
    }

    async fn create_nodes(&self, batch: &NodeBatch) -> AppResult<Vec<Node>> {
        validate_batch(batch)?;
        let cluster = get_cluster(self.runtime.as_ref(), &batch.cluster).await?;

        let first_server = self
            .runtime
            .list_containers(&LabelSelector::cluster(&cluster.name).with_role(NodeRole::Server))
            .await?
            .into_iter()
            .map(|c| c.name)
            .min()
            .ok_or_else(|| {
                AppError::not_found(format!("server node of cluster '{}'", cluster.name))
            })?;

        let batch_label = batch
            .batch
            .clone()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| Utc::now().to_rfc3339());
        let creation_id = Uuid::new_v4().simple().to_string();
        let specs = node_batch_specs(
            batch,
            &cluster,
            &first_server,
            &batch_label,
            &creation_id,
            &self.images,
        );
        let options = CreateOptions {
            wait: batch.wait,
            timeout: batch.timeout_secs.map(Duration::from_secs),
        };

        if let Err(cause) = self.runtime.create_containers(&specs, options).await {
            warn!(error = %cause, "creating nodes failed, cleaning up the batch");
            let rollback = self.remove_created(&cluster.name, &creation_id).await;
            return Err(AppError::partial_create(
                format!("nodes '{}'", batch.name),
                cause,
                rollback,
            ));
        }

        info!(count = specs.len(), "nodes created");
        let created = self
            .runtime
            .list_containers(&LabelSelector::cluster(&cluster.name).with_batch(batch_label))
            .await?;
        Ok(created
            .iter()
            .filter(|c| c.label(LABEL_CREATION_ID) == Some(creation_id.as_str()))
            .filter_map(node_from_container)
            .collect())
    }

    /// Remove the containers this creation call made. The creation id is
    /// fresh per call, so nodes from earlier batches with the same label or
    /// name are never touched.
    async fn remove_created(&self, cluster: &str, creation_id: &str) -> Option<AppError> {
        let created = match self
            .runtime
            .list_containers(&LabelSelector::cluster(cluster))
            .await
        {
            Ok(created) => created,
            Err(e) => return Some(e),
        };

        let mut failures = Vec::new();
        for container in created
            .iter()
            .filter(|c| c.label(LABEL_CREATION_ID) == Some(creation_id))
        {
            match self
                .runtime
                .delete_container(&container.name, DeleteOptions::default())
                .await
            {
                Ok(()) => info!(node = %container.name, "cleaned up node"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(node = %container.name, error = %e, "errored while deleting node");
                    failures.push(format!("{}: {}", container.name, e));
                }
            }
        }
        AppError::aggregate("cleaning up nodes", failures)
    }

    /// Agents of `cluster` whose name is listed
    #[instrument(skip(self))]
    pub async fn filter(&self, cluster: &str, names: &[String]) -> AppResult<Vec<Node>> {
        let nodes = self
            .by_labels(&LabelSelector::cluster(cluster).with_role(NodeRole::Agent))
            .await?;
        Ok(retain_named(nodes, names, |n| n.name.as_str()))
    }

    /// Every node matching the selector
    pub async fn by_labels(&self, selector: &LabelSelector) -> AppResult<Vec<Node>> {
        let containers = self.runtime.list_containers(selector).await?;
        Ok(containers.iter().filter_map(node_from_container).collect())
    }

    pub async fn get(&self, name: &str) -> AppResult<Node> {
        let container = self.runtime.get_container(name).await?;
        node_from_container(&container).ok_or_else(|| AppError::not_found(format!("node '{}'", name)))
    }

    async fn targeted(&self, cluster: &str, target: &Target) -> AppResult<Vec<Node>> {
        match target {
            Target::All => {
                self.by_labels(&LabelSelector::cluster(cluster).with_role(NodeRole::Agent))
                    .await
            }
            Target::Names(names) => self.filter(cluster, names).await,
        }
    }

    /// Start or stop nodes, stopping at the first failure
    #[instrument(skip(self))]
    pub async fn start_stop(&self, cluster: &str, target: &Target, action: Action) -> AppResult<Vec<NodeStatus>> {
        let result = self.transition(cluster, target, action).await;
        record(
            match action {
                Action::Start => "node_start",
                Action::Stop => "node_stop",
            },
            &result,
        );
        result
    }

    async fn transition(&self, cluster: &str, target: &Target, action: Action) -> AppResult<Vec<NodeStatus>> {
        let nodes = self.targeted(cluster, target).await?;
        if nodes.is_empty() {
            return Err(AppError::not_found(format!("nodes of cluster '{}'", cluster)));
        }
        for node in &nodes {
            match action {
                Action::Start => self.runtime.start_container(&node.name).await?,
                Action::Stop => self.runtime.stop_container(&node.name).await?,
            }
            info!(node = %node.name, %action, "node transitioned");
        }
        self.status(cluster, target).await
    }

    /// Delete the listed nodes of a cluster. Every deletion is attempted;
    /// failures are reported together.
    #[instrument(skip(self))]
    pub async fn delete(&self, cluster: &str, names: &[String]) -> AppResult<()> {
        let result = self.delete_nodes(cluster, names).await;
        record("node_delete", &result);
        result
    }

    async fn delete_nodes(&self, cluster: &str, names: &[String]) -> AppResult<()> {
        let nodes = retain_named(
            self.by_labels(&LabelSelector::cluster(cluster)).await?,
            names,
            |n| n.name.as_str(),
        );

        let mut failures = Vec::new();
        for node in nodes.iter().filter(|n| n.role != NodeRole::Registry) {
            if let Err(e) = self
                .runtime
                .delete_container(&node.name, DeleteOptions::default())
                .await
            {
                warn!(node = %node.name, error = %e, "deleting node failed");
                failures.push(format!("{}: {}", node.name, e));
            }
        }
        match AppError::aggregate("deleting nodes", failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn status(&self, cluster: &str, target: &Target) -> AppResult<Vec<NodeStatus>> {
        let nodes = self.targeted(cluster, target).await?;
        Ok(nodes.iter().map(NodeStatus::from).collect())
    }
}
