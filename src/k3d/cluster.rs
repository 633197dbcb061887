//! Cluster manager
//!
//! Creates clusters from a topology, derives them back from runtime state,
//! and drives start/stop and teardown across their nodes.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::kubeconfig::KubeconfigExporter;
use super::projection::{cluster_from_containers, group_clusters, retain_named};
use super::record;
use super::registry::RegistryManager;
use super::resources::{plan_cluster, validate_name, ClusterPlan, ImageDefaults};
use crate::error::{AppError, AppResult};
use crate::models::{Action, Cluster, ClusterTopology, Target};
use crate::runtime::{
    Container, CreateOptions, DeleteOptions, LabelSelector, NodeRole, Runtime,
    LABEL_NETWORK_EXTERNAL,
};

/// Fetch one cluster by name
pub(crate) async fn get_cluster(runtime: &dyn Runtime, name: &str) -> AppResult<Cluster> {
    let containers = runtime.list_containers(&LabelSelector::cluster(name)).await?;
    cluster_from_containers(name, &containers)
        .ok_or_else(|| AppError::not_found(format!("cluster '{}'", name)))
}

pub(crate) async fn list_clusters(runtime: &dyn Runtime) -> AppResult<Vec<Cluster>> {
    let containers = runtime.list_containers(&LabelSelector::any()).await?;
    Ok(group_clusters(&containers))
}

/// Clusters named in `names`. Fails with one `NotFound` naming every
/// unresolved cluster, so a partial match never passes silently.
pub(crate) async fn filter_clusters(runtime: &dyn Runtime, names: &[String]) -> AppResult<Vec<Cluster>> {
    let clusters = retain_named(list_clusters(runtime).await?, names, |c| c.name.as_str());

    let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    let found: BTreeSet<&str> = clusters.iter().map(|c| c.name.as_str()).collect();
    let missing: Vec<&str> = wanted.difference(&found).copied().collect();

    if clusters.is_empty() || !missing.is_empty() {
        return Err(AppError::not_found(format!("clusters [{}]", missing.join(", "))));
    }
    Ok(clusters)
}

pub(crate) async fn resolve_target(runtime: &dyn Runtime, target: &Target) -> AppResult<Vec<Cluster>> {
    match target {
        Target::All => list_clusters(runtime).await,
        Target::Names(names) => filter_clusters(runtime, names).await,
    }
}

fn start_rank(container: &Container) -> u8 {
    match container.role() {
        Some(NodeRole::Server) => 0,
        Some(NodeRole::Agent) => 1,
        Some(NodeRole::LoadBalancer) => 2,
        _ => 3,
    }
}

/// What a teardown removes besides the cluster's node containers
struct Teardown<'a> {
    cluster: &'a str,
    network: &'a str,
    remove_network: bool,
    image_volume: Option<&'a str>,
    /// Leave registries owned by the cluster in place, only detaching them
    skip_registry_check: bool,
}

/// Remove a cluster's resources, continuing past individual failures.
/// Missing resources count as removed.
async fn teardown(runtime: &dyn Runtime, plan: Teardown<'_>) -> AppResult<()> {
    let mut errors = Vec::new();
    let mut note = |what: &str, result: AppResult<()>| match result {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => {
            warn!(resource = %what, error = %e, "teardown step failed");
            errors.push(format!("{}: {}", what, e));
        }
    };

    let registries = runtime
        .list_containers(&LabelSelector::role(NodeRole::Registry))
        .await?;
    for registry in &registries {
        let owned = registry.cluster() == Some(plan.cluster);
        let attached = registry.networks.iter().any(|n| n == plan.network);
        if owned && !plan.skip_registry_check {
            let result = runtime
                .delete_container(&registry.name, DeleteOptions::default())
                .await;
            note(&registry.name, result);
        } else if attached {
            let result = runtime.detach_network(&registry.name, plan.network).await;
            note(&registry.name, result);
        }
    }

    let members = runtime
        .list_containers(&LabelSelector::cluster(plan.cluster))
        .await?;
    for member in members.iter().filter(|c| c.role() != Some(NodeRole::Registry)) {
        let result = runtime
            .delete_container(&member.name, DeleteOptions::default())
            .await;
        note(&member.name, result);
    }

    if let Some(volume) = plan.image_volume {
        let result = runtime.delete_volume(volume).await;
        note(volume, result);
    }
    if plan.remove_network {
        let result = runtime.delete_network(plan.network).await;
        note(plan.network, result);
    }

    match AppError::aggregate(format!("deleting cluster '{}'", plan.cluster), errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Resources created so far by one cluster creation
#[derive(Default)]
struct Progress {
    network: bool,
    volume: bool,
    registry: Option<String>,
}

/// Manages cluster lifecycle on a container runtime
pub struct ClusterManager {
    runtime: Arc<dyn Runtime>,
    images: ImageDefaults,
    registries: RegistryManager,
    kubeconfig: KubeconfigExporter,
}

impl ClusterManager {
    pub fn new(runtime: Arc<dyn Runtime>, images: ImageDefaults, kubeconfig_path: Option<PathBuf>) -> Self {
        Self {
            registries: RegistryManager::new(runtime.clone(), images.clone()),
            kubeconfig: KubeconfigExporter::new(runtime.clone(), kubeconfig_path),
            runtime,
            images,
        }
    }

    /// Create a cluster. Any failure after the existence check tears the
    /// partial cluster down again and reports both failures.
    #[instrument(skip(self, topology), fields(cluster = %topology.name))]
    pub async fn create(&self, topology: &ClusterTopology) -> AppResult<Cluster> {
        let result = self.create_cluster(topology).await;
        record("cluster_create", &result);
        result
    }

    async fn create_cluster(&self, topology: &ClusterTopology) -> AppResult<Cluster> {
        let plan = plan_cluster(topology, &self.images)?;
        if let Some(registry) = &topology.registries.create {
            validate_name(&registry.name)?;
        }

        let existing = self
            .runtime
            .list_containers(&LabelSelector::cluster(&plan.name))
            .await?;
        if existing.iter().any(|c| c.role() != Some(NodeRole::Registry)) {
            return Err(AppError::already_exists(format!("cluster '{}'", plan.name)));
        }

        let mut progress = Progress::default();
        if let Err(cause) = self.provision(&plan, topology, &mut progress).await {
            warn!(error = %cause, "cluster creation failed, rolling back");
            let rollback = self.rollback(&plan, &progress).await.err();
            return Err(AppError::partial_create(
                format!("cluster '{}'", plan.name),
                cause,
                rollback,
            ));
        }

        info!(nodes = plan.nodes.len(), "cluster created");
        get_cluster(self.runtime.as_ref(), &plan.name).await
    }

    async fn provision(
        &self,
        plan: &ClusterPlan,
        topology: &ClusterTopology,
        progress: &mut Progress,
    ) -> AppResult<()> {
        match self.runtime.create_network(&plan.network, &plan.labels).await {
            Ok(()) => progress.network = true,
            Err(e) if e.is_already_exists() && plan.network_external => {
                info!(network = %plan.network, "joining existing network");
            }
            Err(e) => return Err(e),
        }

        if let Some(volume) = &plan.image_volume {
            self.runtime.create_volume(volume, &plan.labels).await?;
            progress.volume = true;
        }

        let options = CreateOptions {
            wait: topology.k3d.wait,
            timeout: topology.k3d.timeout_secs.map(Duration::from_secs),
        };
        self.runtime.create_containers(&plan.nodes, options).await?;

        if let Some(request) = &topology.registries.create {
            let mut request = request.clone();
            request.cluster = Some(plan.name.clone());
            let registry = self.registries.create(&request).await?;
            progress.registry = Some(registry.name);
        }
        if !topology.registries.use_existing.is_empty() {
            self.registries
                .connect(&topology.registries.use_existing, &plan.name)
                .await?;
        }

        if topology.kubeconfig.update_default {
            self.kubeconfig
                .write_default(&plan.name, topology.kubeconfig.switch_context)
                .await?;
        }
        Ok(())
    }

    async fn rollback(&self, plan: &ClusterPlan, progress: &Progress) -> AppResult<()> {
        let mut result = Ok(());
        if let Some(registry) = &progress.registry {
            if let Err(e) = self
                .runtime
                .delete_container(registry, DeleteOptions::default())
                .await
            {
                warn!(registry = %registry, error = %e, "failed to remove registry");
                result = Err(e);
            }
        }

        let removed = teardown(
            self.runtime.as_ref(),
            Teardown {
                cluster: &plan.name,
                network: &plan.network,
                remove_network: progress.network,
                image_volume: plan.image_volume.as_deref().filter(|_| progress.volume),
                skip_registry_check: true,
            },
        )
        .await;
        result.and(removed)
    }

    /// Fetch one cluster
    #[instrument(skip(self))]
    pub async fn get(&self, name: &str) -> AppResult<Cluster> {
        get_cluster(self.runtime.as_ref(), name).await
    }

    /// Fetch the named clusters; every name must resolve
    #[instrument(skip(self))]
    pub async fn get_filtered(&self, names: &[String]) -> AppResult<Vec<Cluster>> {
        filter_clusters(self.runtime.as_ref(), names).await
    }

    #[instrument(skip(self))]
    pub async fn get_all(&self) -> AppResult<Vec<Cluster>> {
        list_clusters(self.runtime.as_ref()).await
    }

    /// Start servers, then agents, then the load balancer; stop in reverse.
    /// Stops at the first failing node.
    #[instrument(skip(self))]
    pub async fn start_stop(&self, target: &Target, action: Action) -> AppResult<Vec<Cluster>> {
        let result = self.transition(target, action).await;
        record(
            match action {
                Action::Start => "cluster_start",
                Action::Stop => "cluster_stop",
            },
            &result,
        );
        result
    }

    async fn transition(&self, target: &Target, action: Action) -> AppResult<Vec<Cluster>> {
        let clusters = resolve_target(self.runtime.as_ref(), target).await?;
        for cluster in &clusters {
            let mut members: Vec<Container> = self
                .runtime
                .list_containers(&LabelSelector::cluster(&cluster.name))
                .await?
                .into_iter()
                .filter(|c| c.role() != Some(NodeRole::Registry))
                .collect();
            members.sort_by(|a, b| start_rank(a).cmp(&start_rank(b)).then(a.name.cmp(&b.name)));
            if action == Action::Stop {
                members.reverse();
            }

            for member in &members {
                match action {
                    Action::Start => self.runtime.start_container(&member.name).await?,
                    Action::Stop => self.runtime.stop_container(&member.name).await?,
                }
            }
            info!(cluster = %cluster.name, %action, "cluster transitioned");
        }

        let names: Vec<String> = clusters.into_iter().map(|c| c.name).collect();
        let refreshed = list_clusters(self.runtime.as_ref()).await?;
        Ok(retain_named(refreshed, &names, |c| c.name.as_str()))
    }

    /// Delete a cluster, leaving registries it owns in place. Deleting a
    /// cluster that does not exist succeeds.
    pub async fn delete(&self, name: &str) -> AppResult<()> {
        self.delete_with(name, true).await
    }

    #[instrument(skip(self))]
    pub async fn delete_with(&self, name: &str, skip_registry_check: bool) -> AppResult<()> {
        let result = self.delete_cluster(name, skip_registry_check).await;
        record("cluster_delete", &result);
        result
    }

    async fn delete_cluster(&self, name: &str, skip_registry_check: bool) -> AppResult<()> {
        let cluster = match self.get_filtered(&[name.to_string()]).await {
            Ok(mut clusters) => clusters.remove(0),
            Err(e) if e.is_not_found() => {
                info!("cluster already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let members = self
            .runtime
            .list_containers(&LabelSelector::cluster(name))
            .await?;
        let external = members
            .iter()
            .any(|c| c.label(LABEL_NETWORK_EXTERNAL) == Some("true"));

        teardown(
            self.runtime.as_ref(),
            Teardown {
                cluster: name,
                network: &cluster.network,
                remove_network: !external,
                image_volume: Some(cluster.image_volume.as_str()).filter(|v| !v.is_empty()),
                skip_registry_check,
            },
        )
        .await?;
        info!("cluster deleted");
        Ok(())
    }
}
