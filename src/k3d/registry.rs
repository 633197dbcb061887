use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::cluster::get_cluster;
use super::projection::{registry_from_container, registry_status, retain_named};
use super::record;
use super::resources::{registry_spec, ImageDefaults};
use crate::error::{AppError, AppResult};
use crate::models::{
    ConnectionAction, Expose, ProxyConfig, Registry, RegistryQuery, RegistryRequest,
    RegistryStatus,
};
use crate::runtime::{Container, DeleteOptions, LabelSelector, NodeRole, Runtime};

/// Manages image registries and their attachment to cluster networks
pub struct RegistryManager {
    runtime: Arc<dyn Runtime>,
    images: ImageDefaults,
}

impl RegistryManager {
    pub fn new(runtime: Arc<dyn Runtime>, images: ImageDefaults) -> Self {
        Self { runtime, images }
    }

    /// Run a registry and, when a cluster is given, connect it right away.
    /// A failed connect removes the new registry again.
    #[instrument(skip(self, request), fields(registry = %request.name))]
    pub async fn create(&self, request: &RegistryRequest) -> AppResult<Registry> {
        let result = self.create_registry(request).await;
        record("registry_create", &result);
        result
    }

    async fn create_registry(&self, request: &RegistryRequest) -> AppResult<Registry> {
        let expose = Expose::or_default(request.expose.as_ref());
        let proxy = self.vetted_proxy(request);
        let spec = registry_spec(request, &expose, proxy, &self.images)?;

        let mut container = self.runtime.run_registry(&spec).await?;
        info!("registry running");

        if let Some(cluster) = request.cluster.as_deref().filter(|c| !c.is_empty()) {
            info!(cluster = %cluster, "connecting the registry with cluster");
            if let Err(cause) = self.connect(std::slice::from_ref(&spec.name), cluster).await {
                warn!(error = %cause, "connecting registry failed, removing it");
                let rollback = self
                    .runtime
                    .delete_container(&spec.name, DeleteOptions::default())
                    .await
                    .err();
                return Err(AppError::partial_create(
                    format!("registry '{}'", spec.name),
                    cause,
                    rollback,
                ));
            }
            container = self.runtime.get_container(&spec.name).await?;
        }
        Ok(registry_from_container(&container))
    }

    /// Proxy settings are all-or-nothing
    fn vetted_proxy<'a>(&self, request: &'a RegistryRequest) -> Option<&'a ProxyConfig> {
        if !request.use_proxy {
            return None;
        }
        match &request.proxy {
            Some(proxy) if proxy.is_complete() => Some(proxy),
            _ => {
                warn!("proxy requested but remote url, username or password is missing; not applying it");
                None
            }
        }
    }

    async fn registry_containers(&self, cluster: Option<&str>) -> AppResult<Vec<Container>> {
        let mut selector = LabelSelector::role(NodeRole::Registry);
        if let Some(cluster) = cluster.filter(|c| !c.is_empty()) {
            selector = selector.with_cluster(cluster);
        }
        self.runtime.list_containers(&selector).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, query: &RegistryQuery) -> AppResult<Vec<Registry>> {
        let registries: Vec<Registry> = self
            .registry_containers(query.cluster.as_deref())
            .await?
            .iter()
            .map(registry_from_container)
            .collect();
        if query.all {
            return Ok(registries);
        }
        Ok(retain_named(registries, &query.names, |r| r.name.as_str()))
    }

    /// Registries named in `names`; `NotFound` when none match
    async fn named(&self, names: &[String]) -> AppResult<Vec<Registry>> {
        let registries = self
            .get(&RegistryQuery {
                names: names.to_vec(),
                ..Default::default()
            })
            .await?;
        if registries.is_empty() {
            return Err(AppError::not_found(format!("registries [{}]", names.join(", "))));
        }
        Ok(registries)
    }

    #[instrument(skip(self))]
    pub async fn connect(&self, names: &[String], cluster: &str) -> AppResult<Vec<RegistryStatus>> {
        let result = self.apply(names, cluster, ConnectionAction::Connect).await;
        record("registry_connect", &result);
        result
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&self, names: &[String], cluster: &str) -> AppResult<Vec<RegistryStatus>> {
        let result = self.apply(names, cluster, ConnectionAction::Disconnect).await;
        record("registry_disconnect", &result);
        result
    }

    /// Attach or detach each registry. Registries already in the wanted
    /// state are skipped, so repeating a call changes nothing.
    async fn apply(
        &self,
        names: &[String],
        cluster: &str,
        action: ConnectionAction,
    ) -> AppResult<Vec<RegistryStatus>> {
        let cluster = get_cluster(self.runtime.as_ref(), cluster).await?;
        let registries = self.named(names).await?;

        for registry in &registries {
            let attached = registry.networks.iter().any(|n| *n == cluster.network);
            match action {
                ConnectionAction::Connect if !attached => {
                    self.runtime
                        .attach_network(&registry.name, &cluster.network)
                        .await?;
                }
                ConnectionAction::Disconnect if attached => {
                    self.runtime
                        .detach_network(&registry.name, &cluster.network)
                        .await?;
                }
                _ => info!(registry = %registry.name, ?action, "registry already in wanted state"),
            }
        }
        self.status(names, &cluster.name).await
    }

    /// Connection state of each named registry with the cluster
    pub async fn status(&self, names: &[String], cluster: &str) -> AppResult<Vec<RegistryStatus>> {
        let cluster = get_cluster(self.runtime.as_ref(), cluster).await?;
        let registries = self.named(names).await?;
        Ok(registries
            .iter()
            .map(|r| registry_status(r, &cluster))
            .collect())
    }

    /// Remove the named registries, attempting every one
    #[instrument(skip(self))]
    pub async fn delete(&self, names: &[String]) -> AppResult<()> {
        let result = self.delete_registries(names).await;
        record("registry_delete", &result);
        result
    }

    async fn delete_registries(&self, names: &[String]) -> AppResult<()> {
        let registries = self.named(names).await?;
        let mut failures = Vec::new();
        for registry in &registries {
            if let Err(e) = self
                .runtime
                .delete_container(&registry.name, DeleteOptions::default())
                .await
            {
                warn!(registry = %registry.name, error = %e, "deleting registry failed");
                failures.push(format!("{}: {}", registry.name, e));
            }
        }
        match AppError::aggregate("deleting registries", failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
