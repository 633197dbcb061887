use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use kube::config::Kubeconfig;
use tracing::{info, instrument};

use super::cluster::resolve_target;
use crate::error::{AppError, AppResult};
use crate::models::{KubeconfigEntry, Target};
use crate::runtime::Runtime;

/// Reads cluster kubeconfigs and merges them into the user's default file
pub struct KubeconfigExporter {
    runtime: Arc<dyn Runtime>,
    path: Option<PathBuf>,
}

impl KubeconfigExporter {
    /// `path` overrides the default kubeconfig location
    pub fn new(runtime: Arc<dyn Runtime>, path: Option<PathBuf>) -> Self {
        Self { runtime, path }
    }

    /// Kubeconfig of every targeted cluster, base64 (standard alphabet)
    /// unless `not_encode` is set. The first failing fetch aborts.
    #[instrument(skip(self))]
    pub async fn export(&self, target: &Target, not_encode: bool) -> AppResult<Vec<KubeconfigEntry>> {
        let clusters = resolve_target(self.runtime.as_ref(), target).await?;

        let mut entries = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            let kubeconfig = self.runtime.kubeconfig(&cluster.name).await?;
            let yaml = serde_yaml::to_string(&kubeconfig)?;
            let kubeconfig = if not_encode { yaml } else { STANDARD.encode(yaml) };
            entries.push(KubeconfigEntry {
                cluster: cluster.name,
                kubeconfig,
            });
        }
        Ok(entries)
    }

    /// Location of the default kubeconfig: the configured override, else the
    /// first `$KUBECONFIG` entry, else `~/.kube/config`
    pub fn default_path(&self) -> AppResult<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        if let Some(paths) = std::env::var_os("KUBECONFIG") {
            if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty()) {
                return Ok(first);
            }
        }
        let home = std::env::var_os("HOME")
            .ok_or_else(|| AppError::kubeconfig("cannot locate the home directory"))?;
        Ok(PathBuf::from(home).join(".kube").join("config"))
    }

    /// Merge the cluster's kubeconfig into the default file, replacing
    /// entries with the same names. Returns the written path.
    #[instrument(skip(self))]
    pub async fn write_default(&self, cluster: &str, switch_context: bool) -> AppResult<PathBuf> {
        let incoming = self.runtime.kubeconfig(cluster).await?;
        let path = self.default_path()?;

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => {
                Kubeconfig::from_yaml(&text).map_err(|e| AppError::kubeconfig(e.to_string()))?
            }
            Ok(_) => Kubeconfig::default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Kubeconfig::default(),
            Err(e) => return Err(e.into()),
        };

        let merged = merge(existing, incoming, switch_context);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_yaml::to_string(&merged)?).await?;
        info!(path = %path.display(), "kubeconfig updated");
        Ok(path)
    }
}

/// Replace same-named entries of `base` with those of `incoming`
fn merge(mut base: Kubeconfig, incoming: Kubeconfig, switch_context: bool) -> Kubeconfig {
    base.clusters
        .retain(|c| !incoming.clusters.iter().any(|n| n.name == c.name));
    base.clusters.extend(incoming.clusters);

    base.contexts
        .retain(|c| !incoming.contexts.iter().any(|n| n.name == c.name));
    base.contexts.extend(incoming.contexts);

    base.auth_infos
        .retain(|a| !incoming.auth_infos.iter().any(|n| n.name == a.name));
    base.auth_infos.extend(incoming.auth_infos);

    let unset = base.current_context.as_deref().map_or(true, str::is_empty);
    if switch_context || unset {
        base.current_context = incoming.current_context;
    }
    base.api_version.get_or_insert_with(|| "v1".to_string());
    base.kind.get_or_insert_with(|| "Config".to_string());
    base
}
