//! k3d lifecycle layer
//!
//! Reconciles clusters, nodes and registries against a container runtime:
//! - Creating clusters from a declarative topology, with rollback
//! - Adding, filtering, starting and stopping nodes
//! - Creating registries and wiring them into cluster networks
//! - Exporting kubeconfigs and loading images into nodes

mod cluster;
mod image;
mod kubeconfig;
mod node;
pub mod projection;
mod registry;
pub mod resources;

pub use cluster::ClusterManager;
pub use image::ImageLoader;
pub use kubeconfig::KubeconfigExporter;
pub use node::NodeManager;
pub use registry::RegistryManager;

use crate::error::AppResult;

/// Count one manager operation by outcome
fn record<T>(operation: &'static str, result: &AppResult<T>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    metrics::increment_counter!(
        "k3d_operations_total",
        "operation" => operation,
        "outcome" => outcome
    );
}
