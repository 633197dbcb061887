//! k3d lifecycle backend library
//!
//! Cluster, node and registry lifecycle management on top of a container
//! runtime, exposed over HTTP.

pub mod api;
pub mod config;
pub mod error;
pub mod k3d;
pub mod models;
pub mod runtime;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the application router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health::health_check))
        .route("/metrics", get(api::metrics::metrics_handler))
        // Clusters
        .route(
            "/api/clusters",
            get(api::clusters::list).post(api::clusters::create),
        )
        .route("/api/clusters/actions", post(api::clusters::actions))
        .route(
            "/api/clusters/:name",
            get(api::clusters::get).delete(api::clusters::delete),
        )
        // Nodes
        .route(
            "/api/clusters/:name/nodes",
            get(api::nodes::list)
                .post(api::nodes::create)
                .delete(api::nodes::delete),
        )
        .route("/api/clusters/:name/nodes/actions", post(api::nodes::actions))
        .route("/api/clusters/:name/nodes/status", get(api::nodes::status))
        .route("/api/nodes", get(api::nodes::search))
        .route("/api/nodes/:name", get(api::nodes::get))
        // Registries
        .route(
            "/api/registries",
            get(api::registries::list)
                .post(api::registries::create)
                .delete(api::registries::delete),
        )
        .route("/api/registries/connection", post(api::registries::connection))
        .route("/api/registries/status", get(api::registries::status))
        // Kubeconfig and images
        .route("/api/kubeconfig", get(api::kubeconfig::export))
        .route("/api/images", post(api::images::load))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
