use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::api::{AppState, SelectionQuery};
use crate::error::AppResult;
use crate::models::{Cluster, ClusterAction, ClusterTopology, Target};

/// List clusters, optionally only the named ones
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<SelectionQuery>,
) -> AppResult<Json<Vec<Cluster>>> {
    let clusters = match query.target() {
        Target::Names(names) if !names.is_empty() => state.clusters.get_filtered(&names).await?,
        _ => state.clusters.get_all().await?,
    };
    Ok(Json(clusters))
}

pub async fn create(
    State(state): State<AppState>,
    Json(topology): Json<ClusterTopology>,
) -> AppResult<(StatusCode, Json<Cluster>)> {
    let cluster = state.clusters.create(&topology).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Cluster>> {
    Ok(Json(state.clusters.get(&name).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// Also remove registries owned by the cluster
    #[serde(default)]
    pub registries: bool,
}

pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> AppResult<StatusCode> {
    state.clusters.delete_with(&name, !query.registries).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start or stop clusters
pub async fn actions(
    State(state): State<AppState>,
    Json(req): Json<ClusterAction>,
) -> AppResult<Json<Vec<Cluster>>> {
    Ok(Json(state.clusters.start_stop(&req.target, req.action).await?))
}
