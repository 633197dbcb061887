use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::api::{AppState, SelectionQuery};
use crate::error::AppResult;
use crate::models::{split_names, Node, NodeAction, NodeBatch, NodeStatus, Target};
use crate::runtime::LabelSelector;

/// Nodes of a cluster: every node with `all=true`, otherwise the named agents
pub async fn list(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Query(query): Query<SelectionQuery>,
) -> AppResult<Json<Vec<Node>>> {
    let nodes = match query.target() {
        Target::All => state.nodes.by_labels(&LabelSelector::cluster(cluster)).await?,
        Target::Names(names) => state.nodes.filter(&cluster, &names).await?,
    };
    Ok(Json(nodes))
}

pub async fn create(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(mut batch): Json<NodeBatch>,
) -> AppResult<(StatusCode, Json<Vec<Node>>)> {
    batch.cluster = cluster;
    let nodes = state.nodes.create_batch(&batch).await?;
    Ok((StatusCode::CREATED, Json(nodes)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Query(query): Query<SelectionQuery>,
) -> AppResult<StatusCode> {
    let names = split_names(query.names.as_deref());
    state.nodes.delete(&cluster, &names).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn actions(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Json(req): Json<NodeAction>,
) -> AppResult<Json<Vec<NodeStatus>>> {
    Ok(Json(
        state
            .nodes
            .start_stop(&cluster, &req.target, req.action)
            .await?,
    ))
}

pub async fn status(
    State(state): State<AppState>,
    Path(cluster): Path<String>,
    Query(query): Query<SelectionQuery>,
) -> AppResult<Json<Vec<NodeStatus>>> {
    Ok(Json(state.nodes.status(&cluster, &query.target()).await?))
}

/// Nodes across clusters by role, cluster and batch labels
pub async fn search(
    State(state): State<AppState>,
    Query(selector): Query<LabelSelector>,
) -> AppResult<Json<Vec<Node>>> {
    Ok(Json(state.nodes.by_labels(&selector).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Node>> {
    Ok(Json(state.nodes.get(&name).await?))
}
