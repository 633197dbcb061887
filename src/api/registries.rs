use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::api::AppState;
use crate::error::AppResult;
use crate::models::{
    split_names, ConnectionAction, ConnectionRequest, Registry, RegistryQuery, RegistryRequest,
    RegistryStatus,
};

#[derive(Debug, Default, Deserialize)]
pub struct RegistryListQuery {
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub names: Option<String>,
    #[serde(default)]
    pub all: bool,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<RegistryListQuery>,
) -> AppResult<Json<Vec<Registry>>> {
    let registries = state
        .registries
        .get(&RegistryQuery {
            cluster: query.cluster,
            names: split_names(query.names.as_deref()),
            all: query.all,
        })
        .await?;
    Ok(Json(registries))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<RegistryRequest>,
) -> AppResult<(StatusCode, Json<Registry>)> {
    let registry = state.registries.create(&req).await?;
    Ok((StatusCode::CREATED, Json(registry)))
}

#[derive(Debug, Default, Deserialize)]
pub struct NamesQuery {
    #[serde(default)]
    pub names: Option<String>,
}

pub async fn delete(
    State(state): State<AppState>,
    Query(query): Query<NamesQuery>,
) -> AppResult<StatusCode> {
    state
        .registries
        .delete(&split_names(query.names.as_deref()))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Connect registries to a cluster network or disconnect them
pub async fn connection(
    State(state): State<AppState>,
    Json(req): Json<ConnectionRequest>,
) -> AppResult<Json<Vec<RegistryStatus>>> {
    let statuses = match req.action {
        ConnectionAction::Connect => state.registries.connect(&req.registries, &req.cluster).await?,
        ConnectionAction::Disconnect => {
            state
                .registries
                .disconnect(&req.registries, &req.cluster)
                .await?
        }
    };
    Ok(Json(statuses))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub cluster: String,
    #[serde(default)]
    pub names: Option<String>,
}

pub async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<Vec<RegistryStatus>>> {
    let names = split_names(query.names.as_deref());
    Ok(Json(state.registries.status(&names, &query.cluster).await?))
}
