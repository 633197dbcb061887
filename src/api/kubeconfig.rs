use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::AppState;
use crate::error::AppResult;
use crate::models::{KubeconfigEntry, Target};

#[derive(Debug, Default, Deserialize)]
pub struct KubeconfigQuery {
    #[serde(default)]
    pub names: Option<String>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub not_encoded: bool,
}

pub async fn export(
    State(state): State<AppState>,
    Query(query): Query<KubeconfigQuery>,
) -> AppResult<Json<Vec<KubeconfigEntry>>> {
    let target = Target::from_query(query.all, query.names.as_deref());
    Ok(Json(state.kubeconfig.export(&target, query.not_encoded).await?))
}
