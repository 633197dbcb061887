use axum::{extract::State, Json};

use crate::api::AppState;
use crate::error::AppResult;
use crate::models::{ImageLoadRequest, LoadedImages};

pub async fn load(
    State(state): State<AppState>,
    Json(req): Json<ImageLoadRequest>,
) -> AppResult<Json<Vec<LoadedImages>>> {
    Ok(Json(state.images.load(&req).await?))
}
