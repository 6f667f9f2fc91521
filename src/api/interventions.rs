use axum::extract::{Path, Query, State};
use axum::{routing::get, routing::post, Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::repositories;
use crate::schemas::intervention::{
    CancelRequest, ClaimRequest, InterventionFilter, InterventionResponse, NextFilter,
    ResolveRequest,
};
use crate::services::interventions::{self, Resolution};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/next", get(next))
        .route("/:intervention_id", get(get_one))
        .route("/:intervention_id/claim", post(claim))
        .route("/:intervention_id/resolve", post(resolve))
        .route("/:intervention_id/cancel", post(cancel))
}

async fn list(
    Query(filter): Query<InterventionFilter>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let items = repositories::interventions::list(
        state.db(),
        filter.status,
        filter.priority,
        filter.assignee.as_deref(),
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to list interventions"))?;

    let items: Vec<InterventionResponse> =
        items.into_iter().map(InterventionResponse::from_model).collect();
    Ok(Json(serde_json::json!({ "total": items.len(), "interventions": items })))
}

/// Highest-priority open item, oldest first on ties.
async fn next(
    Query(filter): Query<NextFilter>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let item =
        repositories::interventions::next_open(state.db(), filter.priority, filter.entity_kind)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to query the intervention queue"))?;
    Ok(Json(serde_json::json!({
        "item": item.map(InterventionResponse::from_model),
    })))
}

async fn get_one(
    Path(intervention_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<InterventionResponse>, ApiError> {
    let item = repositories::interventions::find_by_id(state.db(), &intervention_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch intervention"))?
        .ok_or_else(|| ApiError::NotFound(format!("intervention {intervention_id} not found")))?;
    Ok(Json(InterventionResponse::from_model(item)))
}

async fn claim(
    Path(intervention_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ClaimRequest>,
) -> Result<Json<InterventionResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let item = interventions::claim(&state, &intervention_id, &payload.assignee).await?;
    Ok(Json(InterventionResponse::from_model(item)))
}

async fn resolve(
    Path(intervention_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ResolveRequest>,
) -> Result<Json<InterventionResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let item = interventions::resolve(
        &state,
        &intervention_id,
        Resolution {
            resolved_by: &payload.resolved_by,
            note: &payload.note,
            final_answer: payload.final_answer,
        },
    )
    .await?;
    Ok(Json(InterventionResponse::from_model(item)))
}

async fn cancel(
    Path(intervention_id): Path<String>,
    State(state): State<AppState>,
    payload: Option<Json<CancelRequest>>,
) -> Result<Json<InterventionResponse>, ApiError> {
    let note = payload.and_then(|Json(request)| request.note);
    let item = interventions::cancel(&state, &intervention_id, note.as_deref()).await?;
    Ok(Json(InterventionResponse::from_model(item)))
}
