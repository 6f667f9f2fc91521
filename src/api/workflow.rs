use axum::extract::State;
use axum::{routing::post, Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::workflow::{WorkflowCompleteRequest, WorkflowCompleteResponse};
use crate::services::pipeline;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/complete", post(complete))
}

/// Run every stage the sheet can pass without human input and stop at the
/// first gate, reporting where it stopped and which interventions block it.
async fn complete(
    State(state): State<AppState>,
    Json(payload): Json<WorkflowCompleteRequest>,
) -> Result<Json<WorkflowCompleteResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let progress = pipeline::advance_available(&state, &payload.sheet_id).await?;
    Ok(Json(WorkflowCompleteResponse {
        sheet_id: payload.sheet_id,
        stage: progress.stage,
        gating_interventions: progress.gating_interventions,
        halted: progress.halted,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support;

    #[tokio::test]
    async fn complete_drives_a_sheet_to_the_signature_gate() {
        let ctx = test_support::setup_test_context().await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let key_id = test_support::create_key(&ctx, &paper_id).await;
        test_support::lock_key(&ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;

        // First run stops at the external bubble reading.
        let first = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/workflow/complete",
            Some(json!({ "sheet_id": sheet_id })),
        )
        .await;
        assert_eq!(first.status(), StatusCode::OK);
        let body = test_support::read_json(first).await;
        assert_eq!(body["stage"], "quality_assessed");
        assert!(body["halted"].as_str().unwrap().contains("bubble reading"));

        test_support::submit_bubbles(
            &ctx,
            &sheet_id,
            &[("1", "A", 0.95), ("2", "B", 0.95), ("3", "C", 0.95)],
        )
        .await;

        // Second run chains solve, reconcile and score, then stops at the
        // multi-signature gate.
        let second = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/workflow/complete",
            Some(json!({ "sheet_id": sheet_id })),
        )
        .await;
        assert_eq!(second.status(), StatusCode::OK);
        let body = test_support::read_json(second).await;
        assert_eq!(body["stage"], "scored");
        assert!(body["halted"].as_str().unwrap().contains("signature"));
        assert!(body["gating_interventions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_surfaces_gating_interventions() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.solver.answer(1, "B");
        })
        .await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let key_id = test_support::create_key(&ctx, &paper_id).await;
        test_support::lock_key(&ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;
        test_support::run_stage(&ctx, &sheet_id, "quality").await;
        test_support::submit_bubbles(
            &ctx,
            &sheet_id,
            &[("1", "A", 0.95), ("2", "B", 0.95), ("3", "C", 0.95)],
        )
        .await;
        test_support::submit_manual(&ctx, &sheet_id, &[("1", "C"), ("2", "B"), ("3", "C")]).await;

        let response = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/workflow/complete",
            Some(json!({ "sheet_id": sheet_id })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = test_support::read_json(response).await;
        assert_eq!(body["stage"], "reconciled");
        assert_eq!(body["gating_interventions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn complete_on_an_unknown_sheet_is_not_found() {
        let ctx = test_support::setup_test_context().await;
        let response = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/workflow/complete",
            Some(json!({ "sheet_id": "missing" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
