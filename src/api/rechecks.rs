use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, routing::post, Json, Router};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::db::types::RecheckStatus;
use crate::repositories;
use crate::schemas::recheck::{
    RecheckComplete, RecheckCreate, RecheckResponse, RecheckResultResponse,
};
use crate::services::rechecks::{self, CompleteRecheck, RequestRecheck};

/// Revaluation routes, merged into the `/sheets` subtree.
pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:sheet_id/recheck", post(create_recheck))
        .route("/:sheet_id/rechecks", get(list_rechecks))
        .route("/:sheet_id/rechecks/:recheck_id", get(get_recheck_result))
        .route("/:sheet_id/rechecks/:recheck_id/complete", post(complete_recheck))
}

async fn create_recheck(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<RecheckCreate>,
) -> Result<(StatusCode, Json<RecheckResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let item = rechecks::request(
        &state,
        RequestRecheck {
            sheet_id: &sheet_id,
            requested_by: &payload.requested_by,
            reason: &payload.reason,
            questions: payload.questions,
        },
    )
    .await?;

    Ok((StatusCode::CREATED, Json(RecheckResponse::from_model(item))))
}

async fn list_rechecks(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sheet = repositories::sheets::find_by_id(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch sheet"))?;
    if sheet.is_none() {
        return Err(ApiError::NotFound(format!("sheet {sheet_id} not found")));
    }

    let items = repositories::rechecks::list_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to list recheck requests"))?;
    let items: Vec<RecheckResponse> =
        items.into_iter().map(RecheckResponse::from_model).collect();

    Ok(Json(serde_json::json!({
        "sheet_id": sheet_id,
        "total": items.len(),
        "recheck_requests": items,
    })))
}

/// Before/after result of a revaluation; refused while the request is
/// still pending.
async fn get_recheck_result(
    Path((sheet_id, recheck_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<RecheckResultResponse>, ApiError> {
    let item = repositories::rechecks::find_by_id(state.db(), &recheck_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch recheck request"))?
        .filter(|item| item.sheet_id == sheet_id)
        .ok_or_else(|| ApiError::NotFound(format!("recheck request {recheck_id} not found")))?;

    if item.status == RecheckStatus::Pending {
        return Err(ApiError::Conflict("recheck request is still pending".to_string()));
    }

    let original_result = item
        .original_result
        .map(|snapshot| snapshot.0)
        .ok_or_else(|| ApiError::internal("missing snapshot", "Recheck row is incomplete"))?;
    let rechecked_result = item
        .rechecked_result
        .map(|snapshot| snapshot.0)
        .ok_or_else(|| ApiError::internal("missing snapshot", "Recheck row is incomplete"))?;

    Ok(Json(RecheckResultResponse {
        id: item.id,
        sheet_id: item.sheet_id,
        status: item.status,
        original_result,
        rechecked_result,
        changes_found: item.changes_found.map(|changes| changes.0).unwrap_or_default(),
        completed_by: item.completed_by,
        completed_at: item.completed_at.map(crate::core::time::format_primitive),
    }))
}

async fn complete_recheck(
    Path((sheet_id, recheck_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(payload): Json<RecheckComplete>,
) -> Result<Json<RecheckResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let item = rechecks::complete(
        &state,
        CompleteRecheck {
            sheet_id: &sheet_id,
            recheck_id: &recheck_id,
            completed_by: &payload.completed_by,
            corrections: payload.corrections,
        },
    )
    .await?;

    Ok(Json(RecheckResponse::from_model(item)))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support::{self, TestContext};

    /// Drive a sheet to FINALIZED with question 1 detected as a clear but
    /// wrong answer (D against key A), so a recheck has something to fix.
    async fn finalized_sheet(ctx: &TestContext) -> String {
        let paper_id = test_support::create_paper(ctx, "exam-1").await;
        let key_id = test_support::create_key(ctx, &paper_id).await;
        test_support::lock_key(ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(ctx, "exam-1", "roll-001").await;
        test_support::run_stage(ctx, &sheet_id, "quality").await;
        test_support::submit_bubbles(
            ctx,
            &sheet_id,
            &[("1", "D", 0.95), ("2", "B", 0.95), ("3", "C", 0.95)],
        )
        .await;
        test_support::run_stage(ctx, &sheet_id, "ai-solve").await;
        test_support::submit_manual(ctx, &sheet_id, &[("1", "D"), ("2", "B"), ("3", "C")]).await;
        test_support::run_stage(ctx, &sheet_id, "reconcile").await;
        test_support::run_stage(ctx, &sheet_id, "score").await;

        let aggregate = test_support::fetch_sheet(ctx, &sheet_id).await;
        assert_eq!(aggregate["score"]["automated_marks"], 4.0);
        let result_hash = aggregate["score"]["result_hash"].as_str().expect("result hash");

        let signatures = test_support::three_signatures(ctx, result_hash);
        let finalize = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/finalize"),
            Some(json!({ "signatures": signatures })),
        )
        .await;
        assert_eq!(finalize.status(), StatusCode::OK);
        sheet_id
    }

    #[tokio::test]
    async fn recheck_lifecycle_records_before_and_after() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.solver.answer(1, "D");
        })
        .await;
        let sheet_id = finalized_sheet(&ctx).await;

        let create = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/recheck"),
            Some(json!({
                "requested_by": "student-17",
                "reason": "question 1 was marked A, not D",
                "questions": [1]
            })),
        )
        .await;
        assert_eq!(create.status(), StatusCode::CREATED);
        let created = test_support::read_json(create).await;
        assert_eq!(created["status"], "pending");
        let recheck_id = created["id"].as_str().expect("recheck id").to_string();
        assert!(created["requested_block_hash"].is_string());

        // The result is not available while the request is pending.
        let premature = test_support::send_json(
            &ctx.app,
            Method::GET,
            &format!("/api/v1/sheets/{sheet_id}/rechecks/{recheck_id}"),
            None,
        )
        .await;
        assert_eq!(premature.status(), StatusCode::CONFLICT);

        // One pending revaluation at a time.
        let duplicate = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/recheck"),
            Some(json!({ "requested_by": "student-17", "reason": "again" })),
        )
        .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let listing = test_support::send_json(
            &ctx.app,
            Method::GET,
            &format!("/api/v1/sheets/{sheet_id}/rechecks"),
            None,
        )
        .await;
        let listing = test_support::read_json(listing).await;
        assert_eq!(listing["total"], 1);
        assert_eq!(listing["recheck_requests"][0]["id"], recheck_id.as_str());

        let complete = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/rechecks/{recheck_id}/complete"),
            Some(json!({
                "completed_by": "reviewer-3",
                "corrections": { "1": "A" }
            })),
        )
        .await;
        assert_eq!(complete.status(), StatusCode::OK);
        let completed = test_support::read_json(complete).await;
        assert_eq!(completed["status"], "completed");
        assert!(completed["completed_block_hash"].is_string());

        let result = test_support::send_json(
            &ctx.app,
            Method::GET,
            &format!("/api/v1/sheets/{sheet_id}/rechecks/{recheck_id}"),
            None,
        )
        .await;
        assert_eq!(result.status(), StatusCode::OK);
        let result = test_support::read_json(result).await;
        assert_eq!(result["original_result"]["automated_marks"], 4.0);
        assert_eq!(result["rechecked_result"]["automated_marks"], 6.0);
        assert_eq!(result["rechecked_result"]["grade"], "A+");
        let changes = result["changes_found"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["question"], 1);
        assert_eq!(changes[0]["previous_answer"], "D");
        assert_eq!(changes[0]["corrected_answer"], "A");
        assert_eq!(changes[0]["previous_marks"], 0.0);
        assert_eq!(changes[0]["corrected_marks"], 2.0);

        // The finalized score itself stays immutable; the recheck row is
        // the revaluation record.
        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["score"]["automated_marks"], 4.0);
        assert_eq!(aggregate["stage"], "finalized");

        let head = ctx.state.ledger().head().expect("head block");
        assert_eq!(head.kind.as_str(), "RECHECK_COMPLETED");
        assert!(head.payload.iter().any(|item| item.key == "requested_block"));
        assert!(ctx.state.ledger().validate().is_ok());
    }

    #[tokio::test]
    async fn rechecks_are_only_accepted_for_finalized_sheets() {
        let ctx = test_support::setup_test_context().await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let key_id = test_support::create_key(&ctx, &paper_id).await;
        test_support::lock_key(&ctx, &key_id).await;
        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;
        test_support::run_stage(&ctx, &sheet_id, "quality").await;

        let blocks_before = ctx.state.ledger().len();
        let response = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/recheck"),
            Some(json!({ "requested_by": "student-17", "reason": "too early" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(ctx.state.ledger().len(), blocks_before, "no block for a refused recheck");
    }

    #[tokio::test]
    async fn completing_twice_or_out_of_scope_is_refused() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.solver.answer(1, "D");
        })
        .await;
        let sheet_id = finalized_sheet(&ctx).await;

        let create = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/recheck"),
            Some(json!({
                "requested_by": "student-17",
                "reason": "question 1 dispute",
                "questions": [1]
            })),
        )
        .await;
        let recheck_id =
            test_support::read_json(create).await["id"].as_str().expect("id").to_string();

        // Corrections outside the disputed questions are rejected.
        let out_of_scope = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/rechecks/{recheck_id}/complete"),
            Some(json!({ "completed_by": "reviewer-3", "corrections": { "2": "A" } })),
        )
        .await;
        assert_eq!(out_of_scope.status(), StatusCode::BAD_REQUEST);

        let complete = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/rechecks/{recheck_id}/complete"),
            Some(json!({ "completed_by": "reviewer-3", "corrections": { "1": "A" } })),
        )
        .await;
        assert_eq!(complete.status(), StatusCode::OK);

        let again = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/rechecks/{recheck_id}/complete"),
            Some(json!({ "completed_by": "reviewer-3", "corrections": { "1": "A" } })),
        )
        .await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }
}
