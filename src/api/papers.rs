use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, routing::post, Json, Router};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::ledger::block::{payload_item, BlockKind};
use crate::repositories;
use crate::schemas::key::KeyResponse;
use crate::schemas::paper::{PaperCreate, PaperResponse};
use crate::services::audit;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/", post(create_paper)).route("/:paper_id", get(get_paper))
}

async fn create_paper(
    State(state): State<AppState>,
    Json(payload): Json<PaperCreate>,
) -> Result<(StatusCode, Json<PaperResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let existing = repositories::papers::find_by_exam(state.db(), &payload.exam_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to look up question paper"))?;
    if existing.is_some() {
        return Err(ApiError::Conflict(format!(
            "a question paper already exists for exam {}",
            payload.exam_id
        )));
    }

    let now = primitive_now_utc();
    let paper_id = Uuid::new_v4().to_string();
    let mut tx = state
        .db()
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to start transaction"))?;

    let paper = repositories::papers::create(
        &mut *tx,
        repositories::papers::CreatePaper {
            id: &paper_id,
            exam_id: &payload.exam_id,
            subject: &payload.subject,
            total_questions: payload.total_questions,
            max_marks: payload.max_marks,
            content_hash: &payload.content_hash,
            created_at: now,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to create question paper"))?;

    let block_payload = vec![
        payload_item("paper_id", &paper_id),
        payload_item("exam_id", &payload.exam_id),
        audit::entity_item("question_paper", &paper),
    ];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::QuestionPaperUpload,
        block_payload,
        Vec::new(),
        None,
    )?;
    repositories::papers::set_last_block(&mut *tx, &paper_id, &block.self_hash, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to link paper to its block"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit transaction"))?;

    let mut response = PaperResponse::from_model(paper);
    response.last_block_hash = Some(block.self_hash);
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_paper(
    Path(paper_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let paper = repositories::papers::find_by_id(state.db(), &paper_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch question paper"))?
        .ok_or_else(|| ApiError::NotFound(format!("paper {paper_id} not found")))?;

    let key = repositories::keys::find_by_paper(state.db(), &paper_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch answer key"))?;

    Ok(Json(serde_json::json!({
        "paper": PaperResponse::from_model(paper),
        "answer_key": key.map(KeyResponse::from_model),
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::test_support::{self, sample_paper_body};

    #[tokio::test]
    async fn create_paper_appends_an_upload_block() {
        let ctx = test_support::setup_test_context().await;

        let response = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/papers",
            Some(sample_paper_body("exam-1")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = test_support::read_json(response).await;

        assert_eq!(body["exam_id"], "exam-1");
        let block_hash = body["last_block_hash"].as_str().expect("block hash");
        assert_eq!(ctx.state.ledger().len(), 1);
        assert_eq!(
            ctx.state.ledger().head().expect("head").self_hash,
            block_hash,
            "paper must link to the ledger head"
        );
    }

    #[tokio::test]
    async fn duplicate_exam_paper_conflicts() {
        let ctx = test_support::setup_test_context().await;

        let first = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/papers",
            Some(sample_paper_body("exam-1")),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = test_support::send_json(
            &ctx.app,
            Method::POST,
            "/api/v1/papers",
            Some(sample_paper_body("exam-1")),
        )
        .await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(ctx.state.ledger().len(), 1, "conflict must not append a block");
    }

    #[tokio::test]
    async fn get_paper_includes_key_summary() {
        let ctx = test_support::setup_test_context().await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        test_support::create_key(&ctx, &paper_id).await;

        let response = test_support::send_json(
            &ctx.app,
            Method::GET,
            &format!("/api/v1/papers/{paper_id}"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = test_support::read_json(response).await;
        assert_eq!(body["paper"]["id"], paper_id.as_str());
        assert_eq!(body["answer_key"]["status"], "draft");
    }
}
