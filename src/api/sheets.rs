use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, routing::post, Json, Router};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::BubbleCell;
use crate::db::types::{DetectedMark, SheetStage};
use crate::ledger::block::{hash_value, BlockKind, BlockSignature};
use crate::repositories;
use crate::schemas::sheet::{
    BubbleSubmit, FinalizeRequest, ManualSubmit, ScoreRequest, SheetAggregate, SheetIngest,
    StageResponse,
};
use crate::services::audit;
use crate::services::pipeline::{self, StageOutcome};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(ingest_sheet))
        .route("/:sheet_id", get(get_sheet))
        .route("/:sheet_id/quality", post(quality_stage))
        .route("/:sheet_id/reconstruct", post(reconstruct_stage))
        .route("/:sheet_id/bubbles", post(bubbles_stage))
        .route("/:sheet_id/ai-solve", post(ai_solve_stage))
        .route("/:sheet_id/manual", post(manual_stage))
        .route("/:sheet_id/reconcile", post(reconcile_stage))
        .route("/:sheet_id/score", post(score_stage))
        .route("/:sheet_id/finalize", post(finalize_stage))
}

/// Ingestion creates the Sheet, pins the image content hash, and appends
/// the SHEET_INGESTED block.
async fn ingest_sheet(
    State(state): State<AppState>,
    Json(payload): Json<SheetIngest>,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let image_hash = match (&payload.image_hash, &payload.image) {
        (Some(hash), _) => {
            if hash.len() != 64 || !hash.bytes().all(|byte| byte.is_ascii_hexdigit()) {
                return Err(ApiError::BadRequest(
                    "image_hash must be 64 hex characters".to_string(),
                ));
            }
            hash.to_ascii_lowercase()
        }
        (None, Some(image)) => {
            let bytes = hex::decode(image)
                .map_err(|_| ApiError::BadRequest("image must be hex-encoded bytes".to_string()))?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hex::encode(hasher.finalize())
        }
        (None, None) => {
            return Err(ApiError::BadRequest(
                "either image bytes or a content hash is required".to_string(),
            ))
        }
    };

    let paper = repositories::papers::find_by_exam(state.db(), &payload.exam_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to look up question paper"))?;
    if paper.is_none() {
        return Err(ApiError::BadRequest(format!(
            "no question paper registered for exam {}",
            payload.exam_id
        )));
    }

    let existing = repositories::sheets::find_by_exam_and_roll(
        state.db(),
        &payload.exam_id,
        &payload.roll_number,
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to look up sheet"))?;
    if existing.is_some() {
        return Err(ApiError::Conflict(format!(
            "a sheet for roll {} already exists in exam {}",
            payload.roll_number, payload.exam_id
        )));
    }

    let now = primitive_now_utc();
    let sheet_id = Uuid::new_v4().to_string();
    let mut tx = state
        .db()
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to start transaction"))?;

    let sheet = repositories::sheets::create(
        &mut *tx,
        repositories::sheets::CreateSheet {
            id: &sheet_id,
            exam_id: &payload.exam_id,
            roll_number: &payload.roll_number,
            image_hash: &image_hash,
            created_at: now,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to create sheet"))?;

    let block_payload = vec![
        audit::sheet_item(&sheet_id),
        audit::stage_item(SheetStage::Ingested.as_str()),
        audit::entity_item("sheet", &sheet),
    ];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::SheetIngested,
        block_payload,
        Vec::new(),
        None,
    )?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet_id,
        SheetStage::Ingested,
        &block.self_hash,
        now,
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to link sheet to its block"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit transaction"))?;

    Ok((
        StatusCode::CREATED,
        Json(StageResponse {
            sheet_id,
            stage: SheetStage::Ingested,
            block_hash: block.self_hash,
            opened_interventions: Vec::new(),
        }),
    ))
}

async fn quality_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = pipeline::run_quality(&state, &sheet_id).await?;
    stage_response(outcome)
}

async fn reconstruct_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = pipeline::run_reconstruct(&state, &sheet_id).await?;
    stage_response(outcome)
}

async fn bubbles_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<BubbleSubmit>,
) -> Result<Json<StageResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut entries: BTreeMap<u32, BubbleCell> = BTreeMap::new();
    for (question, cell) in payload.entries {
        if !(0.0..=1.0).contains(&cell.confidence) {
            return Err(ApiError::BadRequest(format!(
                "question {question}: confidence must be within 0..=1"
            )));
        }
        let answer: DetectedMark = serde_json::from_value(serde_json::Value::String(cell.answer))
            .map_err(|e| ApiError::BadRequest(format!("question {question}: {e}")))?;
        entries.insert(question, BubbleCell { answer, confidence: cell.confidence });
    }

    let outcome = pipeline::record_bubbles(&state, &sheet_id, entries).await?;
    stage_response(outcome)
}

async fn ai_solve_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = pipeline::run_ai_solve(&state, &sheet_id).await?;
    stage_response(outcome)
}

async fn manual_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ManualSubmit>,
) -> Result<Json<StageResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let outcome =
        pipeline::record_manual(&state, &sheet_id, payload.entries, &payload.entered_by).await?;
    stage_response(outcome)
}

async fn reconcile_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StageResponse>, ApiError> {
    let outcome = pipeline::run_reconcile(&state, &sheet_id).await?;
    stage_response(outcome)
}

async fn score_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
    payload: Option<Json<ScoreRequest>>,
) -> Result<Json<StageResponse>, ApiError> {
    let manual_marks = payload.and_then(|Json(request)| request.manual_marks);
    let outcome = pipeline::run_score(&state, &sheet_id, manual_marks).await?;
    stage_response(outcome)
}

async fn finalize_stage(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<FinalizeRequest>,
) -> Result<Json<StageResponse>, ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let signatures: Vec<BlockSignature> = payload
        .signatures
        .into_iter()
        .map(|submit| BlockSignature {
            signer_kind: submit.signer_kind,
            signer_key: submit.signer_key,
            signature: submit.signature,
        })
        .collect();

    let outcome = pipeline::run_finalize(&state, &sheet_id, signatures).await?;
    stage_response(outcome)
}

async fn get_sheet(
    Path(sheet_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SheetAggregate>, ApiError> {
    let sheet = repositories::sheets::find_by_id(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch sheet"))?
        .ok_or_else(|| ApiError::NotFound(format!("sheet {sheet_id} not found")))?;

    let quality = repositories::quality::find_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch quality record"))?;
    let bubbles = repositories::bubbles::find_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch bubble reading"))?;
    let verdict = repositories::verdicts::find_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch solver verdict"))?;
    let manual = repositories::manual_entries::find_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch manual entry"))?;
    let reconciliation = repositories::reconciliations::find_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch reconciliation"))?;
    let score = repositories::scores::find_by_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch score result"))?
        .map(|result| {
            let result_hash = hash_value(&result);
            (result, result_hash)
        });
    let open = repositories::interventions::open_for_sheet(state.db(), &sheet_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch interventions"))?;

    let sheet_ref = audit::sheet_item(&sheet_id);
    let block_trail: Vec<String> = state
        .ledger()
        .find_by_payload("sheet_id", &sheet_ref.value_hash)
        .into_iter()
        .map(|block| block.self_hash)
        .collect();

    Ok(Json(SheetAggregate::assemble(
        sheet,
        quality,
        bubbles,
        verdict,
        manual,
        reconciliation,
        score,
        open.into_iter().map(|item| item.id).collect(),
        block_trail,
    )))
}

fn stage_response(outcome: StageOutcome) -> Result<Json<StageResponse>, ApiError> {
    match outcome {
        StageOutcome::Advanced { sheet, block_hash, opened_interventions } => Ok(Json(
            StageResponse { sheet_id: sheet.id, stage: sheet.stage, block_hash, opened_interventions },
        )),
        StageOutcome::PreconditionFailed { stage, message } => {
            Err(ApiError::PreconditionFailed { stage: stage.as_str().to_string(), message })
        }
        StageOutcome::GateBlocked { intervention_ids } => {
            Err(ApiError::GateBlocked { intervention_ids })
        }
        StageOutcome::AdapterUnavailable { message, intervention_id } => Err(
            ApiError::AdapterUnavailable(format!("{message} (intervention {intervention_id})")),
        ),
        StageOutcome::Cancelled { intervention_id } => Err(ApiError::Conflict(format!(
            "stage cancelled; intervention {intervention_id} opened"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support::{self, TestContext};

    async fn sheet_through_bubbles(ctx: &TestContext, confidence: f64) -> String {
        let paper_id = test_support::create_paper(ctx, "exam-1").await;
        let key_id = test_support::create_key(ctx, &paper_id).await;
        test_support::lock_key(ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(ctx, "exam-1", "roll-001").await;
        test_support::run_stage(ctx, &sheet_id, "quality").await;
        test_support::submit_bubbles(
            ctx,
            &sheet_id,
            &[("1", "A", confidence), ("2", "B", confidence), ("3", "C", confidence)],
        )
        .await;
        sheet_id
    }

    #[tokio::test]
    async fn happy_path_reaches_a_perfect_finalized_evaluation() {
        let ctx = test_support::setup_test_context().await;
        let sheet_id = sheet_through_bubbles(&ctx, 0.95).await;

        test_support::run_stage(&ctx, &sheet_id, "ai-solve").await;
        test_support::submit_manual(&ctx, &sheet_id, &[("1", "A"), ("2", "B"), ("3", "C")]).await;
        test_support::run_stage(&ctx, &sheet_id, "reconcile").await;

        let score = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/score"),
            Some(json!({ "manual_marks": 6.0 })),
        )
        .await;
        assert_eq!(score.status(), StatusCode::OK);

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["score"]["automated_marks"], 6.0);
        assert_eq!(aggregate["score"]["marks_match"], true);
        assert_eq!(aggregate["score"]["is_perfect_evaluation"], true);
        assert_eq!(aggregate["score"]["grade"], "A+");
        for question in ["1", "2", "3"] {
            assert_eq!(aggregate["reconciliation"][question]["status"], "matched");
        }

        let result_hash = aggregate["score"]["result_hash"].as_str().expect("result hash");
        let signatures = test_support::three_signatures(&ctx, result_hash);
        let finalize = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/finalize"),
            Some(json!({ "signatures": signatures })),
        )
        .await;
        assert_eq!(finalize.status(), StatusCode::OK);
        let finalized = test_support::read_json(finalize).await;
        assert_eq!(finalized["stage"], "finalized");

        assert!(ctx.state.ledger().validate().is_ok());
        let head = ctx.state.ledger().head().expect("head block");
        assert_eq!(head.kind.as_str(), "RESULT_FINALIZED");
        assert_eq!(head.signatures.len(), 3);
    }

    #[tokio::test]
    async fn solver_dispute_resolves_in_the_bubbles_favor() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.solver.answer(1, "B");
        })
        .await;
        let sheet_id = sheet_through_bubbles(&ctx, 0.9).await;

        test_support::run_stage(&ctx, &sheet_id, "ai-solve").await;
        test_support::submit_manual(&ctx, &sheet_id, &[("1", "A"), ("2", "B"), ("3", "C")]).await;
        test_support::run_stage(&ctx, &sheet_id, "reconcile").await;

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["reconciliation"]["1"]["status"], "disputed_ai");
        assert_eq!(aggregate["reconciliation"]["1"]["final"], "A");
        assert!(
            aggregate["open_interventions"].as_array().unwrap().is_empty(),
            "disputed_ai must not open an intervention"
        );

        let score = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/score"),
            None,
        )
        .await;
        assert_eq!(score.status(), StatusCode::OK);
        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["score"]["automated_marks"], 6.0, "question 1 still earns marks");
    }

    #[tokio::test]
    async fn three_way_split_blocks_scoring_until_resolved() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.solver.answer(1, "B");
        })
        .await;
        let sheet_id = sheet_through_bubbles(&ctx, 0.95).await;

        test_support::run_stage(&ctx, &sheet_id, "ai-solve").await;
        test_support::submit_manual(&ctx, &sheet_id, &[("1", "C"), ("2", "B"), ("3", "C")]).await;
        test_support::run_stage(&ctx, &sheet_id, "reconcile").await;

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["reconciliation"]["1"]["status"], "three_way_split");
        assert!(aggregate["reconciliation"]["1"]["final"].is_null());
        let open = aggregate["open_interventions"].as_array().unwrap();
        assert_eq!(open.len(), 1);

        let intervention = test_support::fetch_intervention(&ctx, open[0].as_str().unwrap()).await;
        assert_eq!(intervention["priority"], "high");
        assert_eq!(intervention["reason_kind"], "three_way_split");

        let score = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/score"),
            None,
        )
        .await;
        assert_eq!(score.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = test_support::read_json(score).await;
        assert_eq!(body["code"], "GATE_BLOCKED");
    }

    #[tokio::test]
    async fn low_confidence_forces_review_despite_agreement() {
        let ctx = test_support::setup_test_context().await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let key_id = test_support::create_key(&ctx, &paper_id).await;
        test_support::lock_key(&ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;
        test_support::run_stage(&ctx, &sheet_id, "quality").await;
        test_support::submit_bubbles(
            &ctx,
            &sheet_id,
            &[("1", "A", 0.5), ("2", "B", 0.9), ("3", "C", 0.9)],
        )
        .await;
        test_support::run_stage(&ctx, &sheet_id, "ai-solve").await;
        test_support::submit_manual(&ctx, &sheet_id, &[("1", "A"), ("2", "B"), ("3", "C")]).await;
        test_support::run_stage(&ctx, &sheet_id, "reconcile").await;

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["reconciliation"]["1"]["status"], "needs_review");
        let open = aggregate["open_interventions"].as_array().unwrap();
        assert_eq!(open.len(), 1);
        let intervention = test_support::fetch_intervention(&ctx, open[0].as_str().unwrap()).await;
        assert_eq!(intervention["priority"], "normal");
        assert_eq!(intervention["reason_kind"], "low_confidence");
    }

    #[tokio::test]
    async fn two_signatures_are_insufficient_and_append_nothing() {
        let ctx = test_support::setup_test_context().await;
        let sheet_id = sheet_through_bubbles(&ctx, 0.95).await;
        test_support::run_stage(&ctx, &sheet_id, "ai-solve").await;
        test_support::run_stage(&ctx, &sheet_id, "reconcile").await;
        test_support::run_stage(&ctx, &sheet_id, "score").await;

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        let result_hash = aggregate["score"]["result_hash"].as_str().expect("result hash");
        let head_before = ctx.state.ledger().head().expect("head").self_hash;

        let signatures = test_support::two_signatures(&ctx, result_hash);
        let finalize = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/finalize"),
            Some(json!({ "signatures": signatures })),
        )
        .await;
        assert_eq!(finalize.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = test_support::read_json(finalize).await;
        assert_eq!(body["code"], "SIGNATURE_INSUFFICIENT");

        assert_eq!(ctx.state.ledger().head().expect("head").self_hash, head_before);
        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["stage"], "scored", "the sheet must stay in SCORED");
    }

    #[tokio::test]
    async fn finalize_is_gated_while_an_intervention_pins_the_sheet() {
        let ctx = test_support::setup_test_context().await;
        let sheet_id = sheet_through_bubbles(&ctx, 0.95).await;
        test_support::run_stage(&ctx, &sheet_id, "ai-solve").await;
        test_support::run_stage(&ctx, &sheet_id, "reconcile").await;
        test_support::run_stage(&ctx, &sheet_id, "score").await;

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        let result_hash =
            aggregate["score"]["result_hash"].as_str().expect("result hash").to_string();

        // Pin the sheet after scoring, the way the deadline watchdog would.
        let item = crate::services::interventions::open(
            &ctx.state,
            crate::services::interventions::OpenIntervention {
                entity_kind: crate::db::types::EntityKind::Sheet,
                entity_id: &sheet_id,
                sheet_id: Some(&sheet_id),
                reason: crate::db::types::ReasonKind::DeadlineExpired,
                detail: None,
                priority: crate::db::types::InterventionPriority::Critical,
            },
        )
        .await
        .expect("open intervention");

        let head_before = ctx.state.ledger().head().expect("head").self_hash;
        let signatures = test_support::three_signatures(&ctx, &result_hash);
        let finalize = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/finalize"),
            Some(json!({ "signatures": signatures })),
        )
        .await;
        assert_eq!(finalize.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = test_support::read_json(finalize).await;
        assert_eq!(body["code"], "GATE_BLOCKED");
        assert_eq!(body["details"]["intervention_ids"][0], item.id.as_str());
        assert_eq!(
            ctx.state.ledger().head().expect("head").self_hash,
            head_before,
            "no RESULT_FINALIZED block may be appended while the sheet is pinned"
        );
    }

    #[tokio::test]
    async fn replaying_a_stage_returns_precondition_failed_without_a_block() {
        let ctx = test_support::setup_test_context().await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let key_id = test_support::create_key(&ctx, &paper_id).await;
        test_support::lock_key(&ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;
        test_support::run_stage(&ctx, &sheet_id, "quality").await;
        let blocks_before = ctx.state.ledger().len();

        let replay = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/quality"),
            None,
        )
        .await;
        assert_eq!(replay.status(), StatusCode::CONFLICT);
        let body = test_support::read_json(replay).await;
        assert_eq!(body["code"], "PRECONDITION_FAILED");
        assert_eq!(body["details"]["current_stage"], "quality_assessed");
        assert_eq!(ctx.state.ledger().len(), blocks_before);
    }

    #[tokio::test]
    async fn rejected_sheets_terminate_at_quality() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.vision.score = 0.2;
        })
        .await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let _ = paper_id;

        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;
        let response = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/quality"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = test_support::read_json(response).await;
        assert_eq!(body["stage"], "rejected");
    }

    #[tokio::test]
    async fn adapter_exhaustion_opens_a_critical_intervention() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.vision.fail_transient = true;
        })
        .await;
        test_support::create_paper(&ctx, "exam-1").await;
        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;

        let response = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/quality"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["stage"], "ingested", "the sheet must stay in its stage");
        let open = aggregate["open_interventions"].as_array().unwrap();
        assert_eq!(open.len(), 1);
        let intervention = test_support::fetch_intervention(&ctx, open[0].as_str().unwrap()).await;
        assert_eq!(intervention["priority"], "critical");
        assert_eq!(intervention["reason_kind"], "adapter_failure");
    }

    #[tokio::test]
    async fn damaged_sheets_reconstruct_before_bubbles() {
        let ctx = test_support::setup_test_context_with(|fakes| {
            fakes.vision.score = 0.6;
        })
        .await;
        let paper_id = test_support::create_paper(&ctx, "exam-1").await;
        let key_id = test_support::create_key(&ctx, &paper_id).await;
        test_support::lock_key(&ctx, &key_id).await;

        let sheet_id = test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;
        test_support::run_stage(&ctx, &sheet_id, "quality").await;

        // Bubbles are refused until the sheet is reconstructed.
        let premature = test_support::send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/sheets/{sheet_id}/bubbles"),
            Some(json!({ "entries": { "1": { "answer": "A", "confidence": 0.9 } } })),
        )
        .await;
        assert_eq!(premature.status(), StatusCode::CONFLICT);

        let reconstruct = test_support::run_stage(&ctx, &sheet_id, "reconstruct").await;
        assert_eq!(reconstruct["stage"], "reconstructed");

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["quality"]["decision"], "reconstruct");
        assert!(aggregate["reconstructed_hash"].is_string());
        assert!(aggregate["quality"]["reconstruction_confidence"].is_number());

        test_support::submit_bubbles(
            &ctx,
            &sheet_id,
            &[("1", "A", 0.9), ("2", "B", 0.9), ("3", "C", 0.9)],
        )
        .await;
        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        assert_eq!(aggregate["stage"], "bubbles_read");
    }

    #[tokio::test]
    async fn sheet_aggregate_carries_its_block_trail() {
        let ctx = test_support::setup_test_context().await;
        let sheet_id = sheet_through_bubbles(&ctx, 0.9).await;

        let aggregate = test_support::fetch_sheet(&ctx, &sheet_id).await;
        let trail = aggregate["block_trail"].as_array().unwrap();
        // SHEET_INGESTED, QUALITY_ASSESSED, BUBBLES_READ.
        assert_eq!(trail.len(), 3);
        assert_eq!(aggregate["last_block_hash"], *trail.last().unwrap());
    }
}
