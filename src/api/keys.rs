use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, routing::post, Json, Router};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{AnswerKey, KeyEntry, KeyFlag};
use crate::db::types::{EntityKind, InterventionPriority, KeyStatus, ReasonKind};
use crate::ledger::block::{payload_item, BlockKind};
use crate::repositories;
use crate::schemas::key::{KeyApprove, KeyCreate, KeyResponse, KeyVerifyResponse};
use crate::services::answer_ai::VerifyRequest;
use crate::services::audit;
use crate::services::interventions::{self, OpenIntervention};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_key))
        .route("/:key_id", get(get_key))
        .route("/:key_id/verify", post(verify_key))
        .route("/:key_id/approve", post(approve_key))
        .route("/:key_id/lock", post(lock_key))
}

async fn create_key(
    State(state): State<AppState>,
    Json(payload): Json<KeyCreate>,
) -> Result<(StatusCode, Json<KeyResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let paper = repositories::papers::find_by_id(state.db(), &payload.paper_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch question paper"))?
        .ok_or_else(|| ApiError::NotFound(format!("paper {} not found", payload.paper_id)))?;

    let total = u32::try_from(paper.total_questions).unwrap_or(u32::MAX);
    for question in payload.answers.keys() {
        if *question == 0 || *question > total {
            return Err(ApiError::BadRequest(format!(
                "question {question} is outside this paper's 1..={total} range"
            )));
        }
    }

    let answers: BTreeMap<u32, KeyEntry> = payload
        .answers
        .into_iter()
        .map(|(question, entry)| {
            (question, KeyEntry { answer: entry.answer, marks: entry.marks })
        })
        .collect();

    let now = primitive_now_utc();
    let key = repositories::keys::create(
        state.db(),
        repositories::keys::CreateKey {
            id: &Uuid::new_v4().to_string(),
            paper_id: &payload.paper_id,
            answers,
            created_at: now,
        },
    )
    .await
    .map_err(|e| ApiError::internal(e, "Failed to create answer key"))?;

    Ok((StatusCode::CREATED, Json(KeyResponse::from_model(key))))
}

async fn get_key(
    Path(key_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<KeyResponse>, ApiError> {
    let key = load_key(&state, &key_id).await?;
    Ok(Json(KeyResponse::from_model(key)))
}

/// Run the independent solver over every key entry. Disagreements flag the
/// key and open one intervention each; agreement moves it to ai_verified.
async fn verify_key(
    Path(key_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<KeyVerifyResponse>, ApiError> {
    let key = load_key(&state, &key_id).await?;
    if !matches!(key.status, KeyStatus::Draft | KeyStatus::Flagged) {
        return Err(ApiError::PreconditionFailed {
            stage: key_status_label(key.status).to_string(),
            message: "only draft or flagged keys can be AI-verified".to_string(),
        });
    }

    let paper = repositories::papers::find_by_id(state.db(), &key.paper_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch question paper"))?
        .ok_or_else(|| ApiError::NotFound(format!("paper {} not found", key.paper_id)))?;

    let mut flags: BTreeMap<u32, KeyFlag> = BTreeMap::new();
    let mut disagreements = Vec::new();

    for (question, entry) in &key.answers.0 {
        state.limiter().verify().acquire().await;
        let request = VerifyRequest {
            paper_hash: &paper.content_hash,
            question_number: *question,
            proposed_answer: &entry.answer,
        };
        let verification = match state.solver().verify_answer_key(request).await {
            Ok(verification) => verification,
            Err(error) => {
                interventions::open(
                    &state,
                    OpenIntervention {
                        entity_kind: EntityKind::AnswerKey,
                        entity_id: &key.id,
                        sheet_id: None,
                        reason: ReasonKind::AdapterFailure,
                        detail: Some(format!("verify_answer_key: {error}")),
                        priority: InterventionPriority::Critical,
                    },
                )
                .await
                .map_err(ApiError::from)?;
                return Err(ApiError::AdapterUnavailable(format!(
                    "answer-key verification failed on question {question}: {error}"
                )));
            }
        };

        flags.insert(
            *question,
            KeyFlag { confidence: verification.confidence, note: verification.notes },
        );
        if !verification.agrees {
            disagreements.push(*question);
        }
    }

    let status = if disagreements.is_empty() { KeyStatus::AiVerified } else { KeyStatus::Flagged };
    let now = primitive_now_utc();

    let mut tx = state
        .db()
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to start transaction"))?;
    repositories::keys::update_flags(&mut *tx, &key.id, flags, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to store key flags"))?;
    repositories::keys::update_status(&mut *tx, &key.id, status, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to update key status"))?;

    let block_payload = vec![
        payload_item("key_id", &key.id),
        payload_item("status", &status),
        payload_item("disagreements", &disagreements),
    ];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::AnswerKeyAiVerified,
        block_payload,
        Vec::new(),
        None,
    )?;
    repositories::keys::set_last_block(&mut *tx, &key.id, &block.self_hash, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to link key to its block"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit transaction"))?;

    let mut opened = Vec::new();
    for question in &disagreements {
        let item = interventions::open(
            &state,
            OpenIntervention {
                entity_kind: EntityKind::AnswerKey,
                entity_id: &key.id,
                sheet_id: None,
                reason: ReasonKind::KeyDisagreement,
                detail: Some(format!("solver disagrees with the key on question {question}")),
                priority: InterventionPriority::Normal,
            },
        )
        .await
        .map_err(ApiError::from)?;
        opened.push(item.id);
    }

    let key = load_key(&state, &key_id).await?;
    Ok(Json(KeyVerifyResponse {
        key: KeyResponse::from_model(key),
        disagreements,
        opened_interventions: opened,
        block_hash: block.self_hash,
    }))
}

/// Human approval, optionally correcting individual answers first.
async fn approve_key(
    Path(key_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<KeyApprove>,
) -> Result<Json<KeyResponse>, ApiError> {
    let key = load_key(&state, &key_id).await?;
    if !matches!(key.status, KeyStatus::Draft | KeyStatus::AiVerified | KeyStatus::Flagged) {
        return Err(ApiError::PreconditionFailed {
            stage: key_status_label(key.status).to_string(),
            message: "key has already been approved or locked".to_string(),
        });
    }

    let mut answers = key.answers.0.clone();
    for (question, corrected) in &payload.corrections {
        let entry = answers.get_mut(question).ok_or_else(|| {
            ApiError::BadRequest(format!("correction references unknown question {question}"))
        })?;
        entry.answer = corrected.clone();
    }

    let now = primitive_now_utc();
    let mut tx = state
        .db()
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to start transaction"))?;
    if !payload.corrections.is_empty() {
        repositories::keys::update_answers(&mut *tx, &key.id, answers.clone(), now)
            .await
            .map_err(|e| ApiError::internal(e, "Failed to apply key corrections"))?;
    }
    repositories::keys::update_status(&mut *tx, &key.id, KeyStatus::HumanApproved, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to update key status"))?;

    let block_payload = vec![
        payload_item("key_id", &key.id),
        payload_item("approved_by", &payload.approved_by.as_deref().unwrap_or("unknown")),
        payload_item("answers", &answers),
    ];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::AnswerKeyHumanApproved,
        block_payload,
        Vec::new(),
        None,
    )?;
    repositories::keys::set_last_block(&mut *tx, &key.id, &block.self_hash, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to link key to its block"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit transaction"))?;

    let key = load_key(&state, &key_id).await?;
    Ok(Json(KeyResponse::from_model(key)))
}

/// Only locked keys may score sheets; locking is the last key transition.
async fn lock_key(
    Path(key_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<KeyResponse>, ApiError> {
    let key = load_key(&state, &key_id).await?;
    if key.status != KeyStatus::HumanApproved {
        return Err(ApiError::PreconditionFailed {
            stage: key_status_label(key.status).to_string(),
            message: "only human-approved keys can be locked".to_string(),
        });
    }

    let now = primitive_now_utc();
    let mut tx = state
        .db()
        .begin()
        .await
        .map_err(|e| ApiError::internal(e, "Failed to start transaction"))?;
    repositories::keys::update_status(&mut *tx, &key.id, KeyStatus::Locked, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to update key status"))?;

    let block_payload =
        vec![payload_item("key_id", &key.id), audit::entity_item("answers", &key.answers.0)];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::AnswerKeyLocked,
        block_payload,
        Vec::new(),
        None,
    )?;
    repositories::keys::set_last_block(&mut *tx, &key.id, &block.self_hash, now)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to link key to its block"))?;
    tx.commit().await.map_err(|e| ApiError::internal(e, "Failed to commit transaction"))?;

    let key = load_key(&state, &key_id).await?;
    Ok(Json(KeyResponse::from_model(key)))
}

async fn load_key(state: &AppState, key_id: &str) -> Result<AnswerKey, ApiError> {
    repositories::keys::find_by_id(state.db(), key_id)
        .await
        .map_err(|e| ApiError::internal(e, "Failed to fetch answer key"))?
        .ok_or_else(|| ApiError::NotFound(format!("key {key_id} not found")))
}

fn key_status_label(status: KeyStatus) -> &'static str {
    match status {
        KeyStatus::Draft => "draft",
        KeyStatus::AiVerified => "ai_verified",
        KeyStatus::Flagged => "flagged",
        KeyStatus::HumanApproved => "human_approved",
        KeyStatus::Locked => "locked",
    }
}
