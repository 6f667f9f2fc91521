use std::collections::BTreeMap;

use uuid::Uuid;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{RecheckChange, RecheckRequest, RecheckSnapshot, ScoreResult};
use crate::db::types::{KeyStatus, RecheckStatus, ReconcileStatus, SheetStage};
use crate::ledger::block::{payload_item, BlockKind};
use crate::repositories;
use crate::services::audit;
use crate::services::scoring;

#[derive(Debug, thiserror::Error)]
pub(crate) enum RecheckError {
    #[error("sheet {0} not found")]
    SheetNotFound(String),
    #[error("recheck request {0} not found")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] crate::ledger::LedgerError),
}

pub(crate) struct RequestRecheck<'a> {
    pub(crate) sheet_id: &'a str,
    pub(crate) requested_by: &'a str,
    pub(crate) reason: &'a str,
    /// Question numbers under dispute; empty means the whole sheet.
    pub(crate) questions: Vec<u32>,
}

/// Open a revaluation against a finalized sheet and record the
/// RECHECK_REQUESTED block. The finalized ScoreResult stays immutable; the
/// request row carries the before/after record.
pub(crate) async fn request(
    state: &AppState,
    request: RequestRecheck<'_>,
) -> Result<RecheckRequest, RecheckError> {
    let sheet = repositories::sheets::find_by_id(state.db(), request.sheet_id)
        .await?
        .ok_or_else(|| RecheckError::SheetNotFound(request.sheet_id.to_string()))?;
    if sheet.stage != SheetStage::Finalized {
        return Err(RecheckError::InvalidState(format!(
            "rechecks are only accepted for finalized sheets, this one is {}",
            sheet.stage.as_str()
        )));
    }
    if repositories::rechecks::pending_for_sheet(state.db(), &sheet.id).await?.is_some() {
        return Err(RecheckError::InvalidState(
            "a recheck request is already pending for this sheet".to_string(),
        ));
    }

    let paper = repositories::papers::find_by_exam(state.db(), &sheet.exam_id)
        .await?
        .ok_or_else(|| {
            RecheckError::Validation(format!(
                "no question paper registered for exam {}",
                sheet.exam_id
            ))
        })?;
    let total = u32::try_from(paper.total_questions).unwrap_or(u32::MAX);
    for question in &request.questions {
        if *question == 0 || *question > total {
            return Err(RecheckError::Validation(format!(
                "question {question} is outside this paper's 1..={total} range"
            )));
        }
    }

    let score = repositories::scores::find_by_sheet(state.db(), &sheet.id)
        .await?
        .ok_or_else(|| {
            RecheckError::InvalidState("finalized sheet has no score result".to_string())
        })?;

    let now = primitive_now_utc();
    let id = Uuid::new_v4().to_string();

    let mut tx = state.db().begin().await?;
    let mut item = repositories::rechecks::create(
        &mut *tx,
        repositories::rechecks::CreateRecheck {
            id: &id,
            sheet_id: &sheet.id,
            requested_by: request.requested_by,
            reason: request.reason,
            questions: request.questions.clone(),
            original_result: snapshot_of(&score),
            created_at: now,
        },
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        payload_item("recheck_id", &id),
        payload_item("requested_by", &request.requested_by),
        payload_item("reason", &request.reason),
        payload_item("questions", &request.questions),
    ];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::RecheckRequested,
        payload,
        Vec::new(),
        None,
    )?;
    repositories::rechecks::set_requested_block(&mut *tx, &id, &block.self_hash, now).await?;
    tx.commit().await?;

    item.requested_block_hash = Some(block.self_hash.clone());
    metrics::counter!("rechecks_requested_total").increment(1);
    tracing::info!(
        recheck_id = %id,
        sheet_id = %sheet.id,
        requested_by = request.requested_by,
        block = %block.self_hash,
        "Recheck requested"
    );

    Ok(item)
}

pub(crate) struct CompleteRecheck<'a> {
    pub(crate) sheet_id: &'a str,
    pub(crate) recheck_id: &'a str,
    pub(crate) completed_by: &'a str,
    /// Reviewer-corrected final answers per disputed question. An empty map
    /// confirms the original evaluation.
    pub(crate) corrections: BTreeMap<u32, String>,
}

/// Re-score the disputed questions with the reviewer's corrections and
/// record the outcome, appending the RECHECK_COMPLETED block that
/// references the requesting block.
pub(crate) async fn complete(
    state: &AppState,
    request: CompleteRecheck<'_>,
) -> Result<RecheckRequest, RecheckError> {
    let item = repositories::rechecks::find_by_id(state.db(), request.recheck_id)
        .await?
        .ok_or_else(|| RecheckError::NotFound(request.recheck_id.to_string()))?;
    if item.sheet_id != request.sheet_id {
        return Err(RecheckError::NotFound(request.recheck_id.to_string()));
    }
    if item.status != RecheckStatus::Pending {
        return Err(RecheckError::InvalidState(
            "recheck request has already been completed".to_string(),
        ));
    }

    let disputed = &item.questions.0;
    for question in request.corrections.keys() {
        if !disputed.is_empty() && !disputed.contains(question) {
            return Err(RecheckError::Validation(format!(
                "question {question} is not part of this recheck request"
            )));
        }
    }

    let sheet = repositories::sheets::find_by_id(state.db(), &item.sheet_id)
        .await?
        .ok_or_else(|| RecheckError::SheetNotFound(item.sheet_id.clone()))?;
    let paper = repositories::papers::find_by_exam(state.db(), &sheet.exam_id)
        .await?
        .ok_or_else(|| {
            RecheckError::Validation(format!(
                "no question paper registered for exam {}",
                sheet.exam_id
            ))
        })?;
    let key = repositories::keys::find_by_paper(state.db(), &paper.id)
        .await?
        .filter(|key| key.status == KeyStatus::Locked)
        .ok_or_else(|| {
            RecheckError::InvalidState("recheck requires the locked answer key".to_string())
        })?;
    let reconciliation = repositories::reconciliations::find_by_sheet(state.db(), &sheet.id)
        .await?
        .ok_or_else(|| {
            RecheckError::InvalidState("finalized sheet has no reconciliation".to_string())
        })?;
    let reading = repositories::bubbles::find_by_sheet(state.db(), &sheet.id)
        .await?
        .ok_or_else(|| {
            RecheckError::InvalidState("finalized sheet has no bubble reading".to_string())
        })?;

    for question in request.corrections.keys() {
        if !key.answers.0.contains_key(question) {
            return Err(RecheckError::Validation(format!(
                "question {question} is not part of the answer key"
            )));
        }
    }

    // Re-score a copy of the reconciliation with the corrections applied;
    // the stored rows stay as the pipeline left them.
    let mut entries = reconciliation.entries.0.clone();
    let mut changes = Vec::with_capacity(request.corrections.len());
    for (question, corrected) in &request.corrections {
        let key_entry = &key.answers.0[question];
        let previous_answer =
            entries.get(question).and_then(|entry| entry.final_answer.clone());
        let previous_marks = if previous_answer.as_deref() == Some(key_entry.answer.as_str()) {
            key_entry.marks
        } else {
            0.0
        };
        let corrected_marks =
            if *corrected == key_entry.answer { key_entry.marks } else { 0.0 };

        if let Some(entry) = entries.get_mut(question) {
            entry.final_answer = Some(corrected.clone());
            entry.status = ReconcileStatus::Resolved;
        }
        changes.push(RecheckChange {
            question: *question,
            previous_answer,
            corrected_answer: corrected.clone(),
            previous_marks: scoring::round_marks(previous_marks),
            corrected_marks: scoring::round_marks(corrected_marks),
        });
    }

    let outcome = scoring::score(
        &entries,
        &reading.entries.0,
        &key.answers.0,
        state.settings().reconciliation().low_confidence_threshold,
    );
    let rechecked = RecheckSnapshot {
        automated_marks: outcome.automated_marks,
        percentage: outcome.percentage,
        grade: outcome.grade.to_string(),
    };

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;

    let mut payload = vec![
        audit::sheet_item(&sheet.id),
        payload_item("recheck_id", &item.id),
        payload_item("completed_by", &request.completed_by),
        payload_item("rechecked_result", &rechecked),
        payload_item("changes_found", &changes),
    ];
    if let Some(requested_block) = &item.requested_block_hash {
        payload.push(payload_item("requested_block", requested_block));
    }
    let block = audit::append_block(
        state.ledger(),
        BlockKind::RecheckCompleted,
        payload,
        Vec::new(),
        None,
    )?;
    repositories::rechecks::complete(
        &mut *tx,
        repositories::rechecks::CompleteRecheck {
            id: &item.id,
            rechecked_result: rechecked,
            changes_found: changes,
            completed_by: request.completed_by,
            completed_block_hash: &block.self_hash,
            completed_at: now,
        },
    )
    .await?;
    tx.commit().await?;

    tracing::info!(
        recheck_id = %item.id,
        sheet_id = %sheet.id,
        completed_by = request.completed_by,
        block = %block.self_hash,
        "Recheck completed"
    );

    repositories::rechecks::find_by_id(state.db(), &item.id)
        .await?
        .ok_or_else(|| RecheckError::NotFound(item.id.clone()))
}

fn snapshot_of(score: &ScoreResult) -> RecheckSnapshot {
    RecheckSnapshot {
        automated_marks: score.automated_marks,
        percentage: score.percentage,
        grade: score.grade.clone(),
    }
}
