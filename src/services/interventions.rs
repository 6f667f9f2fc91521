use uuid::Uuid;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::Intervention;
use crate::db::types::{
    EntityKind, InterventionPriority, InterventionStatus, ReasonKind, ReconcileStatus,
};
use crate::ledger::block::{payload_item, BlockKind};
use crate::repositories;
use crate::services::audit;

#[derive(Debug, thiserror::Error)]
pub(crate) enum InterventionError {
    #[error("intervention {0} not found")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] crate::ledger::LedgerError),
}

pub(crate) struct OpenIntervention<'a> {
    pub(crate) entity_kind: EntityKind,
    pub(crate) entity_id: &'a str,
    pub(crate) sheet_id: Option<&'a str>,
    pub(crate) reason: ReasonKind,
    pub(crate) detail: Option<String>,
    pub(crate) priority: InterventionPriority,
}

/// Open an intervention and record the INTERVENTION_OPENED block. The open
/// item pins its sheet: SCORED and RESULT_FINALIZED guards refuse to pass
/// while one exists.
pub(crate) async fn open(
    state: &AppState,
    request: OpenIntervention<'_>,
) -> Result<Intervention, InterventionError> {
    let now = primitive_now_utc();
    let id = Uuid::new_v4().to_string();

    let mut tx = state.db().begin().await?;
    let mut item = repositories::interventions::create(
        &mut *tx,
        repositories::interventions::CreateIntervention {
            id: &id,
            entity_kind: request.entity_kind,
            entity_id: request.entity_id,
            sheet_id: request.sheet_id,
            reason_kind: request.reason,
            detail: request.detail.as_deref(),
            priority: request.priority,
            created_at: now,
        },
    )
    .await?;

    let mut payload = vec![
        payload_item("intervention_id", &id),
        payload_item("entity_id", &request.entity_id),
        payload_item("reason", &request.reason),
        payload_item("priority", &request.priority),
    ];
    if let Some(sheet_id) = request.sheet_id {
        payload.push(audit::sheet_item(sheet_id));
    }

    let block = audit::append_block(
        state.ledger(),
        BlockKind::InterventionOpened,
        payload,
        Vec::new(),
        None,
    )?;
    repositories::interventions::set_opened_block(&mut *tx, &id, &block.self_hash, now).await?;
    tx.commit().await?;

    item.opened_block_hash = Some(block.self_hash.clone());
    metrics::counter!("interventions_opened_total", "reason" => request.reason_label()).increment(1);
    tracing::info!(
        intervention_id = %id,
        sheet_id = request.sheet_id.unwrap_or("-"),
        reason = request.reason_label(),
        block = %block.self_hash,
        "Intervention opened"
    );

    Ok(item)
}

impl OpenIntervention<'_> {
    fn reason_label(&self) -> &'static str {
        match self.reason {
            ReasonKind::ThreeWaySplit => "three_way_split",
            ReasonKind::DisputedManual => "disputed_manual",
            ReasonKind::LowConfidence => "low_confidence",
            ReasonKind::AdapterFailure => "adapter_failure",
            ReasonKind::QualityReview => "quality_review",
            ReasonKind::KeyDisagreement => "key_disagreement",
            ReasonKind::MarksMismatch => "marks_mismatch",
            ReasonKind::DeadlineExpired => "deadline_expired",
            ReasonKind::Cancelled => "cancelled",
        }
    }
}

pub(crate) async fn claim(
    state: &AppState,
    id: &str,
    assignee: &str,
) -> Result<Intervention, InterventionError> {
    let now = primitive_now_utc();
    let claimed = repositories::interventions::claim(state.db(), id, assignee, now).await?;
    match claimed {
        Some(item) => Ok(item),
        None => {
            let existing = repositories::interventions::find_by_id(state.db(), id).await?;
            match existing {
                None => Err(InterventionError::NotFound(id.to_string())),
                Some(item) => Err(InterventionError::InvalidState(format!(
                    "intervention is {}, only open items can be claimed",
                    status_label(item.status)
                ))),
            }
        }
    }
}

pub(crate) struct Resolution<'a> {
    pub(crate) resolved_by: &'a str,
    pub(crate) note: &'a str,
    /// For reconciliation-row interventions: the answer the reviewer settled
    /// on, applied to the row as `final` with status `resolved`.
    pub(crate) final_answer: Option<String>,
}

/// Resolve a claimed intervention, appending the INTERVENTION_RESOLVED
/// block that references the opening block. Only the assignee may resolve.
pub(crate) async fn resolve(
    state: &AppState,
    id: &str,
    resolution: Resolution<'_>,
) -> Result<Intervention, InterventionError> {
    let now = primitive_now_utc();
    let item = repositories::interventions::find_by_id(state.db(), id)
        .await?
        .ok_or_else(|| InterventionError::NotFound(id.to_string()))?;

    match item.status {
        InterventionStatus::Claimed => {}
        InterventionStatus::Open => {
            return Err(InterventionError::InvalidState(
                "intervention must be claimed before it can be resolved".to_string(),
            ))
        }
        status => {
            return Err(InterventionError::InvalidState(format!(
                "intervention is already {}",
                status_label(status)
            )))
        }
    }
    if item.assignee.as_deref() != Some(resolution.resolved_by) {
        return Err(InterventionError::InvalidState(
            "only the assignee may resolve this intervention".to_string(),
        ));
    }

    let mut tx = state.db().begin().await?;

    if item.entity_kind == EntityKind::Reconciliation {
        apply_reconciliation_decision(&mut tx, &item, resolution.final_answer.as_deref(), now)
            .await?;
    }

    let mut payload = vec![
        payload_item("intervention_id", &id),
        payload_item("resolved_by", &resolution.resolved_by),
        payload_item("resolution_note", &resolution.note),
    ];
    if let Some(opened) = &item.opened_block_hash {
        payload.push(payload_item("opened_block", opened));
    }
    if let Some(sheet_id) = &item.sheet_id {
        payload.push(audit::sheet_item(sheet_id));
    }

    let block = audit::append_block(
        state.ledger(),
        BlockKind::InterventionResolved,
        payload,
        Vec::new(),
        None,
    )?;
    repositories::interventions::resolve(&mut *tx, id, resolution.note, &block.self_hash, now)
        .await?;
    tx.commit().await?;

    tracing::info!(intervention_id = %id, block = %block.self_hash, "Intervention resolved");

    repositories::interventions::find_by_id(state.db(), id)
        .await?
        .ok_or_else(|| InterventionError::NotFound(id.to_string()))
}

/// Cancel from any non-terminal state. Cancellation is recorded as an
/// INTERVENTION_RESOLVED block whose note marks it cancelled.
pub(crate) async fn cancel(
    state: &AppState,
    id: &str,
    note: Option<&str>,
) -> Result<Intervention, InterventionError> {
    let now = primitive_now_utc();
    let item = repositories::interventions::find_by_id(state.db(), id)
        .await?
        .ok_or_else(|| InterventionError::NotFound(id.to_string()))?;
    if item.status.is_terminal() {
        return Err(InterventionError::InvalidState(format!(
            "intervention is already {}",
            status_label(item.status)
        )));
    }

    let mut tx = state.db().begin().await?;
    let mut payload = vec![
        payload_item("intervention_id", &id),
        payload_item("resolution_note", &"cancelled"),
    ];
    if let Some(opened) = &item.opened_block_hash {
        payload.push(payload_item("opened_block", opened));
    }
    if let Some(sheet_id) = &item.sheet_id {
        payload.push(audit::sheet_item(sheet_id));
    }
    let block = audit::append_block(
        state.ledger(),
        BlockKind::InterventionResolved,
        payload,
        Vec::new(),
        None,
    )?;
    repositories::interventions::cancel(&mut *tx, id, note, &block.self_hash, now).await?;
    tx.commit().await?;

    repositories::interventions::find_by_id(state.db(), id)
        .await?
        .ok_or_else(|| InterventionError::NotFound(id.to_string()))
}

async fn apply_reconciliation_decision(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    item: &Intervention,
    final_answer: Option<&str>,
    now: time::PrimitiveDateTime,
) -> Result<(), InterventionError> {
    let Some(final_answer) = final_answer else {
        return Err(InterventionError::InvalidState(
            "resolving a reconciliation row requires a final answer".to_string(),
        ));
    };
    let Some(sheet_id) = item.sheet_id.as_deref() else {
        return Err(InterventionError::InvalidState(
            "reconciliation intervention is missing its sheet reference".to_string(),
        ));
    };
    let question: u32 = item
        .entity_id
        .rsplit(':')
        .next()
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            InterventionError::InvalidState(format!(
                "malformed reconciliation reference {}",
                item.entity_id
            ))
        })?;

    let reconciliation = repositories::reconciliations::find_by_sheet(&mut **tx, sheet_id)
        .await?
        .ok_or_else(|| {
            InterventionError::InvalidState(format!("no reconciliation exists for sheet {sheet_id}"))
        })?;

    let mut entries = reconciliation.entries.0;
    let entry = entries.get_mut(&question).ok_or_else(|| {
        InterventionError::InvalidState(format!("question {question} is not reconciled"))
    })?;
    entry.final_answer = Some(final_answer.to_string());
    entry.status = ReconcileStatus::Resolved;

    repositories::reconciliations::update_entries(&mut **tx, sheet_id, entries, now).await?;
    Ok(())
}

fn status_label(status: InterventionStatus) -> &'static str {
    match status {
        InterventionStatus::Open => "open",
        InterventionStatus::Claimed => "claimed",
        InterventionStatus::Resolved => "resolved",
        InterventionStatus::Cancelled => "cancelled",
    }
}
