use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::core::config::AiSolvePolicy;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::{AnswerKey, BubbleCell, QuestionPaper, Sheet, SolverCell};
use crate::db::types::{
    EntityKind, InterventionPriority, KeyStatus, QualityDecision, ReasonKind, SheetStage,
};
use crate::ledger::block::{hash_value, payload_item, BlockKind, BlockSignature};
use crate::ledger::LedgerError;
use crate::repositories;
use crate::services::adapter::AdapterError;
use crate::services::answer_ai::SolveRequest;
use crate::services::audit;
use crate::services::interventions::{self, OpenIntervention};
use crate::services::reconcile::{self, ReconcileInputs};
use crate::services::scoring;
use crate::services::sheet_vision::decide_quality;

const EXPECTED_OPTION_COLUMNS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub(crate) enum PipelineError {
    #[error("sheet {0} not found")]
    SheetNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Intervention(#[from] crate::services::interventions::InterventionError),
}

/// What one stage attempt produced; the sum type the HTTP surface and the
/// worker loop both interpret.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    Advanced { sheet: Sheet, block_hash: String, opened_interventions: Vec<String> },
    PreconditionFailed { stage: SheetStage, message: String },
    GateBlocked { intervention_ids: Vec<String> },
    AdapterUnavailable { message: String, intervention_id: String },
    Cancelled { intervention_id: String },
}

/// Per-sheet mutexes and cancel flags. The mutex serializes stages for one
/// sheet and is released at every stage boundary; it is never held while
/// waiting on a human gate.
pub(crate) struct SheetLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl SheetLocks {
    pub(crate) fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()), cancels: Mutex::new(HashMap::new()) }
    }

    pub(crate) async fn acquire(&self, sheet_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|err| err.into_inner());
            locks.entry(sheet_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub(crate) fn cancel_flag(&self, sheet_id: &str) -> Arc<AtomicBool> {
        let mut cancels = self.cancels.lock().unwrap_or_else(|err| err.into_inner());
        cancels.entry(sheet_id.to_string()).or_default().clone()
    }

    pub(crate) fn request_cancel(&self, sheet_id: &str) {
        self.cancel_flag(sheet_id).store(true, Ordering::SeqCst);
    }

    fn clear_cancel(&self, sheet_id: &str) {
        self.cancel_flag(sheet_id).store(false, Ordering::SeqCst);
    }
}

impl Default for SheetLocks {
    fn default() -> Self {
        Self::new()
    }
}

async fn load_sheet(state: &AppState, sheet_id: &str) -> Result<Sheet, PipelineError> {
    repositories::sheets::find_by_id(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::SheetNotFound(sheet_id.to_string()))
}

async fn paper_for_sheet(
    state: &AppState,
    sheet: &Sheet,
) -> Result<QuestionPaper, PipelineError> {
    repositories::papers::find_by_exam(state.db(), &sheet.exam_id).await?.ok_or_else(|| {
        PipelineError::Validation(format!("no question paper registered for exam {}", sheet.exam_id))
    })
}

async fn key_for_paper(
    state: &AppState,
    paper: &QuestionPaper,
) -> Result<Option<AnswerKey>, PipelineError> {
    Ok(repositories::keys::find_by_paper(state.db(), &paper.id).await?)
}

fn precondition(stage: SheetStage, message: impl Into<String>) -> StageOutcome {
    StageOutcome::PreconditionFailed { stage, message: message.into() }
}

/// Observing a cancel request unwinds the stage without touching the
/// sheet; the flag is consumed and a normal-priority intervention records
/// the interruption.
async fn cancelled_outcome(
    state: &AppState,
    sheet_id: &str,
    stage: SheetStage,
) -> Result<StageOutcome, PipelineError> {
    state.locks().clear_cancel(sheet_id);
    let item = interventions::open(
        state,
        OpenIntervention {
            entity_kind: EntityKind::Sheet,
            entity_id: sheet_id,
            sheet_id: Some(sheet_id),
            reason: ReasonKind::Cancelled,
            detail: Some(format!("stage {} cancelled by request", stage.as_str())),
            priority: InterventionPriority::Normal,
        },
    )
    .await?;
    Ok(StageOutcome::Cancelled { intervention_id: item.id })
}

/// Retry budget exhausted or a permanent upstream failure: the sheet stays
/// in its stage and a critical intervention summons an operator.
async fn adapter_failure_outcome(
    state: &AppState,
    sheet_id: &str,
    adapter: &str,
    error: AdapterError,
) -> Result<StageOutcome, PipelineError> {
    let message = format!("{adapter}: {error}");
    let item = interventions::open(
        state,
        OpenIntervention {
            entity_kind: EntityKind::Sheet,
            entity_id: sheet_id,
            sheet_id: Some(sheet_id),
            reason: ReasonKind::AdapterFailure,
            detail: Some(message.clone()),
            priority: InterventionPriority::Critical,
        },
    )
    .await?;
    Ok(StageOutcome::AdapterUnavailable { message, intervention_id: item.id })
}

fn is_cancelled(state: &AppState, sheet_id: &str) -> bool {
    state.locks().cancel_flag(sheet_id).load(Ordering::SeqCst)
}

/// INGESTED → QUALITY_ASSESSED (or REJECTED when the decision says so).
pub(crate) async fn run_quality(
    state: &AppState,
    sheet_id: &str,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if sheet.stage != SheetStage::Ingested {
        return Ok(precondition(sheet.stage, "quality assessment requires an ingested sheet"));
    }

    if is_cancelled(state, sheet_id) {
        return cancelled_outcome(state, sheet_id, sheet.stage).await;
    }

    state.limiter().quality().acquire().await;
    let assessment = match state.vision().assess_quality(&sheet.image_hash).await {
        Ok(assessment) => assessment,
        Err(error) => return adapter_failure_outcome(state, sheet_id, "assess_quality", error).await,
    };
    if is_cancelled(state, sheet_id) {
        return cancelled_outcome(state, sheet_id, sheet.stage).await;
    }

    let decision = decide_quality(&assessment, state.settings().quality());
    let target_stage =
        if decision == QualityDecision::Reject { SheetStage::Rejected } else { SheetStage::QualityAssessed };
    let now = primitive_now_utc();

    let mut tx = state.db().begin().await?;
    let record = repositories::quality::create(
        &mut *tx,
        repositories::quality::CreateQuality {
            id: &Uuid::new_v4().to_string(),
            sheet_id: &sheet.id,
            score: assessment.score,
            damages: assessment.damages,
            decision,
            created_at: now,
        },
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(target_stage.as_str()),
        payload_item("decision", &decision),
        audit::entity_item("quality_record", &record),
    ];
    let block =
        audit::append_block(state.ledger(), BlockKind::QualityAssessed, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(&mut *tx, &sheet.id, target_stage, &block.self_hash, now)
        .await?;
    tx.commit().await?;

    let mut opened = Vec::new();
    if decision == QualityDecision::HumanReview {
        let item = interventions::open(
            state,
            OpenIntervention {
                entity_kind: EntityKind::Sheet,
                entity_id: &sheet.id,
                sheet_id: Some(&sheet.id),
                reason: ReasonKind::QualityReview,
                detail: Some(format!("quality score {:.2}, damage not recoverable", record.score)),
                priority: InterventionPriority::High,
            },
        )
        .await?;
        opened.push(item.id);
    }

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced { sheet, block_hash: block.self_hash, opened_interventions: opened })
}

/// QUALITY_ASSESSED → RECONSTRUCTED, only for decision=reconstruct.
pub(crate) async fn run_reconstruct(
    state: &AppState,
    sheet_id: &str,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if sheet.stage != SheetStage::QualityAssessed {
        return Ok(precondition(sheet.stage, "reconstruction requires a quality-assessed sheet"));
    }
    let quality = repositories::quality::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no quality record".to_string()))?;
    if quality.decision != QualityDecision::Reconstruct {
        return Ok(precondition(
            sheet.stage,
            format!("quality decision is {:?}, not reconstruct", quality.decision),
        ));
    }

    if is_cancelled(state, sheet_id) {
        return cancelled_outcome(state, sheet_id, sheet.stage).await;
    }

    let paper = paper_for_sheet(state, &sheet).await?;
    let rows = u32::try_from(paper.total_questions).unwrap_or(u32::MAX);

    state.limiter().reconstruct().acquire().await;
    let outcome =
        match state.vision().reconstruct(&sheet.image_hash, rows, EXPECTED_OPTION_COLUMNS).await {
            Ok(outcome) => outcome,
            Err(error) => return adapter_failure_outcome(state, sheet_id, "reconstruct", error).await,
        };
    if is_cancelled(state, sheet_id) {
        return cancelled_outcome(state, sheet_id, sheet.stage).await;
    }

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    repositories::quality::set_reconstruction(
        &mut *tx,
        &sheet.id,
        &outcome.reconstructed_hash,
        outcome.confidence,
        now,
    )
    .await?;
    repositories::sheets::set_reconstructed_hash(&mut *tx, &sheet.id, &outcome.reconstructed_hash, now)
        .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(SheetStage::Reconstructed.as_str()),
        payload_item("reconstructed_hash", &outcome.reconstructed_hash),
        payload_item("confidence", &outcome.confidence),
    ];
    let block =
        audit::append_block(state.ledger(), BlockKind::Reconstructed, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet.id,
        SheetStage::Reconstructed,
        &block.self_hash,
        now,
    )
    .await?;
    tx.commit().await?;

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced {
        sheet,
        block_hash: block.self_hash,
        opened_interventions: Vec::new(),
    })
}

/// Accept the externally produced bubble reading and move to BUBBLES_READ.
pub(crate) async fn record_bubbles(
    state: &AppState,
    sheet_id: &str,
    entries: BTreeMap<u32, BubbleCell>,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;

    match sheet.stage {
        SheetStage::QualityAssessed => {
            let quality = repositories::quality::find_by_sheet(state.db(), sheet_id)
                .await?
                .ok_or_else(|| {
                    PipelineError::Validation("sheet has no quality record".to_string())
                })?;
            match quality.decision {
                QualityDecision::Proceed => {}
                QualityDecision::HumanReview => {
                    let open =
                        repositories::interventions::open_for_sheet(state.db(), sheet_id).await?;
                    return Ok(StageOutcome::GateBlocked {
                        intervention_ids: open.into_iter().map(|item| item.id).collect(),
                    });
                }
                decision => {
                    return Ok(precondition(
                        sheet.stage,
                        format!("quality decision {decision:?} does not allow bubble reading"),
                    ))
                }
            }
        }
        SheetStage::Reconstructed => {}
        stage => {
            return Ok(precondition(stage, "bubble reading requires quality approval first"));
        }
    }

    let paper = paper_for_sheet(state, &sheet).await?;
    validate_question_numbers(entries.keys().copied(), &paper)?;

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    let reading = repositories::bubbles::create(
        &mut *tx,
        &Uuid::new_v4().to_string(),
        &sheet.id,
        entries,
        now,
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(SheetStage::BubblesRead.as_str()),
        audit::entity_item("bubble_reading", &reading),
    ];
    let block =
        audit::append_block(state.ledger(), BlockKind::BubblesRead, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet.id,
        SheetStage::BubblesRead,
        &block.self_hash,
        now,
    )
    .await?;
    tx.commit().await?;

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced {
        sheet,
        block_hash: block.self_hash,
        opened_interventions: Vec::new(),
    })
}

/// BUBBLES_READ → AI_SOLVED, soliciting the solver per the configured
/// policy.
pub(crate) async fn run_ai_solve(
    state: &AppState,
    sheet_id: &str,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if sheet.stage != SheetStage::BubblesRead {
        return Ok(precondition(sheet.stage, "the solver runs after bubbles are read"));
    }

    let policy = state.settings().orchestrator().ai_solve_policy;
    if policy == AiSolvePolicy::Never {
        return Ok(precondition(sheet.stage, "the AI solver is disabled by policy"));
    }

    let paper = paper_for_sheet(state, &sheet).await?;
    let reading = repositories::bubbles::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no bubble reading".to_string()))?;

    let questions: Vec<u32> = match policy {
        AiSolvePolicy::All => reading.entries.0.keys().copied().collect(),
        AiSolvePolicy::Disputed => {
            let key = key_for_paper(state, &paper).await?.ok_or_else(|| {
                PipelineError::Validation("disputed-only solving requires an answer key".to_string())
            })?;
            reading
                .entries
                .0
                .iter()
                .filter(|(question, cell)| {
                    key.answers
                        .0
                        .get(question)
                        .map(|entry| entry.answer != cell.answer.wire_value())
                        .unwrap_or(true)
                })
                .map(|(question, _)| *question)
                .collect()
        }
        AiSolvePolicy::Never => unreachable!("handled above"),
    };

    let mut entries: BTreeMap<u32, SolverCell> = BTreeMap::new();
    for question in questions {
        if is_cancelled(state, sheet_id) {
            return cancelled_outcome(state, sheet_id, sheet.stage).await;
        }
        state.limiter().solve().acquire().await;
        let request = SolveRequest {
            paper_hash: &paper.content_hash,
            question_number: question,
            subject: &paper.subject,
        };
        match state.solver().solve_question(request).await {
            Ok(answer) => {
                entries.insert(
                    question,
                    SolverCell {
                        answer: answer.answer,
                        confidence: answer.confidence,
                        explanation: answer.explanation,
                    },
                );
            }
            Err(error) => {
                return adapter_failure_outcome(state, sheet_id, "solve_question", error).await
            }
        }
    }

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    let verdict = repositories::verdicts::create(
        &mut *tx,
        &Uuid::new_v4().to_string(),
        &sheet.id,
        entries,
        now,
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(SheetStage::AiSolved.as_str()),
        audit::entity_item("ai_solver_verdict", &verdict),
        payload_item("policy", &policy.as_str()),
    ];
    let block = audit::append_block(state.ledger(), BlockKind::AiSolved, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet.id,
        SheetStage::AiSolved,
        &block.self_hash,
        now,
    )
    .await?;
    tx.commit().await?;

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced {
        sheet,
        block_hash: block.self_hash,
        opened_interventions: Vec::new(),
    })
}

/// A human operator submits a full manual entry; allowed at any live stage.
/// The stage advances to MANUAL_ENTERED only along the machine (from
/// BUBBLES_READ or AI_SOLVED); an earlier submission just records the entry.
pub(crate) async fn record_manual(
    state: &AppState,
    sheet_id: &str,
    entries: BTreeMap<u32, String>,
    entered_by: &str,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if sheet.stage.is_terminal() || sheet.stage.order() >= SheetStage::Reconciled.order() {
        return Ok(precondition(sheet.stage, "manual entry is closed for this sheet"));
    }
    if repositories::manual_entries::find_by_sheet(state.db(), sheet_id).await?.is_some() {
        return Ok(precondition(sheet.stage, "a manual entry already exists for this sheet"));
    }

    let paper = paper_for_sheet(state, &sheet).await?;
    validate_question_numbers(entries.keys().copied(), &paper)?;

    let advance_stage =
        matches!(sheet.stage, SheetStage::BubblesRead | SheetStage::AiSolved);
    let target_stage = if advance_stage { SheetStage::ManualEntered } else { sheet.stage };

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    let entry = repositories::manual_entries::create(
        &mut *tx,
        &Uuid::new_v4().to_string(),
        &sheet.id,
        entries,
        entered_by,
        now,
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(target_stage.as_str()),
        audit::entity_item("manual_entry", &entry),
        payload_item("entered_by", &entered_by),
    ];
    let block =
        audit::append_block(state.ledger(), BlockKind::ManualEntered, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(&mut *tx, &sheet.id, target_stage, &block.self_hash, now)
        .await?;
    tx.commit().await?;

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced {
        sheet,
        block_hash: block.self_hash,
        opened_interventions: Vec::new(),
    })
}

/// Tally the sources and move to RECONCILED, opening interventions for
/// every row the engine could not decide.
pub(crate) async fn run_reconcile(
    state: &AppState,
    sheet_id: &str,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if !matches!(
        sheet.stage,
        SheetStage::BubblesRead | SheetStage::AiSolved | SheetStage::ManualEntered
    ) {
        return Ok(precondition(sheet.stage, "reconciliation needs the answer sources first"));
    }

    let paper = paper_for_sheet(state, &sheet).await?;
    let key = key_for_paper(state, &paper).await?;
    let Some(key) = key.filter(|key| key.status == KeyStatus::Locked) else {
        return Ok(precondition(sheet.stage, "reconciliation requires a locked answer key"));
    };

    let reading = repositories::bubbles::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no bubble reading".to_string()))?;
    let verdict = repositories::verdicts::find_by_sheet(state.db(), sheet_id).await?;
    let manual = repositories::manual_entries::find_by_sheet(state.db(), sheet_id).await?;

    let source_count =
        1 + usize::from(verdict.is_some()) + usize::from(manual.is_some());
    if source_count < 2 {
        return Ok(precondition(
            sheet.stage,
            "reconciliation requires at least two answer sources",
        ));
    }

    let outcome = reconcile::reconcile(ReconcileInputs {
        bubbles: &reading.entries.0,
        ai: verdict.as_ref().map(|row| &row.entries.0),
        manual: manual.as_ref().map(|row| &row.entries.0),
        key: &key.answers.0,
        low_confidence_threshold: state.settings().reconciliation().low_confidence_threshold,
    });

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    let reconciliation = repositories::reconciliations::create(
        &mut *tx,
        &Uuid::new_v4().to_string(),
        &sheet.id,
        outcome.entries,
        now,
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(SheetStage::Reconciled.as_str()),
        audit::entity_item("reconciliation", &reconciliation),
    ];
    let block =
        audit::append_block(state.ledger(), BlockKind::Reconciled, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet.id,
        SheetStage::Reconciled,
        &block.self_hash,
        now,
    )
    .await?;
    tx.commit().await?;

    let mut opened = Vec::new();
    for flag in outcome.flags {
        let entity_id = format!("{}:{}", sheet.id, flag.question);
        let item = interventions::open(
            state,
            OpenIntervention {
                entity_kind: EntityKind::Reconciliation,
                entity_id: &entity_id,
                sheet_id: Some(&sheet.id),
                reason: flag.reason,
                detail: Some(format!("question {} could not be reconciled", flag.question)),
                priority: flag.priority,
            },
        )
        .await?;
        opened.push(item.id);
    }

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced { sheet, block_hash: block.self_hash, opened_interventions: opened })
}

/// RECONCILED → SCORED; refused while any intervention pins the sheet or
/// the key is not locked.
pub(crate) async fn run_score(
    state: &AppState,
    sheet_id: &str,
    manual_marks: Option<f64>,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if sheet.stage != SheetStage::Reconciled {
        return Ok(precondition(sheet.stage, "scoring requires a reconciled sheet"));
    }

    let open = repositories::interventions::open_for_sheet(state.db(), sheet_id).await?;
    if !open.is_empty() {
        return Ok(StageOutcome::GateBlocked {
            intervention_ids: open.into_iter().map(|item| item.id).collect(),
        });
    }

    let paper = paper_for_sheet(state, &sheet).await?;
    let key = key_for_paper(state, &paper).await?;
    let Some(key) = key.filter(|key| key.status == KeyStatus::Locked) else {
        return Ok(precondition(sheet.stage, "scoring requires a locked answer key"));
    };

    let reconciliation = repositories::reconciliations::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no reconciliation".to_string()))?;
    let reading = repositories::bubbles::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no bubble reading".to_string()))?;
    let quality = repositories::quality::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no quality record".to_string()))?;

    let low_confidence_threshold =
        state.settings().reconciliation().low_confidence_threshold;
    let outcome =
        scoring::score(&reconciliation.entries.0, &reading.entries.0, &key.answers.0, low_confidence_threshold);

    let manual_marks = manual_marks.map(scoring::round_marks);
    let tallied = scoring::marks_match(
        outcome.automated_marks,
        manual_marks,
        state.settings().scoring().marks_tally_tolerance,
    );
    // The gate above guarantees zero open interventions at this point.
    let perfect = scoring::is_perfect_evaluation(tallied, &reading.entries.0, quality.score, 0);

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    let score = repositories::scores::create(
        &mut *tx,
        repositories::scores::CreateScore {
            id: &Uuid::new_v4().to_string(),
            sheet_id: &sheet.id,
            automated_marks: outcome.automated_marks,
            manual_marks,
            marks_match: tallied,
            is_perfect_evaluation: perfect,
            grade: outcome.grade,
            percentage: outcome.percentage,
            correct_count: outcome.correct_count,
            incorrect_count: outcome.incorrect_count,
            unanswered_count: outcome.unanswered_count,
            breakdown: outcome.breakdown,
            created_at: now,
        },
    )
    .await?;

    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(SheetStage::Scored.as_str()),
        audit::entity_item("score_result", &score),
    ];
    let block = audit::append_block(state.ledger(), BlockKind::Scored, payload, Vec::new(), None)?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet.id,
        SheetStage::Scored,
        &block.self_hash,
        now,
    )
    .await?;
    tx.commit().await?;

    let mut opened = Vec::new();
    if !tallied {
        let detail = discrepancy_summary(&score, manual_marks);
        let item = interventions::open(
            state,
            OpenIntervention {
                entity_kind: EntityKind::Sheet,
                entity_id: &sheet.id,
                sheet_id: Some(&sheet.id),
                reason: ReasonKind::MarksMismatch,
                detail: Some(detail),
                priority: InterventionPriority::High,
            },
        )
        .await?;
        opened.push(item.id);
    }

    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced { sheet, block_hash: block.self_hash, opened_interventions: opened })
}

/// SCORED → FINALIZED under the multi-signature policy; the signatures
/// commit to the score result's content hash.
pub(crate) async fn run_finalize(
    state: &AppState,
    sheet_id: &str,
    signatures: Vec<BlockSignature>,
) -> Result<StageOutcome, PipelineError> {
    let _guard = state.locks().acquire(sheet_id).await;
    let sheet = load_sheet(state, sheet_id).await?;
    if sheet.stage != SheetStage::Scored {
        return Ok(precondition(sheet.stage, "finalization requires a scored sheet"));
    }

    let open = repositories::interventions::open_for_sheet(state.db(), sheet_id).await?;
    if !open.is_empty() {
        return Ok(StageOutcome::GateBlocked {
            intervention_ids: open.into_iter().map(|item| item.id).collect(),
        });
    }

    let score = repositories::scores::find_by_sheet(state.db(), sheet_id)
        .await?
        .ok_or_else(|| PipelineError::Validation("sheet has no score result".to_string()))?;
    let result_hash = hash_value(&score);

    let now = primitive_now_utc();
    let mut tx = state.db().begin().await?;
    let payload = vec![
        audit::sheet_item(&sheet.id),
        audit::stage_item(SheetStage::Finalized.as_str()),
        payload_item("result_hash", &result_hash),
        audit::entity_item("score_result", &score),
    ];
    let block = audit::append_block(
        state.ledger(),
        BlockKind::ResultFinalized,
        payload,
        signatures,
        Some(result_hash.as_bytes()),
    )?;
    repositories::sheets::update_stage(
        &mut *tx,
        &sheet.id,
        SheetStage::Finalized,
        &block.self_hash,
        now,
    )
    .await?;
    tx.commit().await?;

    metrics::counter!("sheets_finalized_total").increment(1);
    let sheet = load_sheet(state, sheet_id).await?;
    Ok(StageOutcome::Advanced {
        sheet,
        block_hash: block.self_hash,
        opened_interventions: Vec::new(),
    })
}

#[derive(Debug)]
pub(crate) struct WorkflowProgress {
    pub(crate) stage: SheetStage,
    pub(crate) gating_interventions: Vec<String>,
    pub(crate) halted: Option<String>,
}

impl WorkflowProgress {
    /// A gate may report an intervention the loop already collected when
    /// it was opened; keep the first mention only.
    fn new(stage: SheetStage, mut gating: Vec<String>, halted: Option<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        gating.retain(|id| seen.insert(id.clone()));
        Self { stage, gating_interventions: gating, halted }
    }
}

/// Drive every stage that can run without human input, stopping at the
/// first gate. The per-sheet lock is taken per stage, never across gates.
pub(crate) async fn advance_available(
    state: &AppState,
    sheet_id: &str,
) -> Result<WorkflowProgress, PipelineError> {
    let mut gating = Vec::new();

    loop {
        let sheet = load_sheet(state, sheet_id).await?;
        let outcome = match sheet.stage {
            SheetStage::Ingested => run_quality(state, sheet_id).await?,
            SheetStage::QualityAssessed => {
                let quality = repositories::quality::find_by_sheet(state.db(), sheet_id)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Validation("sheet has no quality record".to_string())
                    })?;
                match quality.decision {
                    QualityDecision::Reconstruct => run_reconstruct(state, sheet_id).await?,
                    QualityDecision::Proceed => {
                        return Ok(WorkflowProgress::new(sheet.stage, gating, Some("waiting for an external bubble reading".to_string())))
                    }
                    QualityDecision::HumanReview => {
                        let open = repositories::interventions::open_for_sheet(state.db(), sheet_id)
                            .await?;
                        gating.extend(open.into_iter().map(|item| item.id));
                        return Ok(WorkflowProgress::new(sheet.stage, gating, Some("quality review requires a human decision".to_string())));
                    }
                    QualityDecision::Reject => {
                        return Ok(WorkflowProgress::new(sheet.stage, gating, Some("sheet was rejected at quality".to_string())))
                    }
                }
            }
            SheetStage::Reconstructed => {
                return Ok(WorkflowProgress::new(sheet.stage, gating, Some("waiting for an external bubble reading".to_string())))
            }
            SheetStage::BubblesRead => {
                let policy = state.settings().orchestrator().ai_solve_policy;
                if policy != AiSolvePolicy::Never {
                    run_ai_solve(state, sheet_id).await?
                } else if repositories::manual_entries::find_by_sheet(state.db(), sheet_id)
                    .await?
                    .is_some()
                {
                    run_reconcile(state, sheet_id).await?
                } else {
                    return Ok(WorkflowProgress {
                        stage: sheet.stage,
                        gating_interventions: gating,
                        halted: Some(
                            "waiting for a second answer source (manual entry)".to_string(),
                        ),
                    });
                }
            }
            SheetStage::AiSolved | SheetStage::ManualEntered => {
                run_reconcile(state, sheet_id).await?
            }
            SheetStage::Reconciled => run_score(state, sheet_id, None).await?,
            SheetStage::Scored => {
                return Ok(WorkflowProgress::new(sheet.stage, gating, Some("finalization requires the multi-signature payload".to_string())))
            }
            SheetStage::Finalized | SheetStage::Rejected => {
                return Ok(WorkflowProgress::new(sheet.stage, gating, None))
            }
        };

        match outcome {
            StageOutcome::Advanced { opened_interventions, .. } => {
                gating.extend(opened_interventions);
            }
            StageOutcome::GateBlocked { intervention_ids } => {
                gating.extend(intervention_ids);
                let sheet = load_sheet(state, sheet_id).await?;
                return Ok(WorkflowProgress::new(sheet.stage, gating, Some("a human gate blocks further progress".to_string())));
            }
            StageOutcome::PreconditionFailed { stage, message } => {
                return Ok(WorkflowProgress {
                    stage,
                    gating_interventions: gating,
                    halted: Some(message),
                })
            }
            StageOutcome::AdapterUnavailable { message, intervention_id } => {
                gating.push(intervention_id);
                let sheet = load_sheet(state, sheet_id).await?;
                return Ok(WorkflowProgress::new(sheet.stage, gating, Some(message)));
            }
            StageOutcome::Cancelled { intervention_id } => {
                gating.push(intervention_id);
                let sheet = load_sheet(state, sheet_id).await?;
                return Ok(WorkflowProgress::new(sheet.stage, gating, Some("stage cancelled".to_string())));
            }
        }
    }
}

/// Open a critical intervention for every live sheet past its processing
/// deadline and halt its worker via the cancel flag. Human-gate wait time
/// is excluded by skipping sheets that are already pinned.
pub(crate) async fn check_deadlines(state: &AppState) -> Result<(), PipelineError> {
    let deadline =
        Duration::from_secs(state.settings().orchestrator().sheet_deadline_seconds);
    let now = primitive_now_utc();
    let cutoff = now - deadline;

    let expired = repositories::sheets::list_active_older_than(state.db(), cutoff).await?;
    for sheet in expired {
        let open = repositories::interventions::open_for_sheet(state.db(), &sheet.id).await?;
        if !open.is_empty() {
            continue;
        }
        state.locks().request_cancel(&sheet.id);
        interventions::open(
            state,
            OpenIntervention {
                entity_kind: EntityKind::Sheet,
                entity_id: &sheet.id,
                sheet_id: Some(&sheet.id),
                reason: ReasonKind::DeadlineExpired,
                detail: Some(format!(
                    "sheet exceeded its {}s processing deadline in stage {}",
                    state.settings().orchestrator().sheet_deadline_seconds,
                    sheet.stage.as_str()
                )),
                priority: InterventionPriority::Critical,
            },
        )
        .await?;
    }
    Ok(())
}

fn validate_question_numbers(
    questions: impl Iterator<Item = u32>,
    paper: &QuestionPaper,
) -> Result<(), PipelineError> {
    let total = u32::try_from(paper.total_questions).unwrap_or(u32::MAX);
    for question in questions {
        if question == 0 || question > total {
            return Err(PipelineError::Validation(format!(
                "question {question} is outside this paper's 1..={total} range"
            )));
        }
    }
    Ok(())
}

fn discrepancy_summary(
    score: &crate::db::models::ScoreResult,
    manual_marks: Option<f64>,
) -> String {
    let shaky: Vec<u32> = score
        .breakdown
        .0
        .iter()
        .filter(|question| question.low_confidence)
        .map(|question| question.question)
        .collect();
    let cause = if shaky.is_empty() {
        "no obvious cause, review bubble detection and manual totals".to_string()
    } else {
        format!("low-confidence detections on questions {shaky:?}")
    };
    format!(
        "automated {} vs manual {:?} marks do not tally; {}",
        score.automated_marks, manual_marks, cause
    )
}
