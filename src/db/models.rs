use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{
    DamageSeverity, DetectedMark, EntityKind, InterventionPriority, InterventionStatus, KeyStatus,
    QualityDecision, ReasonKind, RecheckStatus, ReconcileStatus, SheetStage,
};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct QuestionPaper {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) subject: String,
    pub(crate) total_questions: i64,
    pub(crate) max_marks: f64,
    pub(crate) content_hash: String,
    pub(crate) last_block_hash: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Expected answer and marks for one question of an answer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyEntry {
    pub(crate) answer: String,
    pub(crate) marks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyFlag {
    pub(crate) confidence: f64,
    #[serde(default)]
    pub(crate) note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct AnswerKey {
    pub(crate) id: String,
    pub(crate) paper_id: String,
    pub(crate) status: KeyStatus,
    pub(crate) answers: Json<BTreeMap<u32, KeyEntry>>,
    pub(crate) flags: Option<Json<BTreeMap<u32, KeyFlag>>>,
    pub(crate) last_block_hash: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Sheet {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) roll_number: String,
    pub(crate) image_hash: String,
    pub(crate) reconstructed_hash: Option<String>,
    pub(crate) stage: SheetStage,
    pub(crate) last_block_hash: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Damage {
    pub(crate) kind: String,
    pub(crate) severity: DamageSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct QualityRecord {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) score: f64,
    pub(crate) damages: Json<Vec<Damage>>,
    pub(crate) decision: QualityDecision,
    pub(crate) reconstruction_hash: Option<String>,
    pub(crate) reconstruction_confidence: Option<f64>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BubbleCell {
    pub(crate) answer: DetectedMark,
    pub(crate) confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BubbleReading {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) entries: Json<BTreeMap<u32, BubbleCell>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SolverCell {
    pub(crate) answer: String,
    pub(crate) confidence: f64,
    #[serde(default)]
    pub(crate) explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct AiSolverVerdict {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) entries: Json<BTreeMap<u32, SolverCell>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ManualEntry {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) entries: Json<BTreeMap<u32, String>>,
    pub(crate) entered_by: String,
    pub(crate) entered_at: PrimitiveDateTime,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// One reconciled question: the three source answers, the selected final
/// answer (absent until the row is decided), and the tally status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReconEntry {
    pub(crate) omr: Option<DetectedMark>,
    pub(crate) ai: Option<String>,
    pub(crate) manual: Option<String>,
    #[serde(rename = "final")]
    pub(crate) final_answer: Option<String>,
    pub(crate) status: ReconcileStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Reconciliation {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) entries: Json<BTreeMap<u32, ReconEntry>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QuestionScore {
    pub(crate) question: u32,
    pub(crate) correct_answer: String,
    pub(crate) final_answer: Option<String>,
    pub(crate) marks_earned: f64,
    pub(crate) marks_possible: f64,
    pub(crate) confidence: f64,
    pub(crate) low_confidence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ScoreResult {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) automated_marks: f64,
    pub(crate) manual_marks: Option<f64>,
    pub(crate) marks_match: bool,
    pub(crate) is_perfect_evaluation: bool,
    pub(crate) grade: String,
    pub(crate) percentage: f64,
    pub(crate) correct_count: i64,
    pub(crate) incorrect_count: i64,
    pub(crate) unanswered_count: i64,
    pub(crate) breakdown: Json<Vec<QuestionScore>>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Intervention {
    pub(crate) id: String,
    pub(crate) entity_kind: EntityKind,
    pub(crate) entity_id: String,
    pub(crate) sheet_id: Option<String>,
    pub(crate) reason_kind: ReasonKind,
    pub(crate) detail: Option<String>,
    pub(crate) priority: InterventionPriority,
    pub(crate) status: InterventionStatus,
    pub(crate) assignee: Option<String>,
    pub(crate) resolution_note: Option<String>,
    pub(crate) opened_block_hash: Option<String>,
    pub(crate) resolved_block_hash: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Totals of a score result as they stood at one point of a revaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecheckSnapshot {
    pub(crate) automated_marks: f64,
    pub(crate) percentage: f64,
    pub(crate) grade: String,
}

/// One question whose outcome moved during a recheck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RecheckChange {
    pub(crate) question: u32,
    pub(crate) previous_answer: Option<String>,
    pub(crate) corrected_answer: String,
    pub(crate) previous_marks: f64,
    pub(crate) corrected_marks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct RecheckRequest {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) requested_by: String,
    pub(crate) reason: String,
    pub(crate) questions: Json<Vec<u32>>,
    pub(crate) status: RecheckStatus,
    pub(crate) original_result: Option<Json<RecheckSnapshot>>,
    pub(crate) rechecked_result: Option<Json<RecheckSnapshot>>,
    pub(crate) changes_found: Option<Json<Vec<RecheckChange>>>,
    pub(crate) completed_by: Option<String>,
    pub(crate) requested_block_hash: Option<String>,
    pub(crate) completed_block_hash: Option<String>,
    pub(crate) completed_at: Option<PrimitiveDateTime>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct SignerKeyRow {
    pub(crate) kind: String,
    pub(crate) public_key: String,
    pub(crate) created_at: PrimitiveDateTime,
}
