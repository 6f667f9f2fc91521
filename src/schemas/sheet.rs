use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{
    AiSolverVerdict, BubbleReading, Damage, ManualEntry, QualityRecord, QuestionScore,
    ReconEntry, Reconciliation, ScoreResult, Sheet,
};
use crate::db::types::{DetectedMark, QualityDecision, SheetStage};
use crate::ledger::signers::SignerKind;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct SheetIngest {
    #[validate(length(min = 1, message = "exam_id must not be empty"))]
    pub(crate) exam_id: String,
    #[validate(length(min = 1, message = "roll_number must not be empty"))]
    pub(crate) roll_number: String,
    /// Content hash of a pre-stored scan.
    #[serde(default)]
    pub(crate) image_hash: Option<String>,
    /// Raw image bytes, hex-encoded; hashed on ingestion.
    #[serde(default)]
    pub(crate) image: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct BubbleCellSubmit {
    pub(crate) answer: String,
    pub(crate) confidence: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct BubbleSubmit {
    #[validate(length(min = 1, message = "entries must not be empty"))]
    pub(crate) entries: BTreeMap<u32, BubbleCellSubmit>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ManualSubmit {
    #[validate(length(min = 1, message = "entries must not be empty"))]
    pub(crate) entries: BTreeMap<u32, String>,
    #[validate(length(min = 1, message = "entered_by must not be empty"))]
    pub(crate) entered_by: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScoreRequest {
    #[serde(default)]
    pub(crate) manual_marks: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct SignatureSubmit {
    pub(crate) signer_kind: SignerKind,
    pub(crate) signer_key: String,
    pub(crate) signature: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct FinalizeRequest {
    #[validate(length(min = 1, message = "signatures must not be empty"))]
    pub(crate) signatures: Vec<SignatureSubmit>,
}

/// Result of one stage attempt.
#[derive(Debug, Serialize)]
pub(crate) struct StageResponse {
    pub(crate) sheet_id: String,
    pub(crate) stage: SheetStage,
    pub(crate) block_hash: String,
    pub(crate) opened_interventions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct QualityView {
    pub(crate) score: f64,
    pub(crate) damages: Vec<Damage>,
    pub(crate) decision: QualityDecision,
    pub(crate) reconstruction_hash: Option<String>,
    pub(crate) reconstruction_confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BubbleView {
    pub(crate) answer: DetectedMark,
    pub(crate) confidence: f64,
}

#[derive(Debug, Serialize)]
pub(crate) struct SolverView {
    pub(crate) answer: String,
    pub(crate) confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) explanation: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ManualView {
    pub(crate) entries: BTreeMap<u32, String>,
    pub(crate) entered_by: String,
    pub(crate) entered_at: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ScoreView {
    pub(crate) automated_marks: f64,
    pub(crate) manual_marks: Option<f64>,
    pub(crate) marks_match: bool,
    pub(crate) is_perfect_evaluation: bool,
    pub(crate) grade: String,
    pub(crate) percentage: f64,
    pub(crate) correct_count: i64,
    pub(crate) incorrect_count: i64,
    pub(crate) unanswered_count: i64,
    pub(crate) breakdown: Vec<QuestionScore>,
    /// Content hash the finalization signatures must commit to.
    pub(crate) result_hash: String,
}

/// Full sheet aggregate: the sheet row, its 1:1 relations, the open
/// interventions pinning it, and its ledger block trail.
#[derive(Debug, Serialize)]
pub(crate) struct SheetAggregate {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) roll_number: String,
    pub(crate) image_hash: String,
    pub(crate) reconstructed_hash: Option<String>,
    pub(crate) stage: SheetStage,
    pub(crate) last_block_hash: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) quality: Option<QualityView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) bubbles: Option<BTreeMap<u32, BubbleView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ai_verdict: Option<BTreeMap<u32, SolverView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) manual: Option<ManualView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) reconciliation: Option<BTreeMap<u32, ReconEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) score: Option<ScoreView>,
    pub(crate) open_interventions: Vec<String>,
    pub(crate) block_trail: Vec<String>,
}

impl SheetAggregate {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        sheet: Sheet,
        quality: Option<QualityRecord>,
        bubbles: Option<BubbleReading>,
        verdict: Option<AiSolverVerdict>,
        manual: Option<ManualEntry>,
        reconciliation: Option<Reconciliation>,
        score: Option<(ScoreResult, String)>,
        open_interventions: Vec<String>,
        block_trail: Vec<String>,
    ) -> Self {
        Self {
            id: sheet.id,
            exam_id: sheet.exam_id,
            roll_number: sheet.roll_number,
            image_hash: sheet.image_hash,
            reconstructed_hash: sheet.reconstructed_hash,
            stage: sheet.stage,
            last_block_hash: sheet.last_block_hash,
            created_at: format_primitive(sheet.created_at),
            updated_at: format_primitive(sheet.updated_at),
            quality: quality.map(|record| QualityView {
                score: record.score,
                damages: record.damages.0,
                decision: record.decision,
                reconstruction_hash: record.reconstruction_hash,
                reconstruction_confidence: record.reconstruction_confidence,
            }),
            bubbles: bubbles.map(|reading| {
                reading
                    .entries
                    .0
                    .into_iter()
                    .map(|(question, cell)| {
                        (question, BubbleView { answer: cell.answer, confidence: cell.confidence })
                    })
                    .collect()
            }),
            ai_verdict: verdict.map(|row| {
                row.entries
                    .0
                    .into_iter()
                    .map(|(question, cell)| {
                        (
                            question,
                            SolverView {
                                answer: cell.answer,
                                confidence: cell.confidence,
                                explanation: cell.explanation,
                            },
                        )
                    })
                    .collect()
            }),
            manual: manual.map(|entry| ManualView {
                entries: entry.entries.0,
                entered_by: entry.entered_by,
                entered_at: format_primitive(entry.entered_at),
            }),
            reconciliation: reconciliation.map(|row| row.entries.0),
            score: score.map(|(result, result_hash)| ScoreView {
                automated_marks: result.automated_marks,
                manual_marks: result.manual_marks,
                marks_match: result.marks_match,
                is_perfect_evaluation: result.is_perfect_evaluation,
                grade: result.grade,
                percentage: result.percentage,
                correct_count: result.correct_count,
                incorrect_count: result.incorrect_count,
                unanswered_count: result.unanswered_count,
                breakdown: result.breakdown.0,
                result_hash,
            }),
            open_interventions,
            block_trail,
        }
    }
}
