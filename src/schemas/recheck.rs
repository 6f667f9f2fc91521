use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{RecheckChange, RecheckRequest, RecheckSnapshot};
use crate::db::types::RecheckStatus;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RecheckCreate {
    #[validate(length(min = 1, message = "requested_by must not be empty"))]
    pub(crate) requested_by: String,
    #[validate(length(min = 1, message = "reason must not be empty"))]
    pub(crate) reason: String,
    /// Question numbers under dispute; empty means the whole sheet.
    #[serde(default)]
    pub(crate) questions: Vec<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct RecheckComplete {
    #[validate(length(min = 1, message = "completed_by must not be empty"))]
    pub(crate) completed_by: String,
    /// Corrected final answers per disputed question; empty confirms the
    /// original evaluation.
    #[serde(default)]
    pub(crate) corrections: BTreeMap<u32, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RecheckResponse {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) requested_by: String,
    pub(crate) reason: String,
    pub(crate) questions: Vec<u32>,
    pub(crate) status: RecheckStatus,
    pub(crate) completed_by: Option<String>,
    pub(crate) requested_block_hash: Option<String>,
    pub(crate) completed_block_hash: Option<String>,
    pub(crate) completed_at: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl RecheckResponse {
    pub(crate) fn from_model(recheck: RecheckRequest) -> Self {
        Self {
            id: recheck.id,
            sheet_id: recheck.sheet_id,
            requested_by: recheck.requested_by,
            reason: recheck.reason,
            questions: recheck.questions.0,
            status: recheck.status,
            completed_by: recheck.completed_by,
            requested_block_hash: recheck.requested_block_hash,
            completed_block_hash: recheck.completed_block_hash,
            completed_at: recheck.completed_at.map(format_primitive),
            created_at: format_primitive(recheck.created_at),
            updated_at: format_primitive(recheck.updated_at),
        }
    }
}

/// The before/after record of a completed revaluation.
#[derive(Debug, Serialize)]
pub(crate) struct RecheckResultResponse {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) status: RecheckStatus,
    pub(crate) original_result: RecheckSnapshot,
    pub(crate) rechecked_result: RecheckSnapshot,
    pub(crate) changes_found: Vec<RecheckChange>,
    pub(crate) completed_by: Option<String>,
    pub(crate) completed_at: Option<String>,
}
