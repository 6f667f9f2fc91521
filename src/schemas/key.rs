use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{AnswerKey, KeyFlag};
use crate::db::types::KeyStatus;

#[derive(Debug, Deserialize, Serialize, Validate)]
pub(crate) struct KeyEntryCreate {
    #[validate(length(min = 1, message = "answer must not be empty"))]
    pub(crate) answer: String,
    #[validate(range(exclusive_min = 0.0, message = "marks must be positive"))]
    pub(crate) marks: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct KeyCreate {
    #[validate(length(min = 1, message = "paper_id must not be empty"))]
    pub(crate) paper_id: String,
    #[validate(length(min = 1, message = "answers must not be empty"))]
    pub(crate) answers: BTreeMap<u32, KeyEntryCreate>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeyApprove {
    #[serde(default)]
    pub(crate) approved_by: Option<String>,
    /// Per-question answer corrections applied before approval.
    #[serde(default)]
    pub(crate) corrections: BTreeMap<u32, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct KeyResponse {
    pub(crate) id: String,
    pub(crate) paper_id: String,
    pub(crate) status: KeyStatus,
    pub(crate) answers: BTreeMap<u32, KeyEntryResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) flags: Option<BTreeMap<u32, KeyFlag>>,
    pub(crate) last_block_hash: Option<String>,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct KeyEntryResponse {
    pub(crate) answer: String,
    pub(crate) marks: f64,
}

impl KeyResponse {
    pub(crate) fn from_model(key: AnswerKey) -> Self {
        Self {
            id: key.id,
            paper_id: key.paper_id,
            status: key.status,
            answers: key
                .answers
                .0
                .into_iter()
                .map(|(question, entry)| {
                    (question, KeyEntryResponse { answer: entry.answer, marks: entry.marks })
                })
                .collect(),
            flags: key.flags.map(|flags| flags.0),
            last_block_hash: key.last_block_hash,
            created_at: format_primitive(key.created_at),
            updated_at: format_primitive(key.updated_at),
        }
    }
}

/// Outcome of the per-entry AI verification pass.
#[derive(Debug, Serialize)]
pub(crate) struct KeyVerifyResponse {
    pub(crate) key: KeyResponse,
    pub(crate) disagreements: Vec<u32>,
    pub(crate) opened_interventions: Vec<String>,
    pub(crate) block_hash: String,
}
