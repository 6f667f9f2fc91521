use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::QuestionPaper;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct PaperCreate {
    #[validate(length(min = 1, message = "exam_id must not be empty"))]
    pub(crate) exam_id: String,
    #[validate(length(min = 1, message = "subject must not be empty"))]
    pub(crate) subject: String,
    #[validate(range(min = 1, max = 500, message = "total_questions must be within 1..=500"))]
    pub(crate) total_questions: i64,
    #[validate(range(exclusive_min = 0.0, message = "max_marks must be positive"))]
    pub(crate) max_marks: f64,
    #[validate(length(equal = 64, message = "content_hash must be 64 hex characters"))]
    pub(crate) content_hash: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct PaperResponse {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) subject: String,
    pub(crate) total_questions: i64,
    pub(crate) max_marks: f64,
    pub(crate) content_hash: String,
    pub(crate) last_block_hash: Option<String>,
    pub(crate) created_at: String,
}

impl PaperResponse {
    pub(crate) fn from_model(paper: QuestionPaper) -> Self {
        Self {
            id: paper.id,
            exam_id: paper.exam_id,
            subject: paper.subject,
            total_questions: paper.total_questions,
            max_marks: paper.max_marks,
            content_hash: paper.content_hash,
            last_block_hash: paper.last_block_hash,
            created_at: format_primitive(paper.created_at),
        }
    }
}
