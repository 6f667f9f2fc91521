use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::db::types::SheetStage;

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct WorkflowCompleteRequest {
    #[validate(length(min = 1, message = "sheet_id must not be empty"))]
    pub(crate) sheet_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct WorkflowCompleteResponse {
    pub(crate) sheet_id: String,
    pub(crate) stage: SheetStage,
    pub(crate) gating_interventions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) halted: Option<String>,
}
