use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::Intervention;
use crate::db::types::{
    EntityKind, InterventionPriority, InterventionStatus, ReasonKind,
};

#[derive(Debug, Deserialize)]
pub(crate) struct InterventionFilter {
    #[serde(default)]
    pub(crate) status: Option<InterventionStatus>,
    #[serde(default)]
    pub(crate) priority: Option<InterventionPriority>,
    #[serde(default)]
    pub(crate) assignee: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NextFilter {
    #[serde(default)]
    pub(crate) priority: Option<InterventionPriority>,
    #[serde(default)]
    pub(crate) entity_kind: Option<EntityKind>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ClaimRequest {
    #[validate(length(min = 1, message = "assignee must not be empty"))]
    pub(crate) assignee: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ResolveRequest {
    #[validate(length(min = 1, message = "resolved_by must not be empty"))]
    pub(crate) resolved_by: String,
    #[validate(length(min = 1, message = "note must not be empty"))]
    pub(crate) note: String,
    /// For reconciliation rows: the answer the reviewer settled on.
    #[serde(default)]
    pub(crate) final_answer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CancelRequest {
    #[serde(default)]
    pub(crate) note: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InterventionResponse {
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
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl InterventionResponse {
    pub(crate) fn from_model(item: Intervention) -> Self {
        Self {
            id: item.id,
            entity_kind: item.entity_kind,
            entity_id: item.entity_id,
            sheet_id: item.sheet_id,
            reason_kind: item.reason_kind,
            detail: item.detail,
            priority: item.priority,
            status: item.status,
            assignee: item.assignee,
            resolution_note: item.resolution_note,
            opened_block_hash: item.opened_block_hash,
            resolved_block_hash: item.resolved_block_hash,
            created_at: format_primitive(item.created_at),
            updated_at: format_primitive(item.updated_at),
        }
    }
}
