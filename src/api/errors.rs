use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ledger::LedgerError;
use crate::services::interventions::InterventionError;
use crate::services::pipeline::PipelineError;
use crate::services::rechecks::RecheckError;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    code: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// A stage guard refused the request; carries the sheet's current stage.
    PreconditionFailed { stage: String, message: String },
    /// Progression requires human resolution; carries the pinning items.
    GateBlocked { intervention_ids: Vec<String> },
    SignatureInsufficient(String),
    AdapterUnavailable(String),
    /// The ledger refuses writes until an operator repairs the chain.
    LedgerReadOnly(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, detail, details) = match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message, None)
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "NOT_FOUND", message, None),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "CONFLICT", message, None),
            ApiError::PreconditionFailed { stage, message } => (
                StatusCode::CONFLICT,
                "PRECONDITION_FAILED",
                message,
                Some(serde_json::json!({ "current_stage": stage })),
            ),
            ApiError::GateBlocked { intervention_ids } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "GATE_BLOCKED",
                "progression requires human resolution".to_string(),
                Some(serde_json::json!({ "intervention_ids": intervention_ids })),
            ),
            ApiError::SignatureInsufficient(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "SIGNATURE_INSUFFICIENT", message, None)
            }
            ApiError::AdapterUnavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ADAPTER_UNAVAILABLE", message, None)
            }
            ApiError::LedgerReadOnly(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, "LEDGER_READ_ONLY", message, None)
            }
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message, None)
            }
        };

        (status, Json(ErrorResponse { status: status.as_u16(), code, detail, details }))
            .into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Signature(inner) => ApiError::SignatureInsufficient(inner.to_string()),
            LedgerError::ReadOnly => ApiError::LedgerReadOnly(err.to_string()),
            LedgerError::ChainIntegrity { .. } => ApiError::LedgerReadOnly(err.to_string()),
            LedgerError::ChainStale { .. }
            | LedgerError::MiningBudgetExceeded { .. }
            | LedgerError::Persist(_) => ApiError::internal(err, "Ledger append failed"),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::SheetNotFound(id) => ApiError::NotFound(format!("sheet {id} not found")),
            PipelineError::Validation(message) => ApiError::BadRequest(message),
            PipelineError::Ledger(inner) => inner.into(),
            PipelineError::Intervention(inner) => inner.into(),
            PipelineError::Db(inner) => ApiError::internal(inner, "Database operation failed"),
        }
    }
}

impl From<InterventionError> for ApiError {
    fn from(err: InterventionError) -> Self {
        match err {
            InterventionError::NotFound(id) => {
                ApiError::NotFound(format!("intervention {id} not found"))
            }
            InterventionError::InvalidState(message) => ApiError::Conflict(message),
            InterventionError::Ledger(inner) => inner.into(),
            InterventionError::Db(inner) => ApiError::internal(inner, "Database operation failed"),
        }
    }
}

impl From<RecheckError> for ApiError {
    fn from(err: RecheckError) -> Self {
        match err {
            RecheckError::SheetNotFound(id) => ApiError::NotFound(format!("sheet {id} not found")),
            RecheckError::NotFound(id) => {
                ApiError::NotFound(format!("recheck request {id} not found"))
            }
            RecheckError::InvalidState(message) => ApiError::Conflict(message),
            RecheckError::Validation(message) => ApiError::BadRequest(message),
            RecheckError::Ledger(inner) => inner.into(),
            RecheckError::Db(inner) => ApiError::internal(inner, "Database operation failed"),
        }
    }
}
