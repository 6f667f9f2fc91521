use axum::extract::{Path, Query, State};
use axum::{routing::get, Json, Router};
use serde::Deserialize;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::ledger::LedgerError;

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/blocks", get(list_blocks))
        .route("/block/:hash", get(get_block))
        .route("/validate", get(validate))
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.ledger().stats();
    Json(serde_json::to_value(stats).unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct BlockQuery {
    #[serde(default)]
    limit: Option<usize>,
    /// Return blocks with an index strictly greater than this.
    #[serde(default)]
    after: Option<u64>,
}

async fn list_blocks(
    Query(query): Query<BlockQuery>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let blocks = state.ledger().list(query.after, limit);
    Json(serde_json::json!({
        "total": state.ledger().len(),
        "blocks": blocks,
    }))
}

async fn get_block(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let block = state
        .ledger()
        .get_by_hash(&hash)
        .ok_or_else(|| ApiError::NotFound(format!("no block with hash {hash}")))?;
    Ok(Json(serde_json::to_value(block).unwrap_or_default()))
}

/// Full chain walk. Reports the first offending index instead of failing
/// the request; a broken chain also flips the ledger read-only.
async fn validate(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.ledger().validate() {
        Ok(()) => Json(serde_json::json!({ "valid": true })),
        Err(LedgerError::ChainIntegrity { index, reason }) => Json(serde_json::json!({
            "valid": false,
            "failed_index": index,
            "reason": reason,
        })),
        Err(other) => Json(serde_json::json!({
            "valid": false,
            "reason": other.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::test_support;

    #[tokio::test]
    async fn status_reports_kind_counts() {
        let ctx = test_support::setup_test_context().await;
        test_support::create_paper(&ctx, "exam-1").await;
        test_support::ingest_sheet(&ctx, "exam-1", "roll-001").await;

        let response =
            test_support::send_json(&ctx.app, Method::GET, "/api/v1/ledger/status", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = test_support::read_json(response).await;
        assert_eq!(body["total_blocks"], 2);
        assert_eq!(body["blocks_by_kind"]["QUESTION_PAPER_UPLOAD"], 1);
        assert_eq!(body["blocks_by_kind"]["SHEET_INGESTED"], 1);
        assert_eq!(body["is_valid"], true);
        assert_eq!(body["read_only"], false);
    }

    #[tokio::test]
    async fn blocks_paginate_after_an_index() {
        let ctx = test_support::setup_test_context().await;
        test_support::create_paper(&ctx, "exam-1").await;
        for roll in ["r1", "r2", "r3"] {
            test_support::ingest_sheet(&ctx, "exam-1", roll).await;
        }

        let response = test_support::send_json(
            &ctx.app,
            Method::GET,
            "/api/v1/ledger/blocks?after=1&limit=2",
            None,
        )
        .await;
        let body = test_support::read_json(response).await;
        let blocks = body["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["index"], 2);
        assert_eq!(blocks[1]["index"], 3);
    }

    #[tokio::test]
    async fn block_lookup_by_hash_round_trips() {
        let ctx = test_support::setup_test_context().await;
        test_support::create_paper(&ctx, "exam-1").await;
        let head = ctx.state.ledger().head().expect("head");

        let response = test_support::send_json(
            &ctx.app,
            Method::GET,
            &format!("/api/v1/ledger/block/{}", head.self_hash),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = test_support::read_json(response).await;
        assert_eq!(body["self_hash"], head.self_hash.as_str());

        let missing = test_support::send_json(
            &ctx.app,
            Method::GET,
            &format!("/api/v1/ledger/block/{}", "0".repeat(64)),
            None,
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn validate_endpoint_reports_a_clean_chain() {
        let ctx = test_support::setup_test_context().await;
        test_support::create_paper(&ctx, "exam-1").await;

        let response =
            test_support::send_json(&ctx.app, Method::GET, "/api/v1/ledger/validate", None).await;
        let body = test_support::read_json(response).await;
        assert_eq!(body["valid"], true);
    }
}
