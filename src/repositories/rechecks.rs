use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{RecheckChange, RecheckRequest, RecheckSnapshot};

pub(crate) const COLUMNS: &str = "\
    id, sheet_id, requested_by, reason, questions, status, original_result, rechecked_result, \
    changes_found, completed_by, requested_block_hash, completed_block_hash, completed_at, \
    created_at, updated_at";

pub(crate) struct CreateRecheck<'a> {
    pub(crate) id: &'a str,
    pub(crate) sheet_id: &'a str,
    pub(crate) requested_by: &'a str,
    pub(crate) reason: &'a str,
    pub(crate) questions: Vec<u32>,
    pub(crate) original_result: RecheckSnapshot,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    recheck: CreateRecheck<'_>,
) -> Result<RecheckRequest, sqlx::Error> {
    sqlx::query_as::<_, RecheckRequest>(&format!(
        "INSERT INTO recheck_requests (
            id, sheet_id, requested_by, reason, questions, original_result,
            created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
         RETURNING {COLUMNS}"
    ))
    .bind(recheck.id)
    .bind(recheck.sheet_id)
    .bind(recheck.requested_by)
    .bind(recheck.reason)
    .bind(Json(recheck.questions))
    .bind(Json(recheck.original_result))
    .bind(recheck.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<RecheckRequest>, sqlx::Error> {
    sqlx::query_as::<_, RecheckRequest>(&format!(
        "SELECT {COLUMNS} FROM recheck_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn list_by_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Vec<RecheckRequest>, sqlx::Error> {
    sqlx::query_as::<_, RecheckRequest>(&format!(
        "SELECT {COLUMNS} FROM recheck_requests WHERE sheet_id = $1 ORDER BY created_at ASC"
    ))
    .bind(sheet_id)
    .fetch_all(executor)
    .await
}

/// A sheet admits one revaluation at a time.
pub(crate) async fn pending_for_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Option<RecheckRequest>, sqlx::Error> {
    sqlx::query_as::<_, RecheckRequest>(&format!(
        "SELECT {COLUMNS} FROM recheck_requests
         WHERE sheet_id = $1 AND status = 'pending'
         LIMIT 1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn set_requested_block(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE recheck_requests SET requested_block_hash = $2, updated_at = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(block_hash)
    .bind(updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) struct CompleteRecheck<'a> {
    pub(crate) id: &'a str,
    pub(crate) rechecked_result: RecheckSnapshot,
    pub(crate) changes_found: Vec<RecheckChange>,
    pub(crate) completed_by: &'a str,
    pub(crate) completed_block_hash: &'a str,
    pub(crate) completed_at: PrimitiveDateTime,
}

pub(crate) async fn complete(
    executor: impl SqliteExecutor<'_>,
    recheck: CompleteRecheck<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE recheck_requests
         SET status = 'completed', rechecked_result = $2, changes_found = $3, completed_by = $4,
             completed_block_hash = $5, completed_at = $6, updated_at = $6
         WHERE id = $1",
    )
    .bind(recheck.id)
    .bind(Json(recheck.rechecked_result))
    .bind(Json(recheck.changes_found))
    .bind(recheck.completed_by)
    .bind(recheck.completed_block_hash)
    .bind(recheck.completed_at)
    .execute(executor)
    .await?;
    Ok(())
}
