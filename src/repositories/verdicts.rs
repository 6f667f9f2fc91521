use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{AiSolverVerdict, SolverCell};

pub(crate) const COLUMNS: &str = "id, sheet_id, entries, created_at, updated_at";

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    sheet_id: &str,
    entries: BTreeMap<u32, SolverCell>,
    created_at: PrimitiveDateTime,
) -> Result<AiSolverVerdict, sqlx::Error> {
    sqlx::query_as::<_, AiSolverVerdict>(&format!(
        "INSERT INTO ai_solver_verdicts (id, sheet_id, entries, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $4)
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(sheet_id)
    .bind(Json(entries))
    .bind(created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Option<AiSolverVerdict>, sqlx::Error> {
    sqlx::query_as::<_, AiSolverVerdict>(&format!(
        "SELECT {COLUMNS} FROM ai_solver_verdicts WHERE sheet_id = $1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}
