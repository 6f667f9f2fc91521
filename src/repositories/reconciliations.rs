use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{ReconEntry, Reconciliation};

pub(crate) const COLUMNS: &str = "id, sheet_id, entries, created_at, updated_at";

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    sheet_id: &str,
    entries: BTreeMap<u32, ReconEntry>,
    created_at: PrimitiveDateTime,
) -> Result<Reconciliation, sqlx::Error> {
    sqlx::query_as::<_, Reconciliation>(&format!(
        "INSERT INTO reconciliations (id, sheet_id, entries, created_at, updated_at)
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
) -> Result<Option<Reconciliation>, sqlx::Error> {
    sqlx::query_as::<_, Reconciliation>(&format!(
        "SELECT {COLUMNS} FROM reconciliations WHERE sheet_id = $1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn update_entries(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
    entries: BTreeMap<u32, ReconEntry>,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE reconciliations SET entries = $2, updated_at = $3 WHERE sheet_id = $1")
        .bind(sheet_id)
        .bind(Json(entries))
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}
