use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::ManualEntry;

pub(crate) const COLUMNS: &str =
    "id, sheet_id, entries, entered_by, entered_at, created_at, updated_at";

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    sheet_id: &str,
    entries: BTreeMap<u32, String>,
    entered_by: &str,
    created_at: PrimitiveDateTime,
) -> Result<ManualEntry, sqlx::Error> {
    sqlx::query_as::<_, ManualEntry>(&format!(
        "INSERT INTO manual_entries (id, sheet_id, entries, entered_by, entered_at, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $5, $5)
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(sheet_id)
    .bind(Json(entries))
    .bind(entered_by)
    .bind(created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Option<ManualEntry>, sqlx::Error> {
    sqlx::query_as::<_, ManualEntry>(&format!(
        "SELECT {COLUMNS} FROM manual_entries WHERE sheet_id = $1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}
