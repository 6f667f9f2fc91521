use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{BubbleCell, BubbleReading};

pub(crate) const COLUMNS: &str = "id, sheet_id, entries, created_at, updated_at";

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    sheet_id: &str,
    entries: BTreeMap<u32, BubbleCell>,
    created_at: PrimitiveDateTime,
) -> Result<BubbleReading, sqlx::Error> {
    sqlx::query_as::<_, BubbleReading>(&format!(
        "INSERT INTO bubble_readings (id, sheet_id, entries, created_at, updated_at)
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
) -> Result<Option<BubbleReading>, sqlx::Error> {
    sqlx::query_as::<_, BubbleReading>(&format!(
        "SELECT {COLUMNS} FROM bubble_readings WHERE sheet_id = $1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}
