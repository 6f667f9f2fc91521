use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{Damage, QualityRecord};
use crate::db::types::QualityDecision;

pub(crate) const COLUMNS: &str = "\
    id, sheet_id, score, damages, decision, reconstruction_hash, reconstruction_confidence, \
    created_at, updated_at";

pub(crate) struct CreateQuality<'a> {
    pub(crate) id: &'a str,
    pub(crate) sheet_id: &'a str,
    pub(crate) score: f64,
    pub(crate) damages: Vec<Damage>,
    pub(crate) decision: QualityDecision,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    record: CreateQuality<'_>,
) -> Result<QualityRecord, sqlx::Error> {
    sqlx::query_as::<_, QualityRecord>(&format!(
        "INSERT INTO quality_records (id, sheet_id, score, damages, decision, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6)
         RETURNING {COLUMNS}"
    ))
    .bind(record.id)
    .bind(record.sheet_id)
    .bind(record.score)
    .bind(Json(record.damages))
    .bind(record.decision)
    .bind(record.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Option<QualityRecord>, sqlx::Error> {
    sqlx::query_as::<_, QualityRecord>(&format!(
        "SELECT {COLUMNS} FROM quality_records WHERE sheet_id = $1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn set_reconstruction(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
    reconstruction_hash: &str,
    confidence: f64,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE quality_records
         SET reconstruction_hash = $2, reconstruction_confidence = $3, updated_at = $4
         WHERE sheet_id = $1",
    )
    .bind(sheet_id)
    .bind(reconstruction_hash)
    .bind(confidence)
    .bind(updated_at)
    .execute(executor)
    .await?;
    Ok(())
}
