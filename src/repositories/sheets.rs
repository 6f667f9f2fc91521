use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::Sheet;
use crate::db::types::SheetStage;

pub(crate) const COLUMNS: &str = "\
    id, exam_id, roll_number, image_hash, reconstructed_hash, stage, last_block_hash, \
    created_at, updated_at";

pub(crate) struct CreateSheet<'a> {
    pub(crate) id: &'a str,
    pub(crate) exam_id: &'a str,
    pub(crate) roll_number: &'a str,
    pub(crate) image_hash: &'a str,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    sheet: CreateSheet<'_>,
) -> Result<Sheet, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "INSERT INTO sheets (id, exam_id, roll_number, image_hash, stage, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6)
         RETURNING {COLUMNS}"
    ))
    .bind(sheet.id)
    .bind(sheet.exam_id)
    .bind(sheet.roll_number)
    .bind(sheet.image_hash)
    .bind(SheetStage::Ingested)
    .bind(sheet.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!("SELECT {COLUMNS} FROM sheets WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn find_by_exam_and_roll(
    executor: impl SqliteExecutor<'_>,
    exam_id: &str,
    roll_number: &str,
) -> Result<Option<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "SELECT {COLUMNS} FROM sheets WHERE exam_id = $1 AND roll_number = $2"
    ))
    .bind(exam_id)
    .bind(roll_number)
    .fetch_optional(executor)
    .await
}

/// Sheets currently parked in a stage, oldest first; the scheduler uses
/// this to resume work after a restart.
pub(crate) async fn list_by_stage(
    executor: impl SqliteExecutor<'_>,
    stage: SheetStage,
) -> Result<Vec<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "SELECT {COLUMNS} FROM sheets WHERE stage = $1 ORDER BY created_at ASC"
    ))
    .bind(stage)
    .fetch_all(executor)
    .await
}

/// Live sheets created before `cutoff`; candidates for the deadline
/// watchdog.
pub(crate) async fn list_active_older_than(
    executor: impl SqliteExecutor<'_>,
    cutoff: PrimitiveDateTime,
) -> Result<Vec<Sheet>, sqlx::Error> {
    sqlx::query_as::<_, Sheet>(&format!(
        "SELECT {COLUMNS} FROM sheets
         WHERE stage NOT IN ('finalized', 'rejected') AND created_at < $1
         ORDER BY created_at ASC"
    ))
    .bind(cutoff)
    .fetch_all(executor)
    .await
}

pub(crate) async fn update_stage(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    stage: SheetStage,
    block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE sheets SET stage = $2, last_block_hash = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(stage)
    .bind(block_hash)
    .bind(updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn set_reconstructed_hash(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    reconstructed_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sheets SET reconstructed_hash = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(reconstructed_hash)
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}
