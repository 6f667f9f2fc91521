use std::collections::BTreeMap;

use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{AnswerKey, KeyEntry, KeyFlag};
use crate::db::types::KeyStatus;

pub(crate) const COLUMNS: &str = "\
    id, paper_id, status, answers, flags, last_block_hash, created_at, updated_at";

pub(crate) struct CreateKey<'a> {
    pub(crate) id: &'a str,
    pub(crate) paper_id: &'a str,
    pub(crate) answers: BTreeMap<u32, KeyEntry>,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    key: CreateKey<'_>,
) -> Result<AnswerKey, sqlx::Error> {
    sqlx::query_as::<_, AnswerKey>(&format!(
        "INSERT INTO answer_keys (id, paper_id, status, answers, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $5)
         RETURNING {COLUMNS}"
    ))
    .bind(key.id)
    .bind(key.paper_id)
    .bind(KeyStatus::Draft)
    .bind(Json(key.answers))
    .bind(key.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<AnswerKey>, sqlx::Error> {
    sqlx::query_as::<_, AnswerKey>(&format!("SELECT {COLUMNS} FROM answer_keys WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// The most recent key for a paper; papers carry at most a handful of key
/// drafts, the newest wins.
pub(crate) async fn find_by_paper(
    executor: impl SqliteExecutor<'_>,
    paper_id: &str,
) -> Result<Option<AnswerKey>, sqlx::Error> {
    sqlx::query_as::<_, AnswerKey>(&format!(
        "SELECT {COLUMNS} FROM answer_keys WHERE paper_id = $1 ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(paper_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn update_status(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    status: KeyStatus,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE answer_keys SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status)
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn update_answers(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    answers: BTreeMap<u32, KeyEntry>,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE answer_keys SET answers = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(Json(answers))
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn update_flags(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    flags: BTreeMap<u32, KeyFlag>,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE answer_keys SET flags = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(Json(flags))
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn set_last_block(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE answer_keys SET last_block_hash = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(block_hash)
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}
