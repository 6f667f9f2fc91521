use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::QuestionPaper;

pub(crate) const COLUMNS: &str = "\
    id, exam_id, subject, total_questions, max_marks, content_hash, last_block_hash, \
    created_at, updated_at";

pub(crate) struct CreatePaper<'a> {
    pub(crate) id: &'a str,
    pub(crate) exam_id: &'a str,
    pub(crate) subject: &'a str,
    pub(crate) total_questions: i64,
    pub(crate) max_marks: f64,
    pub(crate) content_hash: &'a str,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    paper: CreatePaper<'_>,
) -> Result<QuestionPaper, sqlx::Error> {
    sqlx::query_as::<_, QuestionPaper>(&format!(
        "INSERT INTO question_papers (
            id, exam_id, subject, total_questions, max_marks, content_hash,
            created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
         RETURNING {COLUMNS}"
    ))
    .bind(paper.id)
    .bind(paper.exam_id)
    .bind(paper.subject)
    .bind(paper.total_questions)
    .bind(paper.max_marks)
    .bind(paper.content_hash)
    .bind(paper.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<QuestionPaper>, sqlx::Error> {
    sqlx::query_as::<_, QuestionPaper>(&format!(
        "SELECT {COLUMNS} FROM question_papers WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn find_by_exam(
    executor: impl SqliteExecutor<'_>,
    exam_id: &str,
) -> Result<Option<QuestionPaper>, sqlx::Error> {
    sqlx::query_as::<_, QuestionPaper>(&format!(
        "SELECT {COLUMNS} FROM question_papers WHERE exam_id = $1"
    ))
    .bind(exam_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn set_last_block(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE question_papers SET last_block_hash = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(block_hash)
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}
