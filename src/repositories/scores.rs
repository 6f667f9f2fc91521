use sqlx::types::Json;
use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::{QuestionScore, ScoreResult};

pub(crate) const COLUMNS: &str = "\
    id, sheet_id, automated_marks, manual_marks, marks_match, is_perfect_evaluation, grade, \
    percentage, correct_count, incorrect_count, unanswered_count, breakdown, created_at, updated_at";

pub(crate) struct CreateScore<'a> {
    pub(crate) id: &'a str,
    pub(crate) sheet_id: &'a str,
    pub(crate) automated_marks: f64,
    pub(crate) manual_marks: Option<f64>,
    pub(crate) marks_match: bool,
    pub(crate) is_perfect_evaluation: bool,
    pub(crate) grade: &'a str,
    pub(crate) percentage: f64,
    pub(crate) correct_count: i64,
    pub(crate) incorrect_count: i64,
    pub(crate) unanswered_count: i64,
    pub(crate) breakdown: Vec<QuestionScore>,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    score: CreateScore<'_>,
) -> Result<ScoreResult, sqlx::Error> {
    sqlx::query_as::<_, ScoreResult>(&format!(
        "INSERT INTO score_results (
            id, sheet_id, automated_marks, manual_marks, marks_match, is_perfect_evaluation,
            grade, percentage, correct_count, incorrect_count, unanswered_count, breakdown,
            created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
         RETURNING {COLUMNS}"
    ))
    .bind(score.id)
    .bind(score.sheet_id)
    .bind(score.automated_marks)
    .bind(score.manual_marks)
    .bind(score.marks_match)
    .bind(score.is_perfect_evaluation)
    .bind(score.grade)
    .bind(score.percentage)
    .bind(score.correct_count)
    .bind(score.incorrect_count)
    .bind(score.unanswered_count)
    .bind(Json(score.breakdown))
    .bind(score.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Option<ScoreResult>, sqlx::Error> {
    sqlx::query_as::<_, ScoreResult>(&format!(
        "SELECT {COLUMNS} FROM score_results WHERE sheet_id = $1"
    ))
    .bind(sheet_id)
    .fetch_optional(executor)
    .await
}
