use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::Intervention;
use crate::db::types::{EntityKind, InterventionPriority, InterventionStatus, ReasonKind};

pub(crate) const COLUMNS: &str = "\
    id, entity_kind, entity_id, sheet_id, reason_kind, detail, priority, status, assignee, \
    resolution_note, opened_block_hash, resolved_block_hash, created_at, updated_at";

// Dequeue order for open items: critical first, oldest first on ties.
const PRIORITY_RANK: &str = "CASE priority \
    WHEN 'critical' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END";

pub(crate) struct CreateIntervention<'a> {
    pub(crate) id: &'a str,
    pub(crate) entity_kind: EntityKind,
    pub(crate) entity_id: &'a str,
    pub(crate) sheet_id: Option<&'a str>,
    pub(crate) reason_kind: ReasonKind,
    pub(crate) detail: Option<&'a str>,
    pub(crate) priority: InterventionPriority,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn create(
    executor: impl SqliteExecutor<'_>,
    item: CreateIntervention<'_>,
) -> Result<Intervention, sqlx::Error> {
    sqlx::query_as::<_, Intervention>(&format!(
        "INSERT INTO interventions (
            id, entity_kind, entity_id, sheet_id, reason_kind, detail, priority, status,
            created_at, updated_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
         RETURNING {COLUMNS}"
    ))
    .bind(item.id)
    .bind(item.entity_kind)
    .bind(item.entity_id)
    .bind(item.sheet_id)
    .bind(item.reason_kind)
    .bind(item.detail)
    .bind(item.priority)
    .bind(InterventionStatus::Open)
    .bind(item.created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl SqliteExecutor<'_>,
    id: &str,
) -> Result<Option<Intervention>, sqlx::Error> {
    sqlx::query_as::<_, Intervention>(&format!("SELECT {COLUMNS} FROM interventions WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn list(
    executor: impl SqliteExecutor<'_>,
    status: Option<InterventionStatus>,
    priority: Option<InterventionPriority>,
    assignee: Option<&str>,
) -> Result<Vec<Intervention>, sqlx::Error> {
    sqlx::query_as::<_, Intervention>(&format!(
        "SELECT {COLUMNS} FROM interventions
         WHERE ($1 IS NULL OR status = $1)
           AND ($2 IS NULL OR priority = $2)
           AND ($3 IS NULL OR assignee = $3)
         ORDER BY {PRIORITY_RANK} DESC, created_at ASC"
    ))
    .bind(status)
    .bind(priority)
    .bind(assignee)
    .fetch_all(executor)
    .await
}

/// The highest-priority open item, oldest first on ties.
pub(crate) async fn next_open(
    executor: impl SqliteExecutor<'_>,
    priority: Option<InterventionPriority>,
    entity_kind: Option<EntityKind>,
) -> Result<Option<Intervention>, sqlx::Error> {
    sqlx::query_as::<_, Intervention>(&format!(
        "SELECT {COLUMNS} FROM interventions
         WHERE status = 'open'
           AND ($1 IS NULL OR priority = $1)
           AND ($2 IS NULL OR entity_kind = $2)
         ORDER BY {PRIORITY_RANK} DESC, created_at ASC
         LIMIT 1"
    ))
    .bind(priority)
    .bind(entity_kind)
    .fetch_optional(executor)
    .await
}

/// Open (or claimed-but-unresolved) items pinning a sheet.
pub(crate) async fn open_for_sheet(
    executor: impl SqliteExecutor<'_>,
    sheet_id: &str,
) -> Result<Vec<Intervention>, sqlx::Error> {
    sqlx::query_as::<_, Intervention>(&format!(
        "SELECT {COLUMNS} FROM interventions
         WHERE sheet_id = $1 AND status IN ('open', 'claimed')
         ORDER BY created_at ASC"
    ))
    .bind(sheet_id)
    .fetch_all(executor)
    .await
}

/// Atomic claim: flips exactly one open row to claimed. Returns the row or
/// `None` when the item is gone or already claimed.
pub(crate) async fn claim(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    assignee: &str,
    updated_at: PrimitiveDateTime,
) -> Result<Option<Intervention>, sqlx::Error> {
    sqlx::query_as::<_, Intervention>(&format!(
        "UPDATE interventions
         SET status = 'claimed', assignee = $2, updated_at = $3
         WHERE id = $1 AND status = 'open'
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(assignee)
    .bind(updated_at)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn resolve(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    resolution_note: &str,
    resolved_block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE interventions
         SET status = 'resolved', resolution_note = $2, resolved_block_hash = $3, updated_at = $4
         WHERE id = $1",
    )
    .bind(id)
    .bind(resolution_note)
    .bind(resolved_block_hash)
    .bind(updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn cancel(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    resolution_note: Option<&str>,
    resolved_block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE interventions
         SET status = 'cancelled', resolution_note = $2, resolved_block_hash = $3, updated_at = $4
         WHERE id = $1",
    )
    .bind(id)
    .bind(resolution_note)
    .bind(resolved_block_hash)
    .bind(updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn set_opened_block(
    executor: impl SqliteExecutor<'_>,
    id: &str,
    block_hash: &str,
    updated_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE interventions SET opened_block_hash = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(block_hash)
        .bind(updated_at)
        .execute(executor)
        .await?;
    Ok(())
}
