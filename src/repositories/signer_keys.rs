use sqlx::SqliteExecutor;
use time::PrimitiveDateTime;

use crate::db::models::SignerKeyRow;

pub(crate) const COLUMNS: &str = "kind, public_key, created_at";

/// Mirror one registry entry into the store; the registry file stays the
/// source of truth, the table exists for audit queries.
pub(crate) async fn upsert(
    executor: impl SqliteExecutor<'_>,
    kind: &str,
    public_key: &str,
    created_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO signer_keys (kind, public_key, created_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (kind) DO UPDATE SET public_key = excluded.public_key",
    )
    .bind(kind)
    .bind(public_key)
    .bind(created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn list(
    executor: impl SqliteExecutor<'_>,
) -> Result<Vec<SignerKeyRow>, sqlx::Error> {
    sqlx::query_as::<_, SignerKeyRow>(&format!(
        "SELECT {COLUMNS} FROM signer_keys ORDER BY kind ASC"
    ))
    .fetch_all(executor)
    .await
}
