use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::core::state::AppState;
use crate::core::{metrics, time::primitive_now_utc, time::format_primitive};

pub(crate) async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": state.settings().api().project_name,
        "version": state.settings().api().version,
    }))
}

pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(state.db()).await.is_ok();
    let ledger_writable = !state.ledger().is_read_only();

    let status = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(serde_json::json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "database": db_ok,
            "ledger_writable": ledger_writable,
            "time": format_primitive(primitive_now_utc()),
        })),
    )
}

pub(crate) async fn metrics() -> impl IntoResponse {
    match metrics::render() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
