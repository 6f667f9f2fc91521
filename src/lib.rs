pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod ledger;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::path::Path;
use std::sync::Arc;

use crate::core::{config::Settings, state::AppState, telemetry};
use crate::ledger::signers::SignerRegistry;
use crate::ledger::Ledger;
use crate::services::answer_ai::HttpSolverService;
use crate::services::sheet_vision::HttpVisionService;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let state = build_state(settings).await?;

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        ledger_blocks = state.ledger().len(),
        "OMR Ledger API listening"
    );

    axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let state = build_state(settings).await?;

    tracing::info!(
        workers = state.settings().orchestrator().workers,
        "OMR Ledger worker pool starting"
    );

    tasks::scheduler::run(state).await
}

async fn build_state(settings: Settings) -> anyhow::Result<AppState> {
    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let signers = SignerRegistry::load(Path::new(&settings.signers().registry_path))?;
    let ledger = Ledger::open(
        Path::new(&settings.ledger().path),
        settings.ledger().difficulty_hex_zeros,
        settings.ledger().mining_budget,
        signers.clone(),
    )?;
    if ledger.is_read_only() {
        tracing::error!("Ledger opened in read-only mode; operator attention required");
    }

    mirror_signer_keys(&db_pool, &signers).await?;

    let vision = Arc::new(HttpVisionService::from_settings(&settings)?);
    let solver = Arc::new(HttpSolverService::from_settings(&settings)?);

    Ok(AppState::new(settings, db_pool, ledger, vision, solver))
}

/// Keep the signer_keys table in step with the registry file; the file is
/// the source of truth, the table serves audit queries.
async fn mirror_signer_keys(
    pool: &sqlx::SqlitePool,
    registry: &SignerRegistry,
) -> anyhow::Result<()> {
    use crate::ledger::signers::SignerKind;

    let now = core::time::primitive_now_utc();
    for kind in [SignerKind::AiVerifier, SignerKind::HumanVerifier, SignerKind::AdminController] {
        if let Some(key) = registry.key_for(kind) {
            repositories::signer_keys::upsert(
                pool,
                kind.as_str(),
                &hex::encode(key.to_bytes()),
                now,
            )
            .await?;
        }
    }
    Ok(())
}
