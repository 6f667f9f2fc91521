use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

use crate::core::state::AppState;
use crate::db::types::SheetStage;
use crate::repositories;
use crate::services::pipeline;

const CLAIM_SCAN_INTERVAL: Duration = Duration::from_secs(5);
const DEADLINE_SCAN_INTERVAL: Duration = Duration::from_secs(30);

// Stages a worker may push forward without human input. Sheets parked in
// the remaining stages wait on external sources or gates.
const RUNNABLE_STAGES: &[SheetStage] = &[
    SheetStage::Ingested,
    SheetStage::QualityAssessed,
    SheetStage::BubblesRead,
    SheetStage::AiSolved,
    SheetStage::ManualEntered,
    SheetStage::Reconciled,
];

/// Background worker pool: a scan loop feeds runnable sheet ids to `W`
/// workers, each advancing one sheet at a time. All progress is
/// ledger-linearized, so workers are crash-safe and reentrant.
pub(crate) async fn run(state: AppState) -> Result<()> {
    let workers = state.settings().orchestrator().workers;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (work_tx, work_rx) = mpsc::channel::<String>(workers * 4);
    let work_rx = std::sync::Arc::new(tokio::sync::Mutex::new(work_rx));

    let mut handles = Vec::with_capacity(workers + 2);
    for _ in 0..workers {
        handles.push(tokio::spawn(sheet_worker(
            state.clone(),
            work_rx.clone(),
            shutdown_rx.clone(),
        )));
    }
    handles.push(tokio::spawn(claim_loop(state.clone(), work_tx, shutdown_rx.clone())));
    handles.push(tokio::spawn(deadline_loop(state.clone(), shutdown_rx.clone())));

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn sheet_worker(
    state: AppState,
    work_rx: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                next = rx.recv() => next,
            }
        };
        let Some(sheet_id) = next else { break };

        match pipeline::advance_available(&state, &sheet_id).await {
            Ok(progress) => {
                tracing::debug!(
                    sheet_id = %sheet_id,
                    stage = progress.stage.as_str(),
                    halted = progress.halted.as_deref().unwrap_or("-"),
                    "Worker advanced sheet"
                );
            }
            Err(err) => {
                tracing::error!(sheet_id = %sheet_id, error = %err, "Worker failed to advance sheet");
            }
        }
    }
}

/// Scan for sheets parked in runnable stages and queue them. After a
/// restart this also re-schedules everything that was mid-pipeline.
async fn claim_loop(
    state: AppState,
    work_tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(CLAIM_SCAN_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                for stage in RUNNABLE_STAGES {
                    match repositories::sheets::list_by_stage(state.db(), *stage).await {
                        Ok(sheets) => {
                            for sheet in sheets {
                                if work_tx.send(sheet.id).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            tracing::error!(stage = stage.as_str(), error = %err, "Stage scan failed");
                        }
                    }
                }
            }
        }
    }
}

async fn deadline_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(DEADLINE_SCAN_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = pipeline::check_deadlines(&state).await {
                    tracing::error!(error = %err, "Deadline scan failed");
                }
            }
        }
    }
}
