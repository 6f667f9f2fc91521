use std::sync::Arc;

use sqlx::SqlitePool;

use crate::core::config::Settings;
use crate::ledger::Ledger;
use crate::services::adapter::AdapterLimiter;
use crate::services::answer_ai::SolverService;
use crate::services::pipeline::SheetLocks;
use crate::services::sheet_vision::VisionService;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: SqlitePool,
    ledger: Ledger,
    vision: Arc<dyn VisionService>,
    solver: Arc<dyn SolverService>,
    limiter: AdapterLimiter,
    locks: SheetLocks,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: SqlitePool,
        ledger: Ledger,
        vision: Arc<dyn VisionService>,
        solver: Arc<dyn SolverService>,
    ) -> Self {
        let limiter = AdapterLimiter::from_settings(&settings);
        Self {
            inner: Arc::new(InnerState {
                settings,
                db,
                ledger,
                vision,
                solver,
                limiter,
                locks: SheetLocks::new(),
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub(crate) fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub(crate) fn vision(&self) -> &dyn VisionService {
        self.inner.vision.as_ref()
    }

    pub(crate) fn solver(&self) -> &dyn SolverService {
        self.inner.solver.as_ref()
    }

    pub(crate) fn limiter(&self) -> &AdapterLimiter {
        &self.inner.limiter
    }

    pub(crate) fn locks(&self) -> &SheetLocks {
        &self.inner.locks
    }
}
