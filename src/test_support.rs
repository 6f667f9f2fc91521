use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    Router,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::api;
use crate::core::{config::Settings, state::AppState};
use crate::db::models::Damage;
use crate::ledger::signers::testing::TestSigners;
use crate::ledger::signers::SignerKind;
use crate::ledger::Ledger;
use crate::services::adapter::AdapterError;
use crate::services::answer_ai::{
    KeyVerification, SolveRequest, SolverAnswer, SolverService, VerifyRequest,
};
use crate::services::sheet_vision::{
    QualityAssessment, ReconstructionOutcome, VisionService,
};

pub(crate) struct TestContext {
    pub(crate) state: AppState,
    pub(crate) app: Router,
    pub(crate) signers: TestSigners,
    _tmp: TempDir,
}

#[derive(Debug, Clone)]
pub(crate) struct VisionFake {
    pub(crate) score: f64,
    pub(crate) recoverable: bool,
    pub(crate) fail_transient: bool,
    pub(crate) damages: Vec<Damage>,
}

impl Default for VisionFake {
    fn default() -> Self {
        Self { score: 0.95, recoverable: true, fail_transient: false, damages: Vec::new() }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SolverFake {
    answers: BTreeMap<u32, String>,
    disagreements: BTreeSet<u32>,
    pub(crate) fail_transient: bool,
}

impl SolverFake {
    /// Override the solver's answer for one question.
    pub(crate) fn answer(&mut self, question: u32, answer: &str) {
        self.answers.insert(question, answer.to_string());
    }

    /// Make key verification disagree on one question.
    pub(crate) fn disagree_on(&mut self, question: u32) {
        self.disagreements.insert(question);
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Fakes {
    pub(crate) vision: VisionFake,
    pub(crate) solver: SolverFake,
}

struct FakeVisionService {
    config: VisionFake,
}

#[async_trait]
impl VisionService for FakeVisionService {
    async fn assess_quality(&self, _image_hash: &str) -> Result<QualityAssessment, AdapterError> {
        if self.config.fail_transient {
            return Err(AdapterError::Transient("vision fake is down".to_string()));
        }
        Ok(QualityAssessment {
            score: self.config.score,
            damages: self.config.damages.clone(),
            recoverable: self.config.recoverable,
        })
    }

    async fn reconstruct(
        &self,
        image_hash: &str,
        _expected_rows: u32,
        _expected_cols: u32,
    ) -> Result<ReconstructionOutcome, AdapterError> {
        if self.config.fail_transient {
            return Err(AdapterError::Transient("vision fake is down".to_string()));
        }
        // A distinct, deterministic hash derived from the input.
        let mut reconstructed = image_hash.to_string();
        reconstructed.truncate(32);
        reconstructed.push_str(&"f".repeat(64 - reconstructed.len()));
        Ok(ReconstructionOutcome { reconstructed_hash: reconstructed, confidence: 0.9 })
    }
}

struct FakeSolverService {
    config: SolverFake,
}

/// The default solver agrees with the default key (A, B, C).
fn default_answer(question: u32) -> String {
    match question {
        1 => "A".to_string(),
        2 => "B".to_string(),
        3 => "C".to_string(),
        _ => "A".to_string(),
    }
}

#[async_trait]
impl SolverService for FakeSolverService {
    async fn solve_question(
        &self,
        request: SolveRequest<'_>,
    ) -> Result<SolverAnswer, AdapterError> {
        if self.config.fail_transient {
            return Err(AdapterError::Transient("solver fake is down".to_string()));
        }
        let answer = self
            .config
            .answers
            .get(&request.question_number)
            .cloned()
            .unwrap_or_else(|| default_answer(request.question_number));
        Ok(SolverAnswer { answer, confidence: 0.92, explanation: None })
    }

    async fn verify_answer_key(
        &self,
        request: VerifyRequest<'_>,
    ) -> Result<KeyVerification, AdapterError> {
        if self.config.fail_transient {
            return Err(AdapterError::Transient("solver fake is down".to_string()));
        }
        let agrees = !self.config.disagreements.contains(&request.question_number);
        Ok(KeyVerification {
            agrees,
            confidence: if agrees { 0.93 } else { 0.4 },
            notes: (!agrees).then(|| "solver derived a different answer".to_string()),
        })
    }
}

fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|err| err.into_inner())
}

pub(crate) async fn setup_test_context() -> TestContext {
    setup_test_context_with(|_| {}).await
}

pub(crate) async fn setup_test_context_with(configure: impl FnOnce(&mut Fakes)) -> TestContext {
    let tmp = TempDir::new().expect("tempdir");
    let db_path = tmp.path().join("omrledger-test.db");

    let settings = {
        let _guard = env_lock();
        std::env::set_var("OMRLEDGER_ENV", "test");
        std::env::set_var("OMRLEDGER_STRICT_CONFIG", "0");
        std::env::set_var("PROMETHEUS_ENABLED", "0");
        std::env::set_var("LEDGER_DIFFICULTY_HEX_ZEROS", "0");
        std::env::set_var("ADAPTER_MAX_ATTEMPTS", "1");
        std::env::set_var("ADAPTER_TOTAL_BUDGET_SECONDS", "1");
        std::env::set_var(
            "DATABASE_URL",
            format!("sqlite://{}?mode=rwc", db_path.display()),
        );
        Settings::load().expect("settings")
    };

    let db = prepare_db(&settings).await;

    let signers = TestSigners::generate();
    let ledger = Ledger::open(
        &tmp.path().join("ledger.chain"),
        settings.ledger().difficulty_hex_zeros,
        settings.ledger().mining_budget,
        signers.registry.clone(),
    )
    .expect("open ledger");

    let mut fakes = Fakes::default();
    configure(&mut fakes);

    let state = AppState::new(
        settings,
        db,
        ledger,
        Arc::new(FakeVisionService { config: fakes.vision }),
        Arc::new(FakeSolverService { config: fakes.solver }),
    );
    let app = api::router::router(state.clone());

    TestContext { state, app, signers, _tmp: tmp }
}

async fn prepare_db(settings: &Settings) -> SqlitePool {
    let db = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&settings.database().database_url())
        .await
        .expect("db pool");
    crate::db::run_migrations(&db).await.expect("migrations");
    db
}

pub(crate) async fn send_json(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> axum::response::Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);

    let request = if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        builder.body(Body::from(bytes)).expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    };

    app.clone().oneshot(request).await.expect("response")
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}

pub(crate) fn sample_paper_body(exam_id: &str) -> serde_json::Value {
    json!({
        "exam_id": exam_id,
        "subject": "chemistry",
        "total_questions": 3,
        "max_marks": 6.0,
        "content_hash": "c0".repeat(32),
    })
}

pub(crate) async fn create_paper(ctx: &TestContext, exam_id: &str) -> String {
    let response =
        send_json(&ctx.app, Method::POST, "/api/v1/papers", Some(sample_paper_body(exam_id))).await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED, "create paper");
    read_json(response).await["id"].as_str().expect("paper id").to_string()
}

/// Draft key with the standard three answers: 1→A, 2→B, 3→C, two marks each.
pub(crate) async fn create_key(ctx: &TestContext, paper_id: &str) -> String {
    let response = send_json(
        &ctx.app,
        Method::POST,
        "/api/v1/keys",
        Some(json!({
            "paper_id": paper_id,
            "answers": {
                "1": { "answer": "A", "marks": 2.0 },
                "2": { "answer": "B", "marks": 2.0 },
                "3": { "answer": "C", "marks": 2.0 },
            }
        })),
    )
    .await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED, "create key");
    read_json(response).await["id"].as_str().expect("key id").to_string()
}

pub(crate) async fn lock_key(ctx: &TestContext, key_id: &str) {
    for step in ["verify", "approve", "lock"] {
        let body = (step == "approve").then(|| json!({ "approved_by": "chief-examiner" }));
        let response = send_json(
            &ctx.app,
            Method::POST,
            &format!("/api/v1/keys/{key_id}/{step}"),
            body,
        )
        .await;
        assert!(response.status().is_success(), "key {step} failed: {}", response.status());
    }
}

pub(crate) async fn ingest_sheet(ctx: &TestContext, exam_id: &str, roll_number: &str) -> String {
    let response = send_json(
        &ctx.app,
        Method::POST,
        "/api/v1/sheets",
        Some(json!({
            "exam_id": exam_id,
            "roll_number": roll_number,
            "image_hash": "ab".repeat(32),
        })),
    )
    .await;
    assert_eq!(response.status(), axum::http::StatusCode::CREATED, "ingest sheet");
    read_json(response).await["sheet_id"].as_str().expect("sheet id").to_string()
}

/// POST a bodyless stage endpoint and assert success.
pub(crate) async fn run_stage(ctx: &TestContext, sheet_id: &str, stage: &str) -> serde_json::Value {
    let response = send_json(
        &ctx.app,
        Method::POST,
        &format!("/api/v1/sheets/{sheet_id}/{stage}"),
        None,
    )
    .await;
    assert!(
        response.status().is_success(),
        "stage {stage} failed with {}",
        response.status()
    );
    read_json(response).await
}

pub(crate) async fn submit_bubbles(
    ctx: &TestContext,
    sheet_id: &str,
    entries: &[(&str, &str, f64)],
) {
    let mut body = serde_json::Map::new();
    for (question, answer, confidence) in entries {
        body.insert(
            (*question).to_string(),
            json!({ "answer": answer, "confidence": confidence }),
        );
    }
    let response = send_json(
        &ctx.app,
        Method::POST,
        &format!("/api/v1/sheets/{sheet_id}/bubbles"),
        Some(json!({ "entries": body })),
    )
    .await;
    assert!(response.status().is_success(), "submit bubbles: {}", response.status());
}

pub(crate) async fn submit_manual(ctx: &TestContext, sheet_id: &str, entries: &[(&str, &str)]) {
    let mut body = serde_json::Map::new();
    for (question, answer) in entries {
        body.insert((*question).to_string(), json!(answer));
    }
    let response = send_json(
        &ctx.app,
        Method::POST,
        &format!("/api/v1/sheets/{sheet_id}/manual"),
        Some(json!({ "entries": body, "entered_by": "operator-7" })),
    )
    .await;
    assert!(response.status().is_success(), "submit manual: {}", response.status());
}

pub(crate) async fn fetch_sheet(ctx: &TestContext, sheet_id: &str) -> serde_json::Value {
    let response =
        send_json(&ctx.app, Method::GET, &format!("/api/v1/sheets/{sheet_id}"), None).await;
    assert_eq!(response.status(), axum::http::StatusCode::OK, "fetch sheet");
    read_json(response).await
}

pub(crate) async fn fetch_intervention(ctx: &TestContext, id: &str) -> serde_json::Value {
    let response =
        send_json(&ctx.app, Method::GET, &format!("/api/v1/interventions/{id}"), None).await;
    assert_eq!(response.status(), axum::http::StatusCode::OK, "fetch intervention");
    read_json(response).await
}

fn signature_json(ctx: &TestContext, kind: SignerKind, message: &str) -> serde_json::Value {
    let signature = ctx.signers.sign(kind, message.as_bytes());
    json!({
        "signer_kind": kind.as_str(),
        "signer_key": signature.signer_key,
        "signature": signature.signature,
    })
}

pub(crate) fn three_signatures(ctx: &TestContext, result_hash: &str) -> Vec<serde_json::Value> {
    [SignerKind::AiVerifier, SignerKind::HumanVerifier, SignerKind::AdminController]
        .into_iter()
        .map(|kind| signature_json(ctx, kind, result_hash))
        .collect()
}

pub(crate) fn two_signatures(ctx: &TestContext, result_hash: &str) -> Vec<serde_json::Value> {
    [SignerKind::AiVerifier, SignerKind::HumanVerifier]
        .into_iter()
        .map(|kind| signature_json(ctx, kind, result_hash))
        .collect()
}
