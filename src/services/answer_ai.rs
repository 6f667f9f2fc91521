use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::core::config::Settings;
use crate::services::adapter::{build_client, call_with_retry, AdapterError};

/// One question put to the independent solver model. Question content is
/// addressed through the paper's content hash; the solver service resolves
/// the text itself.
#[derive(Debug, Clone)]
pub(crate) struct SolveRequest<'a> {
    pub(crate) paper_hash: &'a str,
    pub(crate) question_number: u32,
    pub(crate) subject: &'a str,
}

#[derive(Debug, Clone)]
pub(crate) struct SolverAnswer {
    pub(crate) answer: String,
    pub(crate) confidence: f64,
    pub(crate) explanation: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct VerifyRequest<'a> {
    pub(crate) paper_hash: &'a str,
    pub(crate) question_number: u32,
    pub(crate) proposed_answer: &'a str,
}

#[derive(Debug, Clone)]
pub(crate) struct KeyVerification {
    pub(crate) agrees: bool,
    pub(crate) confidence: f64,
    pub(crate) notes: Option<String>,
}

/// Remote LLM service answering questions independently of the bubble
/// reading and double-checking proposed answer keys.
#[async_trait]
pub(crate) trait SolverService: Send + Sync {
    async fn solve_question(&self, request: SolveRequest<'_>)
        -> Result<SolverAnswer, AdapterError>;

    async fn verify_answer_key(
        &self,
        request: VerifyRequest<'_>,
    ) -> Result<KeyVerification, AdapterError>;
}

#[derive(Debug, Clone)]
pub(crate) struct HttpSolverService {
    client: Client,
    base_url: String,
    settings: crate::core::config::AdapterSettings,
}

#[derive(Debug, Deserialize)]
struct SolveBody {
    answer: String,
    confidence: f64,
    #[serde(default)]
    explanation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    agrees: bool,
    confidence: f64,
    #[serde(default)]
    notes: Option<String>,
}

impl HttpSolverService {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let adapters = settings.adapters();
        Ok(Self {
            client: build_client(adapters)?,
            base_url: adapters.solver_base_url.trim_end_matches('/').to_string(),
            settings: adapters.clone(),
        })
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| AdapterError::Permanent(format!("malformed response: {err}")))
    }
}

#[async_trait]
impl SolverService for HttpSolverService {
    async fn solve_question(
        &self,
        request: SolveRequest<'_>,
    ) -> Result<SolverAnswer, AdapterError> {
        let body: SolveBody = call_with_retry("solve_question", &self.settings, || {
            self.post_json(
                "/solve",
                json!({
                    "paper_hash": request.paper_hash,
                    "question_number": request.question_number,
                    "subject": request.subject,
                }),
            )
        })
        .await?;

        if body.answer.trim().is_empty() {
            return Err(AdapterError::Permanent("solver returned an empty answer".to_string()));
        }

        Ok(SolverAnswer {
            answer: body.answer,
            confidence: body.confidence,
            explanation: body.explanation,
        })
    }

    async fn verify_answer_key(
        &self,
        request: VerifyRequest<'_>,
    ) -> Result<KeyVerification, AdapterError> {
        let body: VerifyBody = call_with_retry("verify_answer_key", &self.settings, || {
            self.post_json(
                "/verify-key",
                json!({
                    "paper_hash": request.paper_hash,
                    "question_number": request.question_number,
                    "proposed_answer": request.proposed_answer,
                }),
            )
        })
        .await?;

        Ok(KeyVerification { agrees: body.agrees, confidence: body.confidence, notes: body.notes })
    }
}
