use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::core::config::{QualitySettings, Settings};
use crate::db::models::Damage;
use crate::db::types::QualityDecision;
use crate::services::adapter::{build_client, call_with_retry, AdapterError};

/// Raw quality verdict from the vision service; the pipeline turns the
/// score into a decision via [`decide_quality`].
#[derive(Debug, Clone)]
pub(crate) struct QualityAssessment {
    pub(crate) score: f64,
    pub(crate) damages: Vec<Damage>,
    pub(crate) recoverable: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ReconstructionOutcome {
    pub(crate) reconstructed_hash: String,
    pub(crate) confidence: f64,
}

/// Remote damage-detection and reconstruction service. Images are addressed
/// by content hash; the service owns the image store.
#[async_trait]
pub(crate) trait VisionService: Send + Sync {
    async fn assess_quality(&self, image_hash: &str) -> Result<QualityAssessment, AdapterError>;

    async fn reconstruct(
        &self,
        image_hash: &str,
        expected_rows: u32,
        expected_cols: u32,
    ) -> Result<ReconstructionOutcome, AdapterError>;
}

/// Map a quality score to the pipeline decision. Unrecoverable damage is
/// always a human call; recoverable sheets proceed, reconstruct, or get
/// rejected along the configured thresholds.
pub(crate) fn decide_quality(
    assessment: &QualityAssessment,
    settings: &QualitySettings,
) -> QualityDecision {
    if !assessment.recoverable {
        return QualityDecision::HumanReview;
    }
    if assessment.score >= settings.proceed_threshold {
        QualityDecision::Proceed
    } else if assessment.score >= settings.reconstruct_threshold {
        QualityDecision::Reconstruct
    } else {
        QualityDecision::Reject
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HttpVisionService {
    client: Client,
    base_url: String,
    settings: crate::core::config::AdapterSettings,
}

#[derive(Debug, Deserialize)]
struct QualityBody {
    score: f64,
    #[serde(default)]
    damages: Vec<Damage>,
    #[serde(default = "default_recoverable")]
    recoverable: bool,
}

#[derive(Debug, Deserialize)]
struct ReconstructBody {
    reconstructed_hash: String,
    confidence: f64,
}

fn default_recoverable() -> bool {
    true
}

impl HttpVisionService {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let adapters = settings.adapters();
        Ok(Self {
            client: build_client(adapters)?,
            base_url: adapters.vision_base_url.trim_end_matches('/').to_string(),
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
impl VisionService for HttpVisionService {
    async fn assess_quality(&self, image_hash: &str) -> Result<QualityAssessment, AdapterError> {
        let body: QualityBody = call_with_retry("assess_quality", &self.settings, || {
            self.post_json("/quality/assess", json!({ "image_hash": image_hash }))
        })
        .await?;

        if !(0.0..=1.0).contains(&body.score) {
            return Err(AdapterError::Permanent(format!(
                "quality score {} outside [0, 1]",
                body.score
            )));
        }

        Ok(QualityAssessment {
            score: body.score,
            damages: body.damages,
            recoverable: body.recoverable,
        })
    }

    async fn reconstruct(
        &self,
        image_hash: &str,
        expected_rows: u32,
        expected_cols: u32,
    ) -> Result<ReconstructionOutcome, AdapterError> {
        let body: ReconstructBody = call_with_retry("reconstruct", &self.settings, || {
            self.post_json(
                "/reconstruct",
                json!({
                    "image_hash": image_hash,
                    "expected_rows": expected_rows,
                    "expected_cols": expected_cols,
                }),
            )
        })
        .await?;

        Ok(ReconstructionOutcome {
            reconstructed_hash: body.reconstructed_hash,
            confidence: body.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::DamageSeverity;

    fn thresholds() -> QualitySettings {
        QualitySettings { proceed_threshold: 0.7, reconstruct_threshold: 0.5 }
    }

    fn assessment(score: f64, recoverable: bool) -> QualityAssessment {
        QualityAssessment {
            score,
            damages: vec![Damage { kind: "tear".to_string(), severity: DamageSeverity::Minor }],
            recoverable,
        }
    }

    #[test]
    fn clean_sheets_proceed() {
        assert_eq!(decide_quality(&assessment(0.92, true), &thresholds()), QualityDecision::Proceed);
        assert_eq!(decide_quality(&assessment(0.7, true), &thresholds()), QualityDecision::Proceed);
    }

    #[test]
    fn middling_scores_reconstruct() {
        assert_eq!(
            decide_quality(&assessment(0.6, true), &thresholds()),
            QualityDecision::Reconstruct
        );
        assert_eq!(
            decide_quality(&assessment(0.5, true), &thresholds()),
            QualityDecision::Reconstruct
        );
    }

    #[test]
    fn poor_scores_reject() {
        assert_eq!(decide_quality(&assessment(0.2, true), &thresholds()), QualityDecision::Reject);
    }

    #[test]
    fn unrecoverable_damage_needs_a_human() {
        assert_eq!(
            decide_quality(&assessment(0.95, false), &thresholds()),
            QualityDecision::HumanReview
        );
    }
}
