use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::config::{AdapterSettings, Settings};

/// Failure classes of the remote vision and solver services. `Transient`
/// is retried internally; the other two surface to the orchestrator for
/// stage-failure handling.
#[derive(Debug, thiserror::Error)]
pub(crate) enum AdapterError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
    #[error("upstream request timed out")]
    Timeout,
}

impl AdapterError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AdapterError::Timeout;
        }
        if err.is_connect() || err.is_request() {
            return AdapterError::Transient(err.to_string());
        }
        AdapterError::Permanent(err.to_string())
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            AdapterError::Transient(format!("status {status}: {body}"))
        } else {
            AdapterError::Permanent(format!("status {status}: {body}"))
        }
    }
}

pub(crate) fn build_client(settings: &AdapterSettings) -> anyhow::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(settings.timeout_seconds))
        .build()
        .map_err(|err| anyhow::anyhow!("Failed to build adapter HTTP client: {err}"))
}

/// Run `operation` with exponential backoff on `Transient` failures, capped
/// by `max_attempts` and the total retry budget. `Permanent` and `Timeout`
/// results are returned to the caller unchanged; a budget-exhausted
/// `Transient` is returned as the last observed error.
pub(crate) async fn call_with_retry<T, F, Fut>(
    adapter: &'static str,
    settings: &AdapterSettings,
    mut operation: F,
) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let started = Instant::now();
    let budget = Duration::from_secs(settings.total_budget_seconds);
    let mut last_error = AdapterError::Transient("no attempts made".to_string());

    for attempt in 0..settings.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(AdapterError::Transient(message)) => {
                tracing::warn!(adapter, attempt, error = %message, "Transient adapter failure");
                metrics::counter!("adapter_transient_failures_total", "adapter" => adapter)
                    .increment(1);
                last_error = AdapterError::Transient(message);
            }
            Err(other) => return Err(other),
        }

        if attempt + 1 >= settings.max_attempts {
            break;
        }
        let backoff = Duration::from_secs(2_u64.pow(attempt));
        if started.elapsed() + backoff >= budget {
            tracing::warn!(adapter, "Adapter retry budget exhausted");
            break;
        }
        tokio::time::sleep(backoff).await;
    }

    Err(last_error)
}

/// Token-bucket rate limiter; an empty bucket makes the caller wait for a
/// token rather than failing the stage.
pub(crate) struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate_per_second: u32) -> Self {
        let capacity = f64::from(rate_per_second.max(1));
        Self {
            capacity,
            refill_per_second: capacity,
            state: Mutex::new(BucketState { tokens: capacity, refilled_at: Instant::now() }),
        }
    }

    pub(crate) async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.refilled_at.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
                state.refilled_at = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// One bucket per adapter endpoint, shared across workers.
pub(crate) struct AdapterLimiter {
    quality: TokenBucket,
    reconstruct: TokenBucket,
    solve: TokenBucket,
    verify: TokenBucket,
}

impl AdapterLimiter {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let rate = settings.adapters().rate_limit_per_second;
        Self {
            quality: TokenBucket::new(rate),
            reconstruct: TokenBucket::new(rate),
            solve: TokenBucket::new(rate),
            verify: TokenBucket::new(rate),
        }
    }

    pub(crate) fn quality(&self) -> &TokenBucket {
        &self.quality
    }

    pub(crate) fn reconstruct(&self) -> &TokenBucket {
        &self.reconstruct
    }

    pub(crate) fn solve(&self) -> &TokenBucket {
        &self.solve
    }

    pub(crate) fn verify(&self) -> &TokenBucket {
        &self.verify
    }
}
