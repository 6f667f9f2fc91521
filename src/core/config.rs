use std::env;
use std::thread;

use thiserror::Error;

const DEFAULT_CORS_ORIGINS: &[&str] =
    &["http://localhost:5173", "http://localhost:3000", "http://localhost:8080"];

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    server: ServerSettings,
    runtime: RuntimeSettings,
    api: ApiSettings,
    cors: CorsSettings,
    database: DatabaseSettings,
    ledger: LedgerSettings,
    signers: SignerSettings,
    adapters: AdapterSettings,
    orchestrator: OrchestratorSettings,
    quality: QualitySettings,
    reconciliation: ReconciliationSettings,
    scoring: ScoringSettings,
    telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    host: ServerHost,
    port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiSettings {
    pub(crate) project_name: String,
    pub(crate) version: String,
    pub(crate) api_v1_str: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) database_url: Option<String>,
    pub(crate) sqlite_path: String,
}

#[derive(Debug, Clone)]
pub(crate) struct LedgerSettings {
    pub(crate) path: String,
    pub(crate) difficulty_hex_zeros: u8,
    pub(crate) mining_budget: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct SignerSettings {
    pub(crate) registry_path: String,
}

#[derive(Debug, Clone)]
pub(crate) struct AdapterSettings {
    pub(crate) vision_base_url: String,
    pub(crate) solver_base_url: String,
    pub(crate) timeout_seconds: u64,
    pub(crate) max_attempts: u32,
    pub(crate) total_budget_seconds: u64,
    pub(crate) rate_limit_per_second: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct OrchestratorSettings {
    pub(crate) workers: usize,
    pub(crate) sheet_deadline_seconds: u64,
    pub(crate) ai_solve_policy: AiSolvePolicy,
}

#[derive(Debug, Clone)]
pub(crate) struct QualitySettings {
    pub(crate) proceed_threshold: f64,
    pub(crate) reconstruct_threshold: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct ReconciliationSettings {
    pub(crate) low_confidence_threshold: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct ScoringSettings {
    pub(crate) marks_tally_tolerance: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

/// When the orchestrator solicits the AI solver for a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AiSolvePolicy {
    /// Solve every question on the sheet.
    All,
    /// Solve only questions whose bubble reading disagrees with the locked key.
    Disputed,
    /// Never call the solver; reconciliation runs on bubble + manual alone.
    Never,
}

impl AiSolvePolicy {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            AiSolvePolicy::All => "all",
            AiSolvePolicy::Disputed => "disputed",
            AiSolvePolicy::Never => "never",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Test => "test",
        }
    }

    fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required setting {0}")]
    MissingRequired(&'static str),
}

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("OMRLEDGER_HOST", "0.0.0.0");
        let port = env_or_default("OMRLEDGER_PORT", "8000");

        let environment = parse_environment(
            env_optional("OMRLEDGER_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("OMRLEDGER_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "OMR Ledger API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let database_url = env_optional("DATABASE_URL");
        let sqlite_path = env_or_default("SQLITE_PATH", "data/omrledger.db");

        let ledger_path = env_or_default("LEDGER_PATH", "data/ledger.chain");
        let difficulty_hex_zeros = parse_u8(
            "LEDGER_DIFFICULTY_HEX_ZEROS",
            env_or_default("LEDGER_DIFFICULTY_HEX_ZEROS", "0"),
        )?;
        let mining_budget =
            parse_u64("LEDGER_MINING_BUDGET", env_or_default("LEDGER_MINING_BUDGET", "16777216"))?;

        let registry_path = env_or_default("SIGNERS_REGISTRY_PATH", "data/signers.json");

        let vision_base_url = env_or_default("VISION_BASE_URL", "http://localhost:9100");
        let solver_base_url = env_or_default("SOLVER_BASE_URL", "http://localhost:9200");
        let adapter_timeout_seconds =
            parse_u64("ADAPTER_TIMEOUT_SECONDS", env_or_default("ADAPTER_TIMEOUT_SECONDS", "30"))?;
        let adapter_max_attempts =
            parse_u32("ADAPTER_MAX_ATTEMPTS", env_or_default("ADAPTER_MAX_ATTEMPTS", "3"))?;
        let adapter_total_budget_seconds = parse_u64(
            "ADAPTER_TOTAL_BUDGET_SECONDS",
            env_or_default("ADAPTER_TOTAL_BUDGET_SECONDS", "90"),
        )?;
        let rate_limit_per_second = parse_u32(
            "ADAPTER_RATE_LIMIT_PER_SECOND",
            env_or_default("ADAPTER_RATE_LIMIT_PER_SECOND", "10"),
        )?;

        let workers = match env_optional("ORCHESTRATOR_WORKERS") {
            Some(value) => parse_usize("ORCHESTRATOR_WORKERS", value)?,
            None => default_worker_count(),
        };
        let sheet_deadline_seconds =
            parse_u64("SHEET_DEADLINE_SECONDS", env_or_default("SHEET_DEADLINE_SECONDS", "600"))?;
        let ai_solve_policy = parse_ai_solve_policy(env_or_default("AI_SOLVE_POLICY", "all"))?;

        let proceed_threshold = parse_f64(
            "QUALITY_PROCEED_THRESHOLD",
            env_or_default("QUALITY_PROCEED_THRESHOLD", "0.7"),
        )?;
        let reconstruct_threshold = parse_f64(
            "QUALITY_RECONSTRUCT_THRESHOLD",
            env_or_default("QUALITY_RECONSTRUCT_THRESHOLD", "0.5"),
        )?;

        let low_confidence_threshold = parse_f64(
            "LOW_CONFIDENCE_THRESHOLD",
            env_or_default("LOW_CONFIDENCE_THRESHOLD", "0.7"),
        )?;
        let marks_tally_tolerance =
            parse_f64("MARKS_TALLY_TOLERANCE", env_or_default("MARKS_TALLY_TOLERANCE", "0.01"))?;

        let log_level = env_or_default("OMRLEDGER_LOG_LEVEL", "info");
        let json =
            env_optional("OMRLEDGER_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings { database_url, sqlite_path },
            ledger: LedgerSettings { path: ledger_path, difficulty_hex_zeros, mining_budget },
            signers: SignerSettings { registry_path },
            adapters: AdapterSettings {
                vision_base_url,
                solver_base_url,
                timeout_seconds: adapter_timeout_seconds,
                max_attempts: adapter_max_attempts,
                total_budget_seconds: adapter_total_budget_seconds,
                rate_limit_per_second,
            },
            orchestrator: OrchestratorSettings { workers, sheet_deadline_seconds, ai_solve_policy },
            quality: QualitySettings { proceed_threshold, reconstruct_threshold },
            reconciliation: ReconciliationSettings { low_confidence_threshold },
            scoring: ScoringSettings { marks_tally_tolerance },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn ledger(&self) -> &LedgerSettings {
        &self.ledger
    }

    pub(crate) fn signers(&self) -> &SignerSettings {
        &self.signers
    }

    pub(crate) fn adapters(&self) -> &AdapterSettings {
        &self.adapters
    }

    pub(crate) fn orchestrator(&self) -> &OrchestratorSettings {
        &self.orchestrator
    }

    pub(crate) fn quality(&self) -> &QualitySettings {
        &self.quality
    }

    pub(crate) fn reconciliation(&self) -> &ReconciliationSettings {
        &self.reconciliation
    }

    pub(crate) fn scoring(&self) -> &ScoringSettings {
        &self.scoring
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.difficulty_hex_zeros > 8 {
            return Err(ConfigError::InvalidValue {
                field: "LEDGER_DIFFICULTY_HEX_ZEROS",
                value: self.ledger.difficulty_hex_zeros.to_string(),
            });
        }
        if self.orchestrator.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ORCHESTRATOR_WORKERS",
                value: "0".to_string(),
            });
        }
        for (field, value) in [
            ("QUALITY_PROCEED_THRESHOLD", self.quality.proceed_threshold),
            ("QUALITY_RECONSTRUCT_THRESHOLD", self.quality.reconstruct_threshold),
            ("LOW_CONFIDENCE_THRESHOLD", self.reconciliation.low_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue { field, value: value.to_string() });
            }
        }
        if self.quality.reconstruct_threshold > self.quality.proceed_threshold {
            return Err(ConfigError::InvalidValue {
                field: "QUALITY_RECONSTRUCT_THRESHOLD",
                value: self.quality.reconstruct_threshold.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        // Strict/production deployments must name their durable paths explicitly.
        if env_optional("LEDGER_PATH").is_none() {
            return Err(ConfigError::MissingRequired("LEDGER_PATH"));
        }
        if env_optional("SIGNERS_REGISTRY_PATH").is_none() {
            return Err(ConfigError::MissingRequired("SIGNERS_REGISTRY_PATH"));
        }
        if self.database.database_url.is_none() && env_optional("SQLITE_PATH").is_none() {
            return Err(ConfigError::MissingRequired("DATABASE_URL"));
        }

        Ok(())
    }
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }
        format!("sqlite://{}?mode=rwc", self.sqlite_path)
    }
}

impl ServerHost {
    fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }
        Ok(Self(value))
    }
}

impl ServerPort {
    fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }
        Ok(Self(parsed))
    }
}

fn default_worker_count() -> usize {
    let cores = thread::available_parallelism().map(|value| value.get()).unwrap_or(1);
    cores * 4
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_u8(field: &'static str, value: String) -> Result<u8, ConfigError> {
    value.parse::<u8>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_usize(field: &'static str, value: String) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_f64(field: &'static str, value: String) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_cors_origins(value: Option<String>) -> Result<Vec<String>, ConfigError> {
    let Some(raw) = value else {
        return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
    };

    if raw.trim().is_empty() {
        return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
    }

    if raw.trim_start().starts_with('[') {
        let parsed: Vec<String> =
            serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidCors(raw.clone()))?;
        if parsed.is_empty() {
            return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
        }
        return Ok(parsed);
    }

    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if items.is_empty() {
        return Ok(DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect());
    }

    Ok(items)
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|val| val.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

fn parse_ai_solve_policy(value: String) -> Result<AiSolvePolicy, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "all" | "always" => Ok(AiSolvePolicy::All),
        "disputed" => Ok(AiSolvePolicy::Disputed),
        "never" | "off" => Ok(AiSolvePolicy::Never),
        _ => Err(ConfigError::InvalidValue { field: "AI_SOLVE_POLICY", value }),
    }
}
