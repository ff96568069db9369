use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which realtime endpoint flavour the relay connects to upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Azure,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Azure => "azure",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub realtime_url: String,
    pub realtime_model: String,
    pub azure_endpoint: Option<String>,
    pub azure_api_key: Option<String>,
    pub azure_deployment: String,
    pub azure_api_version: String,
    pub voice: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub tool_timeout: Duration,
    pub connect_timeout: Duration,
    pub configure_timeout: Duration,
    pub drain_grace: Duration,
    pub max_sessions: usize,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn millis_var(name: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
            ConfigError::InvalidValue(
                name.to_string(),
                format!("'{}' is not a number of milliseconds", raw),
            )
        }),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = var_or("REALTIME_PROVIDER", "openai");
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "azure" => Provider::Azure,
            other => {
                return Err(ConfigError::InvalidValue(
                    "REALTIME_PROVIDER".to_string(),
                    format!("'{}' is not one of: openai, azure", other),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let realtime_url = var_or("REALTIME_URL", "wss://api.openai.com/v1/realtime");
        let realtime_model = var_or("REALTIME_MODEL", "gpt-4o-realtime-preview");

        let azure_endpoint = std::env::var("AZURE_OPENAI_ENDPOINT").ok();
        let azure_api_key = std::env::var("AZURE_OPENAI_API_KEY").ok();
        let azure_deployment = var_or("AZURE_OPENAI_REALTIME_DEPLOYMENT", "gpt-4o-realtime-preview");
        let azure_api_version = var_or("AZURE_OPENAI_API_VERSION", "2024-10-01-preview");

        let voice = var_or("REALTIME_VOICE", "alloy");

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let tool_timeout = millis_var("TOOL_TIMEOUT_MS", 5_000)?;
        let connect_timeout = millis_var("CONNECT_TIMEOUT_MS", 30_000)?;
        let configure_timeout = millis_var("CONFIGURE_TIMEOUT_MS", 10_000)?;
        let drain_grace = millis_var("DRAIN_GRACE_MS", 5_000)?;

        let max_sessions_str = var_or("MAX_SESSIONS", "256");
        let max_sessions = match max_sessions_str.trim().parse::<usize>() {
            Ok(n) if n >= 1 => n,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "MAX_SESSIONS".to_string(),
                    format!("'{}' is not a positive integer", max_sessions_str),
                ));
            }
        };

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Azure => {
                if azure_endpoint.is_none() {
                    return Err(ConfigError::MissingVar(
                        "AZURE_OPENAI_ENDPOINT must be set for 'azure' provider".to_string(),
                    ));
                }
                if azure_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "AZURE_OPENAI_API_KEY must be set for 'azure' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            realtime_url,
            realtime_model,
            azure_endpoint,
            azure_api_key,
            azure_deployment,
            azure_api_version,
            voice,
            log_level,
            prompts_path,
            tool_timeout,
            connect_timeout,
            configure_timeout,
            drain_grace,
            max_sessions,
        })
    }
}
