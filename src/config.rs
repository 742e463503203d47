//! Configuration management.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. Default LLM model. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `MAX_ITERATIONS` - Optional. Maximum conversation loop iterations. Defaults to `8`.
//! - `MAX_RETRIES` - Optional. Maximum transient retries per run. Defaults to `3`.
//! - `RETRY_BASE_MS` - Optional. Base backoff delay in milliseconds. Defaults to `1000`.
//! - `MESSAGE_WINDOW` - Optional. Rolling message window size. Defaults to `24`.
//! - `QUEUE_TICK_MS` - Optional. Job queue worker tick interval. Defaults to `1000`.
//! - `DELEGATION_TIMEOUT_MS` - Optional. Default per-agent delegation timeout. Defaults to `30000`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Default LLM model identifier (OpenRouter format)
    pub default_model: String,

    /// Maximum iterations for the conversation loop
    pub max_iterations: usize,

    /// Maximum transient retries per run
    pub max_retries: u32,

    /// Base backoff delay in milliseconds (attempt k sleeps base * 2^k)
    pub retry_base_ms: u64,

    /// Rolling message window: system prompt + last N turns
    pub message_window: usize,

    /// Queue worker tick interval in milliseconds
    pub queue_tick_ms: u64,

    /// Default per-agent delegation timeout in milliseconds
    pub delegation_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        Ok(Self {
            api_key,
            default_model,
            max_iterations: parse_env("MAX_ITERATIONS", 8)?,
            max_retries: parse_env("MAX_RETRIES", 3)?,
            retry_base_ms: parse_env("RETRY_BASE_MS", 1000)?,
            message_window: parse_env("MESSAGE_WINDOW", 24)?,
            queue_tick_ms: parse_env("QUEUE_TICK_MS", 1000)?,
            delegation_timeout_ms: parse_env("DELEGATION_TIMEOUT_MS", 30_000)?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            default_model,
            max_iterations: 8,
            max_retries: 3,
            retry_base_ms: 1000,
            message_window: 24,
            queue_tick_ms: 1000,
            delegation_timeout_ms: 30_000,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
