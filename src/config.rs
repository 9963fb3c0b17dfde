//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Default completion keyword a client types to submit the interview.
pub const DEFAULT_COMPLETION_KEYWORD: &str = "送信";

/// Service configuration, built once at startup and passed into constructors.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Frontend base URL used to build shareable link URLs.
    pub front_base_url: String,
    /// Downstream automation webhook. `None` disables dispatch.
    pub webhook_url: Option<String>,
    /// Upper bound for a single webhook delivery.
    pub webhook_timeout: Duration,
    /// Text generation settings.
    pub generation: GenerationConfig,
    /// Trimmed user input that finalizes a session.
    pub completion_keyword: String,
    /// Default lifetime for issued links. `None` means links never expire.
    pub link_ttl: Option<TimeDelta>,
    /// Directory for the rolling log file.
    pub log_dir: PathBuf,
}

/// Settings for the external text-generation service.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// API key. Without one, every generation is reported unavailable.
    pub api_key: Option<SecretString>,
    pub model: String,
    /// OpenAI-compatible API root, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/pulss-intake.db"),
            port: 8000,
            front_base_url: "http://localhost:5173".to_string(),
            webhook_url: None,
            webhook_timeout: Duration::from_secs(5),
            generation: GenerationConfig::default(),
            completion_keyword: DEFAULT_COMPLETION_KEYWORD.to_string(),
            link_ttl: None,
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl IntakeConfig {
    /// Build configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let generation = GenerationConfig {
            api_key: get("OPENAI_API_KEY").map(SecretString::from),
            model: get("PULSS_OPENAI_MODEL").unwrap_or(defaults.generation.model),
            base_url: get("PULSS_OPENAI_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.generation.base_url),
            timeout: match get("PULSS_GENERATION_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(parse_value("PULSS_GENERATION_TIMEOUT_SECS", &v)?),
                None => defaults.generation.timeout,
            },
        };

        let link_ttl = match get("PULSS_LINK_TTL_HOURS") {
            Some(v) => {
                let hours: i64 = parse_value("PULSS_LINK_TTL_HOURS", &v)?;
                let ttl = TimeDelta::try_hours(hours).filter(|_| hours > 0).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: "PULSS_LINK_TTL_HOURS".to_string(),
                        message: "must be a positive number of hours".to_string(),
                    }
                })?;
                Some(ttl)
            }
            None => None,
        };

        Ok(Self {
            db_path: get("PULSS_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            port: match get("PULSS_PORT") {
                Some(v) => parse_value("PULSS_PORT", &v)?,
                None => defaults.port,
            },
            front_base_url: get("PULSS_FRONT_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.front_base_url),
            webhook_url: get("PULSS_N8N_TOUCHPOINT_WEBHOOK_URL"),
            webhook_timeout: match get("PULSS_WEBHOOK_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(parse_value("PULSS_WEBHOOK_TIMEOUT_SECS", &v)?),
                None => defaults.webhook_timeout,
            },
            generation,
            completion_keyword: get("PULSS_COMPLETION_KEYWORD")
                .unwrap_or(defaults.completion_keyword),
            link_ttl,
            log_dir: get("PULSS_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
