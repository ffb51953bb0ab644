//! Session Controller configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8090";

/// Default SC instance ID prefix.
pub const DEFAULT_SC_ID_PREFIX: &str = "sc";

/// Default attempts for a unit of work that keeps losing version checks.
pub const DEFAULT_COMMIT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound between two balance checks for one occupancy (15 minutes).
pub const DEFAULT_BALANCE_CHECK_MAX_INTERVAL_SECONDS: u64 = 900;

/// Delay before the first recording-health check after accept.
pub const DEFAULT_RECORDING_CHECK_DELAY_SECONDS: u64 = 60;

/// Shortest session a participant must be able to afford on accept.
pub const DEFAULT_MIN_SESSION_SECONDS: i64 = 60;

/// Minutes of balance (at the discounted rate) required to join an online waitlist.
pub const DEFAULT_MIN_BALANCE_MINUTES: i64 = 5;

/// Timeout for calls to the recording service and task dispatcher.
pub const DEFAULT_EXTERNAL_TIMEOUT_SECONDS: u64 = 10;

/// Default storage bucket for recordings.
pub const DEFAULT_RECORDING_STORAGE_BUCKET: &str = "session-recordings";

/// Aggregate store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    /// Process-local store; state is lost on restart.
    Memory,
}

/// Session Controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (aggregates, sequences and realtime events).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: Option<SecretString>,

    /// HTTP bind address (default: "0.0.0.0:8090").
    pub bind_address: String,

    /// Unique identifier for this SC instance.
    pub sc_id: String,

    pub store_backend: StoreBackend,

    /// Base URL of the recording service.
    pub recording_api_url: String,

    /// API key for the recording service.
    pub recording_api_key: SecretString,

    pub recording_storage_bucket: String,

    /// Base URL of the delayed task dispatcher.
    pub dispatcher_url: String,

    pub commit_max_attempts: u32,

    pub balance_check_max_interval_seconds: u64,

    pub recording_check_delay_seconds: u64,

    pub min_session_seconds: i64,

    pub min_balance_minutes: i64,

    pub external_timeout_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("bind_address", &self.bind_address)
            .field("sc_id", &self.sc_id)
            .field("store_backend", &self.store_backend)
            .field("recording_api_url", &self.recording_api_url)
            .field("recording_api_key", &"[REDACTED]")
            .field("recording_storage_bucket", &self.recording_storage_bucket)
            .field("dispatcher_url", &self.dispatcher_url)
            .field("commit_max_attempts", &self.commit_max_attempts)
            .field(
                "balance_check_max_interval_seconds",
                &self.balance_check_max_interval_seconds,
            )
            .field(
                "recording_check_delay_seconds",
                &self.recording_check_delay_seconds,
            )
            .field("min_session_seconds", &self.min_session_seconds)
            .field("min_balance_minutes", &self.min_balance_minutes)
            .field("external_timeout_seconds", &self.external_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let store_backend = match vars.get("SC_STORE_BACKEND").map(String::as_str) {
            None | Some("redis") => StoreBackend::Redis,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "SC_STORE_BACKEND must be 'redis' or 'memory', got '{other}'"
                )))
            }
        };

        let redis_url = vars.get("REDIS_URL").cloned().map(SecretString::from);
        if store_backend == StoreBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::MissingEnvVar("REDIS_URL".to_string()));
        }

        let recording_api_url = vars
            .get("RECORDING_API_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("RECORDING_API_URL".to_string()))?
            .clone();

        let recording_api_key = SecretString::from(
            vars.get("RECORDING_API_KEY")
                .ok_or_else(|| ConfigError::MissingEnvVar("RECORDING_API_KEY".to_string()))?
                .clone(),
        );

        let dispatcher_url = vars
            .get("DISPATCHER_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("DISPATCHER_URL".to_string()))?
            .clone();

        let bind_address = vars
            .get("SC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let recording_storage_bucket = vars
            .get("RECORDING_STORAGE_BUCKET")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RECORDING_STORAGE_BUCKET.to_string());

        let commit_max_attempts: u32 = parse_or(
            vars,
            "SC_COMMIT_MAX_ATTEMPTS",
            DEFAULT_COMMIT_MAX_ATTEMPTS,
        )?;
        if commit_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_COMMIT_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let balance_check_max_interval_seconds = parse_or(
            vars,
            "SC_BALANCE_CHECK_MAX_INTERVAL_SECONDS",
            DEFAULT_BALANCE_CHECK_MAX_INTERVAL_SECONDS,
        )?;

        let recording_check_delay_seconds = parse_or(
            vars,
            "SC_RECORDING_CHECK_DELAY_SECONDS",
            DEFAULT_RECORDING_CHECK_DELAY_SECONDS,
        )?;

        let min_session_seconds =
            parse_or(vars, "SC_MIN_SESSION_SECONDS", DEFAULT_MIN_SESSION_SECONDS)?;

        let min_balance_minutes =
            parse_or(vars, "SC_MIN_BALANCE_MINUTES", DEFAULT_MIN_BALANCE_MINUTES)?;

        let external_timeout_seconds = parse_or(
            vars,
            "SC_EXTERNAL_TIMEOUT_SECONDS",
            DEFAULT_EXTERNAL_TIMEOUT_SECONDS,
        )?;

        let sc_id = vars.get("SC_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SC_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            bind_address,
            sc_id,
            store_backend,
            recording_api_url,
            recording_api_key,
            recording_storage_bucket,
            dispatcher_url,
            commit_max_attempts,
            balance_check_max_interval_seconds,
            recording_check_delay_seconds,
            min_session_seconds,
            min_balance_minutes,
            external_timeout_seconds,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name} is not a valid number: '{raw}'"))),
        None => Ok(default),
    }
}
