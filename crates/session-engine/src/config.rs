//! Session engine configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output. Quality constants and timeouts are
//! injected here, never computed by the engine.

use crate::quality::{QualityLevel, DEFAULT_QUALITY_WINDOW};

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default lead time before token expiry at which renewal runs.
pub const DEFAULT_TOKEN_REFRESH_LEAD: Duration = Duration::from_secs(300);

/// Default retry interval after a failed renewal. Kept well under a
/// minute so a transient failure never silences a session for a full
/// TTL cycle.
pub const DEFAULT_TOKEN_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on a single mode-transition procedure.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between recovery attempts while degraded.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(15);

/// Default damped level at or beyond which auto-degrade fires.
pub const DEFAULT_DEGRADE_THRESHOLD: QualityLevel = QualityLevel::Poor;

/// Default bound on the retained transition history.
pub const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Session engine configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct EngineConfig {
    /// Channel to join on the transport.
    pub channel: String,

    /// Identity presented to the transport and the credential service.
    pub identity: String,

    /// Credential service URL for token fetch/renewal.
    pub credential_endpoint: String,

    /// API key presented to the credential service.
    /// Protected by `SecretString` to prevent accidental logging.
    pub credential_api_key: SecretString,

    /// Renew the token this long before it expires (default: 5 minutes).
    pub token_refresh_lead: Duration,

    /// Retry interval after a failed renewal (default: 30 seconds).
    pub token_retry_interval: Duration,

    /// Bound on a single mode-transition procedure (default: 10 seconds).
    pub fallback_timeout: Duration,

    /// Interval between recovery attempts while degraded (default: 15 seconds).
    pub recovery_delay: Duration,

    /// Rolling window length for quality damping (default: 5 samples).
    pub quality_window: usize,

    /// Damped level at or beyond which auto-degrade fires (default: poor).
    pub degrade_threshold: QualityLevel,

    /// Whether the reduced-video fallback mode is available.
    pub enable_reduced_video: bool,

    /// Whether the audio-only fallback mode is available.
    pub enable_audio_only: bool,

    /// Whether the chat-only fallback mode is available.
    pub enable_chat_fallback: bool,

    /// Bound on the retained transition history (default: 32 records).
    pub history_limit: usize,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("channel", &self.channel)
            .field("identity", &self.identity)
            .field("credential_endpoint", &self.credential_endpoint)
            .field("credential_api_key", &"[REDACTED]")
            .field("token_refresh_lead", &self.token_refresh_lead)
            .field("token_retry_interval", &self.token_retry_interval)
            .field("fallback_timeout", &self.fallback_timeout)
            .field("recovery_delay", &self.recovery_delay)
            .field("quality_window", &self.quality_window)
            .field("degrade_threshold", &self.degrade_threshold)
            .field("enable_reduced_video", &self.enable_reduced_video)
            .field("enable_audio_only", &self.enable_audio_only)
            .field("enable_chat_fallback", &self.enable_chat_fallback)
            .field("history_limit", &self.history_limit)
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

fn parse_secs(
    vars: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}

fn parse_bool(vars: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match vars.get(key).map(String::as_str) {
        Some("0" | "false" | "no" | "off") => false,
        Some(_) => true,
        None => default,
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let channel = vars
            .get("SESSION_CHANNEL")
            .ok_or_else(|| ConfigError::MissingEnvVar("SESSION_CHANNEL".to_string()))?
            .clone();

        let identity = vars
            .get("SESSION_IDENTITY")
            .ok_or_else(|| ConfigError::MissingEnvVar("SESSION_IDENTITY".to_string()))?
            .clone();

        let credential_endpoint = vars
            .get("SESSION_CREDENTIAL_ENDPOINT")
            .ok_or_else(|| {
                ConfigError::MissingEnvVar("SESSION_CREDENTIAL_ENDPOINT".to_string())
            })?
            .clone();

        let credential_api_key = SecretString::from(
            vars.get("SESSION_CREDENTIAL_API_KEY")
                .ok_or_else(|| {
                    ConfigError::MissingEnvVar("SESSION_CREDENTIAL_API_KEY".to_string())
                })?
                .clone(),
        );

        let token_refresh_lead = parse_secs(
            vars,
            "SESSION_TOKEN_REFRESH_LEAD_SECONDS",
            DEFAULT_TOKEN_REFRESH_LEAD,
        )?;
        let token_retry_interval = parse_secs(
            vars,
            "SESSION_TOKEN_RETRY_SECONDS",
            DEFAULT_TOKEN_RETRY_INTERVAL,
        )?;
        let fallback_timeout = parse_secs(
            vars,
            "SESSION_FALLBACK_TIMEOUT_SECONDS",
            DEFAULT_FALLBACK_TIMEOUT,
        )?;
        let recovery_delay =
            parse_secs(vars, "SESSION_RECOVERY_DELAY_SECONDS", DEFAULT_RECOVERY_DELAY)?;

        let quality_window = match vars.get("SESSION_QUALITY_WINDOW") {
            None => DEFAULT_QUALITY_WINDOW,
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ConfigError::InvalidValue(format!("SESSION_QUALITY_WINDOW={raw}"))
            })?,
        };

        let degrade_threshold = match vars.get("SESSION_DEGRADE_THRESHOLD") {
            None => DEFAULT_DEGRADE_THRESHOLD,
            Some(raw) => {
                let parsed = raw.parse::<u8>().map_err(|_| {
                    ConfigError::InvalidValue(format!("SESSION_DEGRADE_THRESHOLD={raw}"))
                })?;
                QualityLevel::from_raw(parsed)
            }
        };

        let history_limit = match vars.get("SESSION_HISTORY_LIMIT") {
            None => DEFAULT_HISTORY_LIMIT,
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ConfigError::InvalidValue(format!("SESSION_HISTORY_LIMIT={raw}"))
            })?,
        };

        Ok(EngineConfig {
            channel,
            identity,
            credential_endpoint,
            credential_api_key,
            token_refresh_lead,
            token_retry_interval,
            fallback_timeout,
            recovery_delay,
            quality_window,
            degrade_threshold,
            enable_reduced_video: parse_bool(vars, "SESSION_ENABLE_REDUCED_VIDEO", true),
            enable_audio_only: parse_bool(vars, "SESSION_ENABLE_AUDIO_ONLY", true),
            enable_chat_fallback: parse_bool(vars, "SESSION_ENABLE_CHAT_FALLBACK", true),
            history_limit,
        })
    }
}
