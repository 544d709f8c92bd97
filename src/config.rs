//! Service configuration.
//!
//! Everything tunable about a pairing session lives here: grace period before
//! the token request, the watchdog budgets, reconnect policy, and where
//! working directories are rooted. Values come from `PAIRGATE_*` environment
//! variables with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::socket::{ClosePolicy, DeviceProfile};

/// Delay between the connecting phase starting and the pairing-code request.
/// Requesting earlier yields an unusable code from the transport.
const DEFAULT_GRACE_MS: u64 = 1_500;

/// How long an HTTP caller waits for the pairing token.
const DEFAULT_TOKEN_WAIT_MS: u64 = 30_000;

/// Total budget from session creation to the registered state.
const DEFAULT_LINK_BUDGET_MS: u64 = 75_000;

/// Budget for the credential artifact to materialize after registration.
const DEFAULT_ARTIFACT_BUDGET_MS: u64 = 25_000;

/// Poll interval while waiting for the artifact.
const DEFAULT_ARTIFACT_POLL_MS: u64 = 300;

/// Reconnect attempts before a transient-disconnect loop is abandoned.
const DEFAULT_MAX_RECONNECTS: u32 = 4;

const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_CAP_MS: u64 = 10_000;

/// Configuration for the pairing orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Grace period before requesting the pairing code.
    pub grace_period: Duration,
    /// How long the HTTP caller waits for a token before 504.
    pub token_wait: Duration,
    /// Watchdog budget from creation to `Registered`.
    pub link_budget: Duration,
    /// Budget for the credential artifact to appear.
    pub artifact_budget: Duration,
    /// Artifact poll interval.
    pub artifact_poll: Duration,
    /// Maximum reconnect attempts on retryable closes.
    pub max_reconnects: u32,
    /// Base delay for reconnect backoff.
    pub backoff_base: Duration,
    /// Cap for reconnect backoff.
    pub backoff_cap: Duration,
    /// Root directory for per-session working directories.
    pub session_root: PathBuf,
    /// Device identity presented during linking.
    pub device_profile: DeviceProfile,
    /// Which close reasons are terminal.
    pub close_policy: ClosePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(DEFAULT_GRACE_MS),
            token_wait: Duration::from_millis(DEFAULT_TOKEN_WAIT_MS),
            link_budget: Duration::from_millis(DEFAULT_LINK_BUDGET_MS),
            artifact_budget: Duration::from_millis(DEFAULT_ARTIFACT_BUDGET_MS),
            artifact_poll: Duration::from_millis(DEFAULT_ARTIFACT_POLL_MS),
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            session_root: PathBuf::from("./sessions"),
            device_profile: DeviceProfile::default(),
            close_policy: ClosePolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from `PAIRGATE_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            grace_period: env_duration("PAIRGATE_GRACE_MS", defaults.grace_period)?,
            token_wait: env_duration("PAIRGATE_TOKEN_WAIT_MS", defaults.token_wait)?,
            link_budget: env_duration("PAIRGATE_LINK_BUDGET_MS", defaults.link_budget)?,
            artifact_budget: env_duration(
                "PAIRGATE_ARTIFACT_BUDGET_MS",
                defaults.artifact_budget,
            )?,
            artifact_poll: env_duration("PAIRGATE_ARTIFACT_POLL_MS", defaults.artifact_poll)?,
            max_reconnects: env_u32("PAIRGATE_MAX_RECONNECTS", defaults.max_reconnects)?,
            backoff_base: env_duration("PAIRGATE_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_cap: env_duration("PAIRGATE_BACKOFF_CAP_MS", defaults.backoff_cap)?,
            session_root: std::env::var("PAIRGATE_SESSION_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_root),
            device_profile: defaults.device_profile,
            close_policy: env_close_policy("PAIRGATE_TERMINAL_CLOSE_CODES")?,
        })
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_duration_ms(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an integer, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_close_policy(key: &str) -> Result<ClosePolicy, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_close_codes(key, &raw).map(ClosePolicy::new),
        Err(_) => Ok(ClosePolicy::default()),
    }
}

fn parse_duration_ms(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected milliseconds, got {raw:?}"),
    })?;
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

fn parse_close_codes(key: &str, raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a comma-separated list of codes, got {raw:?}"),
            })
        })
        .collect()
}
