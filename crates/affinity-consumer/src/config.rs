// Session processor options and their env/YAML loading.
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 8;
pub const DEFAULT_MAX_CALLS_PER_SESSION: usize = 1;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_secs(10);
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(5);

pub const CONFIG_PATH_ENV: &str = "AFFINITY_CONSUMER_CONFIG";

/// Bounded exponential backoff for transient broker failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    // Attempts per operation, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_backoff: DEFAULT_RETRY_BASE,
            max_backoff: DEFAULT_RETRY_MAX,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Options recognized by the session worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProcessorOptions {
    // Ceiling on simultaneously held sessions.
    pub max_concurrent_sessions: usize,
    // Handler calls in flight per session. 1 keeps completion order.
    pub max_concurrent_calls_per_session: usize,
    // Restrict acquisition to these session ids.
    pub session_ids: Option<Vec<String>>,
    // Release a session after this long with nothing received.
    pub idle_timeout: Duration,
    // Renew this long before the lock expires.
    pub renewal_margin: Duration,
    // How long one acquisition attempt waits for a session.
    pub accept_timeout: Duration,
    // How long one receive call waits for a message.
    pub receive_wait: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionProcessorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            max_concurrent_calls_per_session: DEFAULT_MAX_CALLS_PER_SESSION,
            session_ids: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            renewal_margin: DEFAULT_RENEWAL_MARGIN,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct OptionsOverride {
    max_concurrent_sessions: Option<usize>,
    max_concurrent_calls_per_session: Option<usize>,
    session_ids: Option<Vec<String>>,
    idle_timeout_ms: Option<u64>,
    renewal_margin_ms: Option<u64>,
    accept_timeout_ms: Option<u64>,
    receive_wait_ms: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
}

impl OptionsOverride {
    // YAML values are applied as written; `validate` rejects the bad ones.
    fn apply(self, options: &mut SessionProcessorOptions) {
        if let Some(value) = self.max_concurrent_sessions {
            options.max_concurrent_sessions = value;
        }
        if let Some(value) = self.max_concurrent_calls_per_session {
            options.max_concurrent_calls_per_session = value;
        }
        if let Some(value) = self.session_ids {
            options.session_ids = Some(value);
        }
        if let Some(value) = self.idle_timeout_ms {
            options.idle_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.renewal_margin_ms {
            options.renewal_margin = Duration::from_millis(value);
        }
        if let Some(value) = self.accept_timeout_ms {
            options.accept_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.receive_wait_ms {
            options.receive_wait = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_max_attempts {
            options.retry.max_attempts = value;
        }
        if let Some(value) = self.retry_base_ms {
            options.retry.base_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_max_ms {
            options.retry.max_backoff = Duration::from_millis(value);
        }
    }
}

impl SessionProcessorOptions {
    pub fn with_session_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Defaults overlaid with `AFFINITY_*` environment variables.
    ///
    /// Unparseable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = read_usize_env("AFFINITY_MAX_CONCURRENT_SESSIONS") {
            options.max_concurrent_sessions = value;
        }
        if let Some(value) = read_usize_env("AFFINITY_MAX_CALLS_PER_SESSION") {
            options.max_concurrent_calls_per_session = value;
        }
        if let Some(ids) = read_list_env("AFFINITY_SESSION_IDS") {
            options.session_ids = Some(ids);
        }
        if let Some(value) = read_millis_env("AFFINITY_IDLE_TIMEOUT_MS") {
            options.idle_timeout = value;
        }
        if let Some(value) = read_millis_env("AFFINITY_RENEWAL_MARGIN_MS") {
            options.renewal_margin = value;
        }
        if let Some(value) = read_millis_env("AFFINITY_ACCEPT_TIMEOUT_MS") {
            options.accept_timeout = value;
        }
        if let Some(value) = read_millis_env("AFFINITY_RECEIVE_WAIT_MS") {
            options.receive_wait = value;
        }
        if let Some(value) = read_usize_env("AFFINITY_RETRY_MAX_ATTEMPTS") {
            options.retry.max_attempts = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = read_millis_env("AFFINITY_RETRY_BASE_MS") {
            options.retry.base_backoff = value;
        }
        if let Some(value) = read_millis_env("AFFINITY_RETRY_MAX_MS") {
            options.retry.max_backoff = value;
        }
        options
    }

    /// `from_env` plus an optional YAML override file, taken from `config_path`
    /// or `AFFINITY_CONSUMER_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut options = Self::from_env();
        let override_path = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(Into::into));
        if let Some(path) = override_path {
            let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let override_cfg: OptionsOverride = serde_yaml::from_str(&contents)?;
            override_cfg.apply(&mut options);
        }
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sessions < 1 {
            return Err(ConfigError::invalid(
                "max_concurrent_sessions",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_calls_per_session < 1 {
            return Err(ConfigError::invalid(
                "max_concurrent_calls_per_session",
                "must be at least 1",
            ));
        }
        if let Some(ids) = &self.session_ids {
            if ids.is_empty() {
                return Err(ConfigError::invalid(
                    "session_ids",
                    "named session filter is empty",
                ));
            }
            if ids.iter().any(|id| id.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    "session_ids",
                    "session ids must be non-empty",
                ));
            }
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::invalid("idle_timeout", "must be non-zero"));
        }
        if self.accept_timeout.is_zero() {
            return Err(ConfigError::invalid("accept_timeout", "must be non-zero"));
        }
        if self.receive_wait.is_zero() {
            return Err(ConfigError::invalid("receive_wait", "must be non-zero"));
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.retry.max_backoff < self.retry.base_backoff {
            return Err(ConfigError::invalid(
                "retry.max_backoff",
                "must not be below retry.base_backoff",
            ));
        }
        Ok(())
    }
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}

fn read_list_env(key: &str) -> Option<Vec<String>> {
    let ids: Vec<String> = std::env::var(key)
        .ok()?
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    (!ids.is_empty()).then_some(ids)
}
