//! Configuration management for Autocount
//!
//! Static tuning lives in a TOML file. Everything the counting loop mutates
//! at runtime (channel, count, identities) lives in the state file instead,
//! see [`crate::store`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub reset: ResetConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl StateConfig {
    /// Expand `~` in the configured state path
    pub fn expand_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> crate::client::RetryPolicy {
        crate::client::RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

/// Speed governor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Consecutive successes needed before speeding up
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Multiplier applied to the delay after enough successes (< 1)
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    /// Multiplier applied to the delay on a rate limit (> 1)
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
    /// Extra one-time multiplier when the rate limit is global
    #[serde(default = "default_global_penalty")]
    pub global_penalty: f64,
    /// Added on top of the service's retry_after
    #[serde(default = "default_retry_cushion_ms")]
    pub retry_cushion_ms: u64,
    /// Random jitter applied to pacing delays, as a fraction (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            success_threshold: default_success_threshold(),
            decrease_factor: default_decrease_factor(),
            increase_factor: default_increase_factor(),
            global_penalty: default_global_penalty(),
            retry_cushion_ms: default_retry_cushion_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Items fetched per scan
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u8,
    /// Items fetched by the one-off mismatch fix
    #[serde(default = "default_fix_fetch_limit")]
    pub fix_fetch_limit: u8,
    /// Items fetched by the deep reset rescan
    #[serde(default = "default_deep_fetch_limit")]
    pub deep_fetch_limit: u8,
    /// Run a full scan every Nth successful send
    #[serde(default = "default_scan_every")]
    pub scan_every: u32,
    /// Local/observed divergence that gets flagged for manual review
    #[serde(default = "default_divergence_alert")]
    pub divergence_alert: u64,
    /// Re-read the channel after each send and only advance once the value
    /// is visible there
    #[serde(default)]
    pub verify_sends: bool,
    #[serde(default = "default_verify_fetch_limit")]
    pub verify_fetch_limit: u8,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            fix_fetch_limit: default_fix_fetch_limit(),
            deep_fetch_limit: default_deep_fetch_limit(),
            scan_every: default_scan_every(),
            divergence_alert: default_divergence_alert(),
            verify_sends: false,
            verify_fetch_limit: default_verify_fetch_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetConfig {
    /// Replaces the built-in reset patterns when set
    #[serde(default)]
    pub patterns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Pause after a failed cycle before scanning again
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default = "default_presence")]
    pub presence: bool,
    #[serde(default = "default_presence_ms")]
    pub presence_ms: u64,
    /// Pacing bounds written to a fresh state file
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_recency_window_secs")]
    pub recency_window_secs: u64,
    #[serde(default = "default_automated_participants")]
    pub automated_participants: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            watchdog_secs: default_watchdog_secs(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            error_backoff_ms: default_error_backoff_ms(),
            presence: default_presence(),
            presence_ms: default_presence_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            recency_window_secs: default_recency_window_secs(),
            automated_participants: default_automated_participants(),
        }
    }
}

impl RunnerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn presence_duration(&self) -> Duration {
        Duration::from_millis(self.presence_ms)
    }
}

fn default_state_path() -> String {
    "~/.local/share/autocount/state.json".to_string()
}

fn default_base_url() -> String {
    "https://discord.com/api/v9".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_retry_max_ms() -> u64 {
    8000
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string()
}

fn default_success_threshold() -> u32 {
    5
}

fn default_decrease_factor() -> f64 {
    0.8
}

fn default_increase_factor() -> f64 {
    1.5
}

fn default_global_penalty() -> f64 {
    2.0
}

fn default_retry_cushion_ms() -> u64 {
    500
}

fn default_jitter() -> f64 {
    0.2
}

fn default_fetch_limit() -> u8 {
    30
}

fn default_fix_fetch_limit() -> u8 {
    10
}

fn default_deep_fetch_limit() -> u8 {
    50
}

fn default_scan_every() -> u32 {
    1
}

fn default_divergence_alert() -> u64 {
    5
}

fn default_verify_fetch_limit() -> u8 {
    5
}

fn default_cooldown_ms() -> u64 {
    3000
}

fn default_watchdog_secs() -> u64 {
    60
}

fn default_max_rate_limit_retries() -> u32 {
    5
}

fn default_error_backoff_ms() -> u64 {
    5000
}

fn default_presence() -> bool {
    true
}

fn default_presence_ms() -> u64 {
    50
}

fn default_min_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_recency_window_secs() -> u64 {
    300
}

fn default_automated_participants() -> Vec<String> {
    vec![
        "counting".to_string(),
        "CountingBot".to_string(),
        "APP".to_string(),
    ]
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file yields the built-in defaults.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        if !config_path.exists() {
            tracing::debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tuning values that would break the governor or the loop
    pub fn validate(&self) -> Result<()> {
        let g = &self.governor;
        if !(g.decrease_factor > 0.0 && g.decrease_factor < 1.0) {
            return Err(invalid("governor.decrease_factor", "must be in (0, 1)"));
        }
        if !g.increase_factor.is_finite() || g.increase_factor <= 1.0 {
            return Err(invalid("governor.increase_factor", "must be greater than 1"));
        }
        if !g.global_penalty.is_finite() || g.global_penalty < 1.0 {
            return Err(invalid("governor.global_penalty", "must be at least 1"));
        }
        if !(0.0..1.0).contains(&g.jitter) {
            return Err(invalid("governor.jitter", "must be in [0, 1)"));
        }
        if g.success_threshold == 0 {
            return Err(invalid("governor.success_threshold", "must be positive"));
        }
        if self.runner.min_delay_ms > self.runner.max_delay_ms {
            return Err(invalid(
                "runner.min_delay_ms",
                "must not exceed runner.max_delay_ms",
            ));
        }
        if self.runner.max_delay_ms > crate::governor::MAX_PACING_DELAY.as_millis() as u64 {
            return Err(invalid("runner.max_delay_ms", "must not exceed one hour"));
        }
        if self.scan.scan_every == 0 {
            return Err(invalid("scan.scan_every", "must be positive"));
        }
        if self.scan.verify_fetch_limit == 0 {
            return Err(invalid("scan.verify_fetch_limit", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::AutocountError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("AUTOCOUNT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("autocount").join("config.toml"))
}
