//! Engine configuration loading: retry schedules, timeouts and polling cadences.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};
use validator::{Validate, ValidationError};

use crate::services::backoff::BackoffPolicy;

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/quiz-session.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "QUIZ_SESSION_CONFIG_PATH";

/// Immutable runtime configuration shared across the engine.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Cadence of the phase timer.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[validate(custom(function = "validate_tick"))]
    pub tick_interval: Duration,
    /// Join protocol tuning.
    #[validate(nested)]
    pub join: JoinConfig,
    /// Answer retry queue tuning.
    #[validate(nested)]
    pub answer_sync: AnswerSyncConfig,
    /// Change feed supervision tuning.
    #[validate(nested)]
    pub realtime: RealtimeConfig,
    /// Participant count polling.
    #[validate(nested)]
    pub engagement: EngagementConfig,
    /// Delay after the authoritative end time before redirecting to results.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub redirect_grace: Duration,
    /// Upper bound for work attached to a state transition (submission).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub transition_timeout: Duration,
    /// Backend health probing.
    #[validate(nested)]
    pub connectivity: ConnectivityConfig,
}

/// Bounded join retries while the backend catches up with the activation.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct JoinConfig {
    /// Join calls issued before falling back to pre-join.
    #[validate(range(min = 1, max = 10))]
    pub attempts: u32,
    /// Wait between attempts when the quiz is reported as not active yet.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub grace: Duration,
}

/// Retry schedule of failed answer writes.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct AnswerSyncConfig {
    /// First retry delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[validate(custom(function = "validate_positive"))]
    pub base: Duration,
    /// Retry delay ceiling.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cap: Duration,
    /// Retries per answer before it is dropped.
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    /// Queued answers kept while offline; older entries are evicted first.
    #[validate(range(min = 1))]
    pub max_queue: usize,
}

impl AnswerSyncConfig {
    /// Backoff schedule for the retry queue.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base, self.cap)
    }
}

/// Subscription supervision of the backend change feed.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Time a subscription may take to be acknowledged.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[validate(custom(function = "validate_positive"))]
    pub join_timeout: Duration,
    /// First reconnect delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base: Duration,
    /// Reconnect delay ceiling.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cap: Duration,
    /// Symmetric jitter ratio applied to reconnect delays.
    #[validate(range(min = 0.0, max = 0.5))]
    pub jitter: f64,
    /// Consecutive failed subscriptions before giving up.
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

impl RealtimeConfig {
    /// Jittered reconnect schedule.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base, self.cap).with_jitter(self.jitter)
    }
}

/// Participant count polling cadence.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct EngagementConfig {
    /// Interval between successful polls.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[validate(custom(function = "validate_positive"))]
    pub interval: Duration,
    /// Interval ceiling reached by doubling after failures.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_interval: Duration,
}

impl EngagementConfig {
    /// Doubling schedule applied after consecutive failures.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.interval, self.max_interval.max(self.interval))
    }
}

/// Backend health probing that drives the online flag.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Interval between probes while healthy.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[validate(custom(function = "validate_positive"))]
    pub probe_interval: Duration,
    /// First delay after a failed probe.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base: Duration,
    /// Delay ceiling while the backend stays unreachable.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cap: Duration,
}

impl ConnectivityConfig {
    /// Probe schedule while the backend is unreachable.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base, self.cap)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            join: JoinConfig::default(),
            answer_sync: AnswerSyncConfig::default(),
            realtime: RealtimeConfig::default(),
            engagement: EngagementConfig::default(),
            redirect_grace: Duration::from_secs(2),
            transition_timeout: Duration::from_secs(10),
            connectivity: ConnectivityConfig::default(),
        }
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            grace: Duration::from_millis(1_500),
        }
    }
}

impl Default for AnswerSyncConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
            max_queue: 50,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(8),
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
        }
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Load the engine configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|err| {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse config; falling back to defaults"
                );
                Self::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and validate a JSON document. Missing keys keep their defaults.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        info!(
            tick_ms = config.tick_interval.as_millis() as u64,
            join_attempts = config.join.attempts,
            max_queue = config.answer_sync.max_queue,
            "loaded engine config"
        );
        Ok(config)
    }
}

/// Reasons a configuration document is rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid JSON for [`EngineConfig`].
    #[error("malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

fn validate_positive(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        let mut err = ValidationError::new("duration_zero");
        err.message = Some("duration must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

fn validate_tick(value: &Duration) -> Result<(), ValidationError> {
    validate_positive(value)?;
    if *value > Duration::from_secs(5) {
        let mut err = ValidationError::new("tick_too_slow");
        err.message = Some(format!("tick interval must not exceed 5s (got {value:?})").into());
        return Err(err);
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_keep_defaults() {
        let config = EngineConfig::parse(r#"{"join": {"attempts": 3}, "redirect_grace": 500}"#)
            .unwrap();

        assert_eq!(config.join.attempts, 3);
        assert_eq!(config.join.grace, Duration::from_millis(1_500));
        assert_eq!(config.redirect_grace, Duration::from_millis(500));
        assert_eq!(config.answer_sync, AnswerSyncConfig::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(matches!(
            EngineConfig::parse(r#"{"answer_sync": {"max_queue": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::parse(r#"{"tick_interval": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::parse(r#"{"realtime": {"jitter": 0.9}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::parse("not json"),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
