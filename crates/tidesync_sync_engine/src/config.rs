//! Configuration for the sync engine.

use crate::error::ConfigError;
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote backend base URL.
    pub remote_endpoint: String,
    /// Maximum number of log entries read per batch.
    pub upload_batch_size: usize,
    /// Per-request timeout for remote calls.
    pub request_timeout: Duration,
    /// Upper bound for one upload pass.
    pub attempt_timeout: Duration,
    /// Backoff between passes.
    pub backoff: BackoffConfig,
    /// Whether the engine starts in offline mode.
    pub start_offline: bool,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(remote_endpoint: impl Into<String>) -> Self {
        Self {
            remote_endpoint: remote_endpoint.into(),
            upload_batch_size: 100,
            request_timeout: Duration::from_secs(15),
            attempt_timeout: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
            start_offline: false,
        }
    }

    /// Sets the upload batch size.
    pub fn with_upload_batch_size(mut self, size: usize) -> Self {
        self.upload_batch_size = size.max(1);
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Starts the engine offline.
    pub fn with_start_offline(mut self, offline: bool) -> Self {
        self.start_offline = offline;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for backoff between upload passes.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Interval after a successful pass, and the starting interval.
    pub floor: Duration,
    /// Maximum interval.
    pub ceiling: Duration,
    /// Multiplier applied after each failed pass.
    pub factor: f64,
    /// Whether to add up to 25% random jitter to each wait.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(floor: Duration, ceiling: Duration, factor: f64) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            factor: factor.max(1.0),
            jitter: false,
        }
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the interval following `current` after a failure.
    pub fn grow(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.factor;
        if !next.is_finite() || next >= self.ceiling.as_secs_f64() {
            return self.ceiling;
        }
        // f64 round-tripping can lose a nanosecond; never shrink.
        Duration::from_secs_f64(next).max(current).max(self.floor)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(60), 1.5)
    }
}

/// Backoff state owned by the scheduler.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    interval: Duration,
    errors: u32,
}

impl Backoff {
    /// Creates backoff state at the floor interval.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            interval: config.floor,
            config,
            errors: 0,
        }
    }

    /// Current interval, without jitter.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consecutive failed passes.
    pub fn error_count(&self) -> u32 {
        self.errors
    }

    /// Records a successful pass.
    pub fn on_success(&mut self) {
        self.errors = 0;
        self.interval = self.config.floor;
    }

    /// Records a failed pass.
    pub fn on_failure(&mut self) {
        self.errors = self.errors.saturating_add(1);
        self.interval = self.config.grow(self.interval);
    }

    /// The wait before the next pass, jitter applied.
    pub fn delay(&self) -> Duration {
        if self.config.jitter {
            let jitter = self.interval.as_secs_f64() * 0.25 * rand::thread_rng().gen::<f64>();
            self.interval + Duration::from_secs_f64(jitter)
        } else {
            self.interval
        }
    }
}

/// Process configuration, usually loaded from a TOML file.
///
/// ```toml
/// database = "tasks.db"
/// remote_endpoint = "https://example.supabase.co/rest/v1"
/// credential_endpoint = "https://auth.example.com"
///
/// [sync]
/// upload_batch_size = 50
/// attempt_timeout_secs = 30
///
/// [sync.backoff]
/// floor_secs = 5
/// ceiling_secs = 60
/// factor = 1.5
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Local database file.
    pub database: PathBuf,
    /// Remote backend base URL.
    pub remote_endpoint: Option<String>,
    /// Credential service base URL.
    pub credential_endpoint: Option<String>,
    /// Fixed bearer token, used when no credential service is configured.
    pub access_token: Option<String>,
    /// Scheduler settings.
    pub sync: SyncSection,
}

/// `[sync]` table of [`EngineConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    /// Log entries per batch.
    pub upload_batch_size: usize,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Per-attempt timeout in seconds.
    pub attempt_timeout_secs: u64,
    /// Start in offline mode.
    pub start_offline: bool,
    /// Backoff settings.
    pub backoff: BackoffSection,
}

/// `[sync.backoff]` table of [`EngineConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffSection {
    /// Floor in seconds.
    pub floor_secs: f64,
    /// Ceiling in seconds.
    pub ceiling_secs: f64,
    /// Growth factor.
    pub factor: f64,
    /// Random jitter.
    pub jitter: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("tidesync.db"),
            remote_endpoint: None,
            credential_endpoint: None,
            access_token: None,
            sync: SyncSection::default(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            upload_batch_size: defaults.upload_batch_size,
            request_timeout_secs: defaults.request_timeout.as_secs(),
            attempt_timeout_secs: defaults.attempt_timeout.as_secs(),
            start_offline: false,
            backoff: BackoffSection::default(),
        }
    }
}

impl Default for BackoffSection {
    fn default() -> Self {
        let defaults = BackoffConfig::default();
        Self {
            floor_secs: defaults.floor.as_secs_f64(),
            ceiling_secs: defaults.ceiling.as_secs_f64(),
            factor: defaults.factor,
            jitter: defaults.jitter,
        }
    }
}

impl EngineConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let backoff = &self.sync.backoff;
        if !(backoff.floor_secs.is_finite() && backoff.floor_secs > 0.0) {
            return Err(ConfigError::Invalid("sync.backoff.floor_secs must be positive".into()));
        }
        if !backoff.ceiling_secs.is_finite() || backoff.ceiling_secs < backoff.floor_secs {
            return Err(ConfigError::Invalid(
                "sync.backoff.ceiling_secs must be at least floor_secs".into(),
            ));
        }
        if !(backoff.factor.is_finite() && backoff.factor >= 1.0) {
            return Err(ConfigError::Invalid("sync.backoff.factor must be >= 1".into()));
        }
        if self.sync.upload_batch_size == 0 {
            return Err(ConfigError::Invalid("sync.upload_batch_size must be positive".into()));
        }
        if self.sync.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("sync.request_timeout_secs must be positive".into()));
        }
        if self.sync.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid("sync.attempt_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Builds the scheduler configuration.
    ///
    /// Returns `None` when no remote endpoint is configured.
    pub fn sync_config(&self) -> Option<SyncConfig> {
        let endpoint = self.remote_endpoint.as_ref()?;
        let backoff = &self.sync.backoff;
        Some(
            SyncConfig::new(endpoint.trim_end_matches('/'))
                .with_upload_batch_size(self.sync.upload_batch_size)
                .with_request_timeout(Duration::from_secs(self.sync.request_timeout_secs))
                .with_attempt_timeout(Duration::from_secs(self.sync.attempt_timeout_secs))
                .with_start_offline(self.sync.start_offline)
                .with_backoff(
                    BackoffConfig::new(
                        Duration::from_secs_f64(backoff.floor_secs),
                        Duration::from_secs_f64(backoff.ceiling_secs),
                        backoff.factor,
                    )
                    .with_jitter(backoff.jitter),
                ),
        )
    }
}
