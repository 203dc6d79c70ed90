//! Configuration management.
//!
//! One [`AppConfig`] is loaded at startup — defaults, then an optional
//! `config/stagedoor` file, then `STAGEDOOR__`-prefixed environment
//! variables — validated, and passed explicitly to the components that
//! need it. Nothing re-reads persisted settings at call sites.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::TimeSource;
use crate::scheduler::SchedulerSettings;

/// Configuration error with an actionable fix hint.
#[derive(Error, Debug)]
#[error("invalid configuration: {message}\n\nHow to fix: {fix_hint}")]
pub struct ConfigError {
    pub message: String,
    pub fix_hint: String,
}

impl ConfigError {
    fn new(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }
}

/// Time-source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// HTTP endpoint or NTP host used as the authoritative clock.
    pub source: String,
    /// Budget for one sync round trip, in milliseconds.
    pub sync_timeout_ms: u64,
    /// Resync cadence while a task waits, in milliseconds.
    pub resync_interval_ms: u64,
    /// Stop resyncing once the fire instant is closer than this.
    pub resync_guard_ms: u64,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            source: "https://api.bilibili.com/x/report/click/now".to_string(),
            sync_timeout_ms: 5_000,
            resync_interval_ms: 10_000,
            resync_guard_ms: 2_000,
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Post-expiry tolerance before a timer re-arms, in milliseconds.
    pub tolerance_window_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tolerance_window_ms: 100,
        }
    }
}

/// Push-channel credentials; an absent or empty value disables the channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// PushPlus token.
    pub pushplus: Option<String>,
    /// ServerChan send key.
    pub serverchan: Option<String>,
    /// Bark token or full server URL.
    pub bark: Option<String>,
    /// Ntfy topic or full URL.
    pub ntfy: Option<String>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub time: TimeConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationsConfig,
    /// Outbound proxy handed to the purchase executor.
    pub proxy: Option<String>,
}

impl AppConfig {
    /// Load configuration from defaults, config files and environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;
        config.validate()?;
        Ok(config)
    }

    /// Load without validation, for tests and tooling.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let raw = config::Config::builder()
            .add_source(config::File::with_name("config/stagedoor").required(false))
            .add_source(
                config::Environment::with_prefix("STAGEDOOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = raw.try_deserialize()?;
        Ok(config)
    }

    /// Validate the loaded configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time.source.trim().is_empty() {
            return Err(ConfigError::new(
                "time.source is empty",
                "Set STAGEDOOR__TIME__SOURCE to an HTTP time endpoint or an NTP host",
            ));
        }
        if self.time.sync_timeout_ms == 0 {
            return Err(ConfigError::new(
                "time.sync_timeout_ms is 0",
                "Give the sync at least a few hundred milliseconds, e.g. 5000",
            ));
        }
        if self.time.resync_guard_ms <= self.scheduler.tolerance_window_ms {
            return Err(ConfigError::new(
                "time.resync_guard_ms must exceed scheduler.tolerance_window_ms",
                "A resync inside the tolerance window could move the target under a timer that is about to fire",
            ));
        }
        Ok(())
    }

    /// The scheduler settings this configuration describes.
    #[must_use]
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            time_source: TimeSource::parse(&self.time.source),
            sync_timeout: Duration::from_millis(self.time.sync_timeout_ms),
            tolerance_window: Duration::from_millis(self.scheduler.tolerance_window_ms),
            resync_interval: Duration::from_millis(self.time.resync_interval_ms),
            resync_guard: Duration::from_millis(self.time.resync_guard_ms),
        }
    }
}
