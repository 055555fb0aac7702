//! Worker configuration.

use std::time::Duration;

use watchpost_models::AnalysisMode;

use crate::error::{WorkerError, WorkerResult};

/// Analysis configuration.
#[derive(Debug, Clone)]
pub struct WatchpostConfig {
    /// Sampling interval for uploaded files
    pub upload_interval: Duration,
    /// Capture interval for the local camera
    pub live_interval: Duration,
    /// Capture interval for external streams
    pub external_interval: Duration,
    /// Maximum frames being classified and reported at once
    pub max_in_flight: usize,
    /// JPEG quality for captured frames
    pub jpeg_quality: u8,
    /// How long a source may take to load
    pub metadata_timeout: Duration,
    /// Where to POST incident notifications; none disables notification
    pub notify_webhook_url: Option<String>,
}

impl Default for WatchpostConfig {
    fn default() -> Self {
        Self {
            upload_interval: Duration::from_secs(5),
            live_interval: Duration::from_secs(5),
            external_interval: Duration::from_secs(10),
            max_in_flight: 4,
            jpeg_quality: 80,
            metadata_timeout: Duration::from_secs(30),
            notify_webhook_url: None,
        }
    }
}

fn env_interval(name: &str, default_secs: f64) -> WorkerResult<Duration> {
    let secs = std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default_secs);
    interval(name, secs)
}

impl WatchpostConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let config = Self {
            upload_interval: env_interval("WATCHPOST_UPLOAD_INTERVAL_SECS", 5.0)?,
            live_interval: env_interval("WATCHPOST_LIVE_INTERVAL_SECS", 5.0)?,
            external_interval: env_interval("WATCHPOST_EXTERNAL_INTERVAL_SECS", 10.0)?,
            max_in_flight: std::env::var("WATCHPOST_MAX_IN_FLIGHT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            jpeg_quality: std::env::var("WATCHPOST_JPEG_QUALITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(80),
            metadata_timeout: Duration::from_secs(
                std::env::var("WATCHPOST_METADATA_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            notify_webhook_url: std::env::var("WATCHPOST_NOTIFY_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        for mode in AnalysisMode::ALL {
            if self.interval_for(mode).is_zero() {
                return Err(WorkerError::config_error(format!(
                    "{} interval must be positive",
                    mode
                )));
            }
        }
        if self.max_in_flight == 0 {
            return Err(WorkerError::config_error("max_in_flight must be at least 1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(WorkerError::config_error("jpeg_quality must be between 1 and 100"));
        }
        Ok(())
    }

    /// Capture interval for a mode.
    pub fn interval_for(&self, mode: AnalysisMode) -> Duration {
        match mode {
            AnalysisMode::Upload => self.upload_interval,
            AnalysisMode::Live => self.live_interval,
            AnalysisMode::External => self.external_interval,
        }
    }

    /// Override the interval of one mode.
    pub fn with_interval(mut self, mode: AnalysisMode, interval: Duration) -> Self {
        match mode {
            AnalysisMode::Upload => self.upload_interval = interval,
            AnalysisMode::Live => self.live_interval = interval,
            AnalysisMode::External => self.external_interval = interval,
        }
        self
    }
}

/// Convert a seconds value into a positive interval.
pub fn interval(name: &str, secs: f64) -> WorkerResult<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(WorkerError::config_error(format!(
            "{} must be a positive number of seconds, got {}",
            name, secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WatchpostConfig::default();
        assert_eq!(config.interval_for(AnalysisMode::Upload), Duration::from_secs(5));
        assert_eq!(config.interval_for(AnalysisMode::Live), Duration::from_secs(5));
        assert_eq!(config.interval_for(AnalysisMode::External), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        assert!(interval("x", 0.0).is_err());
        assert!(interval("x", -1.0).is_err());
        assert_eq!(interval("x", 2.5).unwrap(), Duration::from_millis(2500));

        let config = WatchpostConfig::default().with_interval(AnalysisMode::Live, Duration::ZERO);
        assert!(matches!(config.validate(), Err(WorkerError::ConfigError(_))));
    }
}
