//! Runtime configuration.
//!
//! Loaded from environment variables. Malformed values fall back to the
//! defaults with a warning; out-of-range risk thresholds are rejected later
//! by the owning component's constructor (`GuardConfig::new`,
//! `SchedulerConfig::validate`), which is the fail-fast path.

use crate::domain::services::equity_guard::GuardConfig;
use crate::domain::services::matcher::MatcherConfig;
use crate::application::scheduler::SchedulerConfig;
use crate::domain::errors::ConfigError;
use std::time::Duration;

/// Reference pip used to convert the absolute FX-quoted tolerance options
/// into pip counts for the matcher.
const FX_PIP: f64 = 0.0001;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub sync_interval_seconds: u64,
    pub sync_timeout_seconds: u64,
    pub max_concurrent_syncs: usize,
    pub volume_tolerance_percent: f64,
    pub divergence_volume_tolerance_percent: f64,
    /// Absolute, FX-quoted (0.0002 = 2 pips).
    pub entry_price_tolerance: f64,
    /// Absolute, FX-quoted (0.0005 = 5 pips).
    pub divergence_entry_price_tolerance: f64,
    pub max_drawdown_percent: f64,
    pub min_equity_floor: f64,
    pub database_url: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 10,
            sync_timeout_seconds: 8,
            max_concurrent_syncs: 5,
            volume_tolerance_percent: 5.0,
            divergence_volume_tolerance_percent: 10.0,
            entry_price_tolerance: 0.0002,
            divergence_entry_price_tolerance: 0.0005,
            max_drawdown_percent: 20.0,
            min_equity_floor: 500.0,
            database_url: "sqlite://data/sentra.db".to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration from environment variables, keeping defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        read_u64("SYNC_INTERVAL_SECONDS", &mut config.sync_interval_seconds);
        read_u64("SYNC_TIMEOUT_SECONDS", &mut config.sync_timeout_seconds);
        read_usize("MAX_CONCURRENT_SYNCS", &mut config.max_concurrent_syncs);
        read_f64("VOLUME_TOLERANCE_PERCENT", &mut config.volume_tolerance_percent);
        read_f64(
            "DIVERGENCE_VOLUME_TOLERANCE_PERCENT",
            &mut config.divergence_volume_tolerance_percent,
        );
        read_f64("ENTRY_PRICE_TOLERANCE", &mut config.entry_price_tolerance);
        read_f64(
            "DIVERGENCE_ENTRY_PRICE_TOLERANCE",
            &mut config.divergence_entry_price_tolerance,
        );
        read_f64("MAX_DRAWDOWN_PERCENT", &mut config.max_drawdown_percent);
        read_f64("MIN_EQUITY_FLOOR", &mut config.min_equity_floor);

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database_url = url;
            }
        }

        config
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            volume_tolerance_percent: self.volume_tolerance_percent,
            divergence_volume_tolerance_percent: self.divergence_volume_tolerance_percent,
            entry_price_tolerance_pips: self.entry_price_tolerance / FX_PIP,
            divergence_price_tolerance_pips: self.divergence_entry_price_tolerance / FX_PIP,
            stop_level_tolerance_pips: 10.0,
        }
    }

    /// Fails fast on out-of-range thresholds.
    pub fn guard_config(&self) -> Result<GuardConfig, ConfigError> {
        GuardConfig::new(self.max_drawdown_percent, self.min_equity_floor)
    }

    /// Fails fast when the timeout does not fit inside the interval.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let config = SchedulerConfig {
            sync_interval: Duration::from_secs(self.sync_interval_seconds),
            sync_timeout: Duration::from_secs(self.sync_timeout_seconds),
            max_concurrent_syncs: self.max_concurrent_syncs,
            ..SchedulerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_u64(name: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<u64>() {
            Ok(value) if value > 0 => *target = value,
            Ok(value) => {
                tracing::warn!("{} must be positive, got {}, using default {}", name, value, target);
            }
            Err(e) => {
                tracing::warn!("failed to parse {} '{}': {}, using default {}", name, raw, e, target);
            }
        }
    }
}

fn read_usize(name: &str, target: &mut usize) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<usize>() {
            Ok(value) if value > 0 => *target = value,
            Ok(value) => {
                tracing::warn!("{} must be positive, got {}, using default {}", name, value, target);
            }
            Err(e) => {
                tracing::warn!("failed to parse {} '{}': {}, using default {}", name, raw, e, target);
            }
        }
    }
}

fn read_f64(name: &str, target: &mut f64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() && value > 0.0 => *target = value,
            Ok(value) => {
                tracing::warn!("{} must be positive and finite, got {}, using default {}", name, value, target);
            }
            Err(e) => {
                tracing::warn!("failed to parse {} '{}': {}, using default {}", name, raw, e, target);
            }
        }
    }
}
