//! Fetcher configuration.
//!
//! One plain struct per subsystem (backoff, breaker, proxy pool), all
//! gathered under [`FetcherConfig`] and validated when the fetcher is
//! built. Invalid values surface as [`ConfigError`] rather than panics.

use std::time::Duration;

use thiserror::Error;

pub use crate::modules::breaker::BreakerConfig;
pub use crate::modules::identity::RotationMode;
pub use crate::modules::proxy::PoolConfig;
pub use crate::modules::retry::{BackoffConfig, JitterMode};
use crate::strategies::StrategyKind;

/// Top-level configuration consumed by the fetcher builder.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Escalation ladder, cheapest technique first.
    pub strategy_order: Vec<StrategyKind>,
    /// Hard wall-clock budget for one strategy attempt.
    pub request_timeout: Duration,
    /// Navigation budget for the headless-browser rung, which needs more
    /// room than a plain HTTP round trip.
    pub browser_timeout: Duration,
    /// How identities are drawn from the pool.
    pub rotation_mode: RotationMode,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            strategy_order: StrategyKind::default_order(),
            request_timeout: Duration::from_secs(30),
            browser_timeout: Duration::from_secs(45),
            rotation_mode: RotationMode::default(),
            backoff: BackoffConfig::default(),
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl FetcherConfig {
    /// Checks every invariant the subsystems rely on. Called by the
    /// fetcher builder; exposed for callers assembling configs by hand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy_order.is_empty() {
            return Err(ConfigError::EmptyStrategyOrder);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("request_timeout"));
        }
        if self.browser_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("browser_timeout"));
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.backoff.multiplier < 1.0 || !self.backoff.multiplier.is_finite() {
            return Err(ConfigError::InvalidMultiplier(self.backoff.multiplier));
        }
        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(ConfigError::DelayRange {
                initial: self.backoff.initial_delay,
                max: self.backoff.max_delay,
            });
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ZeroBreakerThreshold("failure_threshold"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::ZeroBreakerThreshold("success_threshold"));
        }
        if self.pool.cooldown_forbidden <= self.pool.cooldown_rate_limited {
            return Err(ConfigError::CooldownOrder {
                rate_limited: self.pool.cooldown_rate_limited,
                forbidden: self.pool.cooldown_forbidden,
            });
        }
        if self.pool.probe_urls.is_empty() {
            return Err(ConfigError::NoProbeUrls);
        }
        if self.pool.max_consecutive_failures == 0 {
            return Err(ConfigError::ZeroPoolThreshold);
        }
        Ok(())
    }
}

/// Configuration problems detected at build time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("strategy order must name at least one strategy")]
    EmptyStrategyOrder,
    #[error("{0} must be non-zero")]
    ZeroTimeout(&'static str),
    #[error("backoff max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("backoff multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("backoff max_delay ({max:?}) must not be below initial_delay ({initial:?})")]
    DelayRange { initial: Duration, max: Duration },
    #[error("circuit breaker {0} must be at least 1")]
    ZeroBreakerThreshold(&'static str),
    #[error(
        "forbidden cooldown ({forbidden:?}) must be strictly longer than \
         rate-limit cooldown ({rate_limited:?})"
    )]
    CooldownOrder {
        rate_limited: Duration,
        forbidden: Duration,
    },
    #[error("proxy pool needs at least one health-probe URL")]
    NoProbeUrls,
    #[error("proxy pool max_consecutive_failures must be at least 1")]
    ZeroPoolThreshold,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FetcherConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_strategy_order() {
        let config = FetcherConfig {
            strategy_order: Vec::new(),
            ..FetcherConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyStrategyOrder)
        ));
    }

    #[test]
    fn rejects_multiplier_below_one() {
        let mut config = FetcherConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn rejects_inverted_delay_range() {
        let mut config = FetcherConfig::default();
        config.backoff.initial_delay = Duration::from_secs(10);
        config.backoff.max_delay = Duration::from_secs(5);
        assert!(matches!(config.validate(), Err(ConfigError::DelayRange { .. })));
    }

    #[test]
    fn forbidden_cooldown_must_exceed_rate_limit_cooldown() {
        let mut config = FetcherConfig::default();
        config.pool.cooldown_forbidden = config.pool.cooldown_rate_limited;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CooldownOrder { .. })
        ));
    }

    #[test]
    fn rejects_missing_probe_urls() {
        let mut config = FetcherConfig::default();
        config.pool.probe_urls.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoProbeUrls)));
    }

    #[test]
    fn rejects_zero_breaker_thresholds() {
        let mut config = FetcherConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroBreakerThreshold("failure_threshold"))
        ));
    }
}
