//! Failure classification and retry scheduling.
//!
//! Every failed attempt is classified into a small taxonomy, then the
//! engine decides whether the attempt should be retried and how long to
//! wait. Delays grow exponentially per attempt, vary by failure class
//! (rate limiting and forbidden responses back off far longer than
//! transport hiccups), and are jittered to keep concurrent fetchers from
//! synchronizing. The per-domain circuit breaker has veto power over
//! every retry decision.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::thread_rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::modules::breaker::BreakerRegistry;

/// Statuses that are never retried no matter the attempt budget.
pub const NO_RETRY_STATUSES: [u16; 4] = [400, 401, 404, 410];

/// Failure taxonomy applied to every unsuccessful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    #[serde(rename = "network_error")]
    Network,
    #[serde(rename = "server_error")]
    ServerError,
    #[serde(rename = "rate_limited")]
    RateLimited,
    #[serde(rename = "forbidden")]
    Forbidden,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "proxy_error")]
    ProxyError,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network_error",
            FailureKind::ServerError => "server_error",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Forbidden => "forbidden",
            FailureKind::Timeout => "timeout",
            FailureKind::ProxyError => "proxy_error",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Whether this class of failure is worth retrying on the same
    /// strategy at all.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Network
                | FailureKind::ServerError
                | FailureKind::RateLimited
                | FailureKind::Timeout
                | FailureKind::ProxyError
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies an HTTP status. `None` means the status is not a failure.
pub fn classify_status(status: u16) -> Option<FailureKind> {
    match status {
        200..=399 => None,
        403 => Some(FailureKind::Forbidden),
        408 => Some(FailureKind::Timeout),
        429 => Some(FailureKind::RateLimited),
        500..=599 => Some(FailureKind::ServerError),
        _ => Some(FailureKind::Unknown),
    }
}

/// Classifies a transport-level error. Connection failures through a
/// proxy are charged to the proxy.
pub fn classify_transport(err: &reqwest::Error, via_proxy: bool) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() {
        if via_proxy {
            FailureKind::ProxyError
        } else {
            FailureKind::Network
        }
    } else if err.is_request() || err.is_body() || err.is_decode() || err.is_redirect() {
        FailureKind::Network
    } else {
        FailureKind::Unknown
    }
}

/// A classified attempt failure, carried from strategies up to the
/// orchestrator and the proxy pool.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub message: String,
    /// Server-provided wait hint (Retry-After), when one was present.
    pub retry_after: Option<Duration>,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: classify_status(status).unwrap_or(FailureKind::Unknown),
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transport(err: &reqwest::Error, via_proxy: bool) -> Self {
        Self {
            kind: classify_transport(err, via_proxy),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            retry_after: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            status: None,
            message: format!("request exceeded {} ms", after.as_millis()),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, hint: Option<Duration>) -> Self {
        self.retry_after = hint;
        self
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {status}): {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Parses a Retry-After header value: either delta seconds or an HTTP
/// date in the future.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = DateTime::parse_from_rfc2822(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed).map(|dt| dt.with_timezone(&Utc)))
        .ok()?;
    let delta = when - Utc::now();
    delta.to_std().ok()
}

/// Jitter applied to computed backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Exact exponential value.
    None,
    /// uniform(0, delay).
    Full,
    /// delay/2 + uniform(0, delay/2).
    Equal,
    /// uniform(base, previous_delay * 3), capped.
    Decorrelated,
}

impl Default for JitterMode {
    fn default() -> Self {
        JitterMode::Full
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay for transport-class failures (network, timeout, proxy).
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: JitterMode,
    /// Attempts per strategy, the first one included.
    pub max_attempts: u32,
    pub rate_limited_base: Duration,
    pub forbidden_base: Duration,
    pub server_error_base: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: JitterMode::Full,
            max_attempts: 3,
            rate_limited_base: Duration::from_secs(30),
            forbidden_base: Duration::from_secs(60),
            server_error_base: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    pub fn base_for(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::RateLimited => self.rate_limited_base,
            FailureKind::Forbidden => self.forbidden_base,
            FailureKind::ServerError => self.server_error_base,
            _ => self.initial_delay,
        }
    }

    /// Exponential delay for the given attempt (1-based), before jitter,
    /// capped at `max_delay`.
    pub fn raw_delay(&self, attempt: u32, kind: FailureKind) -> Duration {
        let base = self.base_for(kind).as_secs_f64();
        let exponent = attempt.max(1) - 1;
        let grown = base * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay for the given attempt. `previous` is the delay the
    /// caller slept last time, used only by decorrelated jitter.
    pub fn delay_for(
        &self,
        attempt: u32,
        kind: FailureKind,
        previous: Option<Duration>,
    ) -> Duration {
        let raw = self.raw_delay(attempt, kind);
        let raw_secs = raw.as_secs_f64();
        if raw_secs <= 0.0 {
            return Duration::ZERO;
        }

        let mut rng = thread_rng();
        let jittered = match self.jitter {
            JitterMode::None => raw_secs,
            JitterMode::Full => rng.gen_range(0.0..raw_secs),
            JitterMode::Equal => raw_secs / 2.0 + rng.gen_range(0.0..raw_secs / 2.0),
            JitterMode::Decorrelated => {
                let base = self.base_for(kind).as_secs_f64();
                let prev = previous.map(|d| d.as_secs_f64()).unwrap_or(base);
                let upper = (prev * 3.0).max(base + f64::EPSILON);
                rng.gen_range(base..upper)
            }
        };
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

/// One retry engine verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp { reason: GiveUpReason },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    AttemptsExhausted,
    NonRetryableStatus(u16),
    BreakerOpen,
    NotRetryable(FailureKind),
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GiveUpReason::AttemptsExhausted => f.write_str("attempt budget exhausted"),
            GiveUpReason::NonRetryableStatus(status) => {
                write!(f, "status {status} is never retried")
            }
            GiveUpReason::BreakerOpen => f.write_str("circuit breaker is open"),
            GiveUpReason::NotRetryable(kind) => write!(f, "{kind} does not retry"),
        }
    }
}

/// Record of one attempt, appended to per-domain statistics.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub delay: Duration,
    pub at: DateTime<Utc>,
}

/// Decides retries for the orchestrator. Owns the backoff policy and
/// consults (but does not mutate) the breaker registry; breaker
/// transitions are driven by the orchestrator recording outcomes.
#[derive(Clone, Debug)]
pub struct RetryEngine {
    policy: BackoffConfig,
    breakers: BreakerRegistry,
}

impl RetryEngine {
    pub fn new(policy: BackoffConfig, breakers: BreakerRegistry) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &BackoffConfig {
        &self.policy
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Verdict for an attempt that just failed. `attempt` is the 1-based
    /// number of the failed attempt; `previous_delay` is the last slept
    /// delay in this attempt sequence.
    pub fn evaluate(
        &self,
        domain: &str,
        attempt: u32,
        failure: &FetchFailure,
        previous_delay: Option<Duration>,
    ) -> RetryDecision {
        if let Some(status) = failure.status
            && NO_RETRY_STATUSES.contains(&status)
        {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NonRetryableStatus(status),
            };
        }
        if attempt >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::AttemptsExhausted,
            };
        }
        if !self.breakers.would_allow(domain) {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::BreakerOpen,
            };
        }
        if !failure.kind.is_retryable() {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable(failure.kind),
            };
        }

        let mut delay = self.policy.delay_for(attempt, failure.kind, previous_delay);
        if let Some(hint) = failure.retry_after {
            delay = delay.max(hint).min(self.policy.max_delay);
        }
        RetryDecision::Retry { delay }
    }

    /// Predicate form of `evaluate`.
    pub fn should_retry(&self, domain: &str, attempt: u32, failure: &FetchFailure) -> bool {
        self.evaluate(domain, attempt, failure, None).is_retry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::breaker::BreakerConfig;

    fn no_jitter_policy() -> BackoffConfig {
        BackoffConfig {
            jitter: JitterMode::None,
            max_attempts: 5,
            ..BackoffConfig::default()
        }
    }

    fn engine(policy: BackoffConfig) -> RetryEngine {
        RetryEngine::new(policy, BreakerRegistry::default())
    }

    #[test]
    fn status_classification_follows_the_taxonomy() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(301), None);
        assert_eq!(classify_status(403), Some(FailureKind::Forbidden));
        assert_eq!(classify_status(408), Some(FailureKind::Timeout));
        assert_eq!(classify_status(429), Some(FailureKind::RateLimited));
        assert_eq!(classify_status(500), Some(FailureKind::ServerError));
        assert_eq!(classify_status(503), Some(FailureKind::ServerError));
        assert_eq!(classify_status(404), Some(FailureKind::Unknown));
    }

    #[test]
    fn no_retry_statuses_are_refused_at_any_attempt() {
        let engine = engine(no_jitter_policy());
        for status in NO_RETRY_STATUSES {
            for attempt in 1..4 {
                let failure = FetchFailure::from_status(status, "client error");
                assert!(
                    !engine.should_retry("example.com", attempt, &failure),
                    "status {status} retried at attempt {attempt}"
                );
            }
        }
    }

    #[test]
    fn retryable_failures_are_retried_until_the_budget_runs_out() {
        let engine = engine(no_jitter_policy());
        let failure = FetchFailure::from_status(503, "upstream sad");
        assert!(engine.should_retry("example.com", 1, &failure));
        assert!(engine.should_retry("example.com", 4, &failure));
        assert!(!engine.should_retry("example.com", 5, &failure));
    }

    #[test]
    fn forbidden_does_not_retry_within_a_strategy() {
        let engine = engine(no_jitter_policy());
        let failure = FetchFailure::from_status(403, "blocked");
        assert!(!engine.should_retry("example.com", 1, &failure));
    }

    #[test]
    fn open_breaker_vetoes_retries() {
        let breakers = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        });
        let engine = RetryEngine::new(no_jitter_policy(), breakers.clone());
        breakers.record_failure("example.com");
        breakers.record_failure("example.com");

        let failure = FetchFailure::from_status(503, "upstream sad");
        assert!(!engine.should_retry("example.com", 1, &failure));
        assert!(engine.should_retry("other.example", 1, &failure));
    }

    #[test]
    fn delays_grow_monotonically_and_stay_bounded() {
        let policy = no_jitter_policy();
        let mut last = Duration::ZERO;
        for attempt in 1..12 {
            let delay = policy.delay_for(attempt, FailureKind::Network, None);
            assert!(delay >= last, "delay shrank at attempt {attempt}");
            assert!(delay <= policy.max_delay);
            last = delay;
        }
        assert_eq!(
            policy.delay_for(1, FailureKind::Network, None),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(3, FailureKind::Network, None),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn rate_limited_and_forbidden_use_long_bases() {
        let policy = no_jitter_policy();
        let network = policy.delay_for(1, FailureKind::Network, None);
        let limited = policy.delay_for(1, FailureKind::RateLimited, None);
        let forbidden = policy.delay_for(1, FailureKind::Forbidden, None);
        assert_eq!(limited, Duration::from_secs(30));
        assert_eq!(forbidden, Duration::from_secs(60));
        assert!(network < limited && limited < forbidden);
    }

    #[test]
    fn full_jitter_stays_inside_the_raw_delay() {
        let policy = BackoffConfig {
            jitter: JitterMode::Full,
            ..BackoffConfig::default()
        };
        let raw = policy.raw_delay(2, FailureKind::Network);
        for _ in 0..200 {
            let delay = policy.delay_for(2, FailureKind::Network, None);
            assert!(delay <= raw);
        }
    }

    #[test]
    fn equal_jitter_keeps_at_least_half_the_delay() {
        let policy = BackoffConfig {
            jitter: JitterMode::Equal,
            ..BackoffConfig::default()
        };
        let raw = policy.raw_delay(2, FailureKind::Network);
        for _ in 0..200 {
            let delay = policy.delay_for(2, FailureKind::Network, None);
            assert!(delay >= raw / 2 && delay <= raw);
        }
    }

    #[test]
    fn decorrelated_jitter_respects_the_cap() {
        let policy = BackoffConfig {
            jitter: JitterMode::Decorrelated,
            ..BackoffConfig::default()
        };
        for _ in 0..200 {
            let delay = policy.delay_for(4, FailureKind::Network, Some(policy.max_delay));
            assert!(delay <= policy.max_delay);
            assert!(delay >= policy.initial_delay);
        }
    }

    #[test]
    fn retry_after_hint_extends_the_computed_delay() {
        let engine = engine(no_jitter_policy());
        let failure = FetchFailure::from_status(429, "slow down")
            .with_retry_after(Some(Duration::from_secs(45)));
        match engine.evaluate("example.com", 1, &failure, None) {
            RetryDecision::Retry { delay } => assert_eq!(delay, Duration::from_secs(45)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn parses_retry_after_seconds_and_dates() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("not a date"), None);

        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed > Duration::from_secs(80) && parsed <= Duration::from_secs(90));
    }
}
