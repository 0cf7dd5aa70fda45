//! Per-domain circuit breaking.
//!
//! Closed until a domain fails `failure_threshold` times in a row, then
//! open: requests short-circuit without touching the network. After
//! `timeout_duration` the next caller flips the breaker to half-open and
//! probes; `success_threshold` consecutive successes close it again, any
//! failure reopens it. Transitions happen on use, there is no background
//! timer.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker blocks before allowing a probe.
    pub timeout_duration: Duration,
    /// Consecutive successes that close a half-open breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_duration: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// A state change produced by recording an outcome or admitting a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
}

/// Outcome of asking the breaker to admit a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed.
    Allowed,
    /// Request may proceed; this call flipped the breaker half-open.
    AllowedAsProbe(BreakerTransition),
    /// Short-circuit without a network attempt.
    Denied,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    transitions: u64,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            transitions: 0,
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Whether a request may proceed right now. An open breaker whose
    /// window has elapsed flips to half-open and admits the caller as
    /// the probe.
    pub fn allow_request(&mut self) -> Admission {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.timeout_duration {
                    self.consecutive_successes = 0;
                    Admission::AllowedAsProbe(self.transition_to(BreakerState::HalfOpen))
                } else {
                    Admission::Denied
                }
            }
        }
    }

    /// Non-mutating form of `allow_request`: true when a request issued
    /// right now would be admitted (including as the half-open probe).
    pub fn would_allow(&self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => self
                .opened_at
                .map(|at| at.elapsed() >= self.config.timeout_duration)
                .unwrap_or(true),
        }
    }

    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        self.consecutive_failures = 0;
        match self.state {
            BreakerState::HalfOpen => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                if self.consecutive_successes >= self.config.success_threshold {
                    return Some(self.transition_to(BreakerState::Closed));
                }
                None
            }
            _ => None,
        }
    }

    pub fn record_failure(&mut self) -> Option<BreakerTransition> {
        self.consecutive_successes = 0;
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    return Some(self.trip());
                }
                None
            }
            BreakerState::HalfOpen => Some(self.trip()),
            BreakerState::Open => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                None
            }
        }
    }

    fn trip(&mut self) -> BreakerTransition {
        self.opened_at = Some(Instant::now());
        self.transition_to(BreakerState::Open)
    }

    fn transition_to(&mut self, next: BreakerState) -> BreakerTransition {
        let from = self.state;
        self.state = next;
        self.transitions = self.transitions.saturating_add(1);
        BreakerTransition { from, to: next }
    }
}

/// Point-in-time view of one domain's breaker for the statistics surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerView {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub transitions: u64,
}

/// Thread-safe registry of breakers keyed by domain. The lock is held
/// only for the transition itself, never across awaits.
#[derive(Clone, Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn allow_request(&self, domain: &str) -> Admission {
        self.with_breaker(domain, |breaker| breaker.allow_request())
            .unwrap_or(Admission::Allowed)
    }

    pub fn record_success(&self, domain: &str) -> Option<BreakerTransition> {
        self.with_breaker(domain, |breaker| breaker.record_success())
            .flatten()
    }

    pub fn record_failure(&self, domain: &str) -> Option<BreakerTransition> {
        let transition = self
            .with_breaker(domain, |breaker| breaker.record_failure())
            .flatten();
        if let Some(t) = transition
            && t.to == BreakerState::Open
        {
            log::warn!("circuit breaker opened for {domain}");
        }
        transition
    }

    pub fn state(&self, domain: &str) -> BreakerState {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(domain).map(|b| b.state()))
            .unwrap_or(BreakerState::Closed)
    }

    /// Read-only admission check; never transitions.
    pub fn would_allow(&self, domain: &str) -> bool {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(domain).map(|b| b.would_allow()))
            .unwrap_or(true)
    }

    pub fn views(&self) -> HashMap<String, BreakerView> {
        match self.inner.read() {
            Ok(map) => map
                .iter()
                .map(|(domain, breaker)| {
                    (
                        domain.clone(),
                        BreakerView {
                            state: breaker.state(),
                            consecutive_failures: breaker.consecutive_failures,
                            transitions: breaker.transitions,
                        },
                    )
                })
                .collect(),
            Err(_) => HashMap::new(),
        }
    }

    fn with_breaker<T>(&self, domain: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> Option<T> {
        let mut guard = self.inner.write().ok()?;
        let breaker = guard
            .entry(domain.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        Some(f(breaker))
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            timeout_duration: Duration::from_millis(30),
            success_threshold: 2,
        }
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(fast_config());
        assert!(breaker.record_failure().is_none());
        assert!(breaker.record_failure().is_none());
        let transition = breaker.record_failure().unwrap();
        assert_eq!(transition.to, BreakerState::Open);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn short_circuits_while_open_then_probes_after_timeout() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.allow_request(), Admission::Denied);

        std::thread::sleep(Duration::from_millis(40));
        match breaker.allow_request() {
            Admission::AllowedAsProbe(transition) => {
                assert_eq!(transition.from, BreakerState::Open);
                assert_eq!(transition.to, BreakerState::HalfOpen);
            }
            other => panic!("expected half-open probe, got {other:?}"),
        }
    }

    #[test]
    fn closes_after_enough_half_open_successes() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        breaker.allow_request();

        assert!(breaker.record_success().is_none());
        let transition = breaker.record_success().unwrap();
        assert_eq!(transition.to, BreakerState::Closed);
    }

    #[test]
    fn failure_while_half_open_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        breaker.allow_request();
        breaker.record_success();

        let transition = breaker.record_failure().unwrap();
        assert_eq!(transition.from, BreakerState::HalfOpen);
        assert_eq!(transition.to, BreakerState::Open);
        assert_eq!(breaker.allow_request(), Admission::Denied);
    }

    #[test]
    fn registry_isolates_domains() {
        let registry = BreakerRegistry::new(fast_config());
        for _ in 0..3 {
            registry.record_failure("a.example");
        }
        assert_eq!(registry.allow_request("a.example"), Admission::Denied);
        assert!(registry.allow_request("b.example").is_allowed());
        assert_eq!(registry.state("b.example"), BreakerState::Closed);
    }
}
