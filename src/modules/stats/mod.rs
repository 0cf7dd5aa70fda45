//! Fetch statistics.
//!
//! Aggregates per-strategy and per-domain counters with latency
//! percentiles. The collector is the write side; serializable
//! snapshot slices are the read side, exposed through the fetcher
//! together with the proxy and breaker views.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::modules::breaker::BreakerView;
use crate::modules::identity::RotationMode;
use crate::modules::proxy::PoolSummary;
use crate::modules::retry::RetryAttempt;

/// Aggregated counters across every domain and strategy.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalSlice {
    pub started_at: DateTime<Utc>,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancelled: u64,
}

impl Default for GlobalSlice {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            requests: 0,
            successes: 0,
            failures: 0,
            cancelled: 0,
        }
    }
}

/// Per-strategy attempt counters and latency percentiles.
#[derive(Debug, Clone, Serialize)]
pub struct StrategySlice {
    pub strategy: String,
    pub attempts: u64,
    pub successes: u64,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
}

/// Per-domain attempt and retry counters.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSlice {
    pub domain: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub avg_retry_delay_ms: Option<f64>,
    /// Failure-kind name -> occurrences.
    pub failure_kinds: HashMap<String, u64>,
    pub breaker_transitions: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub global: GlobalSlice,
    pub strategies: Vec<StrategySlice>,
    pub domains: Vec<DomainSlice>,
}

/// Identity rotator usage counters.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySlice {
    pub profiles: usize,
    pub mode: RotationMode,
    pub serve_counts: Vec<(String, u64)>,
}

/// Full observability snapshot: retry counters plus the current breaker,
/// proxy-pool and identity state at the moment of the call.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub global: GlobalSlice,
    pub strategies: Vec<StrategySlice>,
    pub domains: Vec<DomainSlice>,
    pub breakers: HashMap<String, BreakerView>,
    pub pool: PoolSummary,
    pub identity: IdentitySlice,
}

#[derive(Debug)]
struct StrategyAccumulator {
    attempts: u64,
    successes: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl StrategyAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        }
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<f64>, Option<f64>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (
            Some(avg * 1000.0),
            Some(samples[p95_index].as_secs_f64() * 1000.0),
        )
    }

    fn slice(&self, strategy: &str) -> StrategySlice {
        let (avg, p95) = self.latency_stats();
        StrategySlice {
            strategy: strategy.to_string(),
            attempts: self.attempts,
            successes: self.successes,
            avg_latency_ms: avg,
            p95_latency_ms: p95,
        }
    }
}

#[derive(Debug, Default)]
struct DomainAccumulator {
    attempts: u64,
    successes: u64,
    failures: u64,
    retries: u64,
    total_retry_delay: Duration,
    failure_kinds: HashMap<String, u64>,
    breaker_transitions: u64,
    last_failure_at: Option<DateTime<Utc>>,
    recent_attempts: VecDeque<RetryAttempt>,
}

const RECENT_ATTEMPT_LIMIT: usize = 32;

impl DomainAccumulator {
    fn slice(&self, domain: &str) -> DomainSlice {
        let avg_retry_delay_ms = (self.retries > 0)
            .then(|| self.total_retry_delay.as_secs_f64() * 1000.0 / self.retries as f64);
        DomainSlice {
            domain: domain.to_string(),
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            retries: self.retries,
            avg_retry_delay_ms,
            failure_kinds: self.failure_kinds.clone(),
            breaker_transitions: self.breaker_transitions,
            last_failure_at: self.last_failure_at,
        }
    }
}

#[derive(Debug)]
struct StatsState {
    global: GlobalSlice,
    max_window: usize,
    strategies: HashMap<String, StrategyAccumulator>,
    domains: HashMap<String, DomainAccumulator>,
}

impl StatsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalSlice::default(),
            max_window,
            strategies: HashMap::new(),
            domains: HashMap::new(),
        }
    }

    fn strategy_mut(&mut self, strategy: &str) -> &mut StrategyAccumulator {
        self.strategies
            .entry(strategy.to_string())
            .or_insert_with(|| StrategyAccumulator::new(self.max_window))
    }

    fn domain_mut(&mut self, domain: &str) -> &mut DomainAccumulator {
        self.domains.entry(domain.to_string()).or_default()
    }
}

/// Thread-safe collector used by the orchestration loop.
#[derive(Clone, Debug)]
pub struct FetchStats {
    inner: Arc<Mutex<StatsState>>,
}

impl FetchStats {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsState::new(window.max(16)))),
        }
    }

    /// One strategy attempt against one domain.
    pub fn record_attempt(&self, strategy: &str, domain: &str, success: bool, latency: Duration) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.strategy_mut(strategy).record(success, latency);
        let acc = guard.domain_mut(domain);
        acc.attempts += 1;
        if success {
            acc.successes += 1;
        } else {
            acc.failures += 1;
            acc.last_failure_at = Some(Utc::now());
        }
    }

    /// A scheduled retry, recorded against the domain it waits on.
    pub fn record_retry(&self, domain: &str, attempt: &RetryAttempt) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        let acc = guard.domain_mut(domain);
        acc.retries += 1;
        acc.total_retry_delay += attempt.delay;
        *acc.failure_kinds
            .entry(attempt.kind.as_str().to_string())
            .or_insert(0) += 1;
        if acc.recent_attempts.len() == RECENT_ATTEMPT_LIMIT {
            acc.recent_attempts.pop_front();
        }
        acc.recent_attempts.push_back(attempt.clone());
    }

    pub fn record_breaker_transition(&self, domain: &str) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.domain_mut(domain).breaker_transitions += 1;
    }

    /// Terminal outcome of one `fetch` call.
    pub fn record_completion(&self, success: bool, cancelled: bool) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.global.requests += 1;
        if cancelled {
            guard.global.cancelled += 1;
            guard.global.failures += 1;
        } else if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }
    }

    /// Recent retry attempts for a domain, oldest first.
    pub fn recent_attempts(&self, domain: &str) -> Vec<RetryAttempt> {
        let guard = self.inner.lock().expect("stats lock poisoned");
        guard
            .domains
            .get(domain)
            .map(|acc| acc.recent_attempts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn report(&self) -> StatsReport {
        let guard = self.inner.lock().expect("stats lock poisoned");
        let mut strategies: Vec<StrategySlice> = guard
            .strategies
            .iter()
            .map(|(name, acc)| acc.slice(name))
            .collect();
        strategies.sort_by(|a, b| a.strategy.cmp(&b.strategy));
        let mut domains: Vec<DomainSlice> = guard
            .domains
            .iter()
            .map(|(domain, acc)| acc.slice(domain))
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        StatsReport {
            global: guard.global.clone(),
            strategies,
            domains,
        }
    }
}

impl Default for FetchStats {
    fn default() -> Self {
        Self::new()
    }
}
