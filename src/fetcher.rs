//! High level fetch orchestration.
//!
//! Wires the identity rotator, proxy pool, retry engine, breaker
//! registry and the strategy ladder into one façade. A fetch walks the
//! ladder cheapest-first; within a rung the retry engine schedules
//! attempts, and classified failures decide whether to retry the rung,
//! escalate past it, or abort the whole fetch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use http::HeaderMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use url::Url;

use crate::config::{ConfigError, FetcherConfig};
use crate::extract::Table;
use crate::modules::breaker::{Admission, BreakerRegistry, BreakerState};
use crate::modules::events::{
    AttemptOutcomeEvent, AttemptStartedEvent, BreakerTransitionEvent, EventDispatcher,
    EventHandler, FetchCompletedEvent, FetchEvent, LoggingHandler, ProxySidelinedEvent,
    RequestStartedEvent, RetryScheduledEvent,
};
use crate::modules::identity::{IdentityError, IdentityProfile, IdentityRotator};
use crate::modules::proxy::{PoolSummary, ProxyPool, ProxySource};
use crate::modules::retry::{
    FailureKind, FetchFailure, GiveUpReason, RetryAttempt, RetryDecision, RetryEngine,
};
use crate::modules::stats::{FetchStats, IdentitySlice, StatsReport, StatsSnapshot};
use crate::strategies::{FetchStrategy, StrategyRequest, StrategyResponse, build_ladder};

/// Errors raised before any network attempt is made. Failures during
/// fetching are reported inside [`FetchResult`] instead.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("URL '{url}' has no host to key retries and breakers on")]
    MissingHost { url: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Extracted content of a successfully fetched page.
#[derive(Debug, Clone)]
pub struct FetchPayload {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub text: String,
    pub tables: Vec<Table>,
    pub links: Vec<String>,
    pub title: Option<String>,
}

/// How the fetch was performed, for logs and debugging.
#[derive(Debug, Clone)]
pub struct FetchMeta {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub strategies_attempted: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of one fetch. `success == false` carries the aggregated
/// error instead of a payload; both shapes come back as `Ok` from
/// [`Fetcher::fetch`] so callers always see what happened.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub final_url: Option<String>,
    pub success: bool,
    pub status: Option<u16>,
    /// The rung that produced the payload.
    pub strategy: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub cancelled: bool,
    pub error: Option<String>,
    pub payload: Option<FetchPayload>,
    pub meta: FetchMeta,
}

/// Per-call knobs. The zero value means: any region, no table
/// requirement, no cancellation.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Only draw proxies tagged with this region.
    pub region: Option<String>,
    /// Treat a page without extracted tables as a failed attempt, so
    /// the ladder escalates to heavier rungs.
    pub require_tables: bool,
    /// Cooperative cancellation; flip the sender to `true` to stop.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl FetchOptions {
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn require_tables(mut self) -> Self {
        self.require_tables = true;
        self
    }

    pub fn cancel_on(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cancel = Some(signal);
        self
    }
}

/// Fluent builder for [`Fetcher`].
#[derive(Default)]
pub struct FetcherBuilder {
    config: FetcherConfig,
    identities: Option<Vec<IdentityProfile>>,
    identities_file: Option<PathBuf>,
    proxy_lists: Vec<(Vec<String>, Option<String>)>,
    strategies: Option<Vec<Arc<dyn FetchStrategy>>>,
    handlers: Vec<Arc<dyn EventHandler>>,
    stats_window: Option<usize>,
}

impl FetcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: FetcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the escalation order of the built-in ladder.
    pub fn strategy_order(mut self, order: Vec<crate::strategies::StrategyKind>) -> Self {
        self.config.strategy_order = order;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn browser_timeout(mut self, timeout: Duration) -> Self {
        self.config.browser_timeout = timeout;
        self
    }

    pub fn rotation_mode(mut self, mode: crate::modules::identity::RotationMode) -> Self {
        self.config.rotation_mode = mode;
        self
    }

    pub fn with_backoff(mut self, backoff: crate::modules::retry::BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn with_breaker(mut self, breaker: crate::modules::breaker::BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn with_proxy_config(mut self, pool: crate::modules::proxy::PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Identity profiles to rotate through instead of the built-in pool.
    pub fn with_identities(mut self, profiles: Vec<IdentityProfile>) -> Self {
        self.identities = Some(profiles);
        self
    }

    /// Loads identity profiles from a JSON array document at build time.
    /// Ignored when `with_identities` was also called.
    pub fn identities_from_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identities_file = Some(path.into());
        self
    }

    /// Static proxy entries (`host:port`, `host:port:user:pass` or URL
    /// form). Remote lists load after build via [`Fetcher::load_proxies`].
    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxy_lists
            .push((proxies.into_iter().map(Into::into).collect(), None));
        self
    }

    /// Static proxy entries tagged with a region, selectable through
    /// [`FetchOptions::region`].
    pub fn with_tagged_proxies<I, S>(mut self, proxies: I, region: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxy_lists.push((
            proxies.into_iter().map(Into::into).collect(),
            Some(region.into()),
        ));
        self
    }

    /// Replaces the built-in ladder entirely. Order is escalation order.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn register_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Samples kept per strategy for latency percentiles.
    pub fn stats_window(mut self, window: usize) -> Self {
        self.stats_window = Some(window);
        self
    }

    pub fn build(self) -> Result<Fetcher, FetchError> {
        self.config.validate()?;
        if let Some(strategies) = &self.strategies
            && strategies.is_empty()
        {
            return Err(FetchError::Config(ConfigError::EmptyStrategyOrder));
        }

        let identities = match (self.identities, self.identities_file) {
            (Some(profiles), _) => {
                IdentityRotator::from_profiles(profiles, self.config.rotation_mode)
            }
            (None, Some(path)) => IdentityRotator::load_json(&path, self.config.rotation_mode)?,
            (None, None) => IdentityRotator::with_defaults(self.config.rotation_mode),
        };

        let breakers = BreakerRegistry::new(self.config.breaker.clone());
        let retry = RetryEngine::new(self.config.backoff.clone(), breakers.clone());

        let pool = Arc::new(ProxyPool::new(self.config.pool.clone()));
        for (entries, region) in &self.proxy_lists {
            pool.add_entries(entries.iter().map(String::as_str), region.as_deref());
        }

        let strategies = self.strategies.unwrap_or_else(|| {
            build_ladder(&self.config.strategy_order, self.config.browser_timeout)
        });

        let stats = match self.stats_window {
            Some(window) => FetchStats::with_window(window),
            None => FetchStats::new(),
        };

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        for handler in self.handlers {
            events.register_handler(handler);
        }

        Ok(Fetcher {
            inner: Arc::new(FetcherInner {
                config: self.config,
                strategies,
                identities,
                pool,
                retry,
                breakers,
                stats,
                events,
            }),
        })
    }
}

struct FetcherInner {
    config: FetcherConfig,
    strategies: Vec<Arc<dyn FetchStrategy>>,
    identities: IdentityRotator,
    pool: Arc<ProxyPool>,
    retry: RetryEngine,
    breakers: BreakerRegistry,
    stats: FetchStats,
    events: EventDispatcher,
}

/// The fetching façade. Cheap to clone; clones share every subsystem.
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

impl Fetcher {
    /// A fetcher with default configuration and the full ladder.
    pub fn new() -> Result<Self, FetchError> {
        Self::builder().build()
    }

    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::new()
    }

    /// Fetches one URL with default options.
    pub async fn fetch(&self, url: &str) -> Result<FetchResult, FetchError> {
        self.fetch_with(url, FetchOptions::default()).await
    }

    /// Fetches every URL with at most `concurrency` in flight. Results
    /// come back in input order.
    pub async fn fetch_many<I, S>(
        &self,
        urls: I,
        concurrency: usize,
    ) -> Vec<Result<FetchResult, FetchError>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: Vec<String> = urls.into_iter().map(Into::into).collect();
        stream::iter(targets.into_iter().map(|url| {
            let fetcher = self.clone();
            async move { fetcher.fetch(&url).await }
        }))
        .buffered(concurrency.max(1))
        .collect()
        .await
    }

    /// Merges proxy sources into the pool; remote lists are fetched here.
    pub async fn load_proxies(&self, sources: &[ProxySource]) -> usize {
        self.inner.pool.load(sources).await
    }

    /// Probes every proxy immediately instead of waiting for the next
    /// scheduled pass.
    pub async fn check_proxy_health(&self) {
        self.inner.pool.health_check_all().await
    }

    /// Composes the retry counters with the current breaker, proxy-pool
    /// and identity state into one snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        let StatsReport {
            global,
            strategies,
            domains,
        } = self.inner.stats.report();
        StatsSnapshot {
            global,
            strategies,
            domains,
            breakers: self.inner.breakers.views(),
            pool: self.inner.pool.summary(),
            identity: IdentitySlice {
                profiles: self.inner.identities.len(),
                mode: self.inner.identities.mode(),
                serve_counts: self.inner.identities.serve_counts(),
            },
        }
    }

    pub fn proxy_summary(&self) -> PoolSummary {
        self.inner.pool.summary()
    }

    pub fn breaker_state(&self, domain: &str) -> BreakerState {
        self.inner.breakers.state(domain)
    }

    /// Fetches one URL, walking the strategy ladder until a rung
    /// succeeds, every rung has given up, or the breaker or caller
    /// stops the fetch.
    pub async fn fetch_with(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchResult, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let domain = parsed
            .host_str()
            .ok_or_else(|| FetchError::MissingHost {
                url: url.to_string(),
            })?
            .to_string();

        let inner = &self.inner;
        let started = Instant::now();
        inner
            .events
            .dispatch(FetchEvent::RequestStarted(RequestStartedEvent {
                url: parsed.clone(),
                timestamp: Utc::now(),
            }));

        let mut ladder_failures: Vec<(&'static str, FetchFailure)> = Vec::new();
        let mut strategies_attempted: Vec<String> = Vec::new();
        let mut total_attempts = 0u32;
        let mut cancelled = false;
        let mut abort_reason: Option<String> = None;
        let mut last_identity: Option<Arc<IdentityProfile>> = None;
        let mut last_proxy: Option<String> = None;

        'ladder: for strategy in &inner.strategies {
            strategies_attempted.push(strategy.name().to_string());
            let mut attempt = 0u32;
            let mut previous_delay: Option<Duration> = None;

            loop {
                if is_cancelled(options.cancel.as_ref()) {
                    cancelled = true;
                    break 'ladder;
                }

                match inner.breakers.allow_request(&domain) {
                    Admission::Allowed => {}
                    Admission::AllowedAsProbe(transition) => {
                        inner.stats.record_breaker_transition(&domain);
                        inner
                            .events
                            .dispatch(FetchEvent::BreakerTransition(BreakerTransitionEvent {
                                domain: domain.clone(),
                                from: transition.from,
                                to: transition.to,
                                timestamp: Utc::now(),
                            }));
                    }
                    Admission::Denied => {
                        let message = format!("circuit breaker open for {domain}");
                        ladder_failures
                            .push((strategy.name(), FetchFailure::new(FailureKind::Forbidden, &message)));
                        abort_reason = Some(message);
                        break 'ladder;
                    }
                }

                attempt += 1;
                total_attempts += 1;

                let identity = inner.identities.next_identity();
                let proxy = inner.pool.acquire(options.region.as_deref()).await;
                let proxy_label = proxy.as_ref().map(|record| record.endpoint().label());
                last_identity = Some(Arc::clone(&identity));
                last_proxy = proxy_label.clone();

                let budget = strategy.attempt_timeout(inner.config.request_timeout);
                let request = StrategyRequest {
                    url: parsed.clone(),
                    identity,
                    proxy: proxy.clone(),
                    timeout: budget,
                };

                inner
                    .events
                    .dispatch(FetchEvent::AttemptStarted(AttemptStartedEvent {
                        url: parsed.clone(),
                        strategy: strategy.name().to_string(),
                        attempt,
                        proxy: proxy_label.clone(),
                        timestamp: Utc::now(),
                    }));

                let attempt_started = Instant::now();
                let outcome = match run_attempt(
                    strategy.as_ref(),
                    &request,
                    budget,
                    options.cancel.clone(),
                )
                .await
                {
                    Some(outcome) => outcome,
                    None => {
                        cancelled = true;
                        break 'ladder;
                    }
                };
                let latency = attempt_started.elapsed();

                let failure = match outcome {
                    Ok(response) => {
                        // The origin answered: transport and domain both
                        // earn success credit even if the payload is
                        // rejected below.
                        if let Some(record) = proxy.as_ref() {
                            inner.pool.report_outcome(
                                record,
                                true,
                                Some(response.status),
                                Some(latency),
                            );
                        }
                        if let Some(transition) = inner.breakers.record_success(&domain) {
                            inner.stats.record_breaker_transition(&domain);
                            inner.events.dispatch(FetchEvent::BreakerTransition(
                                BreakerTransitionEvent {
                                    domain: domain.clone(),
                                    from: transition.from,
                                    to: transition.to,
                                    timestamp: Utc::now(),
                                },
                            ));
                        }

                        if options.require_tables && response.tables.is_empty() {
                            FetchFailure::new(
                                FailureKind::Unknown,
                                format!("{} produced no tables", strategy.name()),
                            )
                        } else {
                            let elapsed = started.elapsed();
                            inner
                                .stats
                                .record_attempt(strategy.name(), &domain, true, latency);
                            inner
                                .events
                                .dispatch(FetchEvent::AttemptOutcome(AttemptOutcomeEvent {
                                    url: parsed.clone(),
                                    strategy: strategy.name().to_string(),
                                    attempt,
                                    success: true,
                                    status: Some(response.status),
                                    latency,
                                    error: None,
                                    timestamp: Utc::now(),
                                }));
                            inner.stats.record_completion(true, false);
                            inner
                                .events
                                .dispatch(FetchEvent::FetchCompleted(FetchCompletedEvent {
                                    url: parsed.clone(),
                                    success: true,
                                    strategy: Some(strategy.name().to_string()),
                                    attempts: total_attempts,
                                    elapsed,
                                    timestamp: Utc::now(),
                                }));

                            let StrategyResponse {
                                final_url,
                                status,
                                headers,
                                body,
                                text,
                                tables,
                                links,
                                title,
                            } = response;
                            return Ok(FetchResult {
                                url: url.to_string(),
                                final_url: Some(final_url),
                                success: true,
                                status: Some(status),
                                strategy: Some(strategy.name().to_string()),
                                attempts: total_attempts,
                                elapsed,
                                cancelled: false,
                                error: None,
                                payload: Some(FetchPayload {
                                    headers,
                                    body,
                                    text,
                                    tables,
                                    links,
                                    title,
                                }),
                                meta: FetchMeta {
                                    user_agent: Some(request.identity.user_agent.clone()),
                                    proxy: proxy_label,
                                    strategies_attempted,
                                    fetched_at: Utc::now(),
                                },
                            });
                        }
                    }
                    Err(failure) => {
                        if let Some(record) = proxy.as_ref() {
                            let effect = inner.pool.report_outcome(
                                record,
                                false,
                                failure.status,
                                Some(latency),
                            );
                            if effect.blocked_until.is_some() || effect.went_unhealthy {
                                inner.events.dispatch(FetchEvent::ProxySidelined(
                                    ProxySidelinedEvent {
                                        endpoint: record.endpoint().label(),
                                        status: failure.status,
                                        blocked_until: effect.blocked_until,
                                        went_unhealthy: effect.went_unhealthy,
                                        timestamp: Utc::now(),
                                    },
                                ));
                            }
                        }
                        if let Some(transition) = inner.breakers.record_failure(&domain) {
                            inner.stats.record_breaker_transition(&domain);
                            inner.events.dispatch(FetchEvent::BreakerTransition(
                                BreakerTransitionEvent {
                                    domain: domain.clone(),
                                    from: transition.from,
                                    to: transition.to,
                                    timestamp: Utc::now(),
                                },
                            ));
                        }
                        failure
                    }
                };

                inner
                    .stats
                    .record_attempt(strategy.name(), &domain, false, latency);
                inner
                    .events
                    .dispatch(FetchEvent::AttemptOutcome(AttemptOutcomeEvent {
                        url: parsed.clone(),
                        strategy: strategy.name().to_string(),
                        attempt,
                        success: false,
                        status: failure.status,
                        latency,
                        error: Some(failure.to_string()),
                        timestamp: Utc::now(),
                    }));

                match inner.retry.evaluate(&domain, attempt, &failure, previous_delay) {
                    RetryDecision::Retry { delay } => {
                        let record = RetryAttempt {
                            attempt,
                            kind: failure.kind,
                            status: failure.status,
                            delay,
                            at: Utc::now(),
                        };
                        inner.stats.record_retry(&domain, &record);
                        inner
                            .events
                            .dispatch(FetchEvent::RetryScheduled(RetryScheduledEvent {
                                domain: domain.clone(),
                                strategy: strategy.name().to_string(),
                                attempt,
                                kind: failure.kind,
                                delay,
                                timestamp: Utc::now(),
                            }));
                        previous_delay = Some(delay);
                        if !sleep_or_cancel(delay, options.cancel.clone()).await {
                            ladder_failures.push((strategy.name(), failure));
                            cancelled = true;
                            break 'ladder;
                        }
                    }
                    RetryDecision::GiveUp { reason } => {
                        log::debug!("{} giving up on {url}: {reason}", strategy.name());
                        ladder_failures.push((strategy.name(), failure));
                        match reason {
                            GiveUpReason::NonRetryableStatus(_) | GiveUpReason::BreakerOpen => {
                                abort_reason = Some(reason.to_string());
                                break 'ladder;
                            }
                            _ => break,
                        }
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        let error = if cancelled {
            "fetch cancelled by caller".to_string()
        } else if let Some(reason) = abort_reason {
            match ladder_failures.last() {
                Some((name, failure)) => format!("{name}: {failure} ({reason})"),
                None => reason,
            }
        } else {
            let parts: Vec<String> = ladder_failures
                .iter()
                .map(|(name, failure)| format!("{name}: {failure}"))
                .collect();
            format!("all strategies failed: {}", parts.join("; "))
        };
        let status = ladder_failures.last().and_then(|(_, failure)| failure.status);

        inner.stats.record_completion(false, cancelled);
        inner
            .events
            .dispatch(FetchEvent::FetchCompleted(FetchCompletedEvent {
                url: parsed.clone(),
                success: false,
                strategy: None,
                attempts: total_attempts,
                elapsed,
                timestamp: Utc::now(),
            }));

        Ok(FetchResult {
            url: url.to_string(),
            final_url: None,
            success: false,
            status,
            strategy: None,
            attempts: total_attempts,
            elapsed,
            cancelled,
            error: Some(error),
            payload: None,
            meta: FetchMeta {
                user_agent: last_identity.map(|identity| identity.user_agent.clone()),
                proxy: last_proxy,
                strategies_attempted,
                fetched_at: Utc::now(),
            },
        })
    }
}

/// Runs one attempt under its budget. `None` means the caller's cancel
/// signal fired mid-attempt.
async fn run_attempt(
    strategy: &dyn FetchStrategy,
    request: &StrategyRequest,
    budget: Duration,
    cancel: Option<watch::Receiver<bool>>,
) -> Option<Result<StrategyResponse, FetchFailure>> {
    // The hard stop sits slightly beyond the budget so a strategy's own
    // finer-grained timeout error wins when both fire.
    let hard_stop = budget + Duration::from_secs(1);
    let work = async {
        match timeout(hard_stop, strategy.attempt(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchFailure::timeout(budget)),
        }
    };
    match cancel {
        Some(signal) => {
            tokio::select! {
                outcome = work => Some(outcome),
                _ = wait_for_cancel(signal) => None,
            }
        }
        None => Some(work.await),
    }
}

fn is_cancelled(cancel: Option<&watch::Receiver<bool>>) -> bool {
    cancel.map(|signal| *signal.borrow()).unwrap_or(false)
}

async fn wait_for_cancel(mut signal: watch::Receiver<bool>) {
    loop {
        if *signal.borrow() {
            return;
        }
        if signal.changed().await.is_err() {
            // Sender dropped without cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps for `delay` unless the cancel signal fires first. Returns
/// `false` when cancelled.
async fn sleep_or_cancel(delay: Duration, cancel: Option<watch::Receiver<bool>>) -> bool {
    match cancel {
        Some(signal) => {
            tokio::select! {
                _ = sleep(delay) => true,
                _ = wait_for_cancel(signal) => false,
            }
        }
        None => {
            sleep(delay).await;
            true
        }
    }
}
