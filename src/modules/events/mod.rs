//! Event hooks around the fetch lifecycle.
//!
//! Every significant step of a fetch (attempts, retries, breaker and
//! proxy transitions, completion) is broadcast to registered handlers,
//! so callers can wire their own telemetry without patching the
//! orchestration loop.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::modules::breaker::BreakerState;
use crate::modules::retry::FailureKind;

/// Structured fetch-started event.
#[derive(Debug, Clone)]
pub struct RequestStartedEvent {
    pub url: Url,
    pub timestamp: DateTime<Utc>,
}

/// One strategy attempt is about to run.
#[derive(Debug, Clone)]
pub struct AttemptStartedEvent {
    pub url: Url,
    pub strategy: String,
    pub attempt: u32,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One strategy attempt finished, either way.
#[derive(Debug, Clone)]
pub struct AttemptOutcomeEvent {
    pub url: Url,
    pub strategy: String,
    pub attempt: u32,
    pub success: bool,
    pub status: Option<u16>,
    pub latency: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The retry engine scheduled another attempt after a delay.
#[derive(Debug, Clone)]
pub struct RetryScheduledEvent {
    pub domain: String,
    pub strategy: String,
    pub attempt: u32,
    pub kind: FailureKind,
    pub delay: Duration,
    pub timestamp: DateTime<Utc>,
}

/// A domain's circuit breaker changed state.
#[derive(Debug, Clone)]
pub struct BreakerTransitionEvent {
    pub domain: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub timestamp: DateTime<Utc>,
}

/// A proxy record was put on cooldown or parked as unhealthy.
#[derive(Debug, Clone)]
pub struct ProxySidelinedEvent {
    pub endpoint: String,
    pub status: Option<u16>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub went_unhealthy: bool,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of one fetch call.
#[derive(Debug, Clone)]
pub struct FetchCompletedEvent {
    pub url: Url,
    pub success: bool,
    pub strategy: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FetchEvent {
    RequestStarted(RequestStartedEvent),
    AttemptStarted(AttemptStartedEvent),
    AttemptOutcome(AttemptOutcomeEvent),
    RetryScheduled(RetryScheduledEvent),
    BreakerTransition(BreakerTransitionEvent),
    ProxySidelined(ProxySidelinedEvent),
    FetchCompleted(FetchCompletedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &FetchEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: FetchEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &FetchEvent) {
        match event {
            FetchEvent::RequestStarted(started) => {
                log::debug!("-> fetch {}", started.url);
            }
            FetchEvent::AttemptStarted(attempt) => {
                log::debug!(
                    "-> {} attempt {} via {} for {}",
                    attempt.strategy,
                    attempt.attempt,
                    attempt.proxy.as_deref().unwrap_or("direct"),
                    attempt.url
                );
            }
            FetchEvent::AttemptOutcome(outcome) => {
                if outcome.success {
                    log::debug!(
                        "<- {} attempt {} -> {} ({:.2}s)",
                        outcome.strategy,
                        outcome.attempt,
                        outcome.status.unwrap_or(0),
                        outcome.latency.as_secs_f64()
                    );
                } else {
                    log::info!(
                        "<- {} attempt {} failed for {}: {}",
                        outcome.strategy,
                        outcome.attempt,
                        outcome.url,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            FetchEvent::RetryScheduled(retry) => {
                log::info!(
                    "retry {} ({}) attempt {} after {:.2}s",
                    retry.domain,
                    retry.kind.as_str(),
                    retry.attempt,
                    retry.delay.as_secs_f64()
                );
            }
            FetchEvent::BreakerTransition(transition) => {
                log::info!(
                    "breaker {} {:?} -> {:?}",
                    transition.domain,
                    transition.from,
                    transition.to
                );
            }
            FetchEvent::ProxySidelined(sidelined) => {
                log::info!(
                    "proxy {} sidelined (status {:?}, unhealthy={})",
                    sidelined.endpoint,
                    sidelined.status,
                    sidelined.went_unhealthy
                );
            }
            FetchEvent::FetchCompleted(completed) => {
                log::info!(
                    "fetch {} {} via {} after {} attempts ({:.2}s)",
                    completed.url,
                    if completed.success { "ok" } else { "failed" },
                    completed.strategy.as_deref().unwrap_or("none"),
                    completed.attempts,
                    completed.elapsed.as_secs_f64()
                );
            }
        }
    }
}
