//! End-to-end tests of the strategy ladder: escalation order, retry
//! behavior within a rung, exhaustion reporting, circuit breaking and
//! cancellation, all against a local mock server or injected strategies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hardfetch::modules::retry::{BackoffConfig, JitterMode};
use hardfetch::{
    BreakerConfig, BreakerState, FailureKind, FetchFailure, FetchOptions, FetchStrategy, Fetcher,
    StrategyKind, StrategyRequest, StrategyResponse,
};

/// Injected rung that fails or succeeds on demand and counts its calls.
struct ScriptedRung {
    name: &'static str,
    succeed: bool,
    calls: AtomicU32,
}

impl ScriptedRung {
    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            succeed: false,
            calls: AtomicU32::new(0),
        })
    }

    fn succeeding(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            succeed: true,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FetchStrategy for ScriptedRung {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self, request: &StrategyRequest) -> Result<StrategyResponse, FetchFailure> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.succeed {
            let text = "<html><title>ok</title></html>".to_string();
            Ok(StrategyResponse {
                final_url: request.url.to_string(),
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::from(text.clone()),
                text,
                tables: Vec::new(),
                links: Vec::new(),
                title: Some("ok".into()),
            })
        } else {
            Err(FetchFailure::new(
                FailureKind::Network,
                format!("{} cannot reach the origin", self.name),
            ))
        }
    }
}

fn quick_backoff(max_attempts: u32) -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        rate_limited_base: Duration::from_millis(10),
        forbidden_base: Duration::from_millis(20),
        server_error_base: Duration::from_millis(5),
        jitter: JitterMode::None,
        max_attempts,
        ..BackoffConfig::default()
    }
}

#[tokio::test]
async fn ladder_escalates_until_a_rung_succeeds() {
    let s1 = ScriptedRung::failing("s1");
    let s2 = ScriptedRung::failing("s2");
    let s3 = ScriptedRung::succeeding("s3");
    let ladder: Vec<Arc<dyn FetchStrategy>> = vec![s1.clone(), s2.clone(), s3.clone()];
    let fetcher = Fetcher::builder()
        .with_strategies(ladder)
        .with_backoff(quick_backoff(1))
        .build()
        .unwrap();

    let result = fetcher.fetch("https://target.example/page").await.unwrap();

    assert!(result.success);
    assert_eq!(result.strategy.as_deref(), Some("s3"));
    assert_eq!(result.meta.strategies_attempted, ["s1", "s2", "s3"]);
    assert_eq!(s1.calls(), 1);
    assert_eq!(s2.calls(), 1);
    assert_eq!(s3.calls(), 1);
    assert_eq!(result.attempts, 3);
}

#[tokio::test]
async fn exhaustion_error_names_every_attempted_strategy() {
    let s1 = ScriptedRung::failing("alpha");
    let s2 = ScriptedRung::failing("beta");
    let ladder: Vec<Arc<dyn FetchStrategy>> = vec![s1, s2];
    let fetcher = Fetcher::builder()
        .with_strategies(ladder)
        .with_backoff(quick_backoff(1))
        .build()
        .unwrap();

    let result = fetcher.fetch("https://target.example/page").await.unwrap();

    assert!(!result.success);
    assert!(result.payload.is_none());
    let error = result.error.unwrap();
    assert!(error.contains("all strategies failed"), "{error}");
    assert!(error.contains("alpha"), "{error}");
    assert!(error.contains("beta"), "{error}");
    assert_eq!(result.meta.strategies_attempted, ["alpha", "beta"]);
}

#[tokio::test]
async fn transient_server_errors_are_retried_within_the_rung() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "<html><title>Recovered</title>\
             <body><table><tr><td>v</td></tr></table></body></html>",
        ))
        .with_priority(2)
        .mount(&server)
        .await;

    let fetcher = Fetcher::builder()
        .strategy_order(vec![StrategyKind::HttpBasic])
        .with_backoff(quick_backoff(3))
        .build()
        .unwrap();

    let result = fetcher
        .fetch(&format!("{}/flaky", server.uri()))
        .await
        .unwrap();

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.strategy.as_deref(), Some("http_basic"));
    assert_eq!(result.payload.unwrap().title.as_deref(), Some("Recovered"));
}

#[tokio::test]
async fn open_breaker_short_circuits_the_next_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher = Fetcher::builder()
        .strategy_order(vec![StrategyKind::HttpBasic])
        .with_backoff(quick_backoff(3))
        .with_breaker(BreakerConfig {
            failure_threshold: 2,
            timeout_duration: Duration::from_secs(60),
            success_threshold: 1,
        })
        .build()
        .unwrap();

    // Two failed attempts trip the breaker mid-fetch; the retry engine
    // then refuses the third attempt.
    let first = fetcher.fetch(&server.uri()).await.unwrap();
    assert!(!first.success);
    assert_eq!(first.attempts, 2);

    // The breaker is open now: no network attempt at all.
    let second = fetcher.fetch(&server.uri()).await.unwrap();
    assert!(!second.success);
    assert_eq!(second.attempts, 0);
    assert!(
        second.error.unwrap().contains("circuit breaker open"),
        "expected a breaker short-circuit"
    );
}

#[tokio::test]
async fn cancellation_during_backoff_stops_the_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::builder()
        .strategy_order(vec![StrategyKind::HttpBasic])
        .with_backoff(BackoffConfig {
            // Long enough that the cancel always lands inside the sleep.
            server_error_base: Duration::from_secs(30),
            jitter: JitterMode::None,
            max_attempts: 3,
            ..BackoffConfig::default()
        })
        .build()
        .unwrap();

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = tx.send(true);
    });

    let result = fetcher
        .fetch_with(&server.uri(), FetchOptions::default().cancel_on(rx))
        .await
        .unwrap();

    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn statistics_cover_strategies_domains_and_outcomes() {
    let s1 = ScriptedRung::failing("cheap");
    let s2 = ScriptedRung::succeeding("heavy");
    let ladder: Vec<Arc<dyn FetchStrategy>> = vec![s1, s2];
    let fetcher = Fetcher::builder()
        .with_strategies(ladder)
        .with_backoff(quick_backoff(1))
        .build()
        .unwrap();

    fetcher.fetch("https://target.example/one").await.unwrap();
    fetcher.fetch("https://target.example/two").await.unwrap();

    let report = fetcher.stats();
    assert_eq!(report.global.requests, 2);
    assert_eq!(report.global.successes, 2);

    let cheap = report
        .strategies
        .iter()
        .find(|s| s.strategy == "cheap")
        .expect("cheap rung in stats");
    assert_eq!(cheap.attempts, 2);
    assert_eq!(cheap.successes, 0);
    let heavy = report
        .strategies
        .iter()
        .find(|s| s.strategy == "heavy")
        .expect("heavy rung in stats");
    assert_eq!(heavy.successes, 2);

    let domain = report
        .domains
        .iter()
        .find(|d| d.domain == "target.example")
        .expect("domain in stats");
    assert_eq!(domain.attempts, 4);
    assert_eq!(domain.successes, 2);
    assert_eq!(domain.failures, 2);

    let breaker = report
        .breakers
        .get("target.example")
        .expect("breaker view for the fetched domain");
    assert_eq!(breaker.state, BreakerState::Closed);

    assert_eq!(report.pool.total, 0);
    assert!(report.identity.profiles > 0);
    let serves: u64 = report.identity.serve_counts.iter().map(|(_, n)| n).sum();
    assert_eq!(serves, 4);
}

#[tokio::test]
async fn static_proxy_lists_feed_the_pool_summary() {
    let fetcher = Fetcher::builder()
        .with_proxies(["10.0.0.1:8080", "not a proxy", "10.0.0.2:3128:u:p"])
        .with_tagged_proxies(["socks5://10.0.0.3:1080"], "eu")
        .build()
        .unwrap();

    let summary = fetcher.proxy_summary();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.healthy, 3);
    assert_eq!(summary.blocked, 0);
    assert!(
        summary
            .records
            .iter()
            .any(|r| r.region.as_deref() == Some("eu"))
    );
}
