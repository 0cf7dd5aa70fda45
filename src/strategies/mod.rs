//! Fetch strategies, ordered from cheapest to heaviest.
//!
//! Each rung of the escalation ladder implements [`FetchStrategy`]: a
//! plain HTTP GET with lightweight extraction, a full DOM parse, an
//! embedded-JavaScript pass for pages that assemble themselves in
//! script, and finally a headless browser. The orchestrator walks the
//! ladder in configured order and moves to the next rung when a
//! strategy gives up.
//!
//! Custom rungs are first-class: anything implementing the trait can be
//! handed to the fetcher builder in place of the built-in ladder.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::detect::{self, EscalationHint};
use crate::extract::Table;
use crate::modules::identity::IdentityProfile;
use crate::modules::proxy::ProxyRecord;
use crate::modules::retry::{FailureKind, FetchFailure, classify_status, parse_retry_after};

mod browser;
mod http_basic;
mod http_table;
mod scripted;

pub use browser::BrowserStrategy;
pub use http_basic::HttpBasicStrategy;
pub use http_table::HttpTableStrategy;
pub use scripted::ScriptedStrategy;

/// Built-in rungs, named as they appear in results and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    HttpBasic,
    HttpTable,
    Scripted,
    Browser,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::HttpBasic => "http_basic",
            StrategyKind::HttpTable => "http_table",
            StrategyKind::Scripted => "scripted",
            StrategyKind::Browser => "browser",
        }
    }

    /// The full ladder, cheapest first.
    pub fn default_order() -> Vec<StrategyKind> {
        vec![
            StrategyKind::HttpBasic,
            StrategyKind::HttpTable,
            StrategyKind::Scripted,
            StrategyKind::Browser,
        ]
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one attempt needs: target, identity, transport, budget.
#[derive(Debug, Clone)]
pub struct StrategyRequest {
    pub url: Url,
    pub identity: Arc<IdentityProfile>,
    pub proxy: Option<Arc<ProxyRecord>>,
    /// Wall-clock budget for the whole attempt.
    pub timeout: Duration,
}

/// What a successful attempt hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct StrategyResponse {
    /// URL after redirects, which may differ from the requested one.
    pub final_url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub text: String,
    pub tables: Vec<Table>,
    pub links: Vec<String>,
    pub title: Option<String>,
}

/// One rung of the escalation ladder.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Stable name used in results, statistics and events.
    fn name(&self) -> &'static str;

    /// Attempt budget given the configured base timeout. Rungs that
    /// need more room than a plain HTTP round trip override this.
    fn attempt_timeout(&self, base: Duration) -> Duration {
        base
    }

    /// Runs one attempt. Errors are already classified; the caller
    /// decides whether to retry, escalate or give up.
    async fn attempt(&self, request: &StrategyRequest) -> Result<StrategyResponse, FetchFailure>;
}

/// Shared HTTP transport for the non-browser rungs.
///
/// Clients are cached per proxy so one cookie jar persists across
/// attempts and across rungs sharing the executor. Identity headers are
/// stamped per request, never baked into a client.
pub struct HttpExecutor {
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// GET the request's own URL.
    pub async fn get(&self, request: &StrategyRequest) -> Result<reqwest::Response, FetchFailure> {
        self.get_url(request, request.url.clone()).await
    }

    /// GET an arbitrary URL with the request's identity and proxy.
    /// Used when a strategy follows a redirect it discovered itself.
    pub async fn get_url(
        &self,
        request: &StrategyRequest,
        url: Url,
    ) -> Result<reqwest::Response, FetchFailure> {
        let client = self.client_for(request.proxy.as_deref()).await?;
        let mut pending = client.get(url).timeout(request.timeout);
        for (name, value) in request.identity.full_headers() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(header), Ok(value)) => pending = pending.header(header, value),
                _ => log::warn!("skipping malformed identity header {name:?}"),
            }
        }
        pending
            .send()
            .await
            .map_err(|err| FetchFailure::transport(&err, request.proxy.is_some()))
    }

    async fn client_for(&self, proxy: Option<&ProxyRecord>) -> Result<reqwest::Client, FetchFailure> {
        let key = proxy.map(|record| record.endpoint().proxy_url());
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(key.as_deref()).map_err(|err| {
            let kind = if key.is_some() {
                FailureKind::ProxyError
            } else {
                FailureKind::Unknown
            };
            FetchFailure::new(kind, format!("could not build HTTP client: {err}"))
        })?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client(proxy_url: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .cookie_store(true)
        .gzip(true)
        .brotli(true)
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(15));
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    builder.build()
}

/// A fully read HTTP response, decoded once and shared by whatever
/// extraction the strategy performs.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub final_url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub text: String,
    /// Parsed Retry-After header, when the server sent one.
    pub retry_after: Option<Duration>,
}

impl RawPage {
    /// Drains the response body. Transport errors while streaming are
    /// classified like any other network failure.
    pub async fn read(response: reqwest::Response, via_proxy: bool) -> Result<Self, FetchFailure> {
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchFailure::transport(&err, via_proxy))?;
        let text = String::from_utf8_lossy(&body).into_owned();
        Ok(Self {
            final_url,
            status,
            headers,
            body,
            text,
            retry_after,
        })
    }

    /// The failure this page represents, if any. Resistance pages are
    /// classified by their escalation hint even on a 200; everything
    /// else falls back to plain status classification.
    pub fn failure(&self) -> Option<FetchFailure> {
        if let Some(resistance) = detect::inspect(self.status, &self.text) {
            let kind = match resistance.hint {
                EscalationHint::Backoff => FailureKind::RateLimited,
                _ => FailureKind::Forbidden,
            };
            let mut failure = FetchFailure::new(kind, resistance.to_string());
            failure.status = Some(self.status);
            failure.retry_after = self.retry_after;
            return Some(failure);
        }
        if classify_status(self.status).is_some() {
            return Some(
                FetchFailure::from_status(self.status, format!("server answered {}", self.status))
                    .with_retry_after(self.retry_after),
            );
        }
        None
    }

    /// Finishes the page into a response carrying extraction results.
    pub fn into_response(
        self,
        tables: Vec<Table>,
        links: Vec<String>,
        title: Option<String>,
    ) -> StrategyResponse {
        StrategyResponse {
            final_url: self.final_url,
            status: self.status,
            headers: self.headers,
            body: self.body,
            text: self.text,
            tables,
            links,
            title,
        }
    }
}

/// Materializes the built-in rungs in the given order. The HTTP rungs
/// share one executor so cookies earned early survive escalation.
pub fn build_ladder(order: &[StrategyKind], browser_timeout: Duration) -> Vec<Arc<dyn FetchStrategy>> {
    let executor = Arc::new(HttpExecutor::new());
    order
        .iter()
        .map(|kind| match kind {
            StrategyKind::HttpBasic => {
                Arc::new(HttpBasicStrategy::new(Arc::clone(&executor))) as Arc<dyn FetchStrategy>
            }
            StrategyKind::HttpTable => {
                Arc::new(HttpTableStrategy::new(Arc::clone(&executor))) as Arc<dyn FetchStrategy>
            }
            StrategyKind::Scripted => {
                Arc::new(ScriptedStrategy::new(Arc::clone(&executor))) as Arc<dyn FetchStrategy>
            }
            StrategyKind::Browser => {
                Arc::new(BrowserStrategy::new(browser_timeout)) as Arc<dyn FetchStrategy>
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(status: u16, text: &str) -> RawPage {
        RawPage {
            final_url: "https://example.com/".into(),
            status,
            headers: HeaderMap::new(),
            body: Bytes::from(text.as_bytes().to_vec()),
            text: text.into(),
            retry_after: None,
        }
    }

    #[test]
    fn kind_names_round_trip_through_serde() {
        for kind in StrategyKind::default_order() {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: StrategyKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn default_order_escalates_from_cheap_to_heavy() {
        let order = StrategyKind::default_order();
        assert_eq!(order.first(), Some(&StrategyKind::HttpBasic));
        assert_eq!(order.last(), Some(&StrategyKind::Browser));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn clean_page_is_not_a_failure() {
        assert!(page(200, "<html><body>plain</body></html>").failure().is_none());
        assert!(page(301, "moved").failure().is_none());
    }

    #[test]
    fn server_errors_classify_by_status() {
        let failure = page(503, "oops").failure().unwrap();
        assert_eq!(failure.kind, FailureKind::ServerError);
        assert_eq!(failure.status, Some(503));
    }

    #[test]
    fn challenge_page_fails_even_with_status_200() {
        let body = "<html><title>Just a moment...</title>\
                    <body>Checking your browser before accessing</body></html>";
        let failure = page(200, body).failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Forbidden);
        assert_eq!(failure.status, Some(200));
    }

    #[test]
    fn rate_limit_page_maps_to_backoff_even_on_200() {
        let body = "<html><body><p>You are being rate limited</p></body></html>";
        let failure = page(200, body).failure().unwrap();
        assert_eq!(failure.kind, FailureKind::RateLimited);
        assert_eq!(failure.status, Some(200));
    }

    #[test]
    fn ladder_builds_every_requested_rung_in_order() {
        let ladder = build_ladder(&StrategyKind::default_order(), Duration::from_secs(45));
        let names: Vec<&str> = ladder.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["http_basic", "http_table", "scripted", "browser"]);
    }

    #[test]
    fn attempt_timeout_defaults_to_the_base() {
        let ladder = build_ladder(&[StrategyKind::HttpBasic], Duration::from_secs(45));
        let base = Duration::from_secs(30);
        assert_eq!(ladder[0].attempt_timeout(base), base);
    }

    #[test]
    fn browser_rung_claims_a_longer_budget() {
        let ladder = build_ladder(&[StrategyKind::Browser], Duration::from_secs(45));
        assert_eq!(
            ladder[0].attempt_timeout(Duration::from_secs(30)),
            Duration::from_secs(45)
        );
    }
}
