//! Fourth rung: full page rendering in headless Chromium.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::Mutex;
use url::Url;

use crate::detect;
use crate::external_deps::browser::{BrowserError, HeadlessBrowser};
use crate::extract;
use crate::modules::retry::{FailureKind, FetchFailure};

use super::{FetchStrategy, StrategyRequest, StrategyResponse};

/// Headless-browser rung. The browser process launches lazily and is
/// reused across attempts; a proxy change forces a relaunch because
/// Chromium takes its proxy as a process argument.
pub struct BrowserStrategy {
    browser_timeout: Duration,
    session: Mutex<Option<HeadlessBrowser>>,
}

impl BrowserStrategy {
    pub fn new(browser_timeout: Duration) -> Self {
        Self {
            browser_timeout,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FetchStrategy for BrowserStrategy {
    fn name(&self) -> &'static str {
        "browser"
    }

    /// A full render needs more room than an HTTP round trip.
    fn attempt_timeout(&self, _base: Duration) -> Duration {
        self.browser_timeout
    }

    async fn attempt(&self, request: &StrategyRequest) -> Result<StrategyResponse, FetchFailure> {
        let mut session = self.session.lock().await;

        let wanted = request.proxy.as_ref().map(|p| p.endpoint().label());
        let relaunch = match session.as_ref() {
            Some(browser) => browser.proxy_label() != wanted.as_deref(),
            None => true,
        };
        if relaunch {
            if let Some(old) = session.take() {
                old.shutdown().await;
            }
            let endpoint = request.proxy.as_ref().map(|p| p.endpoint());
            let launched = HeadlessBrowser::launch(endpoint)
                .await
                .map_err(|err| browser_failure(err, request.proxy.is_some()))?;
            *session = Some(launched);
        }
        let Some(browser) = session.as_ref() else {
            return Err(FetchFailure::new(
                FailureKind::Unknown,
                "browser session missing after launch",
            ));
        };

        let rendered = match browser
            .render(
                request.url.as_str(),
                Some(&request.identity.user_agent),
                request.timeout,
            )
            .await
        {
            Ok(rendered) => rendered,
            Err(err) => {
                // A navigation timeout leaves the process usable; other
                // failures may mean a wedged browser, relaunch next time.
                if !matches!(err, BrowserError::NavigationTimeout(_))
                    && let Some(old) = session.take()
                {
                    old.shutdown().await;
                }
                return Err(browser_failure(err, request.proxy.is_some()));
            }
        };
        drop(session);

        log::debug!(
            "browser rendered {} in {:?}",
            rendered.final_url,
            rendered.load_time
        );

        // CDP exposes no reliable top-level status; judge the DOM instead.
        if let Some(resistance) = detect::inspect(200, &rendered.html) {
            return Err(FetchFailure::new(
                FailureKind::Forbidden,
                format!("{resistance} after full render"),
            ));
        }

        let base = Url::parse(&rendered.final_url).unwrap_or_else(|_| request.url.clone());
        let tables = extract::dom_tables(&rendered.html);
        let content = extract::page_content(&rendered.html, &base);
        let text = rendered.html;
        Ok(StrategyResponse {
            final_url: rendered.final_url,
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from(text.as_bytes().to_vec()),
            text,
            tables,
            links: content.links,
            title: content.title,
        })
    }
}

fn browser_failure(err: BrowserError, via_proxy: bool) -> FetchFailure {
    let kind = match &err {
        BrowserError::NavigationTimeout(_) => FailureKind::Timeout,
        BrowserError::Navigation(_) => {
            if via_proxy {
                FailureKind::ProxyError
            } else {
                FailureKind::Network
            }
        }
        BrowserError::Unavailable(_) | BrowserError::Launch(_) | BrowserError::Capture(_) => {
            FailureKind::Unknown
        }
    };
    FetchFailure::new(kind, err.to_string())
}
