//! Headless Chromium integration via the DevTools protocol.
//!
//! One [`HeadlessBrowser`] wraps a launched Chromium process and its
//! CDP event loop. Proxies bind at launch time (Chromium takes
//! `--proxy-server` as a process argument), so the browser remembers
//! which proxy it was launched with and callers relaunch when they
//! need a different one.

use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use thiserror::Error;

use crate::modules::proxy::ProxyEndpoint;

/// Overrides browser-executable autodetection when set.
pub const EXECUTABLE_ENV: &str = "HARDFETCH_BROWSER";

/// Failures from the browser rung.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("no usable browser executable: {0}")]
    Unavailable(String),
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("browser navigation failed: {0}")]
    Navigation(String),
    #[error("browser navigation timed out after {0:?}")]
    NavigationTimeout(Duration),
    #[error("failed to read rendered page: {0}")]
    Capture(String),
}

/// A fully rendered page as the browser saw it.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub html: String,
    pub load_time: Duration,
}

/// A launched headless Chromium instance.
pub struct HeadlessBrowser {
    browser: Browser,
    proxy: Option<String>,
}

impl HeadlessBrowser {
    /// Launches Chromium, optionally through a proxy. The executable
    /// comes from `HARDFETCH_BROWSER` when set, otherwise from the
    /// library's own detection; a missing binary fails fast here.
    pub async fn launch(proxy: Option<&ProxyEndpoint>) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking");

        if let Ok(path) = std::env::var(EXECUTABLE_ENV) {
            builder = builder.chrome_executable(path);
        }

        if let Some(endpoint) = proxy {
            // CDP has no per-request proxy auth hook; credentials in the
            // endpoint cannot be forwarded to the launched process.
            if endpoint.username.is_some() {
                log::warn!(
                    "browser launch ignores credentials on proxy {}",
                    endpoint.label()
                );
            }
            builder = builder.arg(format!("--proxy-server={}", endpoint.label()));
        }

        let config = builder.build().map_err(BrowserError::Unavailable)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        // Drive the CDP event loop; it ends when the browser drops.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        log::debug!(
            "headless browser launched (proxy: {})",
            proxy.map(|p| p.label()).unwrap_or_else(|| "direct".into())
        );

        Ok(Self {
            browser,
            proxy: proxy.map(|p| p.label()),
        })
    }

    /// The proxy this instance was launched with, if any.
    pub fn proxy_label(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Navigates a fresh tab and captures the rendered DOM. The whole
    /// round trip shares one wall-clock budget.
    pub async fn render(
        &self,
        url: &str,
        user_agent: Option<&str>,
        timeout: Duration,
    ) -> Result<RenderedPage, BrowserError> {
        let started = Instant::now();

        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;

        if let Some(ua) = user_agent
            && let Err(err) = page.set_user_agent(ua).await
        {
            log::debug!("could not override browser user agent: {err}");
        }

        match tokio::time::timeout(timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                let _ = page.close().await;
                return Err(BrowserError::Navigation(e.to_string()));
            }
            Err(_) => {
                let _ = page.close().await;
                return Err(BrowserError::NavigationTimeout(timeout));
            }
        }

        // Give late navigations (JS challenges, meta refreshes) the rest
        // of the budget; a timeout here just means the page settled.
        let remaining = timeout
            .saturating_sub(started.elapsed())
            .max(Duration::from_millis(100));
        let _ = tokio::time::timeout(remaining, page.wait_for_navigation()).await;

        let html: String = match page.evaluate("document.documentElement.outerHTML").await {
            Ok(result) => result
                .into_value()
                .map_err(|e| BrowserError::Capture(format!("{e:?}")))?,
            Err(e) => {
                let _ = page.close().await;
                return Err(BrowserError::Capture(e.to_string()));
            }
        };

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());

        let _ = page.close().await;

        Ok(RenderedPage {
            final_url,
            html,
            load_time: started.elapsed(),
        })
    }

    /// Closes the browser process. Dropping the instance also kills
    /// it; this just does so deterministically.
    pub async fn shutdown(mut self) {
        let _ = self.browser.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a Chromium binary"]
    async fn renders_a_data_url() {
        let browser = HeadlessBrowser::launch(None).await.expect("launch");
        let page = browser
            .render(
                "data:text/html,<h1>Hello</h1><table><tr><td>cell</td></tr></table>",
                Some("Mozilla/5.0 (X11; Linux x86_64)"),
                Duration::from_secs(10),
            )
            .await
            .expect("render");

        assert!(page.html.contains("<h1>Hello</h1>"));
        assert!(page.html.contains("cell"));
        browser.shutdown().await;
    }
}
