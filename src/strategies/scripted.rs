//! Third rung: embedded JavaScript execution without a browser.
//!
//! Fetches the page, runs its inline scripts through the embedded
//! engine, and harvests what they produce: `document.write` output is
//! merged into the DOM before extraction, and a `location` assignment
//! (or a meta refresh) is followed exactly once with the same identity
//! and proxy. Pages gated on script execution either unlock here or
//! fail classified for the browser rung.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use url::Url;

use crate::detect::{self, EscalationHint};
use crate::external_deps::interpreters::{
    BoaScriptEngine, ScriptEngine, ScriptError, ScriptHarvest,
};
use crate::extract;
use crate::modules::retry::{FailureKind, FetchFailure};

use super::{FetchStrategy, HttpExecutor, RawPage, StrategyRequest, StrategyResponse};

static META_REFRESH_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(
        r#"<meta[^>]+http-equiv\s*=\s*["']?refresh["']?[^>]*content\s*=\s*["'][^"']*url\s*=\s*([^"'>\s]+)"#,
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .unwrap()
});

pub struct ScriptedStrategy {
    executor: Arc<HttpExecutor>,
}

impl ScriptedStrategy {
    pub fn new(executor: Arc<HttpExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl FetchStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn attempt(&self, request: &StrategyRequest) -> Result<StrategyResponse, FetchFailure> {
        let response = self.executor.get(request).await?;
        let page = RawPage::read(response, request.proxy.is_some()).await?;

        // A render-gated page is this rung's job; every other kind of
        // failure (hard block, rate limit, plain bad status) is not
        // something scripts can talk the origin out of.
        let challenge =
            detect::inspect(page.status, &page.text).filter(|r| r.hint == EscalationHint::Render);
        if challenge.is_none()
            && let Some(failure) = page.failure()
        {
            return Err(failure);
        }

        let harvest = match run_inline(page.text.clone(), request.url.clone()).await {
            Ok(harvest) => harvest,
            Err(err) => {
                // A clean page without runnable scripts is already the
                // answer; a gated one that cannot be scripted stays gated.
                return match &challenge {
                    Some(r) => Err(FetchFailure {
                        kind: FailureKind::Forbidden,
                        status: Some(page.status),
                        message: format!("{r}, inline scripts did not unlock it: {err}"),
                        retry_after: page.retry_after,
                    }),
                    None => Ok(finish(page, request)),
                };
            }
        };

        // Follow one redirect the scripts produced, either a location
        // assignment or a written meta refresh. One hop only.
        let redirect = harvest.redirect.clone().or_else(|| {
            META_REFRESH_RE
                .captures(&harvest.written_html)
                .or_else(|| META_REFRESH_RE.captures(&page.text))
                .map(|caps| caps[1].to_string())
        });
        if let Some(target) = redirect {
            let base = Url::parse(&page.final_url).unwrap_or_else(|_| request.url.clone());
            match base.join(target.trim()) {
                Ok(next_url) => {
                    log::debug!("inline scripts redirected {} -> {next_url}", request.url);
                    let response = self.executor.get_url(request, next_url).await?;
                    let landed = RawPage::read(response, request.proxy.is_some()).await?;
                    if let Some(failure) = landed.failure() {
                        return Err(failure);
                    }
                    return Ok(finish(landed, request));
                }
                Err(err) => {
                    log::debug!("ignoring unjoinable script redirect '{target}': {err}");
                }
            }
        }

        if let Some(r) = &challenge {
            // Gated, and the scripts produced no way forward.
            return Err(FetchFailure {
                kind: FailureKind::Forbidden,
                status: Some(page.status),
                message: format!("{r}, inline scripts yielded no redirect"),
                retry_after: page.retry_after,
            });
        }

        // Clean page: merge script output into the document, then extract.
        let mut combined = page.text.clone();
        if !harvest.written_html.is_empty() {
            combined.push_str(&harvest.written_html);
        }
        let base = Url::parse(&page.final_url).unwrap_or_else(|_| request.url.clone());
        let tables = extract::dom_tables(&combined);
        let content = extract::page_content(&combined, &base);
        let mut response = page.into_response(tables, content.links, content.title);
        response.text = combined;
        Ok(response)
    }
}

/// The engine is CPU-bound and the context is not `Send`, so each run
/// gets a fresh engine on the blocking pool.
async fn run_inline(html: String, url: Url) -> Result<ScriptHarvest, ScriptError> {
    tokio::task::spawn_blocking(move || BoaScriptEngine::new().run_inline(&html, &url))
        .await
        .unwrap_or_else(|err| Err(ScriptError::Engine(format!("script task failed: {err}"))))
}

fn finish(page: RawPage, request: &StrategyRequest) -> StrategyResponse {
    let base = Url::parse(&page.final_url).unwrap_or_else(|_| request.url.clone());
    let tables = extract::dom_tables(&page.text);
    let content = extract::page_content(&page.text, &base);
    page.into_response(tables, content.links, content.title)
}
