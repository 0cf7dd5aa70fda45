//! Second rung: full DOM parse for tables, links and title.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::extract;
use crate::modules::retry::FetchFailure;

use super::{FetchStrategy, HttpExecutor, RawPage, StrategyRequest, StrategyResponse};

/// HTTP GET followed by a structured DOM parse. Heavier than the basic
/// rung but correct on nested tables, thead rows, colspans and relative
/// links.
pub struct HttpTableStrategy {
    executor: Arc<HttpExecutor>,
}

impl HttpTableStrategy {
    pub fn new(executor: Arc<HttpExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl FetchStrategy for HttpTableStrategy {
    fn name(&self) -> &'static str {
        "http_table"
    }

    async fn attempt(&self, request: &StrategyRequest) -> Result<StrategyResponse, FetchFailure> {
        let response = self.executor.get(request).await?;
        let page = RawPage::read(response, request.proxy.is_some()).await?;
        if let Some(failure) = page.failure() {
            return Err(failure);
        }
        // Links resolve against where redirects actually landed.
        let base = Url::parse(&page.final_url).unwrap_or_else(|_| request.url.clone());
        let tables = extract::dom_tables(&page.text);
        let content = extract::page_content(&page.text, &base);
        Ok(page.into_response(tables, content.links, content.title))
    }
}
