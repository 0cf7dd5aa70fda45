//! First rung: one plain GET with regex-level extraction.

use std::sync::Arc;

use async_trait::async_trait;

use crate::extract;
use crate::modules::retry::FetchFailure;

use super::{FetchStrategy, HttpExecutor, RawPage, StrategyRequest, StrategyResponse};

/// Plain HTTP GET. Extraction stays at the regex level; pages that need
/// real DOM handling or script execution escalate past this rung.
pub struct HttpBasicStrategy {
    executor: Arc<HttpExecutor>,
}

impl HttpBasicStrategy {
    pub fn new(executor: Arc<HttpExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl FetchStrategy for HttpBasicStrategy {
    fn name(&self) -> &'static str {
        "http_basic"
    }

    async fn attempt(&self, request: &StrategyRequest) -> Result<StrategyResponse, FetchFailure> {
        let response = self.executor.get(request).await?;
        let page = RawPage::read(response, request.proxy.is_some()).await?;
        if let Some(failure) = page.failure() {
            return Err(failure);
        }
        let tables = extract::quick_tables(&page.text);
        let title = extract::quick_title(&page.text);
        Ok(page.into_response(tables, Vec::new(), title))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::modules::identity::default_profiles;
    use crate::modules::retry::FailureKind;

    use super::*;

    fn request_for(url: &str) -> StrategyRequest {
        StrategyRequest {
            url: Url::parse(url).unwrap(),
            identity: Arc::new(default_profiles().remove(0)),
            proxy: None,
            timeout: Duration::from_secs(5),
        }
    }

    fn strategy() -> HttpBasicStrategy {
        HttpBasicStrategy::new(Arc::new(HttpExecutor::new()))
    }

    #[tokio::test]
    async fn extracts_title_and_tables_from_a_plain_page() {
        let server = MockServer::start().await;
        let html = "<html><head><title>Prices</title></head><body>\
                    <table><tr><th>Item</th><th>Cost</th></tr>\
                    <tr><td>Widget</td><td>3.50</td></tr></table>\
                    </body></html>";
        Mock::given(method("GET"))
            .and(path("/prices"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(html)
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let response = strategy()
            .attempt(&request_for(&format!("{}/prices", server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.title.as_deref(), Some("Prices"));
        assert_eq!(response.tables.len(), 1);
        assert_eq!(response.tables[0].headers, ["Item", "Cost"]);
        assert_eq!(response.tables[0].rows, [["Widget", "3.50"]]);
    }

    #[tokio::test]
    async fn sends_the_identity_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .expect(1)
            .mount(&server)
            .await;

        strategy()
            .attempt(&request_for(&server.uri()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_error_comes_back_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let failure = strategy()
            .attempt(&request_for(&server.uri()))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ServerError);
        assert_eq!(failure.status, Some(502));
    }

    #[tokio::test]
    async fn challenge_body_fails_as_forbidden() {
        let server = MockServer::start().await;
        let html = "<html><head><title>Just a moment...</title></head>\
                    <body>Checking your browser before accessing</body></html>";
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(html))
            .mount(&server)
            .await;

        let failure = strategy()
            .attempt(&request_for(&server.uri()))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Forbidden);
    }
}
