//! Evidence fetching across the two web-search providers.
//!
//! Tavily returns ranked results whose pages are then run through its extract
//! endpoint; SerpAPI contributes Google organic results with snippets only.
//! Failures are contained per provider and per query, so a dead provider only
//! means fewer sources.

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use url::Url;

use super::error::SearchError;
use super::utils::truncate_chars;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Tavily,
    Serp,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Tavily => write!(f, "tavily"),
            Provider::Serp => write!(f, "serp"),
        }
    }
}

/// One normalized search result usable as a citation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    source_url: String,
    title: String,
    content: Option<String>,
    provider: Provider,
}

impl EvidenceRecord {
    /// Returns `None` when the URL is blank; blank content is stored as absent.
    pub fn new(
        source_url: impl Into<String>,
        title: impl Into<String>,
        content: Option<String>,
        provider: Provider,
    ) -> Option<Self> {
        let source_url = source_url.into().trim().to_string();
        if source_url.is_empty() {
            return None;
        }
        Some(Self {
            source_url,
            title: title.into(),
            content: content.filter(|c| !c.trim().is_empty()),
            provider,
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn with_content_limit(self, max_chars: usize) -> Self {
        Self {
            content: self.content.map(|c| truncate_chars(&c, max_chars)),
            ..self
        }
    }
}

/// Trait for pluggable search providers
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str) -> Result<Vec<EvidenceRecord>, SearchError>;
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<T, SearchError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| SearchError::Request { provider, source })?;
    if !status.is_success() {
        return Err(SearchError::Status {
            provider,
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| SearchError::Malformed {
        provider,
        reason: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<TavilySearchResult>,
}

#[derive(Debug, Deserialize)]
struct TavilySearchResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TavilyExtractResponse {
    #[serde(default)]
    results: Vec<TavilyExtracted>,
    #[serde(default)]
    failed_results: Vec<TavilyFailedExtract>,
}

#[derive(Debug, Deserialize)]
struct TavilyExtracted {
    url: String,
    #[serde(default)]
    raw_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TavilyFailedExtract {
    url: String,
    #[serde(default)]
    error: Option<String>,
}

/// Tavily search provider with content extraction.
pub struct TavilyProvider {
    client: Client,
    api_key: String,
    base_url: Url,
    max_results: usize,
}

impl TavilyProvider {
    pub fn new(client: Client, api_key: String, base_url: Url, max_results: usize) -> Self {
        Self {
            client,
            api_key,
            base_url,
            max_results,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, SearchError> {
        self.base_url.join(path).map_err(|e| SearchError::Malformed {
            provider: "Tavily",
            reason: format!("bad endpoint {}: {}", path, e),
        })
    }

    async fn extract(&self, urls: &[String]) -> Result<TavilyExtractResponse, SearchError> {
        let response = self
            .client
            .post(self.endpoint("extract")?)
            .bearer_auth(&self.api_key)
            .json(&json!({ "urls": urls }))
            .send()
            .await
            .map_err(|source| SearchError::Request {
                provider: "Tavily",
                source,
            })?;
        read_json("Tavily", response).await
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &'static str {
        "Tavily"
    }

    async fn search(&self, query: &str) -> Result<Vec<EvidenceRecord>, SearchError> {
        let response = self
            .client
            .post(self.endpoint("search")?)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "query": query,
                "topic": "general",
                "search_depth": "advanced",
                "max_results": self.max_results,
            }))
            .send()
            .await
            .map_err(|source| SearchError::Request {
                provider: "Tavily",
                source,
            })?;
        let found: TavilySearchResponse = read_json("Tavily", response).await?;

        let mut results: Vec<TavilySearchResult> = found
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .take(self.max_results)
            .collect();
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let urls: Vec<String> = results.iter().map(|r| r.url.clone()).collect();
        match self.extract(&urls).await {
            Ok(extracted) => {
                for failed in &extracted.failed_results {
                    tracing::debug!(
                        url = %failed.url,
                        error = failed.error.as_deref().unwrap_or("unknown"),
                        "extraction failed, keeping snippet"
                    );
                }
                for page in extracted.results {
                    let Some(raw) = page.raw_content.filter(|c| !c.trim().is_empty()) else {
                        continue;
                    };
                    if let Some(result) = results.iter_mut().find(|r| r.url == page.url) {
                        result.content = Some(raw);
                    }
                }
            }
            Err(e) => tracing::warn!(query, error = %e, "Tavily extract failed, using snippets"),
        }

        Ok(results
            .into_iter()
            .filter_map(|r| EvidenceRecord::new(r.url, r.title, r.content, Provider::Tavily))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic_results: Vec<SerpOrganic>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpOrganic {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: Option<String>,
}

/// SerpAPI Google search; snippets only.
pub struct SerpProvider {
    client: Client,
    api_key: String,
    base_url: Url,
    max_results: usize,
}

impl SerpProvider {
    pub fn new(client: Client, api_key: String, base_url: Url, max_results: usize) -> Self {
        Self {
            client,
            api_key,
            base_url,
            max_results,
        }
    }
}

#[async_trait]
impl SearchProvider for SerpProvider {
    fn name(&self) -> &'static str {
        "SerpAPI"
    }

    async fn search(&self, query: &str) -> Result<Vec<EvidenceRecord>, SearchError> {
        let endpoint = self.base_url.join("search.json").map_err(|e| SearchError::Malformed {
            provider: "SerpAPI",
            reason: e.to_string(),
        })?;
        let num = self.max_results.to_string();
        let response = self
            .client
            .get(endpoint)
            .query(&[
                ("engine", "google"),
                ("q", query),
                ("num", num.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|source| SearchError::Request {
                provider: "SerpAPI",
                source,
            })?;
        let found: SerpResponse = read_json("SerpAPI", response).await?;

        // SerpAPI signals "no results" through the error field as well.
        if let Some(error) = found.error {
            if found.organic_results.is_empty() && !error.contains("hasn't returned any results") {
                return Err(SearchError::Malformed {
                    provider: "SerpAPI",
                    reason: error,
                });
            }
        }

        Ok(found
            .organic_results
            .into_iter()
            .take(self.max_results)
            .filter_map(|r| EvidenceRecord::new(r.link, r.title, r.snippet, Provider::Serp))
            .collect())
    }
}

/// Runs every planned query against every provider and concatenates the evidence.
pub struct EvidenceFetcher {
    providers: Vec<Arc<dyn SearchProvider>>,
    max_chars_per_source: usize,
}

impl EvidenceFetcher {
    pub fn new(providers: Vec<Arc<dyn SearchProvider>>, max_chars_per_source: usize) -> Self {
        Self {
            providers,
            max_chars_per_source,
        }
    }

    /// Never fails: provider errors are logged and contribute no evidence.
    /// Output is ordered by query, then by provider.
    pub async fn fetch(&self, queries: &[String]) -> Vec<EvidenceRecord> {
        let searches = queries.iter().flat_map(|query| {
            self.providers.iter().map(move |provider| async move {
                match provider.search(query).await {
                    Ok(records) => {
                        tracing::info!(
                            provider = provider.name(),
                            query = %query,
                            results = records.len(),
                            "search completed"
                        );
                        records
                    }
                    Err(e) => {
                        tracing::warn!(
                            provider = provider.name(),
                            query = %query,
                            error = %e,
                            "search failed"
                        );
                        Vec::new()
                    }
                }
            })
        });

        join_all(searches)
            .await
            .into_iter()
            .flatten()
            .map(|record| record.with_content_limit(self.max_chars_per_source))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::Value;
    use std::collections::HashMap;

    async fn serve(app: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    fn tavily_search_body() -> Value {
        json!({
            "results": [
                { "url": "https://reef.example/a", "title": "A", "content": "snippet a" },
                { "url": "https://reef.example/b", "title": "B", "content": "snippet b" },
                { "url": "", "title": "blank", "content": "dropped" }
            ]
        })
    }

    #[tokio::test]
    async fn tavily_keeps_snippet_when_extraction_fails_for_a_url() {
        let app = Router::new()
            .route("/search", post(|| async { Json(tavily_search_body()) }))
            .route(
                "/extract",
                post(|| async {
                    Json(json!({
                        "results": [{ "url": "https://reef.example/a", "raw_content": "full page a" }],
                        "failed_results": [{ "url": "https://reef.example/b", "error": "timeout" }]
                    }))
                }),
            );
        let base = serve(app).await;
        let provider = TavilyProvider::new(Client::new(), "key".into(), base, 5);

        let records = provider.search("coral").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content(), Some("full page a"));
        assert_eq!(records[1].source_url(), "https://reef.example/b");
        assert_eq!(records[1].content(), Some("snippet b"));
        assert!(records.iter().all(|r| r.provider() == Provider::Tavily));
    }

    #[tokio::test]
    async fn tavily_falls_back_to_snippets_when_extract_call_errors() {
        let app = Router::new()
            .route("/search", post(|| async { Json(tavily_search_body()) }))
            .route("/extract", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let base = serve(app).await;
        let provider = TavilyProvider::new(Client::new(), "key".into(), base, 5);

        let records = provider.search("coral").await.unwrap();
        let contents: Vec<_> = records.iter().map(|r| r.content()).collect();
        assert_eq!(contents, vec![Some("snippet a"), Some("snippet b")]);
    }

    #[tokio::test]
    async fn serp_maps_organic_results_and_bounds_count() {
        let app = Router::new().route(
            "/search.json",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("engine").map(String::as_str), Some("google"));
                assert_eq!(params.get("api_key").map(String::as_str), Some("serp-key"));
                let q = params.get("q").cloned().unwrap_or_default();
                let organic: Vec<Value> = (0..8)
                    .map(|i| json!({ "link": format!("https://serp.example/{}", i), "title": q, "snippet": "s" }))
                    .collect();
                Json(json!({ "organic_results": organic }))
            }),
        );
        let base = serve(app).await;
        let provider = SerpProvider::new(Client::new(), "serp-key".into(), base, 5);

        let records = provider.search("microplastics").await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].title(), "microplastics");
        assert_eq!(records[4].source_url(), "https://serp.example/4");
    }

    #[tokio::test]
    async fn serp_error_payload_is_a_provider_error() {
        let app = Router::new().route(
            "/search.json",
            get(|| async { Json(json!({ "error": "Invalid API key." })) }),
        );
        let base = serve(app).await;
        let provider = SerpProvider::new(Client::new(), "bad".into(), base, 5);

        assert!(matches!(
            provider.search("x").await,
            Err(SearchError::Malformed { provider: "SerpAPI", .. })
        ));
    }

    struct Canned {
        name: &'static str,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl SearchProvider for Canned {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn search(&self, query: &str) -> Result<Vec<EvidenceRecord>, SearchError> {
            if self.fail_on == Some(query) {
                return Err(SearchError::Malformed {
                    provider: self.name,
                    reason: "quota".into(),
                });
            }
            Ok(EvidenceRecord::new(
                format!("https://{}.example/{}", self.name, query),
                query,
                Some("x".repeat(50)),
                Provider::Serp,
            )
            .into_iter()
            .collect())
        }
    }

    #[tokio::test]
    async fn fetcher_contains_failures_per_provider_and_query() {
        let fetcher = EvidenceFetcher::new(
            vec![
                Arc::new(Canned { name: "one", fail_on: Some("q2") }),
                Arc::new(Canned { name: "two", fail_on: None }),
            ],
            10,
        );

        let records = fetcher.fetch(&["q1".to_string(), "q2".to_string()]).await;
        let urls: Vec<_> = records.iter().map(|r| r.source_url()).collect();
        assert_eq!(
            urls,
            vec!["https://one.example/q1", "https://two.example/q1", "https://two.example/q2"]
        );
        assert!(records.iter().all(|r| r.content() == Some("xxxxxxxxxx... [truncated]")));
    }

    #[tokio::test]
    async fn fetcher_with_no_results_yields_empty_evidence() {
        let fetcher = EvidenceFetcher::new(
            vec![Arc::new(Canned { name: "one", fail_on: Some("only") })],
            100,
        );
        assert!(fetcher.fetch(&["only".to_string()]).await.is_empty());
    }

    #[test]
    fn blank_urls_are_rejected() {
        assert!(EvidenceRecord::new("  ", "t", None, Provider::Tavily).is_none());
        let record = EvidenceRecord::new("https://x.example", "t", Some(" ".into()), Provider::Tavily).unwrap();
        assert_eq!(record.content(), None);
    }
}
