use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{http_client, is_retryable_status, is_transient};
use crate::agents::SearchProvider;
use crate::config::SearchConfig;
use crate::error::PipelineError;
use crate::model::SearchResult;
use crate::security::SecretValue;

const USER_AGENT: &str = concat!("deepscout/", env!("CARGO_PKG_VERSION"));

/// Tavily-compatible web search client.
pub struct TavilySearchProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretValue,
    search_depth: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    max_results: usize,
    include_answer: bool,
    include_images: bool,
    include_raw_content: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl TavilySearchProvider {
    pub fn new(
        config: &SearchConfig,
        api_key: SecretValue,
        timeout: std::time::Duration,
    ) -> Result<Self, PipelineError> {
        let client = http_client(USER_AGENT, timeout).map_err(|err| {
            PipelineError::InvalidConfiguration(format!("failed to build search client: {err}"))
        })?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            search_depth: config.search_depth.clone(),
        })
    }
}

#[async_trait]
impl SearchProvider for TavilySearchProvider {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, PipelineError> {
        let request = SearchRequest {
            api_key: self.api_key.expose(),
            query,
            search_depth: &self.search_depth,
            max_results: limit,
            include_answer: false,
            include_images: false,
            include_raw_content: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| PipelineError::search_unavailable(err.to_string(), is_transient(&err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::search_unavailable(
                format!("provider returned HTTP {status}"),
                is_retryable_status(status),
            ));
        }

        let body: SearchResponse = response.json().await.map_err(|err| {
            PipelineError::search_unavailable(format!("malformed provider response: {err}"), false)
        })?;
        debug!(hits = body.results.len(), "tavily response decoded");

        Ok(body
            .results
            .into_iter()
            .enumerate()
            .map(|(idx, hit)| {
                SearchResult::new(hit.url, hit.title, idx as u32 + 1).with_snippet(hit.content)
            })
            .collect())
    }
}
