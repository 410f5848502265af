//! Search agent: turns a query into a ranked, deduplicated list of sources.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use futures::future::join_all;
use reqwest::Url;
use tracing::{debug, info, instrument, warn};

use crate::error::PipelineError;
use crate::model::SearchResult;

/// Extensions that point at documents or media rather than readable pages.
const SKIPPED_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".ppt", ".pptx", ".xml", ".json", ".jpg", ".png",
];

/// Search backend boundary. Implementations return hits in provider order;
/// ranks need not be contiguous or unique.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, PipelineError>;
}

/// Stateless search capability over a [`SearchProvider`].
///
/// One call fans the topic out into its query variants, one provider attempt
/// each; retries belong to the Manager.
pub struct SearchAgent {
    provider: Arc<dyn SearchProvider>,
    max_results: usize,
    query_variants: Vec<String>,
}

impl SearchAgent {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        Self {
            provider,
            max_results: max_results.max(1),
            query_variants: vec!["{topic}".to_string()],
        }
    }

    /// Templates expanded per call; an empty list keeps the bare topic.
    pub fn with_query_variants(mut self, variants: Vec<String>) -> Self {
        if !variants.is_empty() {
            self.query_variants = variants;
        }
        self
    }

    #[instrument(name = "agent.search", skip(self), fields(provider = self.provider.name()))]
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, PipelineError> {
        let topic = query.trim();
        if topic.is_empty() {
            return Err(PipelineError::InvalidQuery("query must not be empty".into()));
        }

        let queries = expand_queries(topic, &self.query_variants, Utc::now().year());
        let batches = join_all(
            queries
                .iter()
                .map(|variant| self.provider.search(variant, self.max_results)),
        )
        .await;

        let mut raw = Vec::new();
        let mut succeeded = 0;
        let mut last_error: Option<PipelineError> = None;
        for (variant, batch) in queries.iter().zip(batches) {
            match batch {
                Ok(hits) => {
                    succeeded += 1;
                    raw.extend(hits);
                }
                Err(err) => {
                    warn!(query = %variant, error = %err, "search variant failed, skipping");
                    let keep_previous = last_error
                        .as_ref()
                        .is_some_and(|prev| prev.is_retryable() && !err.is_retryable());
                    if !keep_previous {
                        last_error = Some(err);
                    }
                }
            }
        }

        if succeeded == 0 {
            return Err(last_error.unwrap_or_else(|| {
                PipelineError::search_unavailable("no search query could be issued", false)
            }));
        }

        let raw_count = raw.len();
        let results = normalize_results(raw, self.max_results);
        info!(
            variants = queries.len(),
            succeeded,
            raw_count,
            kept = results.len(),
            "search returned candidate sources"
        );
        Ok(results)
    }
}

/// Substitute `{topic}` and `{year}` into each template, dropping blank and
/// repeated queries. Never returns an empty list.
pub fn expand_queries(topic: &str, templates: &[String], year: i32) -> Vec<String> {
    let year = year.to_string();
    let mut seen = HashSet::new();
    let mut queries = Vec::new();
    for template in templates {
        let query = template
            .replace("{topic}", topic)
            .replace("{year}", &year)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !query.is_empty() && seen.insert(query.clone()) {
            queries.push(query);
        }
    }
    if queries.is_empty() {
        queries.push(topic.to_string());
    }
    queries
}

/// Best-first ordering, URL filtering, dedup keeping the best-ranked
/// occurrence, top-K truncation and contiguous re-numbering.
pub fn normalize_results(mut raw: Vec<SearchResult>, max_results: usize) -> Vec<SearchResult> {
    // Stable sort keeps provider order for equal ranks.
    raw.sort_by_key(|result| result.rank);

    let mut seen = HashSet::new();
    let mut results = Vec::with_capacity(max_results.min(raw.len()));
    for result in raw {
        let Some(key) = normalize_url(&result.url) else {
            debug!(url = %result.url, "dropping non-http result");
            continue;
        };
        if is_document_url(&key) {
            debug!(url = %result.url, "dropping document link");
            continue;
        }
        if !seen.insert(key) {
            debug!(url = %result.url, rank = result.rank, "dropping duplicate result");
            continue;
        }
        results.push(result);
        if results.len() == max_results {
            break;
        }
    }

    for (idx, result) in results.iter_mut().enumerate() {
        result.rank = idx as u32 + 1;
    }
    results
}

/// Canonical form used for duplicate detection, or `None` for anything that
/// is not an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let mut key = url.to_string();
    if url.query().is_none() {
        while key.ends_with('/') {
            key.pop();
        }
    }
    Some(key)
}

fn is_document_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let path = lower.split('?').next().unwrap_or(&lower);
    SKIPPED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
