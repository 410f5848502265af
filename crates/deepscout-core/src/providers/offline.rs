//! Deterministic in-memory collaborators for offline runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::{FetchedPage, ImageDescription, PageFetcher, SearchProvider, VisionModel};
use crate::error::PipelineError;
use crate::model::SearchResult;

/// Search provider that replays a fixed result list.
#[derive(Debug, Default)]
pub struct StaticSearchProvider {
    results: Vec<SearchResult>,
    failures_left: AtomicUsize,
    always_fail: bool,
    down_queries: HashSet<String>,
    calls: AtomicUsize,
}

impl StaticSearchProvider {
    pub fn new(results: Vec<SearchResult>) -> Self {
        Self {
            results,
            ..Default::default()
        }
    }

    /// A provider whose every call is a retryable outage.
    pub fn unavailable() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    /// Fails the first `failures` calls, then serves `results`.
    pub fn failing_times(failures: usize, results: Vec<SearchResult>) -> Self {
        Self {
            results,
            failures_left: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    /// Every call for exactly `query` is a retryable outage.
    pub fn with_outage_for(mut self, query: &str) -> Self {
        self.down_queries.insert(query.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StaticSearchProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || self.down_queries.contains(query) {
            return Err(PipelineError::search_unavailable("static provider is offline", true));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::search_unavailable("simulated outage", true));
        }
        Ok(self.results.iter().take(limit).cloned().collect())
    }
}

#[derive(Debug, Clone)]
enum ScriptedPage {
    Page {
        page: FetchedPage,
        delay: Option<Duration>,
    },
    Failure(String),
}

/// Page fetcher backed by a URL → page map.
#[derive(Debug, Default)]
pub struct StaticPageFetcher {
    pages: HashMap<String, ScriptedPage>,
    calls: AtomicUsize,
}

impl StaticPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, text: &str, images: &[&str]) -> Self {
        self.insert(url, text, images, None)
    }

    pub fn with_delayed_page(
        self,
        url: &str,
        text: &str,
        images: &[&str],
        delay: Duration,
    ) -> Self {
        self.insert(url, text, images, Some(delay))
    }

    pub fn with_failure(mut self, url: &str, reason: &str) -> Self {
        self.pages
            .insert(url.to_string(), ScriptedPage::Failure(reason.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn insert(mut self, url: &str, text: &str, images: &[&str], delay: Option<Duration>) -> Self {
        let page = FetchedPage {
            text: text.to_string(),
            image_refs: images.iter().map(|s| s.to_string()).collect(),
        };
        self.pages
            .insert(url.to_string(), ScriptedPage::Page { page, delay });
        self
    }
}

#[async_trait]
impl PageFetcher for StaticPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.pages.get(url) {
            Some(ScriptedPage::Page { page, delay }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(*delay).await;
                }
                Ok(page.clone())
            }
            Some(ScriptedPage::Failure(reason)) => {
                Err(PipelineError::fetch_failed(url, reason.clone(), false))
            }
            None => Err(PipelineError::fetch_failed(url, "HTTP 404 Not Found", false)),
        }
    }
}

/// Vision model with scripted answers, failures and latencies per image.
#[derive(Debug, Default)]
pub struct ScriptedVisionModel {
    descriptions: HashMap<String, String>,
    failures: HashSet<String>,
    delays: HashMap<String, Duration>,
}

impl ScriptedVisionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_description(mut self, image_ref: &str, description: &str) -> Self {
        self.descriptions
            .insert(image_ref.to_string(), description.to_string());
        self
    }

    pub fn with_failure(mut self, image_ref: &str) -> Self {
        self.failures.insert(image_ref.to_string());
        self
    }

    pub fn with_delay(mut self, image_ref: &str, delay: Duration) -> Self {
        self.delays.insert(image_ref.to_string(), delay);
        self
    }
}

#[async_trait]
impl VisionModel for ScriptedVisionModel {
    async fn describe(&self, image_ref: &str) -> Result<ImageDescription, PipelineError> {
        if let Some(delay) = self.delays.get(image_ref) {
            tokio::time::sleep(*delay).await;
        }
        if self.failures.contains(image_ref) {
            return Err(PipelineError::image_failed(image_ref, "simulated model failure", false));
        }
        let description = self
            .descriptions
            .get(image_ref)
            .cloned()
            .unwrap_or_else(|| format!("Illustration from {image_ref}"));
        Ok(ImageDescription {
            description,
            confidence: Some(0.9),
        })
    }
}

/// Collaborators for `deepscout run --offline`.
#[derive(Debug)]
pub struct OfflineFixture {
    pub search: StaticSearchProvider,
    pub fetcher: StaticPageFetcher,
    pub vision: ScriptedVisionModel,
}

impl OfflineFixture {
    /// Three sample sources whose content loosely follows `query`.
    pub fn demo(query: &str) -> Self {
        let topic = query.trim();
        let sources = [
            ("https://offline.deepscout.dev/market-overview", "Market overview", 2021, 20.8, 41.0),
            ("https://offline.deepscout.dev/field-study", "Field study", 2022, 21.7, 37.5),
            ("https://offline.deepscout.dev/lab-results", "Lab results", 2023, 22.9, 33.0),
        ];

        let mut results = Vec::new();
        let mut fetcher = StaticPageFetcher::new();
        let mut vision = ScriptedVisionModel::new();
        for (idx, (url, title, year, efficiency, cost)) in sources.into_iter().enumerate() {
            let text = format!(
                "{title} for {topic}.\n\
                 Measured efficiency was {efficiency}% in {year}.\n\
                 Average installed cost stood at {cost} in {year}.\n\
                 The study compared several deployments and documented methodology, sample sizes, \
                 and measurement conditions so that the numbers can be compared across sources."
            );
            let chart = format!("{url}/chart.png");
            let photo = format!("{url}/site.jpg");
            fetcher = fetcher.with_page(url, &text, &[chart.as_str(), photo.as_str()]);
            vision = vision
                .with_description(
                    &chart,
                    &format!("A line chart; measured efficiency is {efficiency}% in {year}."),
                )
                .with_description(&photo, "A photograph of a rooftop installation.");
            results.push(
                SearchResult::new(url, format!("{title}: {topic}"), idx as u32 + 1)
                    .with_snippet(format!("{title} covering {topic}")),
            );
        }

        Self {
            search: StaticSearchProvider::new(results),
            fetcher,
            vision,
        }
    }
}
