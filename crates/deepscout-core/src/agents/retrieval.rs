use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, instrument, warn};

use crate::config::RetrievalConfig;
use crate::error::PipelineError;
use crate::model::{ImageInsight, SearchResult, SourceRecord};
use crate::retry::RetryPolicy;

/// Readable content extracted from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    pub text: String,
    /// Absolute image references in document order.
    pub image_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescription {
    pub description: String,
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError>;
}

/// Vision-language model boundary.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn describe(&self, image_ref: &str) -> Result<ImageDescription, PipelineError>;
}

/// Fetches a single source and describes its images.
///
/// `retrieve` never fails: every outcome, including a dead URL, is folded
/// into the returned record's status so one source cannot sink the run.
pub struct RetrievalAgent {
    fetcher: Arc<dyn PageFetcher>,
    vision: Arc<dyn VisionModel>,
    retry: RetryPolicy,
    max_images: usize,
    image_concurrency: usize,
    min_text_chars: usize,
}

impl RetrievalAgent {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        vision: Arc<dyn VisionModel>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            fetcher,
            vision,
            retry: RetryPolicy::default(),
            max_images: config.max_images_per_page,
            image_concurrency: config.image_concurrency.max(1),
            min_text_chars: config.min_text_chars,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[instrument(
        name = "agent.retrieve",
        skip(self, result),
        fields(rank = result.rank, url = %result.url)
    )]
    pub async fn retrieve(&self, result: &SearchResult) -> SourceRecord {
        let fetcher = &self.fetcher;
        let url = result.url.as_str();
        let fetched = self.retry.run("fetch", move |_| fetcher.fetch(url)).await;

        let page = match fetched.result {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, attempts = fetched.attempts, "source fetch failed");
                return SourceRecord::failed(result, err.to_string());
            }
        };

        let mut builder = SourceRecord::builder(result).text(page.text);
        let image_refs: Vec<String> = page.image_refs.into_iter().take(self.max_images).collect();

        let outcomes: Vec<(String, Result<ImageDescription, PipelineError>)> =
            stream::iter(image_refs)
                .map(|image_ref| async move {
                    let vision = &self.vision;
                    let target = image_ref.as_str();
                    let attempted = self
                        .retry
                        .run("describe_image", move |_| vision.describe(target))
                        .await;
                    (image_ref, attempted.result)
                })
                .buffered(self.image_concurrency)
                .collect()
                .await;

        for (image_ref, outcome) in outcomes {
            match outcome {
                Ok(description) => builder.push_image(ImageInsight {
                    image_ref,
                    vlm_description: description.description,
                    confidence: description.confidence,
                }),
                Err(err) => {
                    debug!(image = %image_ref, error = %err, "image description failed");
                    builder.record_image_failure(format!("{image_ref}: {err}"));
                }
            }
        }

        builder.build(self.min_text_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FetchStatus;
    use crate::providers::offline::{ScriptedVisionModel, StaticPageFetcher};
    use std::time::Duration;

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            min_text_chars: 10,
            max_images_per_page: 3,
            ..RetrievalConfig::default()
        }
    }

    fn hit() -> SearchResult {
        SearchResult::new("https://a.test/article", "Article", 1)
    }

    fn agent(fetcher: StaticPageFetcher, vision: ScriptedVisionModel) -> RetrievalAgent {
        RetrievalAgent::new(Arc::new(fetcher), Arc::new(vision), &config())
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn full_page_with_described_images_is_ok() {
        let fetcher = StaticPageFetcher::new().with_page(
            "https://a.test/article",
            "Panel efficiency is 22% in 2023.",
            &["https://a.test/1.png", "https://a.test/2.png"],
        );
        let record = agent(fetcher, ScriptedVisionModel::new()).retrieve(&hit()).await;

        assert_eq!(record.fetch_status(), FetchStatus::Ok);
        assert_eq!(record.images().len(), 2);
        assert_eq!(record.images()[0].image_ref, "https://a.test/1.png");
        assert_eq!(record.images()[1].image_ref, "https://a.test/2.png");
    }

    #[tokio::test]
    async fn one_failed_image_makes_the_record_partial() {
        let fetcher = StaticPageFetcher::new().with_page(
            "https://a.test/article",
            "Panel efficiency is 22% in 2023.",
            &["https://a.test/1.png", "https://a.test/2.png"],
        );
        let vision = ScriptedVisionModel::new().with_failure("https://a.test/2.png");
        let record = agent(fetcher, vision).retrieve(&hit()).await;

        assert_eq!(record.fetch_status(), FetchStatus::Partial);
        assert_eq!(record.images().len(), 1);
        assert_eq!(record.failed_images(), 1);
        assert!(record.failure_reason().unwrap().contains("2.png"));
    }

    #[tokio::test]
    async fn image_order_survives_uneven_latency() {
        let fetcher = StaticPageFetcher::new().with_page(
            "https://a.test/article",
            "Panel efficiency is 22% in 2023.",
            &["https://a.test/slow.png", "https://a.test/fast.png"],
        );
        let vision = ScriptedVisionModel::new()
            .with_delay("https://a.test/slow.png", Duration::from_millis(40));
        let record = agent(fetcher, vision).retrieve(&hit()).await;

        let refs: Vec<_> = record.images().iter().map(|i| i.image_ref.as_str()).collect();
        assert_eq!(refs, vec!["https://a.test/slow.png", "https://a.test/fast.png"]);
    }

    #[tokio::test]
    async fn image_count_is_capped() {
        let fetcher = StaticPageFetcher::new().with_page(
            "https://a.test/article",
            "Panel efficiency is 22% in 2023.",
            &["1.png", "2.png", "3.png", "4.png", "5.png"],
        );
        let record = agent(fetcher, ScriptedVisionModel::new()).retrieve(&hit()).await;
        assert_eq!(record.images().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_page_becomes_a_failed_record() {
        let fetcher =
            StaticPageFetcher::new().with_failure("https://a.test/article", "connection refused");
        let record = agent(fetcher, ScriptedVisionModel::new()).retrieve(&hit()).await;

        assert_eq!(record.fetch_status(), FetchStatus::Failed);
        assert!(record.failure_reason().unwrap().contains("connection refused"));
        assert_eq!(record.rank(), 1);
    }
}
