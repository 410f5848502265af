use std::collections::HashSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Url;
use reqwest::header::CONTENT_TYPE;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{http_client, is_retryable_status, is_transient};
use crate::agents::{FetchedPage, PageFetcher};
use crate::config::RetrievalConfig;
use crate::error::PipelineError;

const BLOCK_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "td", "th", "blockquote", "figcaption",
];
const EXCLUDED_TAGS: &[&str] = &["script", "style", "nav", "header", "footer", "noscript"];

static BLOCKS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6, p, li, td, th, blockquote, figcaption")
        .expect("block selector parses")
});
static IMAGES: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("img selector parses"));

/// Fetches pages over HTTP and extracts readable text plus image links.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    max_images: usize,
}

impl HttpPageFetcher {
    pub fn new(config: &RetrievalConfig) -> Result<Self, PipelineError> {
        let client = http_client(&config.user_agent, config.request_timeout()).map_err(|err| {
            PipelineError::InvalidConfiguration(format!("failed to build page client: {err}"))
        })?;
        Ok(Self {
            client,
            max_images: config.max_images_per_page,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, PipelineError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| PipelineError::fetch_failed(url, err.to_string(), is_transient(&err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch_failed(
                url,
                format!("HTTP {status}"),
                is_retryable_status(status),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        if !content_type.contains("html") {
            return Err(PipelineError::fetch_failed(
                url,
                format!("non-HTML content ({content_type})"),
                false,
            ));
        }

        let base = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|err| PipelineError::fetch_failed(url, err.to_string(), is_transient(&err)))?;

        let page = extract_page(&base, &html, self.max_images);
        debug!(
            url,
            text_chars = page.text.len(),
            images = page.image_refs.len(),
            "page extracted"
        );
        Ok(page)
    }
}

/// Pull block-level text and image references out of an HTML document.
pub fn extract_page(base: &Url, html: &str, max_images: usize) -> FetchedPage {
    let document = Html::parse_document(html);

    let lines: Vec<String> = document
        .select(&BLOCKS)
        .filter(|element| {
            !has_ancestor(element, EXCLUDED_TAGS) && !has_ancestor(element, BLOCK_TAGS)
        })
        .map(|element| element.text().collect::<Vec<_>>().join(" "))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();

    let mut seen = HashSet::new();
    let image_refs = document
        .select(&IMAGES)
        .filter(|element| !has_ancestor(element, EXCLUDED_TAGS))
        .filter_map(|element| {
            let value = element.value();
            value.attr("src").or_else(|| value.attr("data-src"))
        })
        .map(str::trim)
        .filter(|src| !src.is_empty() && !src.starts_with("data:"))
        .filter_map(|src| base.join(src).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(String::from)
        .filter(|url| seen.insert(url.clone()))
        .take(max_images)
        .collect();

    FetchedPage {
        text: lines.join("\n"),
        image_refs,
    }
}

fn has_ancestor(element: &ElementRef<'_>, tags: &[&str]) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|ancestor| tags.contains(&ancestor.name()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><head><style>p { color: red }</style><script>var x = "Efficiency is 99%";</script></head>
        <body>
          <nav><p>Home</p><img src="/logo.png"></nav>
          <header><p>Site banner</p></header>
          <h1>Solar  panel   efficiency</h1>
          <p>Module efficiency was 22% in 2023.</p>
          <ul><li>Cell efficiency is <b>26%</b></li></ul>
          <blockquote><p>Quoted once</p></blockquote>
          <img src="charts/trend.png">
          <img data-src="https://cdn.test/lazy.jpg">
          <img src="charts/trend.png">
          <img src="data:image/png;base64,AAAA">
          <footer><p>Copyright 2024</p></footer>
        </body></html>"#;

    fn base() -> Url {
        Url::parse("https://news.test/articles/solar").unwrap()
    }

    #[test]
    fn extracts_block_text_without_chrome() {
        let page = extract_page(&base(), PAGE, 10);
        let lines: Vec<_> = page.text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Solar panel efficiency",
                "Module efficiency was 22% in 2023.",
                "Cell efficiency is 26%",
                "Quoted once",
            ]
        );
        assert!(!page.text.contains("99%"));
        assert!(!page.text.contains("Copyright"));
    }

    #[test]
    fn resolves_and_deduplicates_images() {
        let page = extract_page(&base(), PAGE, 10);
        assert_eq!(
            page.image_refs,
            vec![
                "https://news.test/articles/charts/trend.png".to_string(),
                "https://cdn.test/lazy.jpg".to_string(),
            ]
        );
    }

    #[test]
    fn image_list_is_capped() {
        let page = extract_page(&base(), PAGE, 1);
        assert_eq!(page.image_refs.len(), 1);
    }
}
