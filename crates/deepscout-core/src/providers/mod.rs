//! Concrete collaborators behind the agent traits: live HTTP clients, the SVG
//! chart renderer, and deterministic offline stand-ins.

mod http_fetch;
pub mod offline;
mod openai_vision;
mod svg_charts;
mod tavily;

pub use http_fetch::{HttpPageFetcher, extract_page};
pub use openai_vision::OpenAiVisionModel;
pub use svg_charts::SvgChartRenderer;
pub use tavily::TavilySearchProvider;

use reqwest::StatusCode;

/// Transport failures that may clear up on their own.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn http_client(user_agent: &str, timeout: std::time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }
}
