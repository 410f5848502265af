use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error type for DeepScout.
///
/// Only `SearchUnavailable` (after retries) and configuration problems can end
/// a run. Every other variant is caught by the stage that owns the affected
/// unit and degraded into a status marker.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("search provider unavailable: {reason}")]
    SearchUnavailable { reason: String, retryable: bool },
    #[error("fetch failed for {url}: {reason}")]
    FetchFailed {
        url: String,
        reason: String,
        retryable: bool,
    },
    #[error("image analysis failed for {image_ref}: {reason}")]
    ImageAnalysisFailed {
        image_ref: String,
        reason: String,
        retryable: bool,
    },
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("chart rendering failed for {chart_id}: {reason}")]
    RenderFailed { chart_id: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn search_unavailable(reason: impl Into<String>, retryable: bool) -> Self {
        Self::SearchUnavailable {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn fetch_failed(
        url: impl Into<String>,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::FetchFailed {
            url: url.into(),
            reason: reason.into(),
            retryable,
        }
    }

    pub fn image_failed(
        image_ref: impl Into<String>,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::ImageAnalysisFailed {
            image_ref: image_ref.into(),
            reason: reason.into(),
            retryable,
        }
    }

    pub fn render_failed(chart_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RenderFailed {
            chart_id: chart_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether a bounded retry may succeed where this attempt did not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SearchUnavailable { retryable, .. }
            | Self::FetchFailed { retryable, .. }
            | Self::ImageAnalysisFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfiguration(_) | Self::MissingSecret(_) | Self::ConfigIo { .. } => {
                ErrorKind::Configuration
            }
            Self::InvalidQuery(_) => ErrorKind::InvalidQuery,
            Self::SearchUnavailable { .. } => ErrorKind::SearchUnavailable,
            Self::FetchFailed { .. } => ErrorKind::FetchFailed,
            Self::ImageAnalysisFailed { .. } => ErrorKind::ImageAnalysisFailed,
            Self::InsufficientData(_) => ErrorKind::InsufficientData,
            Self::RenderFailed { .. } => ErrorKind::RenderFailed,
            Self::Other(_) => ErrorKind::Internal,
        }
    }
}

/// Serializable error classification carried by failure reports and run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InvalidQuery,
    SearchUnavailable,
    NoSearchResults,
    FetchFailed,
    ImageAnalysisFailed,
    InsufficientData,
    RenderFailed,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::InvalidQuery => "invalid_query",
            ErrorKind::SearchUnavailable => "search_unavailable",
            ErrorKind::NoSearchResults => "no_search_results",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::ImageAnalysisFailed => "image_analysis_failed",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::RenderFailed => "render_failed",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_flag() {
        assert!(PipelineError::search_unavailable("503", true).is_retryable());
        assert!(!PipelineError::search_unavailable("401", false).is_retryable());
        assert!(PipelineError::fetch_failed("https://a.test", "reset", true).is_retryable());
        assert!(!PipelineError::InvalidQuery("empty".into()).is_retryable());
        assert!(!PipelineError::render_failed("chart", "no font").is_retryable());
    }

    #[test]
    fn kinds_map_to_the_taxonomy() {
        assert_eq!(
            PipelineError::image_failed("img.png", "timeout", true).kind(),
            ErrorKind::ImageAnalysisFailed
        );
        assert_eq!(
            PipelineError::MissingSecret("KEY".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(ErrorKind::NoSearchResults.to_string(), "no_search_results");
    }
}
