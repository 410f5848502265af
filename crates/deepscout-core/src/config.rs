use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{PipelineError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "deepscout.toml";
const CONFIG_PATH_ENV: &str = "DEEPSCOUT_CONFIG";
const MAX_PROJECTION_HORIZON: u32 = 100;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub retrieval: RetrievalConfig,
    pub vlm: VlmConfig,
    pub retry: RetryConfig,
    pub analyst: AnalystConfig,
    pub reporter: ReporterConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the search provider key (from environment only).
    pub fn search_api_key(&self) -> Result<SecretValue, PipelineError> {
        require_env(&self.search.api_key_env)
    }

    /// Resolve the vision model key (from environment only).
    pub fn vlm_api_key(&self) -> Result<SecretValue, PipelineError> {
        require_env(&self.vlm.api_key_env)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `DEEPSCOUT_CONFIG` environment variable.
    /// 3. `deepscout.toml` in the current working directory.
    ///
    /// Only the implicit default file may be absent; built-in defaults are
    /// used in that case.
    pub fn load(path: Option<PathBuf>) -> Result<Config, PipelineError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            tracing::debug!(path = %candidate.display(), "no config file found, using defaults");
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| PipelineError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn parse(raw: &str) -> Result<Config, PipelineError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| PipelineError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), PipelineError> {
        if config.retrieval.max_concurrent_fetches == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "retrieval.max_concurrent_fetches must be at least 1".into(),
            ));
        }
        if config.retrieval.image_concurrency == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "retrieval.image_concurrency must be at least 1".into(),
            ));
        }
        if config.retrieval.run_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "retrieval.run_timeout_ms must be positive".into(),
            ));
        }
        if config.search.max_results == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "search.max_results must be at least 1".into(),
            ));
        }
        if config
            .search
            .query_variants
            .iter()
            .any(|template| !template.contains("{topic}"))
        {
            return Err(PipelineError::InvalidConfiguration(
                "search.query_variants entries must contain {topic}".into(),
            ));
        }
        if config.analyst.projection_horizon > MAX_PROJECTION_HORIZON {
            return Err(PipelineError::InvalidConfiguration(format!(
                "analyst.projection_horizon must not exceed {MAX_PROJECTION_HORIZON}"
            )));
        }
        if config.retry.initial_backoff_ms > config.retry.max_backoff_ms {
            return Err(PipelineError::InvalidConfiguration(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Checks the live provider settings, including that the referenced
    /// secrets exist, without returning them.
    pub fn validate_live(config: &Config) -> Result<(), PipelineError> {
        if config.search.api_key_env.trim().is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "search.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.vlm.api_key_env.trim().is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "vlm.api_key_env must reference an environment variable".into(),
            ));
        }
        require_env(&config.search.api_key_env)?;
        require_env(&config.vlm.api_key_env)?;
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,
    pub api_key_env: String,
    /// Top-K cut applied after deduplication.
    pub max_results: usize,
    pub search_depth: String,
    /// Query templates run side by side; `{topic}` and `{year}` are
    /// substituted.
    pub query_variants: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.tavily.com/search".into(),
            api_key_env: "TAVILY_API_KEY".into(),
            max_results: 10,
            search_depth: "advanced".into(),
            query_variants: vec![
                "{topic}".into(),
                "{topic} {year}".into(),
                "{topic} trends {year}".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_concurrent_fetches: usize,
    /// Wall clock budget for the whole fan-out.
    pub run_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_images_per_page: usize,
    pub image_concurrency: usize,
    /// Pages with less extracted text are kept but marked partial.
    pub min_text_chars: usize,
    pub user_agent: String,
}

impl RetrievalConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 5,
            run_timeout_ms: 60_000,
            request_timeout_ms: 15_000,
            max_images_per_page: 6,
            image_concurrency: 2,
            min_text_chars: 200,
            user_agent: concat!("deepscout/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub prompt: String,
    pub timeout_ms: u64,
}

impl VlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            prompt: "Describe this image for a research report. Focus on facts and visual \
                     details: objects, shapes, colours, materials, and any numbers or \
                     labels shown in charts or tables."
                .into(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Zero disables retries; a search outage is then fatal on first failure.
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

/// How conflicting values for one topic are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Most supporting records wins, then newest fetch, then best rank.
    #[default]
    Majority,
    /// Newest fetch wins, then best rank.
    MostRecent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub projection_horizon: u32,
    pub tie_break: TieBreak,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            projection_horizon: 1,
            tie_break: TieBreak::Majority,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    pub output_dir: PathBuf,
    pub max_charts: usize,
    pub chart_width: u32,
    pub chart_height: u32,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            max_charts: 4,
            chart_width: 800,
            chart_height: 480,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ConfigLoader::parse("").expect("defaults are valid");
        assert_eq!(config.search.max_results, 10);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.analyst.tie_break, TieBreak::Majority);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ConfigLoader::parse(
            r#"
            [retrieval]
            run_timeout_ms = 5000

            [analyst]
            tie_break = "most_recent"
            projection_horizon = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.retrieval.run_timeout(), Duration::from_secs(5));
        assert_eq!(config.retrieval.max_concurrent_fetches, 5);
        assert_eq!(config.analyst.tie_break, TieBreak::MostRecent);
        assert_eq!(config.analyst.projection_horizon, 3);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = ConfigLoader::parse("[retrieval]\nmax_concurrent_fetches = 0").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
    }

    #[test]
    fn unknown_tie_break_is_rejected() {
        let err = ConfigLoader::parse("[analyst]\ntie_break = \"coin_flip\"").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
    }

    #[test]
    fn default_search_runs_three_query_variants() {
        let config = Config::default();
        assert_eq!(
            config.search.query_variants,
            vec!["{topic}", "{topic} {year}", "{topic} trends {year}"]
        );
    }

    #[test]
    fn variants_without_topic_are_rejected() {
        let err =
            ConfigLoader::parse("[search]\nquery_variants = [\"news {year}\"]").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfiguration(_)));
    }

    #[test]
    fn oversized_projection_horizon_is_rejected() {
        let err = ConfigLoader::parse("[analyst]\nprojection_horizon = 4000000000").unwrap_err();
        assert!(err.to_string().contains("projection_horizon"));
        assert!(ConfigLoader::parse("[analyst]\nprojection_horizon = 100").is_ok());
    }

    #[test]
    fn explicit_missing_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::load(Some(dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigIo { .. }));
    }

    #[test]
    fn live_validation_requires_secrets() {
        let mut config = Config::default();
        config.search.api_key_env = "DEEPSCOUT_TEST_ABSENT_SEARCH_KEY".into();
        unsafe {
            std::env::remove_var("DEEPSCOUT_TEST_ABSENT_SEARCH_KEY");
        }
        let err = ConfigLoader::validate_live(&config).unwrap_err();
        assert!(matches!(err, PipelineError::MissingSecret(_)));
    }
}
