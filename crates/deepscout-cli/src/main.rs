use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use deepscout_core::providers::offline::OfflineFixture;
use deepscout_core::providers::{
    HttpPageFetcher, OpenAiVisionModel, SvgChartRenderer, TavilySearchProvider,
};
use deepscout_core::{
    Config, ConfigLoader, Manager, PageFetcher, RunOutcome, RunRecord, SearchProvider,
    TelemetryOptions, VisionModel, init_telemetry, persist_run_record, persist_trace,
    persist_trace_summary, write_report,
};
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "deepscout",
    version,
    about = "Multi-agent web research with image understanding"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research a query and write a Markdown report.
    Run(RunArgs),
    /// Print the effective configuration as TOML.
    ShowConfig(ShowConfigArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Query to research.
    #[arg(long)]
    query: String,

    /// Path to a TOML config file (defaults to `deepscout.toml` or `DEEPSCOUT_CONFIG`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory receiving the report and its charts.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Maximum number of search results to research.
    #[arg(long)]
    max_urls: Option<usize>,

    /// Overall retrieval deadline in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Use built-in sample sources instead of live providers.
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Persist the stage trace (JSON plus a markdown/mermaid summary) into this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Append a JSONL run record into this directory.
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Print the run record as JSON instead of a text summary.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ShowConfigArgs {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run_command(args),
        Command::ShowConfig(args) => {
            let config = ConfigLoader::load(args.config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_command(args: RunArgs) -> Result<ExitCode> {
    let mut config = ConfigLoader::load(args.config.clone())?;
    apply_overrides(&mut config, &args);
    init_telemetry(TelemetryOptions::for_level(&config.logging.level))?;

    let manager = build_manager(&config, &args)?;

    let rt = Runtime::new()?;
    let outcome = rt.block_on(async { manager.run(&args.query).await });

    let report_path = match outcome.report() {
        Some(report) => Some(write_report(report, &config.reporter.output_dir, &args.query)?),
        None => None,
    };

    let run_id = outcome.context().run_id().to_string();
    if let Some(dir) = &args.trace_dir {
        let trace = outcome.context().trace();
        match persist_trace(dir, &run_id, trace.events()) {
            Ok(path) => info!(path = %path.display(), "trace persisted"),
            Err(err) => warn!(error = %err, "failed to persist trace"),
        }
        match persist_trace_summary(dir, &run_id, &trace.summary()) {
            Ok(path) => info!(path = %path.display(), "trace summary persisted"),
            Err(err) => warn!(error = %err, "failed to persist trace summary"),
        }
    }
    if let Some(dir) = &args.record_dir {
        persist_run_record(dir, &outcome, report_path.as_deref());
    }

    if args.json {
        let record = RunRecord::from_outcome(&outcome, report_path.as_deref());
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_summary(&outcome, report_path.as_ref());
    }

    if let Some(failure) = outcome.failure() {
        eprintln!("{}", failure.render_markdown());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(dir) = &args.output_dir {
        config.reporter.output_dir = dir.clone();
    }
    if let Some(max_urls) = args.max_urls {
        config.search.max_results = max_urls.max(1);
    }
    if let Some(secs) = args.timeout_secs {
        config.retrieval.run_timeout_ms = secs.max(1).saturating_mul(1_000);
    }
}

fn build_manager(config: &Config, args: &RunArgs) -> Result<Manager> {
    let (provider, fetcher, vision): (
        Arc<dyn SearchProvider>,
        Arc<dyn PageFetcher>,
        Arc<dyn VisionModel>,
    ) = if args.offline {
        info!("using offline sample sources");
        let OfflineFixture {
            search,
            fetcher,
            vision,
        } = OfflineFixture::demo(&args.query);
        (Arc::new(search), Arc::new(fetcher), Arc::new(vision))
    } else {
        ConfigLoader::validate_live(config).context("live providers are not configured")?;
        let provider = TavilySearchProvider::new(
            &config.search,
            config.search_api_key()?,
            config.retrieval.request_timeout(),
        )?;
        let fetcher = HttpPageFetcher::new(&config.retrieval)?;
        let vision = OpenAiVisionModel::new(&config.vlm, config.vlm_api_key()?)?;
        (Arc::new(provider), Arc::new(fetcher), Arc::new(vision))
    };

    let renderer = Arc::new(SvgChartRenderer::new(&config.reporter));
    Ok(Manager::from_config(
        config, provider, fetcher, vision, renderer,
    ))
}

fn print_summary(outcome: &RunOutcome, report_path: Option<&PathBuf>) {
    let context = outcome.context();
    println!("Run {} finished in stage {}", context.run_id(), outcome.final_stage());
    if let Some(analysis) = context.analysis() {
        let coverage = &analysis.coverage;
        println!(
            "Sources: {} usable of {} ({} failed)",
            coverage.usable_sources, coverage.total_sources, coverage.failed_sources
        );
        println!("Metrics: {}", analysis.statistics.len());
    }
    if let Some(report) = outcome.report() {
        println!("Charts: {}", report.visualization_refs.len());
    }
    if let Some(path) = report_path {
        println!("Report: {}", path.display());
    }
}
