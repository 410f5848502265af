//! The four stage agents. None of them holds run state or knows about the
//! others; the Manager wires their inputs and outputs together.

mod analyst;
mod facts;
mod reporter;
mod retrieval;
mod search;

pub use analyst::AnalystAgent;
pub use facts::{ExtractedFact, extract_facts, normalize_label};
pub use reporter::{ChartRenderer, ChartSpec, ReporterAgent, report_filename, write_report};
pub use retrieval::{FetchedPage, ImageDescription, PageFetcher, RetrievalAgent, VisionModel};
pub use search::{SearchAgent, SearchProvider, normalize_results, normalize_url};
