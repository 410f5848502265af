use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::PipelineError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Configuration options when initialising telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter directive; `RUST_LOG` wins when set.
    pub env_filter: Option<String>,
    pub with_ansi: bool,
    pub with_target: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
            with_target: false,
        }
    }
}

impl TelemetryOptions {
    /// Options for a configured base level, scoping verbose levels to this crate.
    pub fn for_level(level: &str) -> Self {
        Self {
            env_filter: Some(format!("warn,deepscout_core={level},deepscout={level}")),
            ..Default::default()
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), PipelineError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or(options.env_filter)
        .unwrap_or_else(|| "info".to_string());

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi)
        .with_target(options.with_target)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| {
            PipelineError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_scoped_to_workspace_crates() {
        let options = TelemetryOptions::for_level("debug");
        assert_eq!(
            options.env_filter.as_deref(),
            Some("warn,deepscout_core=debug,deepscout=debug")
        );
    }

    #[test]
    fn repeated_initialisation_is_a_no_op() {
        assert!(init_telemetry(TelemetryOptions::default()).is_ok());
        assert!(init_telemetry(TelemetryOptions::default()).is_ok());
    }
}
