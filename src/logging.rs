//! tracing subscriber set-up for the binary and embedders.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Number of `-v` flags.
    pub verbosity: u8,
    /// Filter from weaver.toml, used when `RUST_LOG` is unset and no `-v` was given.
    pub level: Option<String>,
    pub json: bool,
    /// Directory for daily-rolling log files.
    pub file_dir: Option<PathBuf>,
}

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(verbosity: u8, level: Option<&str>) -> String {
    match (verbosity, level) {
        (0, Some(level)) => level.to_string(),
        (0, None) => "warn".to_string(),
        (1, _) => "weaver=info".to_string(),
        (2, _) => "weaver=debug".to_string(),
        _ => "weaver=trace".to_string(),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the life of
/// the process so buffered file logs are flushed.
pub fn init(options: LoggingOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(default_directive(options.verbosity, options.level.as_deref()))
    });

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);
    if options.json {
        layers.push(console.json().boxed());
    } else {
        layers.push(console.compact().boxed());
    }

    let mut guard = None;
    if let Some(dir) = &options.file_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("weaver")
            .filename_suffix("log")
            .build(dir)
            .context("Failed to open log file")?;
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    // A subscriber may already be installed (tests, embedding applications).
    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .ok();

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0, None), "warn");
        assert_eq!(default_directive(0, Some("weaver=debug")), "weaver=debug");
        assert_eq!(default_directive(1, Some("error")), "weaver=info");
        assert_eq!(default_directive(2, None), "weaver=debug");
        assert_eq!(default_directive(5, None), "weaver=trace");
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init(LoggingOptions {
            file_dir: Some(logs.clone()),
            ..Default::default()
        })
        .unwrap();
        assert!(guard.is_some());
        assert!(logs.is_dir());
    }
}
