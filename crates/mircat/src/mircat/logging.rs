use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::mircat::config::LoggingConfig;

/// Keeps the background log writer alive; drop it last so buffered lines are flushed.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Text,
}

fn parse_format(s: &str) -> anyhow::Result<Format> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "json" => Ok(Format::Json),
        "text" | "pretty" => Ok(Format::Text),
        other => anyhow::bail!("logging: unknown format {other:?} (expected json|text)"),
    }
}

fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Install the global subscriber.
///
/// `MIRCAT_LOG` (then `RUST_LOG`) overrides the configured level with a full
/// `EnvFilter` directive.
pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let format = parse_format(&logging.format)?;

    let filter = EnvFilter::try_from_env("MIRCAT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(level_directive(&logging.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(logging.output.trim())?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(format == Format::Text && logging.output.trim() == "stderr")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let layer = match format {
        Format::Json => layer.json().boxed(),
        Format::Text => layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let p = Path::new(path);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
