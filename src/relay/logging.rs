//! Structured logging (C10): `tracing` + `tracing-subscriber` with a
//! non-blocking `tracing-appender` writer, text or JSON formatted.
//!
//! `RUST_LOG` always wins over the `--log-level` default, matching the
//! env-filter precedence the rest of the corpus uses.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the non-blocking writer's background thread alive for the
/// process's lifetime; drop it only at shutdown.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

pub fn init(level: &str, json: bool) -> anyhow::Result<LoggingRuntime> {
    let directive = match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .context("logging: init filter")?;

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true);

    let base_fmt = if json {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(base_fmt)
        .init();

    Ok(LoggingRuntime { _guard: guard })
}
