//! Tracing setup.
//!
//! Stdout carries the JSON command result, so diagnostics go to stderr.
//! `SHIPYARD_LOG` (or `RUST_LOG`) selects the filter; the default is `warn`.
//! When file logging is enabled, a daily-rolling file under `{home}/logs/`
//! receives the same events.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "shipyard=debug,info" } else { "warn" };
    std::env::var("SHIPYARD_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(fallback))
}

/// Install the global subscriber. Returns the file writer guard, which must
/// live until the process exits so buffered lines are flushed.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).compact();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shipyard.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().json().with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .ok()?;
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter(verbose))
                .with(stderr_layer)
                .try_init()
                .ok();
            None
        }
    }
}
