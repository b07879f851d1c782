use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes logging: a daily-rolling file in `logs_dir` plus compact
/// console output on stderr. `RUST_LOG` overrides `level`.
///
/// Returns a guard that must be kept alive for the duration of the app.
pub fn init_logging(logs_dir: &Path, level: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "weave");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

/// `level` for our crates, `warn` for everything else.
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("warn,weave_app={level},weave_network={level}"))
        .unwrap_or_else(|_| EnvFilter::new("warn,weave_app=info,weave_network=info"))
}
