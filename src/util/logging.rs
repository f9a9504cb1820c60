use std::path::Path;

use anyhow::{Result, anyhow};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging system with tracing.
///
/// `RUST_LOG` takes precedence when set; otherwise the `verbose` flag picks
/// between the crate's debug and info defaults. If `log_dir` is provided,
/// logs are also written to a daily-rolling file in that directory.
///
/// Errors if a global subscriber is already installed.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "kumi_audio=debug,warn"
    } else {
        "kumi_audio=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(dir) = log_dir {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "kumi-audio.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // the guard flushes the writer on drop; keep it alive for the
        // lifetime of the process
        std::mem::forget(guard);

        registry
            .with(fmt::layer().with_target(true))
            .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    }
    .map_err(|e| anyhow!("logging already initialized: {e}"))
}
