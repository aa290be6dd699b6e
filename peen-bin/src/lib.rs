//! Shared pieces of the `peen` binary.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Builds the logging and progress stack.
///
/// The env_logger filter starts at `default_filter` (the CLI verbosity
/// choice); a `RUST_LOG` setting in the environment still wins. The logger is
/// routed through the returned [`MultiProgress`] so log lines do not tear the
/// progress bars.
pub fn init_logging_with_progress(default_filter: &str) -> anyhow::Result<MultiProgress> {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), env_logger::Builder::from_env(env).build()).try_init()?;
    Ok(progress)
}
