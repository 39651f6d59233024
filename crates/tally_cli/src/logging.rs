use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How chatty the session is, from the command-line flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// `--no-log`: warnings and errors only.
    Quiet,
    Normal,
    /// `--verbose`: every send, receive and connect attempt.
    Verbose,
}

impl Verbosity {
    pub fn from_flags(no_log: bool, verbose: bool) -> Self {
        if no_log {
            Self::Quiet
        } else if verbose {
            Self::Verbose
        } else {
            Self::Normal
        }
    }

    /// Filter used when `RUST_LOG` is not set.
    pub fn default_filter(self) -> &'static str {
        match self {
            Self::Quiet => "warn",
            Self::Normal => "info",
            Self::Verbose => "info,tally_core=debug,tally=debug",
        }
    }
}

/// Log file for party `index` of an `m`-party local run.
pub fn log_file_name(m: usize, index: u8) -> String {
    format!("party{m}_{index}.log")
}

/// Initializes compact console logging.
pub fn init_console(verbosity: Verbosity) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_filter()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}

/// Append log output to `dir/file_name` instead of the console.
/// Returns a guard that must be kept alive until the session ends.
pub fn init_file(dir: &Path, file_name: &str, verbosity: Verbosity) -> Result<WorkerGuard> {
    std::fs::create_dir_all(dir)?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.default_filter()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_from_flags() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Verbose);
        // --no-log wins over --verbose.
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Quiet);
    }

    #[test]
    fn test_default_filters_parse() {
        for verbosity in [Verbosity::Quiet, Verbosity::Normal, Verbosity::Verbose] {
            let filter = EnvFilter::try_new(verbosity.default_filter());
            assert!(filter.is_ok(), "bad filter for {verbosity:?}");
        }
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name(3, 1), "party3_1.log");
        assert_eq!(log_file_name(12, 11), "party12_11.log");
    }

    #[test]
    fn test_init_file_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; the directory is created
        // either way.
        let result = init_file(&logs_dir, &log_file_name(2, 1), Verbosity::Quiet);
        assert!(logs_dir.exists());

        match result {
            Ok(guard) => drop(guard),
            Err(e) => {
                let msg = e.to_string();
                assert!(msg.contains("logging"), "unexpected error: {msg}");
            }
        }
    }
}
