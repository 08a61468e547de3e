use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEBUG_LOG_ENV: &str = "BOMWATCH_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "bomwatch.log";

/// Installs the global subscriber. With a log directory, output is also
/// written to a daily rolling file; the returned guard must be kept alive for
/// the life of the process or buffered lines are lost.
pub fn init(directory: Option<&Path>) -> Option<WorkerGuard> {
    let filter = build_filter(env::var(DEBUG_LOG_ENV).ok().as_deref());

    let Some(directory) = directory else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    if let Err(err) = fs_err::create_dir_all(directory) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!(error = %err, "Log directory unavailable; logging to stderr only");
        return None;
    }

    let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Some(guard)
}

fn build_filter(debug_flag: Option<&str>) -> EnvFilter {
    if debug_enabled(debug_flag) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_values() {
        assert!(debug_enabled(Some("1")));
        assert!(debug_enabled(Some("yes")));
        assert!(!debug_enabled(Some("0")));
        assert!(!debug_enabled(None));
    }
}
