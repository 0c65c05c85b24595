//! Tracing setup.
//!
//! Long-running commands (`serve`, `connect`) log to a daily file under the
//! relay home as well as stderr. One-shot commands keep their output readable
//! and only print warnings.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::get_home_dir;

/// Overrides the default filter directives.
pub const ENV_LOG: &str = "A2A_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Relay server or live endpoint.
    Service,
    /// Single request and exit.
    OneShot,
}

fn default_directives(mode: LogMode) -> &'static str {
    match mode {
        LogMode::Service => "info,a2a_relay=debug,tower_http=info",
        LogMode::OneShot => "warn",
    }
}

fn filter_for(mode: LogMode) -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new(default_directives(mode)))
}

/// Install the global subscriber.
///
/// In service mode the returned guard flushes the file writer on drop and must
/// be held until the process exits.
pub fn init(mode: LogMode) -> Result<Option<(WorkerGuard, PathBuf)>> {
    let filter = filter_for(mode);

    if mode == LogMode::OneShot {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .without_time(),
            )
            .try_init()?;
        return Ok(None);
    }

    let log_dir = get_home_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "a2a-relay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    tracing::debug!("Logging to {}", log_dir.display());
    Ok(Some((guard, log_dir)))
}

/// Console-only logging for tests. Safe to call more than once.
#[cfg(test)]
pub fn init_test() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_parse() {
        for mode in [LogMode::Service, LogMode::OneShot] {
            assert!(EnvFilter::try_new(default_directives(mode)).is_ok());
        }
    }
}
