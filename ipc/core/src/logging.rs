//! Logging setup
//!
//! The crate only emits `tracing` events. Applications that do not install
//! their own subscriber can call [`init_logging`].

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

pub type LoggingError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Filter used when `RUST_LOG` is not set
pub fn default_filter(level: LogLevel) -> String {
    format!("ipc_core={}", level.as_directive())
}

/// Install a global fmt subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(level: LogLevel) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(LogLevel::Debug), "ipc_core=debug");
        assert_eq!(default_filter(LogLevel::default()), "ipc_core=error");
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_logging(LogLevel::Warn);
        assert!(init_logging(LogLevel::Warn).is_err());
    }
}
