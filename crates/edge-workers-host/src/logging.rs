//! Guest console output.
//!
//! `console.*` calls in the sandbox end up in [`LoggingHost::log`], which
//! appends them to the worker's Log Channel. The channel also emits each
//! entry through `tracing`.

use edge_workers_core::{GuestScope, LogLevel};

/// Host implementation of the guest console.
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message for the scope's worker.
    ///
    /// # Arguments
    ///
    /// * `scope` - The sandbox the message came from
    /// * `level` - The log level
    /// * `message` - The formatted console line
    pub fn log(scope: &GuestScope, level: LogLevel, message: &str) {
        scope.logs().append(scope.worker_id(), level, message);
    }
}

/// Convert a console method's level name to [`LogLevel`].
///
/// `log`, `info`, `debug` and `trace` all map to `Info`; unknown names do too.
pub fn level_from_name(level: &str) -> LogLevel {
    match level.to_ascii_lowercase().as_str() {
        "warn" | "warning" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use edge_workers_core::LogChannel;

    use super::*;

    #[test]
    fn test_level_from_name() {
        assert_eq!(level_from_name("info"), LogLevel::Info);
        assert_eq!(level_from_name("log"), LogLevel::Info);
        assert_eq!(level_from_name("WARN"), LogLevel::Warn);
        assert_eq!(level_from_name("error"), LogLevel::Error);
        assert_eq!(level_from_name("bogus"), LogLevel::Info);
    }

    #[tokio::test]
    async fn test_logging_appends_to_channel() {
        let logs = LogChannel::new(10);
        let scope = GuestScope::new("w1", logs.clone(), tokio::runtime::Handle::current());

        LoggingHost::log(&scope, LogLevel::Info, "Hello");
        LoggingHost::log(&scope, LogLevel::Error, "World");

        let entries = logs.get_logs("w1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "Hello");
        assert_eq!(entries[1].level, LogLevel::Error);
        assert!(logs.get_logs("other").is_empty());
    }
}
