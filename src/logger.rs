//! Pluggable sink for connection-level failures.
//!
//! The runtime reports callback and fatal I/O failures through a [`Logger`]
//! rather than a fixed logging framework. Without one configured the reports
//! are dropped ([`NoOpLogger`]); [`TracingLogger`] forwards them to `tracing`.

/// Log levels for network events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger trait for network events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Forwards every message to the `tracing` macros of the matching level.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "rush_net", "{message}"),
            LogLevel::Info => tracing::info!(target: "rush_net", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "rush_net", "{message}"),
            LogLevel::Error => tracing::error!(target: "rush_net", "{message}"),
        }
    }
}
