//! Callback logger.
//!
//! A root object (an engine) is handed one `LoggerCallback`; every
//! internal object joins that callback with its own category function to
//! form a `Logger`. There are no process-wide singletons — the sink is
//! whatever closure the embedder provides. `tracing_callback()` builds a
//! sink that forwards into the `tracing` ecosystem.

use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::SystemTime;

/// Category provider; each logging site names itself through one.
pub type CategoryFn = fn() -> &'static str;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One log record as delivered to the sink.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub category: &'static str,
    pub level: LogLevel,
    pub timestamp: SystemTime,
    pub thread: ThreadId,
    pub message: String,
}

/// Shared logging sink.
pub type LoggerCallback = Arc<dyn Fn(LogMessage) + Send + Sync>;

/// A category function joined with a sink.
///
/// Message arguments are closures so formatting only happens when a sink
/// is actually installed to receive it.
#[derive(Clone)]
pub struct Logger {
    category: CategoryFn,
    callback: LoggerCallback,
}

impl Logger {
    pub fn new(category: CategoryFn, callback: LoggerCallback) -> Self {
        Logger { category, callback }
    }

    /// The sink, for handing down to child objects.
    pub fn callback(&self) -> LoggerCallback {
        self.callback.clone()
    }

    pub fn log(&self, level: LogLevel, message: impl FnOnce() -> String) {
        (self.callback)(LogMessage {
            category: (self.category)(),
            level,
            timestamp: SystemTime::now(),
            thread: std::thread::current().id(),
            message: message(),
        });
    }

    pub fn trace(&self, message: impl FnOnce() -> String) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl FnOnce() -> String) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl FnOnce() -> String) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl FnOnce() -> String) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl FnOnce() -> String) {
        self.log(LogLevel::Error, message);
    }
}

/// A sink that forwards records into `tracing` events, category as the
/// `category` field.
pub fn tracing_callback() -> LoggerCallback {
    Arc::new(|msg: LogMessage| match msg.level {
        LogLevel::Trace => tracing::trace!(category = msg.category, "{}", msg.message),
        LogLevel::Debug => tracing::debug!(category = msg.category, "{}", msg.message),
        LogLevel::Info => tracing::info!(category = msg.category, "{}", msg.message),
        LogLevel::Warning => tracing::warn!(category = msg.category, "{}", msg.message),
        LogLevel::Error => tracing::error!(category = msg.category, "{}", msg.message),
    })
}

/// A sink that drops every record.
pub fn discard_callback() -> LoggerCallback {
    Arc::new(|_| {})
}
