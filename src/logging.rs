//! The logging sink handed to the server and its connections.
use std::sync::Arc;

/// A sink for server events. Implementations must not block or fail the caller.
pub trait HttpLogging: Send + Sync {
    fn log_debug(&self, message: &str);
    fn log_info(&self, message: &str);
    fn log_warning(&self, message: &str);
    fn log_error(&self, message: &str);
    fn log_critical(&self, message: &str);
}

/// Forwards to the `log` facade, using `category` as the log target.
#[derive(Debug, Clone)]
pub struct LogLogger {
    category: String,
}

impl LogLogger {
    pub fn new(category: impl Into<String>) -> Self {
        LogLogger { category: category.into() }
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

impl HttpLogging for LogLogger {
    fn log_debug(&self, message: &str) {
        log::debug!(target: &self.category, "{}", message);
    }

    fn log_info(&self, message: &str) {
        log::info!(target: &self.category, "{}", message);
    }

    fn log_warning(&self, message: &str) {
        log::warn!(target: &self.category, "{}", message);
    }

    fn log_error(&self, message: &str) {
        log::error!(target: &self.category, "{}", message);
    }

    // `log` has no level above error
    fn log_critical(&self, message: &str) {
        log::error!(target: &self.category, "critical: {}", message);
    }
}

/// Drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledLogger;

impl HttpLogging for DisabledLogger {
    fn log_debug(&self, _: &str) {}
    fn log_info(&self, _: &str) {}
    fn log_warning(&self, _: &str) {}
    fn log_error(&self, _: &str) {}
    fn log_critical(&self, _: &str) {}
}

pub fn default_logger(category: &str) -> Arc<dyn HttpLogging> {
    Arc::new(LogLogger::new(category))
}
