//! Container logs of finished backend units
//!
//! Fetched on reconcile before the unit is deleted and emitted through
//! tracing: at warn level when the unit failed, at debug level otherwise.

use ion_config::AppConfig;
use tracing::{debug, warn};

/// Output of one container (or one backend log file)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLog {
    pub name: String,
    pub content: String,
}

impl ContainerLog {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogCapture {
    pub enabled: bool,
    pub max_bytes: usize,
}

impl LogCapture {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            enabled: config.dispatcher.capture_logs,
            max_bytes: config.dispatcher.max_log_bytes,
        }
    }

    /// Last `max_bytes` of `content`, cut forward to a char boundary
    pub fn tail(&self, content: &str) -> String {
        if content.len() <= self.max_bytes {
            return content.to_string();
        }
        let mut start = content.len() - self.max_bytes;
        while !content.is_char_boundary(start) {
            start += 1;
        }
        content[start..].to_string()
    }

    pub fn emit(&self, unit: &str, message_id: &str, succeeded: bool, logs: &[ContainerLog]) {
        for log in logs {
            let content = self.tail(&log.content);
            if succeeded {
                debug!(unit = %unit, message_id = %message_id, container = %log.name, logs = %content, "Container logs");
            } else {
                warn!(unit = %unit, message_id = %message_id, container = %log.name, logs = %content, "Container logs of failed run");
            }
        }
    }
}

impl Default for LogCapture {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 16 * 1024,
        }
    }
}
