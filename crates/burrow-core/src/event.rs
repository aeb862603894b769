//! Structured log records
//!
//! Records published on replay streams (dial progress and similar), so
//! several observers can follow one operation. Each record is also
//! forwarded to `tracing`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::now_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub component: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            component: component.into(),
            timestamp_ms: now_ms(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn info(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, component, message)
    }

    pub fn warn(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, component, message)
    }

    pub fn error(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, component, message)
    }

    /// Attach a metadata entry
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Forward to the `tracing` subscriber
    pub fn emit(&self) {
        let component = self.component.as_str();
        let meta = &self.metadata;
        match self.level {
            LogLevel::Trace => tracing::trace!(component, ?meta, "{}", self.message),
            LogLevel::Debug => tracing::debug!(component, ?meta, "{}", self.message),
            LogLevel::Info => tracing::info!(component, ?meta, "{}", self.message),
            LogLevel::Warn => tracing::warn!(component, ?meta, "{}", self.message),
            LogLevel::Error => tracing::error!(component, ?meta, "{}", self.message),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level, self.component, self.message)?;
        for (k, v) in &self.metadata {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}
