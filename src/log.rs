//! Severity-leveled event logging.
//!
//! The engine reports through a `LogSink`; the sink owns the threshold below
//! which events are dropped. `TracingSink` forwards to `tracing`, `MemorySink`
//! keeps events for a host window or for inspection after a headless run.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

/// Event severity, ordered `Minor < Normal < Medium < Major`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    Minor,
    #[default]
    Normal,
    Medium,
    Major,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Minor => "Minor",
            Severity::Normal => "Normal",
            Severity::Medium => "Medium",
            Severity::Major => "Major",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minor" => Ok(Severity::Minor),
            "normal" => Ok(Severity::Normal),
            "medium" => Ok(Severity::Medium),
            "major" => Ok(Severity::Major),
            other => Err(format!(
                "unknown severity '{other}' (expected Minor, Normal, Medium or Major)"
            )),
        }
    }
}

/// One accepted log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub severity: Severity,
    pub message: String,
    pub is_error: bool,
}

/// Destination for engine log events.
pub trait LogSink: Send + Sync {
    /// Record an event. Implementations drop events below `threshold()`.
    fn record(&self, severity: Severity, message: &str, is_error: bool);

    fn threshold(&self) -> Severity;

    /// Whether individual data records should be logged as they load.
    fn log_all_data(&self) -> bool {
        false
    }

    fn accepts(&self, severity: Severity) -> bool {
        severity >= self.threshold()
    }
}

/// Sink that forwards events to the `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct TracingSink {
    threshold: Severity,
    log_all_data: bool,
}

impl TracingSink {
    pub fn new(threshold: Severity) -> Self {
        Self {
            threshold,
            log_all_data: false,
        }
    }

    pub fn with_all_data(mut self, log_all_data: bool) -> Self {
        self.log_all_data = log_all_data;
        self
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(Severity::Normal)
    }
}

impl LogSink for TracingSink {
    fn record(&self, severity: Severity, message: &str, is_error: bool) {
        if !self.accepts(severity) {
            return;
        }
        match (severity, is_error) {
            (Severity::Major, _) => tracing::error!(severity = %severity, "{message}"),
            (_, true) | (Severity::Medium, false) => {
                tracing::warn!(severity = %severity, is_error, "{message}")
            }
            (Severity::Normal, false) => tracing::info!(severity = %severity, "{message}"),
            (Severity::Minor, false) => tracing::debug!(severity = %severity, "{message}"),
        }
    }

    fn threshold(&self) -> Severity {
        self.threshold
    }

    fn log_all_data(&self) -> bool {
        self.log_all_data
    }
}

/// Sink that keeps accepted events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    threshold: Severity,
    log_all_data: bool,
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new(threshold: Severity) -> Self {
        Self {
            threshold,
            log_all_data: false,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_all_data(mut self, log_all_data: bool) -> Self {
        self.log_all_data = log_all_data;
        self
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn errors(&self) -> Vec<LogEvent> {
        self.events().into_iter().filter(|e| e.is_error).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn record(&self, severity: Severity, message: &str, is_error: bool) {
        if !self.accepts(severity) {
            return;
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEvent {
                severity,
                message: message.to_string(),
                is_error,
            });
    }

    fn threshold(&self) -> Severity {
        self.threshold
    }

    fn log_all_data(&self) -> bool {
        self.log_all_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Minor < Severity::Normal);
        assert!(Severity::Normal < Severity::Medium);
        assert!(Severity::Medium < Severity::Major);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("medium".parse::<Severity>(), Ok(Severity::Medium));
        assert_eq!("Major".parse::<Severity>(), Ok(Severity::Major));
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn test_threshold_suppresses_lower_events() {
        let sink = MemorySink::new(Severity::Medium);
        sink.record(Severity::Minor, "minor", false);
        sink.record(Severity::Normal, "normal", false);
        sink.record(Severity::Medium, "medium", true);
        sink.record(Severity::Major, "major", false);
        let messages: Vec<_> = sink.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["medium", "major"]);
        assert_eq!(sink.errors().len(), 1);
    }

    #[test]
    fn test_tracing_sink_threshold() {
        let sink = TracingSink::new(Severity::Major);
        assert!(!sink.accepts(Severity::Medium));
        assert!(sink.accepts(Severity::Major));
        // Nothing installed as subscriber; recording must still be harmless.
        sink.record(Severity::Major, "done", false);
    }
}
