//! Console logger sink

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    logging::{LogEntry, LogLevel, LoggerSink},
};

/// Prints log entries to stdout, for development and the demo binary
#[derive(Debug, Clone)]
pub struct ConsoleLogger {
    pub min_level: LogLevel,
}

impl ConsoleLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self { min_level }
    }

    /// One line per entry, fields sorted by name
    pub fn format_entry(entry: &LogEntry) -> String {
        let mut line = format!(
            "[{}] {:<5} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.level.as_str().to_uppercase(),
            entry.target,
            entry.message
        );

        let mut fields: Vec<_> = entry.fields.iter().collect();
        fields.sort();
        for (key, value) in fields {
            line.push_str(&format!(" {}={}", key, value));
        }

        if let Some(span) = &entry.span_id {
            line.push_str(&format!(" span={}", span));
        }
        line
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

#[async_trait]
impl LoggerSink for ConsoleLogger {
    async fn log(&self, entry: LogEntry) -> Result<()> {
        if entry.level >= self.min_level {
            println!("{}", Self::format_entry(&entry));
        }
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_entry() {
        let entry = LogEntry::new(LogLevel::Warn, "core_controller", "requeueing")
            .with_field("key", "default/a")
            .with_field("attempt", "2")
            .with_span_id("process");

        let line = ConsoleLogger::format_entry(&entry);
        assert!(line.contains("WARN  core_controller: requeueing"));
        assert!(line.ends_with(" attempt=2 key=default/a span=process"));
    }

    #[tokio::test]
    async fn test_console_logger() {
        let logger = ConsoleLogger::default();
        assert_eq!(LoggerSink::min_level(&logger), LogLevel::Info);
        logger
            .log(LogEntry::new(LogLevel::Debug, "test", "filtered"))
            .await
            .unwrap();
        logger
            .log(LogEntry::new(LogLevel::Error, "test", "printed"))
            .await
            .unwrap();
    }
}
