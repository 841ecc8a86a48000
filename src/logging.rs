use std::io::Write;
use std::sync::Mutex;

use chrono::Local;
use log::{Level, Metadata, Record, SetLoggerError};
use serde::Serialize;

/// One formatted log line.
#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    level: String,
    target: String,
    message: String,
    timestamp: String,
}

impl LogMessage {
    fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }

    fn render(&self, json: bool) -> String {
        if json {
            serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
        } else {
            format!(
                "{} [{}] {}: {}",
                self.timestamp, self.level, self.target, self.message
            )
        }
    }
}

/// Writes timestamped log lines to stderr, as text or one JSON object per
/// line.
pub struct EngineLogger {
    level: Level,
    json: bool,
    sink: Mutex<std::io::Stderr>,
}

impl EngineLogger {
    pub fn new(level: Level, json: bool) -> Self {
        Self {
            level,
            json,
            sink: Mutex::new(std::io::stderr()),
        }
    }

    /// Installs the logger process-wide. Fails if a logger is already set.
    pub fn init(level: Level, json: bool) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(EngineLogger::new(level, json)))
            .map(|()| log::set_max_level(level.to_level_filter()))
    }
}

impl log::Log for EngineLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = LogMessage::from_record(record).render(self.json);
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{}", line);
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

/// Installs [`EngineLogger`], or `env_logger` if another logger got there
/// first.
pub fn init(level: Level, json: bool) {
    if EngineLogger::init(level, json).is_err() {
        let _ = env_logger::builder()
            .filter_level(level.to_level_filter())
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_line_carries_level_and_target() {
        let record = Record::builder()
            .level(Level::Warn)
            .target("gatt")
            .args(format_args!("scan failed"))
            .build();
        let line = LogMessage::from_record(&record).render(false);
        assert!(line.ends_with("[WARN] gatt: scan failed"));
    }

    #[test]
    fn test_json_line_parses() {
        let record = Record::builder()
            .level(Level::Info)
            .target("gatt")
            .args(format_args!("ready"))
            .build();
        let line = LogMessage::from_record(&record).render(true);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["message"], "ready");
    }

    #[test]
    fn test_level_filter() {
        let logger = EngineLogger::new(Level::Info, false);
        let debug = Metadata::builder().level(Level::Debug).build();
        let error = Metadata::builder().level(Level::Error).build();
        assert!(!log::Log::enabled(&logger, &debug));
        assert!(log::Log::enabled(&logger, &error));
    }
}
