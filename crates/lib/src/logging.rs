//! Process logger: `env_logger` output plus a copy of every enabled record on the
//! log event bus, so `/log` subscribers can follow the gateway live.

use crate::events::EventBus;
use serde_json::{json, Value};
use std::sync::Arc;

/// A log record as published to log subscribers.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: log::Level,
    pub message: String,
    pub context: Value,
}

pub type LogBus = EventBus<LogEvent>;

impl LogEvent {
    pub fn from_record(record: &log::Record<'_>) -> Self {
        Self {
            level: record.level(),
            message: record.args().to_string(),
            context: json!({
                "target": record.target(),
                "module": record.module_path(),
                "file": record.file(),
                "line": record.line(),
                "time": chrono::Local::now().to_rfc3339(),
            }),
        }
    }
}

pub struct BusLogger {
    inner: env_logger::Logger,
    bus: Arc<LogBus>,
}

impl BusLogger {
    pub fn new(inner: env_logger::Logger, bus: Arc<LogBus>) -> Self {
        Self { inner, bus }
    }
}

impl log::Log for BusLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        if !self.bus.is_empty() {
            self.bus.notify(&LogEvent::from_record(record), None);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the process logger. Filter comes from `RUST_LOG`, else `default_filter`.
pub fn init(bus: Arc<LogBus>, default_filter: &str) -> Result<(), log::SetLoggerError> {
    let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .build();
    let max_level = inner.filter();
    log::set_boxed_logger(Box::new(BusLogger::new(inner, bus)))?;
    log::set_max_level(max_level);
    Ok(())
}
