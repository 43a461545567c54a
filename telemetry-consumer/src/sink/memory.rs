use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use telemetry_memorizer::Record;

use super::{LogSink, MetricSink, SinkError, SinkFuture};
use crate::decoder::LogEntry;

/// In-memory sink, collecting everything written to it.
///
/// Can be told to fail, to exercise redelivery.  Mostly useful for testing.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    logs: Mutex<Vec<LogEntry>>,
    failing: AtomicBool,
}

impl MemorySink {
    /// Creates a new, empty `MemorySink`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether writes fail.
    ///
    /// A failed write stores nothing.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Gets a copy of every record written so far.
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Gets a copy of every log line written so far.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().clone()
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(SinkError::Unavailable(String::from("memory sink set to fail")));
        }
        Ok(())
    }
}

impl MetricSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write_metrics<'a>(&'a self, records: &'a [Record]) -> SinkFuture<'a> {
        Box::pin(async move {
            self.check()?;
            self.records.lock().extend_from_slice(records);
            Ok(records.len())
        })
    }
}

impl LogSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write_logs<'a>(&'a self, entries: &'a [LogEntry]) -> SinkFuture<'a> {
        Box::pin(async move {
            self.check()?;
            self.logs.lock().extend_from_slice(entries);
            Ok(entries.len())
        })
    }
}
