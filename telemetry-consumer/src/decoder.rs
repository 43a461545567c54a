//! Batch decoding.
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use prost::Message as _;
use prost_types::Timestamp;
use telemetry_memorizer::Record;
use thiserror::Error;

use crate::proto::{Log, LogBatch, Metric, MetricBatch};

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Errors that could occur while decoding a batch.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not a valid protobuf encoding of the expected batch.
    #[error("malformed batch: {0}")]
    Malformed(#[from] prost::DecodeError),
}

/// Unit that record timestamps are expressed in.
///
/// Wire timestamps are absolute points in time.  Rates are derived per timestamp unit, so the unit
/// determines what a derived value means: with the default of milliseconds, a rate is in value
/// units per millisecond.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TimestampUnit {
    /// Seconds since the Unix epoch.
    Seconds,
    /// Milliseconds since the Unix epoch.
    #[default]
    Milliseconds,
    /// Microseconds since the Unix epoch.
    Microseconds,
    /// Nanoseconds since the Unix epoch.
    Nanoseconds,
}

impl TimestampUnit {
    const fn nanos_per_unit(&self) -> i128 {
        match self {
            TimestampUnit::Seconds => NANOS_PER_SECOND,
            TimestampUnit::Milliseconds => 1_000_000,
            TimestampUnit::Microseconds => 1_000,
            TimestampUnit::Nanoseconds => 1,
        }
    }

    /// Gets the short name of this unit.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TimestampUnit::Seconds => "s",
            TimestampUnit::Milliseconds => "ms",
            TimestampUnit::Microseconds => "us",
            TimestampUnit::Nanoseconds => "ns",
        }
    }

    /// Converts a wire timestamp into an integer timestamp in this unit.
    ///
    /// Sub-unit precision is truncated towards negative infinity, and timestamps that do not fit
    /// are saturated.  A missing timestamp converts to zero, the unset sentinel.
    pub fn convert(&self, timestamp: Option<&Timestamp>) -> i64 {
        let Some(timestamp) = timestamp else {
            return 0;
        };

        let nanos = i128::from(timestamp.seconds) * NANOS_PER_SECOND + i128::from(timestamp.nanos);
        let units = nanos.div_euclid(self.nanos_per_unit());
        i64::try_from(units).unwrap_or(if units < 0 { i64::MIN } else { i64::MAX })
    }
}

impl fmt::Display for TimestampUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimestampUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" | "seconds" => Ok(TimestampUnit::Seconds),
            "ms" | "milliseconds" => Ok(TimestampUnit::Milliseconds),
            "us" | "microseconds" => Ok(TimestampUnit::Microseconds),
            "ns" | "nanoseconds" => Ok(TimestampUnit::Nanoseconds),
            _ => Err(format!("invalid timestamp unit '{}' (expected 's', 'ms', 'us' or 'ns')", s)),
        }
    }
}

/// Decodes a metric batch into records.
///
/// Records are returned in wire order.  No field is validated here: malformed records are
/// rejected individually during derivation.
///
/// # Errors
///
/// If the payload is not a valid `MetricBatch`, an error variant will be returned.
pub fn decode_metric_batch(payload: &[u8], unit: TimestampUnit) -> Result<Vec<Record>, DecodeError> {
    let batch = MetricBatch::decode(payload)?;
    Ok(batch.metrics.into_iter().map(|metric| into_record(metric, unit)).collect())
}

fn into_record(metric: Metric, unit: TimestampUnit) -> Record {
    Record {
        timestamp: unit.convert(metric.timestamp.as_ref()),
        name: metric.name,
        kind: metric.r#type,
        value: metric.value,
        tags: metric.tags,
        emitter_id: metric.unique_id,
        project_name: metric.project_name,
        hostname: metric.hostname,
        os: metric.os,
        unit: metric.unit,
    }
}

/// A single decoded log line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogEntry {
    /// Log message.
    pub message: String,
    /// Log level, as reported by the emitter.
    pub level: String,
    /// Time the line was logged, if the emitter supplied a valid one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Host name.
    pub hostname: String,
    /// Service name.
    pub service: String,
    /// Source file.
    pub file: String,
    /// Source line.
    pub line: i32,
    /// Source function.
    pub function: String,
}

impl LogEntry {
    /// Gets the timestamp of this line in nanoseconds since the Unix epoch.
    ///
    /// Missing or unrepresentable timestamps map to the epoch itself.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.and_then(|ts| ts.timestamp_nanos_opt()).unwrap_or(0)
    }
}

impl From<Log> for LogEntry {
    fn from(log: Log) -> Self {
        let timestamp = log.timestamp.and_then(|ts| {
            let nanos = u32::try_from(ts.nanos).ok()?;
            DateTime::from_timestamp(ts.seconds, nanos)
        });

        LogEntry {
            message: log.message,
            level: log.level,
            timestamp,
            hostname: log.hostname,
            service: log.service,
            file: log.file,
            line: log.line,
            function: log.function,
        }
    }
}

/// Decodes a log batch.
///
/// # Errors
///
/// If the payload is not a valid `LogBatch`, an error variant will be returned.
pub fn decode_log_batch(payload: &[u8]) -> Result<Vec<LogEntry>, DecodeError> {
    let batch = LogBatch::decode(payload)?;
    Ok(batch.logs.into_iter().map(LogEntry::from).collect())
}

/// Formats a log line for human consumption.
///
/// The format is `[level] YYYY-MM-DD HH:MM:SS - file:line function | message`, with the time in
/// UTC.
pub fn format_log_line(entry: &LogEntry) -> String {
    format!(
        "[{}] {} - {}:{} {} | {}",
        entry.level,
        entry.timestamp.unwrap_or_default().format("%Y-%m-%d %H:%M:%S"),
        entry.file,
        entry.line,
        entry.function,
        entry.message,
    )
}
