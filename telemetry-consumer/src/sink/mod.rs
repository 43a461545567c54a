//! Sink writers.
//!
//! Sinks persist what handlers produce: derived metric records and log lines.  A sink either
//! persists a whole batch or fails it, so that a failed batch can be redelivered as a whole.
use std::{future::Future, pin::Pin};

use telemetry_memorizer::Record;
use thiserror::Error;

use crate::decoder::LogEntry;

mod http;
pub use self::http::{HttpLogSink, LogSinkKind};

mod memory;
pub use self::memory::MemorySink;

mod sqlite;
pub use self::sqlite::SqliteSink;

/// Convenience type for the future returned by sinks.
///
/// Resolves to the number of rows or lines written.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<usize, SinkError>> + Send + 'a>>;

/// Persists metric records.
pub trait MetricSink: Send + Sync {
    /// Gets the name of this sink, as used in logs and telemetry.
    fn name(&self) -> &'static str;

    /// Writes a batch of records.
    fn write_metrics<'a>(&'a self, records: &'a [Record]) -> SinkFuture<'a>;
}

/// Persists log lines.
pub trait LogSink: Send + Sync {
    /// Gets the name of this sink, as used in logs and telemetry.
    fn name(&self) -> &'static str;

    /// Writes a batch of log lines.
    fn write_logs<'a>(&'a self, entries: &'a [LogEntry]) -> SinkFuture<'a>;
}

/// Errors that could occur while writing to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The database rejected an operation.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A payload could not be serialized.
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink endpoint is not a valid URI.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Why the endpoint was rejected.
        reason: String,
    },

    /// The request could not be built.
    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    /// The request could not be sent, or no response was received.
    #[error("failed to send request: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    /// The sink answered with a non-successful status.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, or a placeholder if it could not be read.
        body: String,
    },

    /// A blocking write task failed to complete.
    #[error("write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The sink is unavailable.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}
