//! Batch handlers.
//!
//! Handlers turn the body of a queue message into rows in a sink.  A handler either completes a
//! whole batch or fails it: failing records are dropped individually, but a batch that cannot be
//! decoded or written is reported as an error so that it gets redelivered.
use std::{collections::BTreeMap, sync::Arc};

use telemetry_memorizer::{DerivationStatus, Memorizer, Record};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    decoder::{self, DecodeError, LogEntry, TimestampUnit},
    queue::{Handler, HandlerFuture},
    sink::{LogSink, MetricSink, SinkError},
    telemetry::HandlerTelemetry,
};

/// Errors that could occur while handling a batch.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The batch could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The batch could not be written to its sink.
    #[error("failed to write batch to sink: {0}")]
    Sink(#[from] SinkError),
}

/// Summary of a handled metric batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchReport {
    /// Number of records in the batch.
    pub received: usize,
    /// Number of records per derivation status.
    pub statuses: BTreeMap<DerivationStatus, usize>,
    /// Number of rows written to the sink.
    pub rows_written: usize,
}

impl BatchReport {
    /// Gets the number of records that ended with the given status.
    pub fn count(&self, status: DerivationStatus) -> usize {
        self.statuses.get(&status).copied().unwrap_or(0)
    }
}

/// Handler for metric batches.
///
/// Decodes a batch, runs every record through the memorizer and writes the persistable records
/// to the metric sink.
pub struct MetricHandler {
    memorizer: Arc<Memorizer>,
    sink: Arc<dyn MetricSink>,
    timestamp_unit: TimestampUnit,
    telemetry: HandlerTelemetry,
}

impl MetricHandler {
    /// Creates a new `MetricHandler`.
    pub fn new(
        memorizer: Arc<Memorizer>,
        sink: Arc<dyn MetricSink>,
        timestamp_unit: TimestampUnit,
    ) -> Self {
        let telemetry = HandlerTelemetry::new("metrics", sink.name());
        MetricHandler { memorizer, sink, timestamp_unit, telemetry }
    }

    /// Handles a single encoded metric batch.
    ///
    /// # Errors
    ///
    /// If the batch could not be decoded, or the sink failed to write it, an error variant will be
    /// returned.  Records that could not be derived are not errors: they are counted in the report
    /// and dropped.
    pub async fn handle_batch(&self, payload: &[u8]) -> Result<BatchReport, HandlerError> {
        let result = self.derive_and_write(payload).await;
        match &result {
            Ok(report) => self.telemetry.batch_ok(report.rows_written),
            Err(e) => {
                error!(error = %e, sink = self.sink.name(), "Failed to handle metric batch.");
                self.telemetry.batch_failed();
            }
        }
        result
    }

    async fn derive_and_write(&self, payload: &[u8]) -> Result<BatchReport, HandlerError> {
        let records = decoder::decode_metric_batch(payload, self.timestamp_unit)?;

        let mut report = BatchReport { received: records.len(), ..BatchReport::default() };
        let mut rows: Vec<Record> = Vec::with_capacity(records.len());
        for (record, status) in self.memorizer.process_batch(records) {
            *report.statuses.entry(status).or_default() += 1;
            if status.is_persistable() {
                rows.push(record);
            }
        }

        report.rows_written = self.sink.write_metrics(&rows).await?;
        debug!(
            received = report.received,
            rows_written = report.rows_written,
            "Handled metric batch."
        );
        Ok(report)
    }
}

impl Handler for MetricHandler {
    fn handle<'a>(&'a self, body: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin(async move { self.handle_batch(body).await.map(|_| ()) })
    }
}

/// Handler for log batches.
///
/// Decodes a batch and pushes its lines to the log sink.
pub struct LogHandler {
    sink: Arc<dyn LogSink>,
    telemetry: HandlerTelemetry,
}

impl LogHandler {
    /// Creates a new `LogHandler`.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        let telemetry = HandlerTelemetry::new("logs", sink.name());
        LogHandler { sink, telemetry }
    }

    /// Handles a single encoded log batch, returning the number of lines written.
    ///
    /// # Errors
    ///
    /// If the batch could not be decoded, or the sink failed to write it, an error variant will be
    /// returned.
    pub async fn handle_batch(&self, payload: &[u8]) -> Result<usize, HandlerError> {
        let result = self.write(payload).await;
        match &result {
            Ok(written) => self.telemetry.batch_ok(*written),
            Err(e) => {
                error!(error = %e, sink = self.sink.name(), "Failed to handle log batch.");
                self.telemetry.batch_failed();
            }
        }
        result
    }

    async fn write(&self, payload: &[u8]) -> Result<usize, HandlerError> {
        let entries: Vec<LogEntry> = decoder::decode_log_batch(payload)?;
        if entries.is_empty() {
            return Ok(0);
        }

        for entry in &entries {
            debug!(line = %decoder::format_log_line(entry), "Received log line.");
        }

        Ok(self.sink.write_logs(&entries).await?)
    }
}

impl Handler for LogHandler {
    fn handle<'a>(&'a self, body: &'a [u8]) -> HandlerFuture<'a> {
        Box::pin(async move { self.handle_batch(body).await.map(|_| ()) })
    }
}
