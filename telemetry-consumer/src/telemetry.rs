use metrics::{counter, Counter};

/// Queue telemetry.
///
/// Counts what happened to each delivered message, labelled by topic.
pub(crate) struct QueueTelemetry {
    finished: Counter,
    requeued: Counter,
    discarded: Counter,
}

impl QueueTelemetry {
    pub fn new(topic: &str) -> Self {
        let outcome = |outcome: &'static str| {
            counter!("consumer_messages_total", "topic" => topic.to_string(), "outcome" => outcome)
        };
        Self {
            finished: outcome("finished"),
            requeued: outcome("requeued"),
            discarded: outcome("discarded"),
        }
    }

    pub fn finished(&self) {
        self.finished.increment(1);
    }

    pub fn requeued(&self) {
        self.requeued.increment(1);
    }

    pub fn discarded(&self) {
        self.discarded.increment(1);
    }
}

/// Handler telemetry.
///
/// Counts handled batches by outcome, and rows handed to the sink, labelled by handler and sink.
pub(crate) struct HandlerTelemetry {
    batches_ok: Counter,
    batches_failed: Counter,
    rows_written: Counter,
}

impl HandlerTelemetry {
    pub fn new(handler: &'static str, sink: &'static str) -> Self {
        let batches = |outcome: &'static str| {
            counter!("consumer_batches_total", "handler" => handler, "outcome" => outcome)
        };
        Self {
            batches_ok: batches("ok"),
            batches_failed: batches("failed"),
            rows_written: counter!(
                "consumer_rows_written_total",
                "handler" => handler,
                "sink" => sink
            ),
        }
    }

    pub fn batch_ok(&self, rows_written: usize) {
        self.batches_ok.increment(1);
        self.rows_written.increment(rows_written as u64);
    }

    pub fn batch_failed(&self) {
        self.batches_failed.increment(1);
    }
}
