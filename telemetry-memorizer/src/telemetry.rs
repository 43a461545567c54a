use metrics::{counter, gauge, Counter, Gauge};

use crate::DerivationStatus;

pub(crate) fn record_status(status: DerivationStatus) {
    counter!("memorizer_records_total", "status" => status.as_str()).increment(1);
}

/// State table telemetry.
///
/// Handles are registered when the table is built, so they report to the recorder that was
/// installed at that point.
pub(crate) struct TableTelemetry {
    identities: Gauge,
    idle_evictions: Counter,
    capacity_evictions: Counter,
}

impl TableTelemetry {
    pub fn new() -> Self {
        let identities = gauge!("memorizer_identities");
        identities.set(0.0);

        Self {
            identities,
            idle_evictions: counter!("memorizer_evictions_total", "reason" => "idle"),
            capacity_evictions: counter!("memorizer_evictions_total", "reason" => "capacity"),
        }
    }

    pub fn inserted(&self) {
        self.identities.increment(1.0);
    }

    pub fn removed(&self, count: usize) {
        self.identities.decrement(count as f64);
    }

    pub fn evicted_idle(&self, count: usize) {
        self.idle_evictions.increment(count as u64);
    }

    pub fn evicted_for_capacity(&self) {
        self.capacity_evictions.increment(1);
    }
}
