use tracing::{debug, trace};

use crate::{
    table::StateTable, telemetry, DerivationStatus, DeriveError, IdentityKey, OrderPolicy,
    RateError, RateState, Record, ResetPolicy, Sample, TagOrdering,
};

/// Stateful rate derivation engine.
///
/// A `Memorizer` remembers the last good sample of every rate identity it has seen, and rewrites
/// the value of each subsequent sample of that identity into the rate of change since the
/// remembered one.  Records of every other kind pass through untouched.
///
/// All methods take `&self`: a single `Memorizer` can be shared between workers, for example
/// behind an `Arc`.  Derivations of the same identity are serialized, while derivations of
/// different identities generally proceed in parallel.
///
/// State is held in memory only.  Two processes deriving the same identity each keep their own
/// state, so a deployment must route every identity to the same process to keep it continuous.
pub struct Memorizer {
    table: StateTable,
    reset_policy: ResetPolicy,
    order_policy: OrderPolicy,
    tag_ordering: TagOrdering,
}

impl Memorizer {
    pub(crate) fn from_parts(
        table: StateTable,
        reset_policy: ResetPolicy,
        order_policy: OrderPolicy,
        tag_ordering: TagOrdering,
    ) -> Self {
        Memorizer { table, reset_policy, order_policy, tag_ordering }
    }

    /// Processes a single record.
    ///
    /// Returns the record, with its value replaced by the derived rate when the status is
    /// [`DerivationStatus::Derived`], alongside the outcome.  Only records whose status is
    /// [persistable](DerivationStatus::is_persistable) should be handed to a sink.
    ///
    /// Failures are resolved at the record level: they are reported through the status and never
    /// leave the engine in an unusable state.
    pub fn process(&self, mut record: Record) -> (Record, DerivationStatus) {
        let status = match self.derive(&mut record) {
            Ok(status) => status,
            Err(e) => {
                let status = DerivationStatus::from(&e);
                debug!(
                    error = %e,
                    %status,
                    metric_name = %record.name,
                    emitter_id = %record.emitter_id,
                    timestamp = record.timestamp,
                    "Record not derived."
                );
                status
            }
        };

        telemetry::record_status(status);
        (record, status)
    }

    /// Processes a batch of records.
    ///
    /// Every record is resolved independently and in order, so records of the same identity
    /// within a batch see each other's effect on the derivation state.
    pub fn process_batch(&self, records: Vec<Record>) -> Vec<(Record, DerivationStatus)> {
        records.into_iter().map(|record| self.process(record)).collect()
    }

    /// Derives a single record in place.
    ///
    /// On success, returns [`DerivationStatus::Unchanged`], [`DerivationStatus::SeededNoOutput`]
    /// or [`DerivationStatus::Derived`].  The value of the record is only rewritten in the latter
    /// case.
    ///
    /// # Errors
    ///
    /// Returns a [`DeriveError`] if the record is malformed, or if no rate could be derived from
    /// it.  In neither case is the value of the record rewritten, and the previous sample of its
    /// identity is kept, except for [`DeriveError::CounterReset`] where the record re-seeds it.
    pub fn derive(&self, record: &mut Record) -> Result<DerivationStatus, DeriveError> {
        record.validate()?;

        if !record.is_rate() {
            return Ok(DerivationStatus::Unchanged);
        }

        if !record.value.is_finite() {
            return Err(DeriveError::NonFiniteSample { value: record.value });
        }
        if record.value < 0.0 {
            return Err(DeriveError::NegativeSample { value: record.value });
        }

        let key = record.identity(self.tag_ordering);
        let sample = Sample::new(record.value, record.timestamp);
        let reset_policy = self.reset_policy;
        let order_policy = self.order_policy;

        let rate = self.table.with_state(key, |slot| {
            let Some(state) = slot.as_mut() else {
                *slot = Some(RateState::seeded(sample));
                return Ok(None);
            };

            let previous = state.previous();
            if order_policy == OrderPolicy::Reject
                && !previous.is_unset()
                && !sample.is_unset()
                && sample.timestamp < previous.timestamp
            {
                return Err(DeriveError::OutOfOrder {
                    previous: previous.timestamp,
                    current: sample.timestamp,
                });
            }

            state.observe(sample);
            match state.calculate() {
                Ok(rate) => Ok(Some(rate)),
                // Only a decreasing value is a reset; an older sample with a higher value is not.
                Err(RateError::NegativeRate { .. })
                    if reset_policy == ResetPolicy::Reseed && sample.value < previous.value =>
                {
                    state.reseed(sample);
                    Err(DeriveError::CounterReset { value: sample.value })
                }
                Err(e) => Err(DeriveError::from(e)),
            }
        })?;

        match rate {
            Some(rate) => {
                trace!(metric_name = %record.name, value = record.value, rate, "Derived rate.");
                record.value = rate;
                Ok(DerivationStatus::Derived)
            }
            None => {
                trace!(metric_name = %record.name, key = ?key, "Seeded identity.");
                Ok(DerivationStatus::SeededNoOutput)
            }
        }
    }

    /// Gets a copy of the derivation state of the given identity, if it is tracked and not idle.
    pub fn state_of(&self, key: IdentityKey) -> Option<RateState> {
        self.table.get(key)
    }

    /// Gets the number of identities currently tracked.
    ///
    /// Idle identities that have not been swept yet are included.
    pub fn identities(&self) -> usize {
        self.table.len()
    }

    /// Removes every identity that has been idle for longer than the idle timeout.
    ///
    /// Returns the number of identities removed.  Does nothing if no idle timeout is configured.
    pub fn sweep_idle(&self) -> usize {
        let removed = self.table.sweep_idle();
        if removed > 0 {
            debug!(removed, "Swept idle identities.");
        }
        removed
    }

    /// Drops the state of every identity.
    pub fn clear(&self) {
        self.table.clear();
    }

    /// Gets the counter reset policy.
    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    /// Gets the policy for samples older than the previous sample of their identity.
    pub fn order_policy(&self) -> OrderPolicy {
        self.order_policy
    }

    /// Gets the tag ordering used to compute identity keys.
    pub fn tag_ordering(&self) -> TagOrdering {
        self.tag_ordering
    }
}
