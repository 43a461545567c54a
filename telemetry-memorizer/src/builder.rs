use std::{str::FromStr, time::Duration};

use quanta::Clock;
use thiserror::Error;

use crate::{table::StateTable, Memorizer, TagOrdering};

/// Errors that could occur while building a [`Memorizer`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The shard count is zero.
    #[error("shard count must be greater than zero")]
    InvalidShardCount,

    /// The maximum number of tracked identities is zero.
    #[error("maximum number of identities must be greater than zero")]
    InvalidCapacity,

    /// The idle timeout is zero.
    #[error("idle timeout must be greater than zero")]
    InvalidIdleTimeout,
}

/// What to do when a cumulative value decreases between two samples.
///
/// Real counters reset, for example when the emitting process restarts.  Neither choice is right
/// for every deployment, so the policy is explicit.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ResetPolicy {
    /// Reject the sample as a negative rate and keep the previous sample.
    #[default]
    Reject,

    /// Treat the sample as the start of a new series: it becomes the previous sample, and no rate
    /// is emitted for it.
    Reseed,
}

impl FromStr for ResetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(ResetPolicy::Reject),
            "reseed" => Ok(ResetPolicy::Reseed),
            _ => Err(format!("invalid reset policy '{}' (expected 'reject' or 'reseed')", s)),
        }
    }
}

/// What to do with a rate sample older than the previous sample of its identity.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum OrderPolicy {
    /// Derive the rate over the signed elapsed time, like any other pair of samples.
    ///
    /// An older sample with a lower value yields a positive rate and rolls the identity back to
    /// it.  An older sample with a higher value yields a negative rate and is rejected as such.
    #[default]
    Derive,

    /// Reject the sample as out of order and keep the previous sample.
    Reject,
}

impl FromStr for OrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "derive" => Ok(OrderPolicy::Derive),
            "reject" => Ok(OrderPolicy::Reject),
            _ => Err(format!("invalid order policy '{}' (expected 'derive' or 'reject')", s)),
        }
    }
}

/// Builder for a [`Memorizer`].
pub struct MemorizerBuilder {
    shards: Option<usize>,
    max_identities: Option<usize>,
    idle_timeout: Option<Duration>,
    reset_policy: ResetPolicy,
    order_policy: OrderPolicy,
    tag_ordering: TagOrdering,
    clock: Option<Clock>,
}

impl MemorizerBuilder {
    /// Creates a new `MemorizerBuilder` with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of shards the state table is split into.
    ///
    /// Identities in different shards never contend on the same lock.  The count is rounded up to
    /// the next power of two.
    ///
    /// Defaults to the number of CPUs, rounded up to the next power of two.
    #[must_use]
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Sets the maximum number of identities to keep state for.
    ///
    /// The limit is split evenly across shards, rounding down, so the number of tracked identities
    /// never exceeds it.  If the limit is lower than the shard count, the shard count is lowered to
    /// the largest power of two not above the limit.  Once a shard is full, seeding a new identity
    /// in it evicts the least recently seen identity of that shard, which will be re-seeded the
    /// next time it is seen.
    ///
    /// Defaults to no limit.
    #[must_use]
    pub fn with_max_identities(mut self, max_identities: usize) -> Self {
        self.max_identities = Some(max_identities);
        self
    }

    /// Sets the idle timeout for identities.
    ///
    /// An identity that has not been seen for longer than the idle timeout is treated as never
    /// seen: its next sample re-seeds it.  Idle identities are removed when next touched, or by
    /// [`Memorizer::sweep_idle`].
    ///
    /// Defaults to no timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Sets the counter reset policy.
    ///
    /// See [`ResetPolicy`] for more details.
    ///
    /// Defaults to [`ResetPolicy::Reject`].
    #[must_use]
    pub fn with_reset_policy(mut self, reset_policy: ResetPolicy) -> Self {
        self.reset_policy = reset_policy;
        self
    }

    /// Sets the policy for rate samples older than the previous sample of their identity.
    ///
    /// See [`OrderPolicy`] for more details.
    ///
    /// Defaults to [`OrderPolicy::Derive`].
    #[must_use]
    pub fn with_order_policy(mut self, order_policy: OrderPolicy) -> Self {
        self.order_policy = order_policy;
        self
    }

    /// Sets how tags contribute to identity keys.
    ///
    /// See [`TagOrdering`] for more details.
    ///
    /// Defaults to [`TagOrdering::Unordered`].
    #[must_use]
    pub fn with_tag_ordering(mut self, tag_ordering: TagOrdering) -> Self {
        self.tag_ordering = tag_ordering;
        self
    }

    /// Sets the clock used to track when identities were last seen.
    ///
    /// Primarily useful for testing with a mocked clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the memorizer.
    ///
    /// # Errors
    ///
    /// If the shard count, maximum number of identities or idle timeout were explicitly set to
    /// zero, an error will be returned.
    pub fn build(self) -> Result<Memorizer, BuildError> {
        if self.shards == Some(0) {
            return Err(BuildError::InvalidShardCount);
        }
        if self.max_identities == Some(0) {
            return Err(BuildError::InvalidCapacity);
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(BuildError::InvalidIdleTimeout);
        }

        let shards = self.shards.unwrap_or_else(num_cpus::get);
        let clock = self.clock.unwrap_or_default();
        let table = StateTable::new(shards, self.max_identities, self.idle_timeout, clock);

        Ok(Memorizer::from_parts(table, self.reset_policy, self.order_policy, self.tag_ordering))
    }
}

impl Default for MemorizerBuilder {
    fn default() -> Self {
        MemorizerBuilder {
            shards: None,
            max_identities: None,
            idle_timeout: None,
            reset_policy: ResetPolicy::default(),
            order_policy: OrderPolicy::default(),
            tag_ordering: TagOrdering::default(),
            clock: None,
        }
    }
}
