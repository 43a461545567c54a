//! Sharded, bounded storage for per-identity derivation state.
use std::{
    hash::{BuildHasherDefault, Hasher},
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use lru::LruCache;
use parking_lot::Mutex;
use quanta::{Clock, Instant};

use crate::{telemetry::TableTelemetry, IdentityKey, RateState};

/// A no-op hasher for pre-hashed [`IdentityKey`] values.
///
/// `IdentityKey` hashes itself by writing its raw hash via `write_u64`, and `finish` simply returns
/// that value.
#[derive(Debug, Default)]
pub(crate) struct IdentityHasher {
    hash: u64,
}

impl Hasher for IdentityHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.hash = self.hash.rotate_left(8) ^ u64::from(*byte);
        }
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.hash = i;
    }
}

type Shard = LruCache<IdentityKey, Entry, BuildHasherDefault<IdentityHasher>>;

struct Entry {
    state: RateState,
    last_seen: Instant,
}

/// Per-identity derivation state, split across independently locked shards.
///
/// The shard of an identity is chosen from its hash, and every read-modify-write of an identity
/// happens while holding its shard lock, so two derivations of the same identity never interleave.
///
/// Each shard keeps its identities in recency order.  When a capacity is configured, it is divided
/// evenly across shards and inserting into a full shard evicts the least recently seen identity of
/// that shard.  When an idle timeout is configured, identities that were not seen for longer than
/// the timeout are treated as absent and are dropped either when next touched or during
/// [`sweep_idle`](StateTable::sweep_idle).
pub(crate) struct StateTable {
    shards: Vec<Mutex<Shard>>,
    shard_mask: usize,
    idle_timeout: Option<Duration>,
    clock: Clock,
    len: AtomicUsize,
    telemetry: TableTelemetry,
}

impl StateTable {
    /// Creates a new `StateTable`.
    ///
    /// `shard_count` is rounded up to the next power of two.  With a capacity, it is then lowered to
    /// at most the capacity, and every shard holds `capacity / shard_count` identities.
    pub fn new(
        shard_count: usize,
        capacity: Option<usize>,
        idle_timeout: Option<Duration>,
        clock: Clock,
    ) -> Self {
        let mut shard_count = shard_count.max(1).next_power_of_two();
        let shard_capacity = match capacity {
            Some(capacity) => {
                let capacity = capacity.max(1);
                shard_count = shard_count.min(1 << capacity.ilog2());
                NonZeroUsize::new(capacity / shard_count)
            }
            None => None,
        };

        let shards = (0..shard_count)
            .map(|_| {
                let hasher = BuildHasherDefault::default();
                Mutex::new(match shard_capacity {
                    Some(capacity) => Shard::with_hasher(capacity, hasher),
                    None => Shard::unbounded_with_hasher(hasher),
                })
            })
            .collect();

        StateTable {
            shards,
            shard_mask: shard_count - 1,
            idle_timeout,
            clock,
            len: AtomicUsize::new(0),
            telemetry: TableTelemetry::new(),
        }
    }

    #[inline]
    fn shard(&self, key: IdentityKey) -> &Mutex<Shard> {
        // `shard_mask` is `shards.len() - 1` and `shards.len()` is a power of two, so the index is
        // always in bounds.
        &self.shards[key.as_u64() as usize & self.shard_mask]
    }

    fn is_idle(&self, entry: &Entry, now: Instant) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| now.saturating_duration_since(entry.last_seen) > timeout)
    }

    fn inserted(&self) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.telemetry.inserted();
    }

    fn removed(&self, count: usize) {
        if count > 0 {
            self.len.fetch_sub(count, Ordering::Relaxed);
            self.telemetry.removed(count);
        }
    }

    /// Runs `op` against the state of the given identity, under the identity's shard lock.
    ///
    /// `op` sees `None` if the identity is unknown or idle.  Whatever `op` leaves in the slot is
    /// stored back: `Some` inserts or updates the identity and marks it as seen, `None` removes it.
    pub fn with_state<O, V>(&self, key: IdentityKey, op: O) -> V
    where
        O: FnOnce(&mut Option<RateState>) -> V,
    {
        let mut shard = self.shard(key).lock();
        // Read under the lock, so `last_seen` never decreases along the recency order of a shard.
        let now = self.clock.now();

        let existing = shard.peek(&key).map(|entry| (entry.state, self.is_idle(entry, now)));
        let mut slot = match existing {
            Some((_, true)) => {
                shard.pop(&key);
                self.removed(1);
                self.telemetry.evicted_idle(1);
                None
            }
            Some((state, false)) => Some(state),
            None => None,
        };

        let result = op(&mut slot);

        match slot {
            Some(state) => {
                if let Some(entry) = shard.get_mut(&key) {
                    entry.state = state;
                    entry.last_seen = now;
                } else if shard.push(key, Entry { state, last_seen: now }).is_some() {
                    // `key` was absent, so whatever came back is the evicted least recent entry.
                    self.telemetry.evicted_for_capacity();
                } else {
                    self.inserted();
                }
            }
            None => {
                if shard.pop(&key).is_some() {
                    self.removed(1);
                }
            }
        }

        result
    }

    /// Gets a copy of the state of the given identity, if it is present and not idle.
    ///
    /// Does not count as seeing the identity.
    pub fn get(&self, key: IdentityKey) -> Option<RateState> {
        let shard = self.shard(key).lock();
        let now = self.clock.now();
        shard.peek(&key).filter(|entry| !self.is_idle(entry, now)).map(|entry| entry.state)
    }

    /// Removes every identity that has been idle for longer than the idle timeout.
    ///
    /// Returns the number of identities removed.  Without an idle timeout, nothing is removed.
    ///
    /// Idle identities are popped from the least recent end of each shard, stopping at the first
    /// one that is not idle.  Shards are visited one at a time, so identities touched concurrently
    /// with a sweep may or may not be observed by it.
    pub fn sweep_idle(&self) -> usize {
        if self.idle_timeout.is_none() {
            return 0;
        }

        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let now = self.clock.now();
            while shard.peek_lru().is_some_and(|(_, entry)| self.is_idle(entry, now)) {
                shard.pop_lru();
                removed += 1;
            }
        }

        self.removed(removed);
        if removed > 0 {
            self.telemetry.evicted_idle(removed);
        }
        removed
    }

    /// Gets the number of identities currently held, including idle ones not yet swept.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Removes every identity.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let count = shard.len();
            shard.clear();
            self.removed(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use quanta::Clock;

    use super::StateTable;
    use crate::{IdentityKey, RateState, Sample};

    fn seed(table: &StateTable, key: IdentityKey, sample: Sample) {
        table.with_state(key, |slot| *slot = Some(RateState::seeded(sample)));
    }

    #[test]
    fn stores_what_the_operation_leaves() {
        let table = StateTable::new(4, None, None, Clock::new());
        let key = IdentityKey::from_raw(42);

        assert_eq!(table.get(key), None);
        seed(&table, key, Sample::new(1.0, 10));
        assert_eq!(table.get(key), Some(RateState::seeded(Sample::new(1.0, 10))));
        assert_eq!(table.len(), 1);

        let seen = table.with_state(key, |slot| slot.take());
        assert_eq!(seen, Some(RateState::seeded(Sample::new(1.0, 10))));
        assert_eq!(table.get(key), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn shard_count_rounds_up() {
        let table = StateTable::new(3, None, None, Clock::new());
        assert_eq!(table.shards.len(), 4);

        let table = StateTable::new(0, None, None, Clock::new());
        assert_eq!(table.shards.len(), 1);
    }

    #[test]
    fn capacity_is_a_hard_limit() {
        // Cases are defined as: requested shards, capacity, expected shards, expected limit.
        let cases = [
            (1, 16, 1, 16),
            (4, 16, 4, 16),
            (4, 18, 4, 16),
            (16, 10, 8, 8),
            (16, 1, 1, 1),
            (3, 3, 2, 2),
        ];

        for (shards, capacity, expected_shards, expected_limit) in cases {
            let table = StateTable::new(shards, Some(capacity), None, Clock::new());
            assert_eq!(table.shards.len(), expected_shards, "{shards} shards, capacity {capacity}");

            for raw in 0..200 {
                seed(&table, IdentityKey::from_raw(raw), Sample::new(1.0, 1));
                assert!(table.len() <= capacity);
            }
            assert_eq!(table.len(), expected_limit, "{shards} shards, capacity {capacity}");
        }
    }

    #[test]
    fn evicts_least_recently_seen_when_full() {
        let (clock, mock) = Clock::mock();
        let table = StateTable::new(1, Some(2), None, clock);

        let (a, b, c) = (IdentityKey::from_raw(1), IdentityKey::from_raw(2), IdentityKey::from_raw(3));

        seed(&table, a, Sample::new(1.0, 1));
        mock.increment(Duration::from_secs(1));
        seed(&table, b, Sample::new(1.0, 1));
        mock.increment(Duration::from_secs(1));

        // Touch `a` again so that `b` becomes the least recently seen identity.
        table.with_state(a, |_| ());
        mock.increment(Duration::from_secs(1));

        seed(&table, c, Sample::new(1.0, 1));
        assert_eq!(table.len(), 2);
        assert!(table.get(a).is_some());
        assert!(table.get(b).is_none());
        assert!(table.get(c).is_some());
    }

    #[test]
    fn idle_identities_are_treated_as_absent() {
        let (clock, mock) = Clock::mock();
        let table = StateTable::new(2, None, Some(Duration::from_secs(60)), clock);
        let key = IdentityKey::from_raw(7);

        seed(&table, key, Sample::new(1.0, 1));
        mock.increment(Duration::from_secs(30));
        assert!(table.get(key).is_some());

        mock.increment(Duration::from_secs(31));
        assert!(table.get(key).is_none());
        let seen = table.with_state(key, |slot| slot.is_some());
        assert!(!seen);
    }

    #[test]
    fn sweep_removes_only_idle_identities() {
        let (clock, mock) = Clock::mock();
        let table = StateTable::new(4, None, Some(Duration::from_secs(60)), clock);

        for raw in 0..8 {
            seed(&table, IdentityKey::from_raw(raw), Sample::new(1.0, 1));
        }
        mock.increment(Duration::from_secs(45));
        for raw in 0..3 {
            table.with_state(IdentityKey::from_raw(raw), |_| ());
        }
        mock.increment(Duration::from_secs(30));

        assert_eq!(table.sweep_idle(), 5);
        assert_eq!(table.len(), 3);
        assert_eq!(table.sweep_idle(), 0);
    }

    #[test]
    fn eviction_follows_recency_across_a_full_shard() {
        let capacity = 1000;
        let table = StateTable::new(1, Some(capacity), None, Clock::new());

        for raw in 0..capacity as u64 {
            seed(&table, IdentityKey::from_raw(raw), Sample::new(1.0, 1));
        }
        // Touch the first half, so the second half is now the least recently seen.
        for raw in 0..500 {
            table.with_state(IdentityKey::from_raw(raw), |_| ());
        }
        for raw in 1000..1500 {
            seed(&table, IdentityKey::from_raw(raw), Sample::new(1.0, 1));
        }

        assert_eq!(table.len(), capacity);
        assert!((0..500).all(|raw| table.get(IdentityKey::from_raw(raw)).is_some()));
        assert!((500..1000).all(|raw| table.get(IdentityKey::from_raw(raw)).is_none()));
        assert!((1000..1500).all(|raw| table.get(IdentityKey::from_raw(raw)).is_some()));
    }

    #[test]
    fn reports_identities_as_they_change() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let (clock, mock) = Clock::mock();

        let table = metrics::with_local_recorder(&recorder, || {
            StateTable::new(1, Some(4), Some(Duration::from_secs(60)), clock)
        });
        let value_of = |name: &str, reason: Option<&str>| {
            snapshotter.snapshot().into_vec().into_iter().find_map(|(key, _, _, value)| {
                let key = key.key();
                let matches = key.name() == name
                    && reason.map_or(true, |r| key.labels().any(|l| l.value() == r));
                matches.then_some(value)
            })
        };
        let values = || {
            (
                value_of("memorizer_identities", None),
                value_of("memorizer_evictions_total", Some("capacity")),
                value_of("memorizer_evictions_total", Some("idle")),
            )
        };

        assert_eq!(values().0, Some(DebugValue::Gauge(0.0.into())));

        for raw in 0..6 {
            seed(&table, IdentityKey::from_raw(raw), Sample::new(1.0, 1));
        }
        assert_eq!(
            values(),
            (
                Some(DebugValue::Gauge(4.0.into())),
                Some(DebugValue::Counter(2)),
                Some(DebugValue::Counter(0)),
            )
        );

        table.with_state(IdentityKey::from_raw(5), |slot| *slot = None);
        assert_eq!(values().0, Some(DebugValue::Gauge(3.0.into())));

        mock.increment(Duration::from_secs(61));
        assert_eq!(table.sweep_idle(), 3);
        assert_eq!(values().0, Some(DebugValue::Gauge(0.0.into())));
        assert_eq!(values().2, Some(DebugValue::Counter(3)));

        seed(&table, IdentityKey::from_raw(9), Sample::new(1.0, 1));
        table.clear();
        assert_eq!(values().0, Some(DebugValue::Gauge(0.0.into())));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn sweep_without_timeout_is_a_no_op() {
        let table = StateTable::new(1, None, None, Clock::new());
        seed(&table, IdentityKey::from_raw(1), Sample::new(1.0, 1));
        assert_eq!(table.sweep_idle(), 0);
        assert_eq!(table.len(), 1);

        table.clear();
        assert_eq!(table.len(), 0);
    }
}
