use std::fmt;

use thiserror::Error;

use crate::RateError;

/// Outcome of processing a single record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum DerivationStatus {
    /// The record is not a rate sample and was passed through untouched.
    Unchanged,
    /// First sighting of an identity: state was seeded and there is nothing to persist yet.
    SeededNoOutput,
    /// The value of the record was replaced with the derived rate.
    Derived,
    /// The record lacks a name, kind or emitter identity, or carries a non-finite value.
    InvalidRecord,
    /// The record is a rate sample with a negative cumulative value.
    NegativeSample,
    /// The previous or current timestamp is unset.
    MissingTimestamp,
    /// The record has the same timestamp as the previous sample.
    DuplicateTimestamp,
    /// The record is older than the previous sample and out-of-order samples are rejected.
    OutOfOrder,
    /// The value decreased since the previous sample.
    NegativeRate,
    /// The derived rate is NaN or infinite.
    NonFiniteRate,
    /// The value decreased since the previous sample and the identity was re-seeded.
    CounterReset,
}

impl DerivationStatus {
    /// All statuses.
    pub const ALL: [DerivationStatus; 11] = [
        DerivationStatus::Unchanged,
        DerivationStatus::SeededNoOutput,
        DerivationStatus::Derived,
        DerivationStatus::InvalidRecord,
        DerivationStatus::NegativeSample,
        DerivationStatus::MissingTimestamp,
        DerivationStatus::DuplicateTimestamp,
        DerivationStatus::OutOfOrder,
        DerivationStatus::NegativeRate,
        DerivationStatus::NonFiniteRate,
        DerivationStatus::CounterReset,
    ];

    /// Gets a stable, snake-cased name for this status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DerivationStatus::Unchanged => "unchanged",
            DerivationStatus::SeededNoOutput => "seeded_no_output",
            DerivationStatus::Derived => "derived",
            DerivationStatus::InvalidRecord => "invalid_record",
            DerivationStatus::NegativeSample => "negative_sample",
            DerivationStatus::MissingTimestamp => "missing_timestamp",
            DerivationStatus::DuplicateTimestamp => "duplicate_timestamp",
            DerivationStatus::OutOfOrder => "out_of_order",
            DerivationStatus::NegativeRate => "negative_rate",
            DerivationStatus::NonFiniteRate => "non_finite_rate",
            DerivationStatus::CounterReset => "counter_reset",
        }
    }

    /// Returns `true` if the record should be handed to a sink.
    pub const fn is_persistable(&self) -> bool {
        matches!(self, DerivationStatus::Derived | DerivationStatus::Unchanged)
    }

    /// Returns `true` if the status is a derivation anomaly worth surfacing to operators.
    ///
    /// Seeding is expected and is not an anomaly; neither is malformed input, which is rejected
    /// before any state is involved.
    pub const fn is_anomaly(&self) -> bool {
        matches!(
            self,
            DerivationStatus::MissingTimestamp
                | DerivationStatus::DuplicateTimestamp
                | DerivationStatus::OutOfOrder
                | DerivationStatus::NegativeRate
                | DerivationStatus::NonFiniteRate
                | DerivationStatus::CounterReset
        )
    }
}

impl fmt::Display for DerivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that could occur while deriving a single record.
///
/// None of these are fatal: each one resolves a single record and leaves the engine usable.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DeriveError {
    /// A required field is empty.
    #[error("record has an empty {field}")]
    InvalidRecord {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A rate sample carries a NaN or infinite value.
    #[error("record value {value} is not finite")]
    NonFiniteSample {
        /// The rejected value.
        value: f64,
    },

    /// A rate sample carries a negative cumulative value.
    #[error("negative cumulative sample {value}")]
    NegativeSample {
        /// The rejected value.
        value: f64,
    },

    /// The rate calculator rejected the sample.
    #[error(transparent)]
    Rate(#[from] RateError),

    /// The sample is older than the previous sample of its identity.
    #[error("sample timestamp {current} is older than the previous sample timestamp {previous}")]
    OutOfOrder {
        /// Timestamp of the previous sample.
        previous: i64,
        /// Timestamp of the rejected sample.
        current: i64,
    },

    /// The value decreased and the identity was re-seeded with the incoming sample.
    #[error("counter reset detected, re-seeded at {value}")]
    CounterReset {
        /// The value the identity was re-seeded with.
        value: f64,
    },
}

impl From<&DeriveError> for DerivationStatus {
    fn from(e: &DeriveError) -> Self {
        match e {
            DeriveError::InvalidRecord { .. } | DeriveError::NonFiniteSample { .. } => {
                DerivationStatus::InvalidRecord
            }
            DeriveError::NegativeSample { .. } => DerivationStatus::NegativeSample,
            DeriveError::Rate(RateError::MissingTimestamp) => DerivationStatus::MissingTimestamp,
            DeriveError::Rate(RateError::DuplicateTimestamp { .. }) => {
                DerivationStatus::DuplicateTimestamp
            }
            DeriveError::Rate(RateError::NegativeRate { .. }) => DerivationStatus::NegativeRate,
            DeriveError::Rate(RateError::NonFiniteRate) => DerivationStatus::NonFiniteRate,
            DeriveError::OutOfOrder { .. } => DerivationStatus::OutOfOrder,
            DeriveError::CounterReset { .. } => DerivationStatus::CounterReset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DerivationStatus, DeriveError};
    use crate::RateError;

    #[test]
    fn only_derived_and_unchanged_are_persisted() {
        for status in DerivationStatus::ALL {
            let expected =
                matches!(status, DerivationStatus::Derived | DerivationStatus::Unchanged);
            assert_eq!(status.is_persistable(), expected, "{status}");
        }
    }

    #[test]
    fn status_from_error() {
        // Cases are defined as: error, expected status.
        let cases = [
            (DeriveError::InvalidRecord { field: "name" }, DerivationStatus::InvalidRecord),
            (DeriveError::NonFiniteSample { value: f64::NAN }, DerivationStatus::InvalidRecord),
            (DeriveError::NegativeSample { value: -5.0 }, DerivationStatus::NegativeSample),
            (DeriveError::Rate(RateError::MissingTimestamp), DerivationStatus::MissingTimestamp),
            (
                DeriveError::Rate(RateError::DuplicateTimestamp { timestamp: 1 }),
                DerivationStatus::DuplicateTimestamp,
            ),
            (DeriveError::OutOfOrder { previous: 2, current: 1 }, DerivationStatus::OutOfOrder),
            (
                DeriveError::Rate(RateError::NegativeRate { rate: -1.0 }),
                DerivationStatus::NegativeRate,
            ),
            (DeriveError::Rate(RateError::NonFiniteRate), DerivationStatus::NonFiniteRate),
            (DeriveError::CounterReset { value: 0.0 }, DerivationStatus::CounterReset),
        ];

        for (error, expected) in cases {
            assert_eq!(DerivationStatus::from(&error), expected);
            assert!(!expected.is_persistable());
        }
    }
}
