//! Two-sample rate calculation.
use thiserror::Error;

/// A single observed value at a source-supplied timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sample {
    /// Observed value.
    pub value: f64,
    /// Source-supplied timestamp.  Zero means "unset".
    pub timestamp: i64,
}

impl Sample {
    /// Creates a new `Sample`.
    pub const fn new(value: f64, timestamp: i64) -> Self {
        Sample { value, timestamp }
    }

    /// Returns `true` if the timestamp of this sample is the unset sentinel.
    pub const fn is_unset(&self) -> bool {
        self.timestamp == 0
    }
}

/// Errors that could occur while calculating a rate from two samples.
#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum RateError {
    /// The previous or current timestamp is unset.
    #[error("no timestamp or previous timestamp available")]
    MissingTimestamp,

    /// No time elapsed between the previous and current samples.
    #[error("sample timestamp {timestamp} is the same as the previous sample timestamp")]
    DuplicateTimestamp {
        /// Timestamp shared by both samples.
        timestamp: i64,
    },

    /// The value decreased between the previous and current samples.
    #[error("negative rate {rate} detected")]
    NegativeRate {
        /// The rejected rate.
        rate: f64,
    },

    /// The rate is NaN or infinite.
    #[error("non-finite rate detected")]
    NonFiniteRate,
}

/// Calculates the rate of change between two samples, in value units per timestamp unit.
///
/// Checks are applied in a fixed order: unset timestamps, equal timestamps, then the finiteness
/// and sign of the computed rate.  Equal timestamps are therefore always reported as
/// [`RateError::DuplicateTimestamp`], even if the value also decreased.
///
/// The elapsed time is signed: a current sample older than the previous one yields a positive rate
/// if its value is also lower, and a negative rate otherwise.
///
/// # Errors
///
/// Returns the first [`RateError`] that applies to the pair of samples.
pub fn calculate(previous: Sample, current: Sample) -> Result<f64, RateError> {
    if previous.is_unset() || current.is_unset() {
        return Err(RateError::MissingTimestamp);
    }

    if current.timestamp == previous.timestamp {
        return Err(RateError::DuplicateTimestamp { timestamp: current.timestamp });
    }

    let elapsed = (i128::from(current.timestamp) - i128::from(previous.timestamp)) as f64;
    let rate = (current.value - previous.value) / elapsed;
    if !rate.is_finite() {
        return Err(RateError::NonFiniteRate);
    }
    if rate < 0.0 {
        return Err(RateError::NegativeRate { rate });
    }

    Ok(rate)
}

/// Derivation state of a single identity.
///
/// Holds the last good sample ("previous") and, while a rate is being evaluated, the incoming
/// sample ("current").  A successful [`calculate`](RateState::calculate) rolls the current sample
/// into the previous slot exactly once; a failed one discards the current sample and leaves the
/// previous sample untouched.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateState {
    previous: Sample,
    current: Option<Sample>,
}

impl RateState {
    /// Creates a new `RateState` seeded with the given sample as the previous sample.
    pub const fn seeded(sample: Sample) -> Self {
        RateState { previous: sample, current: None }
    }

    /// Gets the previous sample.
    pub const fn previous(&self) -> Sample {
        self.previous
    }

    /// Gets the current sample, if one is being evaluated.
    pub const fn current(&self) -> Option<Sample> {
        self.current
    }

    /// Sets the current sample.
    pub fn observe(&mut self, sample: Sample) {
        self.current = Some(sample);
    }

    /// Replaces the previous sample, discarding any current sample.
    pub fn reseed(&mut self, sample: Sample) {
        self.previous = sample;
        self.current = None;
    }

    /// Calculates the rate between the previous and current samples.
    ///
    /// On success, the current sample becomes the previous sample.  The current sample is cleared
    /// either way.  If no current sample was observed, this reports a missing timestamp.
    ///
    /// # Errors
    ///
    /// See [`calculate`].
    pub fn calculate(&mut self) -> Result<f64, RateError> {
        let current = self.current.take().unwrap_or_default();
        let rate = calculate(self.previous, current)?;
        self.previous = current;
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    use super::{calculate, RateError, RateState, Sample};

    #[test]
    fn calculate_cases() {
        // Cases are defined as: previous sample, current sample, expected result.
        let cases = [
            (Sample::new(10.0, 1000), Sample::new(25.0, 2000), Ok(0.015)),
            (Sample::new(25.0, 2000), Sample::new(40.0, 2500), Ok(0.03)),
            (Sample::new(5.0, 100), Sample::new(5.0, 200), Ok(0.0)),
            (Sample::new(5.0, 0), Sample::new(6.0, 200), Err(RateError::MissingTimestamp)),
            (Sample::new(5.0, 100), Sample::new(6.0, 0), Err(RateError::MissingTimestamp)),
            (
                Sample::new(5.0, 100),
                Sample::new(6.0, 100),
                Err(RateError::DuplicateTimestamp { timestamp: 100 }),
            ),
            (
                Sample::new(5.0, 100),
                Sample::new(1.0, 100),
                Err(RateError::DuplicateTimestamp { timestamp: 100 }),
            ),
            (
                Sample::new(5.0, 200),
                Sample::new(6.0, 100),
                Err(RateError::NegativeRate { rate: -0.01 }),
            ),
            (Sample::new(6.0, 200), Sample::new(5.0, 100), Ok(0.01)),
            (
                Sample::new(10.0, 100),
                Sample::new(5.0, 200),
                Err(RateError::NegativeRate { rate: -0.05 }),
            ),
            (Sample::new(0.0, 100), Sample::new(f64::INFINITY, 200), Err(RateError::NonFiniteRate)),
        ];

        for (previous, current, expected) in cases {
            match (calculate(previous, current), expected) {
                (Ok(actual), Ok(expected)) => assert_relative_eq!(actual, expected),
                (actual, expected) => assert_eq!(actual, expected),
            }
        }
    }

    #[test]
    fn rolls_forward_on_success() {
        let mut state = RateState::seeded(Sample::new(10.0, 1000));

        state.observe(Sample::new(25.0, 2000));
        let rate = state.calculate().expect("rate should be derivable");
        assert_relative_eq!(rate, 0.015);
        assert_eq!(state.previous(), Sample::new(25.0, 2000));
        assert_eq!(state.current(), None);

        state.observe(Sample::new(40.0, 2500));
        let rate = state.calculate().expect("rate should be derivable");
        assert_relative_eq!(rate, 0.03);
        assert_eq!(state.previous(), Sample::new(40.0, 2500));
    }

    #[test]
    fn keeps_previous_on_failure() {
        let mut state = RateState::seeded(Sample::new(10.0, 1000));

        state.observe(Sample::new(5.0, 2000));
        assert!(matches!(state.calculate(), Err(RateError::NegativeRate { .. })));
        assert_eq!(state.previous(), Sample::new(10.0, 1000));
        assert_eq!(state.current(), None);

        state.observe(Sample::new(50.0, 1000));
        assert_eq!(state.calculate(), Err(RateError::DuplicateTimestamp { timestamp: 1000 }));
        assert_eq!(state.previous(), Sample::new(10.0, 1000));
    }

    #[test]
    fn calculate_without_current_sample() {
        let mut state = RateState::seeded(Sample::new(10.0, 1000));
        assert_eq!(state.calculate(), Err(RateError::MissingTimestamp));
        assert_eq!(state.previous(), Sample::new(10.0, 1000));
    }

    #[test]
    fn reseed_replaces_previous() {
        let mut state = RateState::seeded(Sample::new(10.0, 1000));
        state.observe(Sample::new(1.0, 2000));
        state.reseed(Sample::new(1.0, 2000));
        assert_eq!(state.previous(), Sample::new(1.0, 2000));
        assert_eq!(state.current(), None);
    }

    proptest! {
        #[test]
        fn monotonic_samples_yield_non_negative_rates(
            v1 in 0.0f64..1e12,
            delta in 0.0f64..1e12,
            t1 in 1i64..1_000_000_000,
            dt in 1i64..1_000_000,
        ) {
            let rate = calculate(Sample::new(v1, t1), Sample::new(v1 + delta, t1 + dt));
            prop_assert!(matches!(rate, Ok(r) if r >= 0.0));
        }
    }
}
