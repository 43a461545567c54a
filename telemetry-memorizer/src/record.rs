use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::{identity::IdentityKey, DeriveError, TagOrdering};

/// Metric kind.
///
/// Defines the kind, or type, of a telemetry sample as it is named on the wire.  Only
/// [`MetricKind::Rate`] is stateful: every other kind passes through derivation untouched.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum MetricKind {
    /// Gauge type.
    Gauge,
    /// Count type.
    Count,
    /// Histogram type.
    Histogram,
    /// Rate type.
    ///
    /// Samples are cumulative and are converted into a rate of change between two consecutive
    /// samples of the same identity.
    Rate,
    /// Summary type.
    Summary,
    /// Meter type.
    Meter,
    /// Distribution type.
    Distribution,
    /// Set type.
    Set,
}

impl MetricKind {
    /// All metric kinds, in wire declaration order.
    pub const ALL: [MetricKind; 8] = [
        MetricKind::Gauge,
        MetricKind::Count,
        MetricKind::Histogram,
        MetricKind::Rate,
        MetricKind::Summary,
        MetricKind::Meter,
        MetricKind::Distribution,
        MetricKind::Set,
    ];

    /// Gets the wire name of this kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Count => "count",
            MetricKind::Histogram => "histogram",
            MetricKind::Rate => "rate",
            MetricKind::Summary => "summary",
            MetricKind::Meter => "meter",
            MetricKind::Distribution => "distribution",
            MetricKind::Set => "set",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric kind name that is not one of the known kinds.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown metric kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for MetricKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A single telemetry sample.
///
/// The kind is kept as the raw wire string, so that a record with a missing kind can still be
/// represented and rejected during validation.  Project, host, OS and unit are free-form labels
/// that are carried through derivation unmodified.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    /// Metric name.
    pub name: String,
    /// Metric kind, as named on the wire.
    pub kind: String,
    /// Sample value.
    pub value: f64,
    /// Source-supplied timestamp.  Zero means "unset".
    pub timestamp: i64,
    /// Tags attached to the sample.
    pub tags: Vec<String>,
    /// Identity of the producer that emitted the sample.
    pub emitter_id: String,
    /// Project name.
    pub project_name: String,
    /// Host name.
    pub hostname: String,
    /// Operating system.
    pub os: String,
    /// Unit of the value.
    pub unit: String,
}

impl Record {
    /// Creates a new `Record` with no tags and empty labels.
    pub fn new<N, E>(name: N, kind: MetricKind, value: f64, timestamp: i64, emitter_id: E) -> Self
    where
        N: Into<String>,
        E: Into<String>,
    {
        Record {
            name: name.into(),
            kind: kind.as_str().to_string(),
            value,
            timestamp,
            emitter_id: emitter_id.into(),
            ..Default::default()
        }
    }

    /// Replaces the tags of this record.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Gets the parsed kind of this record, if it is a known kind.
    pub fn metric_kind(&self) -> Option<MetricKind> {
        self.kind.parse().ok()
    }

    /// Returns `true` if this record is a cumulative rate sample.
    pub fn is_rate(&self) -> bool {
        self.kind == MetricKind::Rate.as_str()
    }

    /// Checks the fields every record needs before it may touch derivation state.
    ///
    /// # Errors
    ///
    /// Returns [`DeriveError::InvalidRecord`] naming the first missing field out of name, kind
    /// and emitter identity.
    pub fn validate(&self) -> Result<(), DeriveError> {
        let missing = if self.name.is_empty() {
            "name"
        } else if self.kind.is_empty() {
            "kind"
        } else if self.emitter_id.is_empty() {
            "emitter identity"
        } else {
            return Ok(());
        };

        Err(DeriveError::InvalidRecord { field: missing })
    }

    /// Computes the identity key of this record.
    pub fn identity(&self, ordering: TagOrdering) -> IdentityKey {
        IdentityKey::new(&self.name, &self.tags, &self.emitter_id, ordering)
    }
}

#[cfg(test)]
mod tests {
    use super::{MetricKind, Record};
    use crate::DeriveError;

    #[test]
    fn kind_names_round_trip() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>(), Ok(kind));
        }

        assert!("Rate".parse::<MetricKind>().is_err());
        assert!("".parse::<MetricKind>().is_err());
    }

    #[test]
    fn validation() {
        let valid = Record::new("cpu", MetricKind::Gauge, 1.0, 10, "agent-1");

        // Cases are defined as: record, expected missing field.
        let cases = [
            (Record { name: String::new(), ..valid.clone() }, Some("name")),
            (Record { kind: String::new(), ..valid.clone() }, Some("kind")),
            (Record { emitter_id: String::new(), ..valid.clone() }, Some("emitter identity")),
            (Record { name: String::new(), emitter_id: String::new(), ..valid.clone() }, Some("name")),
            (valid.clone(), None),
        ];

        for (record, expected) in cases {
            let result = record.validate();
            match expected {
                Some(field) => assert_eq!(result, Err(DeriveError::InvalidRecord { field })),
                None => assert_eq!(result, Ok(())),
            }
        }
    }

    #[test]
    fn unknown_kind_is_not_rate() {
        let record = Record { kind: "timer".to_string(), ..Record::default() };
        assert_eq!(record.metric_kind(), None);
        assert!(!record.is_rate());
    }
}
