//! Stateful rate derivation for cumulative telemetry samples.
//!
//! Telemetry producers often report cumulative values, such as the total number of requests served
//! since start-up.  What operators usually want to persist is the rate of change of those values.
//! Deriving it requires remembering the previous sample of every series across otherwise
//! independent batch deliveries, which is what this crate does.
//!
//! # Identities
//!
//! A series is identified by the name, tags and emitter identity of its samples, hashed into an
//! [`IdentityKey`].  See the [`identity`] module for the exact rendering that is hashed.
//!
//! # Derivation
//!
//! [`Memorizer::process`] handles one [`Record`] at a time:
//!
//! - records of any kind other than [`MetricKind::Rate`] pass through as
//!   [`DerivationStatus::Unchanged`]
//! - the first rate sample of an identity seeds its state and reports
//!   [`DerivationStatus::SeededNoOutput`]
//! - every following rate sample has its value replaced by
//!   `(value - previous value) / (timestamp - previous timestamp)` and reports
//!   [`DerivationStatus::Derived`]
//!
//! Anything else is reported through the status and leaves the last good sample of the identity
//! in place, so a bad sample never poisons later derivations.  Only
//! [persistable](DerivationStatus::is_persistable) records should be handed to storage.
//!
//! ```rust
//! use telemetry_memorizer::{DerivationStatus, MemorizerBuilder, MetricKind, Record};
//!
//! let memorizer = MemorizerBuilder::new().build().expect("failed to build memorizer");
//!
//! let (_, status) = memorizer.process(Record::new("requests", MetricKind::Rate, 10.0, 1000, "web-1"));
//! assert_eq!(status, DerivationStatus::SeededNoOutput);
//!
//! let (record, status) = memorizer.process(Record::new("requests", MetricKind::Rate, 25.0, 2000, "web-1"));
//! assert_eq!(status, DerivationStatus::Derived);
//! assert_eq!(record.value, 0.015);
//! ```
//!
//! # State
//!
//! State is kept in memory, in a table split into independently locked shards.  It can be bounded
//! in size and in age through [`MemorizerBuilder`]; see its methods for the details.
//!
//! # Telemetry
//!
//! The memorizer reports on itself through the [`metrics`] facade:
//!
//! - `memorizer_records_total` (counter, labelled by `status`)
//! - `memorizer_identities` (gauge)
//! - `memorizer_evictions_total` (counter, labelled by `reason`: `idle` or `capacity`)
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, MemorizerBuilder, OrderPolicy, ResetPolicy};

pub mod identity;
pub use self::identity::{IdentityKey, TagOrdering};

pub mod rate;
pub use self::rate::{calculate, RateError, RateState, Sample};

mod record;
pub use self::record::{MetricKind, Record, UnknownKind};

mod status;
pub use self::status::{DerivationStatus, DeriveError};

mod memorizer;
pub use self::memorizer::Memorizer;

mod table;
mod telemetry;
