//! Command-line configuration.
use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use getopts::{Matches, Options};
use telemetry_memorizer::{MemorizerBuilder, OrderPolicy, ResetPolicy, TagOrdering};
use thiserror::Error;

use crate::{
    decoder::TimestampUnit,
    queue::{frame::is_valid_name, NsqConsumer},
    sink::LogSinkKind,
};

const DEFAULT_NSQD_ADDRESS: &str = "127.0.0.1:4150";
const DEFAULT_METRICS_TOPIC: &str = "metrics_protobuf";
const DEFAULT_METRICS_CHANNEL: &str = "metrics_channel";
const DEFAULT_LOGS_TOPIC: &str = "logs_protobuf";
const DEFAULT_LOGS_CHANNEL: &str = "log_consumer";
const DEFAULT_DATABASE: &str = "metrics.db";
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(90);
const DEFAULT_MAX_IN_FLIGHT: u64 = 1;
const DEFAULT_MAX_ATTEMPTS: u16 = 5;

/// Errors that could occur while reading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The command line could not be parsed.
    #[error(transparent)]
    Parse(#[from] getopts::Fail),

    /// An option has a value that could not be interpreted.
    #[error("invalid value '{value}' for --{option}: {reason}")]
    InvalidValue {
        /// Name of the option.
        option: &'static str,
        /// Value as given.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A topic or channel name is not accepted by nsqd.
    #[error("invalid name '{name}' for --{option}: expected 1-64 characters of [.a-zA-Z0-9_-]")]
    InvalidName {
        /// Name of the option.
        option: &'static str,
        /// Name as given.
        name: String,
    },
}

/// Configuration of the consumer process.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerConfig {
    /// Address of the nsqd TCP listener.
    pub nsqd_address: String,
    /// Topic carrying metric batches.
    pub metrics_topic: String,
    /// Channel to consume metric batches from.
    pub metrics_channel: String,
    /// Topic carrying log batches.
    pub logs_topic: String,
    /// Channel to consume log batches from.
    pub logs_channel: String,
    /// Path of the SQLite database metrics are written to.
    pub database: PathBuf,
    /// Log index flavour.
    pub log_sink: LogSinkKind,
    /// Endpoint of the log index.
    pub log_sink_url: String,
    /// Unit of record timestamps, and therefore of derived rates.
    pub timestamp_unit: TimestampUnit,
    /// Number of state table shards, or `None` for one per CPU.
    pub shards: Option<usize>,
    /// Maximum number of tracked identities, or `None` for no limit.
    pub max_identities: Option<usize>,
    /// Idle timeout for identities, or `None` to keep them forever.
    pub idle_timeout: Option<Duration>,
    /// Counter reset policy.
    pub reset_policy: ResetPolicy,
    /// Policy for samples older than the previous sample of their identity.
    pub order_policy: OrderPolicy,
    /// Tag ordering used for identity keys.
    pub tag_ordering: TagOrdering,
    /// Address to serve Prometheus scrapes on, or `None` to not export telemetry.
    pub prometheus_listen: Option<SocketAddr>,
    /// How often idle identities are swept.
    pub sweep_interval: Duration,
    /// Base delay before a failed batch is redelivered.
    pub requeue_delay: Duration,
    /// Number of messages nsqd may have in flight to each consumer.
    pub max_in_flight: u64,
    /// Number of delivery attempts after which a batch is discarded, or zero for no limit.
    pub max_attempts: u16,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        let log_sink = LogSinkKind::default();
        ConsumerConfig {
            nsqd_address: DEFAULT_NSQD_ADDRESS.to_string(),
            metrics_topic: DEFAULT_METRICS_TOPIC.to_string(),
            metrics_channel: DEFAULT_METRICS_CHANNEL.to_string(),
            logs_topic: DEFAULT_LOGS_TOPIC.to_string(),
            logs_channel: DEFAULT_LOGS_CHANNEL.to_string(),
            database: PathBuf::from(DEFAULT_DATABASE),
            log_sink,
            log_sink_url: log_sink.default_endpoint().to_string(),
            timestamp_unit: TimestampUnit::default(),
            shards: None,
            max_identities: None,
            idle_timeout: None,
            reset_policy: ResetPolicy::default(),
            order_policy: OrderPolicy::default(),
            tag_ordering: TagOrdering::default(),
            prometheus_listen: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ConsumerConfig {
    /// Gets the command-line options understood by [`ConsumerConfig::from_matches`].
    pub fn options() -> Options {
        let mut opts = Options::new();

        opts.optopt(
            "",
            "nsqd",
            "address of the nsqd TCP listener (default: 127.0.0.1:4150)",
            "ADDR",
        );
        opts.optopt("", "metrics-topic", "topic carrying metric batches", "NAME");
        opts.optopt("", "metrics-channel", "channel to consume metric batches from", "NAME");
        opts.optopt("", "logs-topic", "topic carrying log batches", "NAME");
        opts.optopt("", "logs-channel", "channel to consume log batches from", "NAME");
        opts.optopt(
            "d",
            "database",
            "SQLite database to write metrics to (default: metrics.db)",
            "PATH",
        );
        opts.optopt("", "log-sink", "log index flavour: loki or quickwit (default: loki)", "KIND");
        opts.optopt("", "log-sink-url", "endpoint of the log index", "URL");
        opts.optopt(
            "",
            "timestamp-unit",
            "unit of metric timestamps: s, ms, us or ns (default: ms)",
            "UNIT",
        );
        opts.optopt("", "shards", "number of state table shards (default: one per CPU)", "INTEGER");
        opts.optopt("", "max-identities", "maximum number of tracked identities", "INTEGER");
        opts.optopt(
            "",
            "idle-timeout",
            "seconds after which an unseen identity is forgotten",
            "SECONDS",
        );
        opts.optopt(
            "",
            "reset-policy",
            "on counter decrease: reject or reseed (default: reject)",
            "POLICY",
        );
        opts.optopt(
            "",
            "order-policy",
            "on samples older than the previous one: derive or reject (default: derive)",
            "POLICY",
        );
        opts.optopt("", "tag-ordering", "unordered or as-given (default: unordered)", "ORDERING");
        opts.optopt("", "prometheus", "address to serve Prometheus scrapes on", "ADDR");
        opts.optopt(
            "",
            "sweep-interval",
            "seconds between idle identity sweeps (default: 60)",
            "SECONDS",
        );
        opts.optopt(
            "",
            "requeue-delay",
            "base redelivery delay in seconds (default: 90)",
            "SECONDS",
        );
        opts.optopt("", "max-in-flight", "messages in flight per consumer (default: 1)", "INTEGER");
        opts.optopt(
            "",
            "max-attempts",
            "attempts before a batch is discarded, 0 for no limit",
            "INTEGER",
        );
        opts.optflag("h", "help", "print this help menu");

        opts
    }

    /// Parses the configuration from command-line arguments, excluding the program name.
    ///
    /// # Errors
    ///
    /// If the arguments could not be parsed, or an option has an invalid value, an error variant
    /// will be returned.
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let matches = Self::options().parse(args)?;
        Self::from_matches(&matches)
    }

    /// Builds the configuration from parsed command-line options.
    ///
    /// Options that are absent keep their default value.
    ///
    /// # Errors
    ///
    /// If an option has an invalid value, an error variant will be returned.
    pub fn from_matches(matches: &Matches) -> Result<Self, ConfigError> {
        let defaults = ConsumerConfig::default();

        let log_sink = parse_or(matches, "log-sink", defaults.log_sink)?;
        let log_sink_url = matches
            .opt_str("log-sink-url")
            .unwrap_or_else(|| log_sink.default_endpoint().to_string());

        Ok(ConsumerConfig {
            nsqd_address: matches.opt_str("nsqd").unwrap_or(defaults.nsqd_address),
            metrics_topic: name_or(matches, "metrics-topic", defaults.metrics_topic)?,
            metrics_channel: name_or(matches, "metrics-channel", defaults.metrics_channel)?,
            logs_topic: name_or(matches, "logs-topic", defaults.logs_topic)?,
            logs_channel: name_or(matches, "logs-channel", defaults.logs_channel)?,
            database: matches.opt_str("database").map(PathBuf::from).unwrap_or(defaults.database),
            log_sink,
            log_sink_url,
            timestamp_unit: parse_or(matches, "timestamp-unit", defaults.timestamp_unit)?,
            shards: parse_opt(matches, "shards")?,
            max_identities: parse_opt(matches, "max-identities")?,
            idle_timeout: parse_opt(matches, "idle-timeout")?.map(Duration::from_secs),
            reset_policy: parse_or(matches, "reset-policy", defaults.reset_policy)?,
            order_policy: parse_or(matches, "order-policy", defaults.order_policy)?,
            tag_ordering: parse_or(matches, "tag-ordering", defaults.tag_ordering)?,
            prometheus_listen: parse_opt(matches, "prometheus")?,
            sweep_interval: parse_opt(matches, "sweep-interval")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            requeue_delay: parse_opt(matches, "requeue-delay")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.requeue_delay),
            max_in_flight: parse_or(matches, "max-in-flight", defaults.max_in_flight)?,
            max_attempts: parse_or(matches, "max-attempts", defaults.max_attempts)?,
        })
    }

    /// Gets a memorizer builder configured from this configuration.
    pub fn memorizer_builder(&self) -> MemorizerBuilder {
        let mut builder = MemorizerBuilder::new()
            .with_reset_policy(self.reset_policy)
            .with_order_policy(self.order_policy)
            .with_tag_ordering(self.tag_ordering);
        if let Some(shards) = self.shards {
            builder = builder.with_shards(shards);
        }
        if let Some(max_identities) = self.max_identities {
            builder = builder.with_max_identities(max_identities);
        }
        if let Some(idle_timeout) = self.idle_timeout {
            builder = builder.with_idle_timeout(idle_timeout);
        }
        builder
    }

    /// Gets the consumer for the metrics topic.
    pub fn metrics_consumer(&self) -> NsqConsumer {
        self.consumer(&self.metrics_topic, &self.metrics_channel)
    }

    /// Gets the consumer for the logs topic.
    pub fn logs_consumer(&self) -> NsqConsumer {
        self.consumer(&self.logs_topic, &self.logs_channel)
    }

    fn consumer(&self, topic: &str, channel: &str) -> NsqConsumer {
        NsqConsumer::new(self.nsqd_address.as_str(), topic, channel)
            .with_max_in_flight(self.max_in_flight)
            .with_requeue_delay(self.requeue_delay)
            .with_max_attempts(self.max_attempts)
    }
}

fn parse_opt<T>(matches: &Matches, option: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    matches
        .opt_str(option)
        .map(|value| {
            value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                option,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_or<T>(matches: &Matches, option: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(matches, option)?.unwrap_or(default))
}

fn name_or(
    matches: &Matches,
    option: &'static str,
    default: String,
) -> Result<String, ConfigError> {
    match matches.opt_str(option) {
        None => Ok(default),
        Some(name) if is_valid_name(&name) => Ok(name),
        Some(name) => Err(ConfigError::InvalidName { option, name }),
    }
}
