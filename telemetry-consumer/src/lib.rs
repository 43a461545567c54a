//! Queue consumer for the telemetry pipeline.
//!
//! Telemetry receivers publish protobuf-encoded batches of metric samples and log lines to nsqd.
//! This crate consumes both topics:
//!
//! - metric batches are decoded, run through a shared [`Memorizer`] to turn cumulative rate
//!   samples into rates, and written to SQLite
//! - log batches are decoded and pushed to a log index, either Grafana Loki or Quickwit
//!
//! Each queue message carries one batch, and is only finished once the whole batch has been
//! written.  A batch that could not be decoded or written is requeued and redelivered later.
//!
//! # Deployment
//!
//! The derivation state lives in the memory of the consuming process.  Every sample of a series
//! must be consumed by the same process for its rate to be derived: running several consumers
//! on the same channel splits series between them, and each process seeds its own state.
//!
//! # Telemetry
//!
//! On top of the counters of [`telemetry_memorizer`], the consumer reports:
//!
//! - `consumer_messages_total` (counter, labelled by `topic` and `outcome`: `finished`,
//!   `requeued` or `discarded`)
//! - `consumer_batches_total` (counter, labelled by `handler` and `outcome`: `ok` or `failed`)
//! - `consumer_rows_written_total` (counter, labelled by `handler` and `sink`)
//!
//! Telemetry is recorded through the [`metrics`] facade, and can be served to Prometheus with
//! [`install_exporter`].
#![deny(missing_docs)]
use std::{net::SocketAddr, sync::Arc, time::Duration};

use telemetry_memorizer::{BuildError, Memorizer};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::{JoinError, JoinSet},
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{error, info};

pub mod config;
pub mod decoder;
pub mod handler;
pub mod proto;
pub mod queue;
pub mod sink;

mod telemetry;

use self::{
    config::ConsumerConfig,
    handler::{LogHandler, MetricHandler},
    queue::{Handler, NsqConsumer},
    sink::{HttpLogSink, LogSink, MetricSink, SinkError, SqliteSink},
};

const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(60);

/// Errors that could occur while running the consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The memorizer could not be built.
    #[error("failed to build memorizer: {0}")]
    Build(#[from] BuildError),

    /// A sink could not be created.
    #[error("failed to create sink: {0}")]
    Sink(#[from] SinkError),

    /// The Prometheus exporter could not be installed.
    #[error("failed to install exporter: {0}")]
    Exporter(#[from] metrics_exporter_prometheus::BuildError),

    /// A consumer task panicked.
    #[error("consumer task failed: {0}")]
    Task(#[from] JoinError),
}

/// Installs a Prometheus exporter serving the consumer's telemetry on the given address.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// If the exporter could not be installed, an error variant will be returned.
pub fn install_exporter(address: SocketAddr) -> Result<(), ConsumerError> {
    metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(address).install()?;
    info!(%address, "Serving Prometheus scrapes.");
    Ok(())
}

/// Runs the consumer until `shutdown` changes.
///
/// Opens the sinks, then consumes the metrics and logs topics concurrently, reconnecting to nsqd
/// whenever the connection fails.  Idle identities are swept periodically if an idle timeout is
/// configured.
///
/// # Errors
///
/// If the memorizer or a sink could not be created, or a consumer task panicked, an error
/// variant will be returned.
pub async fn run(
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumerError> {
    let memorizer = Arc::new(config.memorizer_builder().build()?);
    let metric_sink: Arc<dyn MetricSink> = Arc::new(SqliteSink::open(&config.database)?);
    let log_sink: Arc<dyn LogSink> =
        Arc::new(HttpLogSink::new(config.log_sink, &config.log_sink_url)?);

    info!(
        database = %config.database.display(),
        log_sink = %config.log_sink,
        log_sink_url = %config.log_sink_url,
        timestamp_unit = %config.timestamp_unit,
        "Opened sinks."
    );

    let metrics =
        MetricHandler::new(Arc::clone(&memorizer), metric_sink, config.timestamp_unit);
    let logs = LogHandler::new(log_sink);

    let mut tasks = JoinSet::new();
    tasks.spawn(consume(config.metrics_consumer(), metrics, shutdown.clone()));
    tasks.spawn(consume(config.logs_consumer(), logs, shutdown.clone()));
    if config.idle_timeout.is_some() && !config.sweep_interval.is_zero() {
        tasks.spawn(sweep_idle(memorizer, config.sweep_interval, shutdown));
    }

    while let Some(result) = tasks.join_next().await {
        result?;
    }

    info!("Consumer stopped.");
    Ok(())
}

/// Consumes from nsqd until shutdown, reconnecting with a capped exponential backoff.
async fn consume<H>(consumer: NsqConsumer, handler: H, mut shutdown: watch::Receiver<bool>)
where
    H: Handler,
{
    let mut delay = RECONNECT_DELAY_MIN;
    loop {
        match consumer.run(&handler, shutdown.clone()).await {
            Ok(()) => return,
            Err(e) => error!(
                error = %e,
                topic = consumer.topic(),
                delay_secs = delay.as_secs(),
                "Lost nsqd connection, reconnecting."
            ),
        }

        if *shutdown.borrow_and_update() {
            return;
        }

        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
        delay = delay.saturating_mul(2).min(RECONNECT_DELAY_MAX);
    }
}

async fn sweep_idle(
    memorizer: Arc<Memorizer>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                memorizer.sweep_idle();
            }
            _ = shutdown.changed() => return,
        }
    }
}
