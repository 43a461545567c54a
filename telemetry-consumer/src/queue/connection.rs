use std::time::Duration;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::watch,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use super::{
    frame::{
        Command, Frame, Message, MAGIC_V2, RESPONSE_CLOSE_WAIT, RESPONSE_HEARTBEAT, RESPONSE_OK,
    },
    Handler, QueueError,
};
use crate::telemetry::QueueTelemetry;

const DEFAULT_MAX_IN_FLIGHT: u64 = 1;
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(90);
const DEFAULT_MAX_ATTEMPTS: u16 = 5;
const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(15 * 60);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer for a single nsqd topic/channel pair.
///
/// Messages are handled one at a time, in delivery order, and each one is finished or requeued
/// before the next one is read.
#[derive(Clone, Debug)]
pub struct NsqConsumer {
    address: String,
    topic: String,
    channel: String,
    max_in_flight: u64,
    requeue_delay: Duration,
    max_attempts: u16,
}

impl NsqConsumer {
    /// Creates a new `NsqConsumer`.
    pub fn new<A, T, C>(address: A, topic: T, channel: C) -> Self
    where
        A: Into<String>,
        T: Into<String>,
        C: Into<String>,
    {
        NsqConsumer {
            address: address.into(),
            topic: topic.into(),
            channel: channel.into(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the number of messages nsqd may have in flight to this consumer.
    ///
    /// Defaults to 1.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: u64) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Sets the base delay before a failed message is redelivered.
    ///
    /// The delay grows linearly with the number of delivery attempts, up to 15 minutes.
    ///
    /// Defaults to 90 seconds.
    #[must_use]
    pub fn with_requeue_delay(mut self, requeue_delay: Duration) -> Self {
        self.requeue_delay = requeue_delay;
        self
    }

    /// Sets the number of delivery attempts after which a message is discarded.
    ///
    /// A value of zero never discards messages.
    ///
    /// Defaults to 5.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Gets the topic this consumer subscribes to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Connects to nsqd, subscribes, and handles messages until `shutdown` changes.
    ///
    /// On shutdown, the connection is closed cleanly: nsqd is asked to stop sending messages and
    /// any message still delivered in the meantime is requeued.
    ///
    /// # Errors
    ///
    /// If the connection could not be established, the subscription was rejected, or the
    /// connection failed, an error variant will be returned.  Handler failures are not errors:
    /// they requeue the message and consumption continues.
    pub async fn run<H>(
        &self,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError>
    where
        H: Handler + ?Sized,
    {
        let mut conn = Connection::connect(&self.address).await?;
        conn.send(Command::Subscribe { topic: &self.topic, channel: &self.channel }).await?;
        conn.expect_ok("SUB").await?;
        conn.send(Command::Ready(self.max_in_flight)).await?;

        info!(
            address = %self.address,
            topic = %self.topic,
            channel = %self.channel,
            "Subscribed to nsqd."
        );

        let telemetry = QueueTelemetry::new(&self.topic);

        if *shutdown.borrow_and_update() {
            return conn.close().await;
        }

        loop {
            let frame = tokio::select! {
                frame = conn.read_frame() => frame?,
                _ = shutdown.changed() => break,
            };

            match frame {
                Frame::Response(data) if &data[..] == RESPONSE_HEARTBEAT => {
                    conn.send(Command::Nop).await?;
                }
                Frame::Response(data) => {
                    let response = String::from_utf8_lossy(&data);
                    debug!(%response, "Ignoring response from nsqd.");
                }
                Frame::Error(data) => {
                    let error = String::from_utf8_lossy(&data);
                    warn!(%error, topic = %self.topic, "nsqd reported an error.");
                }
                Frame::Message(msg) => self.process(&mut conn, handler, &telemetry, msg).await?,
            }
        }

        info!(topic = %self.topic, channel = %self.channel, "Closing nsqd connection.");
        conn.close().await
    }

    async fn process<H>(
        &self,
        conn: &mut Connection,
        handler: &H,
        telemetry: &QueueTelemetry,
        msg: Message,
    ) -> Result<(), QueueError>
    where
        H: Handler + ?Sized,
    {
        if self.max_attempts > 0 && msg.attempts > self.max_attempts {
            warn!(
                id = ?msg.id,
                attempts = msg.attempts,
                topic = %self.topic,
                "Discarding message after too many attempts."
            );
            telemetry.discarded();
            return conn.send(Command::Finish(msg.id)).await;
        }

        match handler.handle(&msg.body).await {
            Ok(()) => {
                telemetry.finished();
                conn.send(Command::Finish(msg.id)).await
            }
            Err(e) => {
                let delay = self.requeue_delay_for(msg.attempts);
                error!(
                    error = %e,
                    id = ?msg.id,
                    attempts = msg.attempts,
                    delay_ms = delay.as_millis() as u64,
                    topic = %self.topic,
                    "Failed to handle message, requeueing."
                );
                telemetry.requeued();
                conn.send(Command::Requeue(msg.id, delay)).await
            }
        }
    }

    fn requeue_delay_for(&self, attempts: u16) -> Duration {
        self.requeue_delay.saturating_mul(u32::from(attempts.max(1))).min(MAX_REQUEUE_DELAY)
    }
}

struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Connection {
    async fn connect(address: &str) -> Result<Self, QueueError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| QueueError::Connect { address: address.to_string(), source })?;
        stream.set_nodelay(true)?;

        let (reader, mut writer) = stream.into_split();
        writer.write_all(MAGIC_V2).await?;

        Ok(Connection {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(128),
        })
    }

    async fn send(&mut self, command: Command<'_>) -> Result<(), QueueError> {
        self.write_buf.clear();
        command.encode(&mut self.write_buf);
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    // Cancel safe: partially received frames stay buffered until the next call.
    async fn read_frame(&mut self) -> Result<Frame, QueueError> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.read_buf)? {
                return Ok(frame);
            }

            if self.reader.read_buf(&mut self.read_buf).await? == 0 {
                return Err(QueueError::ConnectionClosed);
            }
        }
    }

    async fn expect_ok(&mut self, command: &'static str) -> Result<(), QueueError> {
        loop {
            match self.read_frame().await? {
                Frame::Response(data) if &data[..] == RESPONSE_HEARTBEAT => {
                    self.send(Command::Nop).await?;
                }
                Frame::Response(data) if &data[..] == RESPONSE_OK => return Ok(()),
                Frame::Response(data) => {
                    let response = String::from_utf8_lossy(&data).into_owned();
                    return Err(QueueError::UnexpectedResponse { command, response });
                }
                Frame::Error(data) => {
                    let message = String::from_utf8_lossy(&data).into_owned();
                    return Err(QueueError::Rejected { command, message });
                }
                Frame::Message(_) => {
                    let response = String::from("message");
                    return Err(QueueError::UnexpectedResponse { command, response });
                }
            }
        }
    }

    async fn close(mut self) -> Result<(), QueueError> {
        self.send(Command::Close).await?;

        match timeout(CLOSE_TIMEOUT, self.drain()).await {
            Ok(Err(QueueError::ConnectionClosed)) => Ok(()),
            Ok(result) => result,
            Err(_) => {
                warn!("Timed out waiting for nsqd to acknowledge close.");
                Ok(())
            }
        }
    }

    async fn drain(&mut self) -> Result<(), QueueError> {
        loop {
            match self.read_frame().await? {
                Frame::Response(data) if &data[..] == RESPONSE_CLOSE_WAIT => return Ok(()),
                Frame::Response(data) if &data[..] == RESPONSE_HEARTBEAT => {
                    self.send(Command::Nop).await?;
                }
                Frame::Message(msg) => self.send(Command::Requeue(msg.id, Duration::ZERO)).await?,
                Frame::Response(_) | Frame::Error(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::NsqConsumer;

    #[test]
    fn requeue_delay_grows_with_attempts() {
        let consumer = NsqConsumer::new("127.0.0.1:4150", "metrics_protobuf", "metrics_channel")
            .with_requeue_delay(Duration::from_secs(90));

        // Cases are defined as: attempts, expected delay.
        let cases = [
            (0, Duration::from_secs(90)),
            (1, Duration::from_secs(90)),
            (3, Duration::from_secs(270)),
            (10, Duration::from_secs(900)),
            (u16::MAX, Duration::from_secs(900)),
        ];

        for (attempts, expected) in cases {
            assert_eq!(consumer.requeue_delay_for(attempts), expected, "{attempts}");
        }
    }

    #[test]
    fn max_in_flight_is_at_least_one() {
        let consumer = NsqConsumer::new("127.0.0.1:4150", "t", "c").with_max_in_flight(0);
        assert_eq!(consumer.max_in_flight, 1);
    }
}
