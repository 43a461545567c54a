//! NSQ wire protocol framing.
//!
//! After the client sends the protocol magic, nsqd talks in frames:
//!
//! ```text
//! [size: u32 BE][frame type: u32 BE][data: size - 4 bytes]
//! ```
//!
//! Message frames carry `[timestamp: i64 BE][attempts: u16 BE][id: 16 bytes][body]` as their data.
//! Clients talk in newline-terminated commands.
use std::{fmt, time::Duration};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use super::QueueError;

/// Protocol magic identifying the V2 protocol, sent once after connecting.
pub const MAGIC_V2: &[u8] = b"  V2";

/// Response sent by nsqd when a command succeeded.
pub const RESPONSE_OK: &[u8] = b"OK";

/// Response sent by nsqd to check that the client is alive.
pub const RESPONSE_HEARTBEAT: &[u8] = b"_heartbeat_";

/// Response sent by nsqd once a client asked to close the connection.
pub const RESPONSE_CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

const SIZE_LEN: usize = 4;
const FRAME_TYPE_LEN: usize = 4;
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

/// Maximum frame size accepted from nsqd.
///
/// Matches the default maximum message size of nsqd plus headroom for the message header.
pub const MAX_FRAME_LEN: usize = 1024 * 1024 + 1024;

/// Length of a message ID.
pub const MESSAGE_ID_LEN: usize = 16;

/// Message ID, as assigned by nsqd.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Creates a new `MessageId` from its raw bytes.
    pub const fn new(raw: [u8; MESSAGE_ID_LEN]) -> Self {
        MessageId(raw)
    }

    /// Gets the raw bytes of this message ID.
    pub const fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// A message delivered by nsqd.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Time the message was published, in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Number of times the message was delivered, including this delivery.
    pub attempts: u16,
    /// Message ID.
    pub id: MessageId,
    /// Message body.
    pub body: Bytes,
}

impl Message {
    fn decode(mut data: Bytes) -> Result<Self, QueueError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(QueueError::MalformedFrame { reason: "message shorter than its header" });
        }

        let timestamp = data.get_i64();
        let attempts = data.get_u16();
        let mut id = [0; MESSAGE_ID_LEN];
        data.copy_to_slice(&mut id);

        Ok(Message { timestamp, attempts, id: MessageId(id), body: data })
    }
}

/// A frame sent by nsqd.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Response to a command, or a heartbeat.
    Response(Bytes),
    /// Error, either in response to a command or asynchronous.
    Error(Bytes),
    /// Message delivery.
    Message(Message),
}

impl Frame {
    /// Attempts to parse a single frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not hold a complete frame yet, in which case `buf` is left
    /// untouched.  Otherwise, the frame is split off the front of `buf`.
    ///
    /// # Errors
    ///
    /// If the frame is too short, too large, or of an unknown type, an error variant will be
    /// returned.  The connection cannot be resynchronized after that.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, QueueError> {
        if buf.len() < SIZE_LEN {
            return Ok(None);
        }

        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if size < FRAME_TYPE_LEN {
            return Err(QueueError::MalformedFrame { reason: "frame shorter than its type" });
        }
        if size > MAX_FRAME_LEN {
            return Err(QueueError::MalformedFrame { reason: "frame exceeds maximum length" });
        }
        if buf.len() < SIZE_LEN + size {
            buf.reserve(SIZE_LEN + size - buf.len());
            return Ok(None);
        }

        buf.advance(SIZE_LEN);
        let mut frame = buf.split_to(size).freeze();
        let frame_type = frame.get_u32();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(frame))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(frame))),
            FRAME_TYPE_MESSAGE => Message::decode(frame).map(|msg| Some(Frame::Message(msg))),
            _ => Err(QueueError::MalformedFrame { reason: "unknown frame type" }),
        }
    }

    /// Encodes this frame as nsqd would send it.
    pub fn encode(&self, buf: &mut BytesMut) {
        let (frame_type, data_len) = match self {
            Frame::Response(data) => (FRAME_TYPE_RESPONSE, data.len()),
            Frame::Error(data) => (FRAME_TYPE_ERROR, data.len()),
            Frame::Message(msg) => (FRAME_TYPE_MESSAGE, MESSAGE_HEADER_LEN + msg.body.len()),
        };

        buf.reserve(SIZE_LEN + FRAME_TYPE_LEN + data_len);
        buf.put_u32((FRAME_TYPE_LEN + data_len) as u32);
        buf.put_u32(frame_type);
        match self {
            Frame::Response(data) | Frame::Error(data) => buf.put_slice(data),
            Frame::Message(msg) => {
                buf.put_i64(msg.timestamp);
                buf.put_u16(msg.attempts);
                buf.put_slice(msg.id.as_bytes());
                buf.put_slice(&msg.body);
            }
        }
    }
}

/// A command sent to nsqd.
#[derive(Clone, Debug, PartialEq)]
pub enum Command<'a> {
    /// Subscribes to a topic/channel pair.
    Subscribe {
        /// Topic name.
        topic: &'a str,
        /// Channel name.
        channel: &'a str,
    },
    /// Updates the number of messages the client is ready to receive.
    Ready(u64),
    /// Marks a message as successfully processed.
    Finish(MessageId),
    /// Asks nsqd to redeliver a message after the given delay.
    Requeue(MessageId, Duration),
    /// Answers a heartbeat.
    Nop,
    /// Asks nsqd to stop sending messages and close the connection.
    Close,
}

impl Command<'_> {
    /// Encodes this command into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Command::Subscribe { topic, channel } => {
                buf.put_slice(b"SUB ");
                buf.put_slice(topic.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(channel.as_bytes());
            }
            Command::Ready(count) => {
                buf.put_slice(b"RDY ");
                buf.put_slice(count.to_string().as_bytes());
            }
            Command::Finish(id) => {
                buf.put_slice(b"FIN ");
                buf.put_slice(id.as_bytes());
            }
            Command::Requeue(id, delay) => {
                buf.put_slice(b"REQ ");
                buf.put_slice(id.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(delay.as_millis().to_string().as_bytes());
            }
            Command::Nop => buf.put_slice(b"NOP"),
            Command::Close => buf.put_slice(b"CLS"),
        }
        buf.put_u8(b'\n');
    }
}

/// Checks whether a topic or channel name is acceptable to nsqd.
///
/// Names are 1 to 64 characters out of `[.a-zA-Z0-9_-]`, optionally followed by `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !name.is_empty()
        && name.len() <= 64
        && !base.is_empty()
        && base.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{BufMut as _, Bytes, BytesMut};

    use super::{is_valid_name, Command, Frame, Message, MessageId};
    use crate::queue::QueueError;

    const ID: MessageId = MessageId::new(*b"0123456789abcdef");

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    #[test]
    fn encode_commands() {
        // Cases are defined as: command, expected encoding.
        let cases = [
            (
                Command::Subscribe { topic: "metrics_protobuf", channel: "metrics_channel" },
                "SUB metrics_protobuf metrics_channel\n",
            ),
            (Command::Ready(1), "RDY 1\n"),
            (Command::Finish(ID), "FIN 0123456789abcdef\n"),
            (Command::Requeue(ID, Duration::from_secs(90)), "REQ 0123456789abcdef 90000\n"),
            (Command::Nop, "NOP\n"),
            (Command::Close, "CLS\n"),
        ];

        for (command, expected) in cases {
            let mut buf = BytesMut::new();
            command.encode(&mut buf);
            assert_eq!(&buf[..], expected.as_bytes());
        }
    }

    #[test]
    fn parse_response_and_error_frames() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 6, 0, 0, 0, 0, b'O', b'K']);
        buf.put_slice(&[0, 0, 0, 9, 0, 0, 0, 1]);
        buf.put_slice(b"E_INVALID");

        assert_eq!(
            Frame::parse(&mut buf).unwrap(),
            Some(Frame::Response(Bytes::from_static(b"OK")))
        );
        assert_eq!(
            Frame::parse(&mut buf).unwrap(),
            Some(Frame::Error(Bytes::from_static(b"E_INVALID")))
        );
        assert_eq!(Frame::parse(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_message_frame() {
        let msg = Message {
            timestamp: 1_700_000_000_000_000_000,
            attempts: 3,
            id: ID,
            body: Bytes::from_static(b"payload"),
        };
        let mut buf = encoded(&Frame::Message(msg.clone()));
        assert_eq!(buf.len(), 4 + 4 + 8 + 2 + 16 + 7);

        assert_eq!(Frame::parse(&mut buf).unwrap(), Some(Frame::Message(msg)));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let full = encoded(&Frame::Response(Bytes::from_static(b"_heartbeat_")));

        for split in 0..full.len() {
            let mut buf = BytesMut::from(&full[..split]);
            assert_eq!(Frame::parse(&mut buf).unwrap(), None);
            assert_eq!(buf.len(), split);

            buf.extend_from_slice(&full[split..]);
            assert_eq!(
                Frame::parse(&mut buf).unwrap(),
                Some(Frame::Response(Bytes::from_static(b"_heartbeat_")))
            );
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        let cases: [&[u8]; 4] = [
            // Size smaller than the frame type.
            &[0, 0, 0, 2, 0, 0],
            // Size larger than the maximum frame length.
            &[0, 0x10, 0x10, 0, 0, 0, 0, 0],
            // Unknown frame type.
            &[0, 0, 0, 4, 0, 0, 0, 9],
            // Message shorter than its header.
            &[0, 0, 0, 6, 0, 0, 0, 2, 0, 0],
        ];

        for case in cases {
            let mut buf = BytesMut::from(case);
            assert!(matches!(Frame::parse(&mut buf), Err(QueueError::MalformedFrame { .. })));
        }
    }

    #[test]
    fn name_validation() {
        let too_long = "a".repeat(65);
        let cases = [
            ("metrics_protobuf", true),
            ("log-consumer.v2", true),
            ("archive#ephemeral", true),
            ("", false),
            ("#ephemeral", false),
            ("has space", false),
            ("slash/name", false),
            (too_long.as_str(), false),
        ];

        for (name, expected) in cases {
            assert_eq!(is_valid_name(name), expected, "{name}");
        }
    }
}
