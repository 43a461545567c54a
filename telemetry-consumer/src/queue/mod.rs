//! At-least-once queue consumption over the NSQ TCP protocol.
//!
//! Every delivered message is handed to a [`Handler`].  The message is finished once the handler
//! succeeds and requeued otherwise, so a batch is either fully processed or redelivered as a
//! whole.
use std::{future::Future, io, pin::Pin};

use thiserror::Error;

use crate::handler::HandlerError;

mod connection;
pub use self::connection::NsqConsumer;

pub mod frame;

/// Convenience type for the future returned by a [`Handler`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Processes the body of queue messages.
pub trait Handler: Send + Sync {
    /// Processes a single message body.
    ///
    /// Returning an error requeues the message for redelivery.
    fn handle<'a>(&'a self, body: &'a [u8]) -> HandlerFuture<'a>;
}

/// Errors that could occur while consuming from nsqd.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to nsqd.
    #[error("failed to connect to nsqd at {address}: {source}")]
    Connect {
        /// Address of nsqd.
        address: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// nsqd sent a frame that could not be parsed.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// Why the frame was rejected.
        reason: &'static str,
    },

    /// nsqd rejected a command.
    #[error("nsqd rejected {command}: {message}")]
    Rejected {
        /// Command that was rejected.
        command: &'static str,
        /// Error message sent by nsqd.
        message: String,
    },

    /// nsqd answered a command with something other than the expected response.
    #[error("unexpected response to {command}: {response}")]
    UnexpectedResponse {
        /// Command that was sent.
        command: &'static str,
        /// Response that was received.
        response: String,
    },

    /// nsqd closed the connection.
    #[error("connection closed by nsqd")]
    ConnectionClosed,
}
