use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Transport-level anomalies (lost datagrams, malformed frames from the network, failed
///  socket sends) are absorbed by the engine and become visible only as timeouts or
///  missing completions. Only configuration mistakes and obviously invalid API usage are
///  surfaced synchronously.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// an expected ack or response did not arrive within its deadline
    #[error("timed out waiting for the peer")]
    Timeout,

    /// a received datagram could not be parsed - it is logged and discarded, the sender
    ///  is not notified
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// a message violates the protocol's own rules (e.g. a non-alphanumeric command, or
    ///  responding to a message type that has no response counterpart)
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// payload serialization, deserialization or (de)compression failed
    #[error("payload codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout)
    }
}
