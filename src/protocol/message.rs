use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::Bytes;

use crate::protocol::config::DEFAULT_SIGNATURE;
use crate::protocol::error::{ProtocolError, Result};

/// The closed set of message roles. The wire byte is the ASCII letter, so packet dumps
///  stay readable. 'S' (session), 'F' (frame), 'k' and 's' are reserved for future use
///  and rejected on decode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MessageType {
    /// a fire-and-forget instruction to the peer
    Command,
    /// a request that expects a [MessageType::Response] with the same command and id
    Query,
    Response,
    Event,
    KeepAlive,
    /// greeting sent by a user-triggered hello
    Hello,
    /// greeting sent by automated local-subnet discovery
    DiscoveryHello,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageType::Command => b'C',
            MessageType::Query => b'Q',
            MessageType::Response => b'R',
            MessageType::Event => b'E',
            MessageType::KeepAlive => b'K',
            MessageType::Hello => b'H',
            MessageType::DiscoveryHello => b'h',
        }
    }

    pub fn as_char(self) -> char {
        self.as_byte() as char
    }

    pub fn try_from_byte(b: u8) -> Result<MessageType> {
        match b {
            b'C' => Ok(MessageType::Command),
            b'Q' => Ok(MessageType::Query),
            b'R' => Ok(MessageType::Response),
            b'E' => Ok(MessageType::Event),
            b'K' => Ok(MessageType::KeepAlive),
            b'H' => Ok(MessageType::Hello),
            b'h' => Ok(MessageType::DiscoveryHello),
            _ => Err(ProtocolError::MalformedFrame(format!(
                "unknown message type 0x{:02x}",
                b
            ))),
        }
    }

    /// The type a peer answers with: queries are answered by responses. All other types
    ///  have no response counterpart (a lowercase 'q' / 'r' pair is reserved).
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::Query => Some(MessageType::Response),
            _ => None,
        }
    }
}

/// An application-defined verb: exactly four alphanumeric ASCII bytes, e.g. `ping` or
///  `TIME`. Four bytes keep the header fixed-size while giving packet dumps a
///  human-readable name, same idea as four-letter wire protocols everywhere.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Command(pub [u8; 4]);

impl Command {
    pub const fn new(value: &[u8; 4]) -> Command {
        Command(*value)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// wire validity - the codec rejects anything else in either direction
    pub fn check(&self) -> Result<()> {
        if self.0.iter().all(|b| b.is_ascii_alphanumeric()) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessage(format!(
                "command must be 4 alphanumeric ASCII bytes, got {:?}",
                self.0
            )))
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Command({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Command> {
        let bytes: [u8; 4] = s.as_bytes().try_into().map_err(|_| {
            ProtocolError::InvalidMessage(format!("command must be 4 bytes, got {:?}", s))
        })?;
        let command = Command(bytes);
        command.check()?;
        Ok(command)
    }
}

/// A payload is in exactly one of two usable forms at any time: the wire form (opaque,
///  possibly compressed bytes) or the application form (a decoded value). Decoding a
///  frame leaves the payload encoded so cost is only paid for messages that are actually
///  dispatched; the dispatcher flips it to decoded before handlers see it.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Encoded(Bytes),
    Decoded(serde_json::Value),
}

impl Payload {
    pub fn has_data(&self) -> bool {
        !matches!(self, Payload::None)
    }

    pub fn as_encoded(&self) -> Option<&Bytes> {
        match self {
            Payload::Encoded(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn as_decoded(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Decoded(value) => Some(value),
            _ => None,
        }
    }
}

/// A logical unit the application sends or receives.
///
/// `sender` is set on received messages and unset on outbound ones. `fragment_index` /
///  `fragments_total` default to 0 / 1 and only carry meaning while `fragmented` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub signature: [u8; 3],
    pub msg_type: MessageType,
    pub command: Command,
    pub id: u32,
    pub want_ack: bool,
    pub is_ack: bool,
    pub is_nack: bool,
    pub fragmented: bool,
    /// set on messages that were reconstructed from fragments on the receiving side
    pub reassembled: bool,
    pub compressed: bool,
    pub encrypted: bool,
    pub session_id: Option<[u8; 8]>,
    pub fragment_index: u16,
    pub fragments_total: u16,
    pub payload: Payload,
    pub sender: Option<SocketAddr>,
}

impl Message {
    pub fn new(msg_type: MessageType, command: Command, id: u32) -> Message {
        Message {
            signature: DEFAULT_SIGNATURE,
            msg_type,
            command,
            id,
            want_ack: false,
            is_ack: false,
            is_nack: false,
            fragmented: false,
            reassembled: false,
            compressed: false,
            encrypted: false,
            session_id: None,
            fragment_index: 0,
            fragments_total: 1,
            payload: Payload::None,
            sender: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.payload.has_data()
    }

    /// The acknowledgement for a received message: signature, type, command and id are
    ///  echoed, no payload. Acks for a fragment echo the fragment block as well, so the
    ///  sender can match the ack to one specific retransmission timer.
    pub fn ack_for(msg: &Message) -> Message {
        Message {
            signature: msg.signature,
            msg_type: msg.msg_type,
            command: msg.command,
            id: msg.id,
            want_ack: false,
            is_ack: true,
            is_nack: false,
            fragmented: msg.fragmented,
            reassembled: false,
            compressed: false,
            encrypted: false,
            session_id: None,
            fragment_index: msg.fragment_index,
            fragments_total: msg.fragments_total,
            payload: Payload::None,
            sender: None,
        }
    }

    /// Structural rules that hold for every legal message, in both directions:
    ///  * a message cannot both be an ack and request one
    ///  * acks and nacks never carry data
    ///  * compression / encryption are properties of a payload, so they require one
    ///  * a fragment's index lies below its total
    pub fn check_invariants(&self) -> Result<()> {
        if self.want_ack && (self.is_ack || self.is_nack) {
            return Err(ProtocolError::InvalidMessage(
                "a message cannot request an ack and be one".into(),
            ));
        }
        if (self.is_ack || self.is_nack) && self.has_data() {
            return Err(ProtocolError::InvalidMessage(
                "acks and nacks cannot carry a payload".into(),
            ));
        }
        if (self.compressed || self.encrypted) && !self.has_data() {
            return Err(ProtocolError::InvalidMessage(
                "compressed / encrypted set without a payload".into(),
            ));
        }
        if self.fragment_index >= self.fragments_total {
            return Err(ProtocolError::InvalidMessage(format!(
                "fragment index {} out of range 0..{}",
                self.fragment_index, self.fragments_total
            )));
        }
        Ok(())
    }
}
