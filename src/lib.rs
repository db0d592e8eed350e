//! A reliability and framing layer on top of UDP datagrams.
//!
//! UDP gives us best-effort delivery of unordered datagrams and nothing else. This crate
//!  adds the pieces that most request/response style applications need on top of that,
//!  without going all the way to a stream protocol:
//!
//! * an unambiguous binary frame format with a protocol signature, a flag word, a small
//!   typed header and an optional serialized payload
//! * application-level acknowledgement with timed retransmission: a sender can ask the
//!   peer to confirm reception of each datagram, resending a bounded number of times
//!   before giving up with a timeout
//! * application-level fragmentation: payloads that exceed the configured packet size are
//!   split into MTU-sized fragments and reassembled on the receiving side
//! * request / response correlation: a query can wait for the matching response without
//!   the application threading ids through its own state
//! * dispatch of fully decoded messages into a typed inbox, keyed by message type and
//!   command
//!
//! It is explicitly *not* a stream protocol: there are no ordering guarantees between
//!  distinct messages, no sessions or handshakes, and no encryption. The wire format
//!  reserves flag bits and type letters for those so they can be added without breaking
//!  compatibility, but this crate leaves them unimplemented.
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed 15 byte preamble, followed by optional blocks that
//!  are present iff the corresponding flag bit is set - all numbers in network byte
//!  order (BE):
//!
//! ```ascii
//! 0..2   : protocol signature (3 ASCII bytes, "UNP" by default)
//! 3      : 0x00 separator - packets without it are rejected
//! 4..5   : flags (u16):
//!          * 0x0001 WANT_ACK    sender requests an acknowledgement
//!          * 0x0002 IS_ACK      this datagram acknowledges a previous one
//!          * 0x0004 IS_NACK     reserved, not implemented
//!          * 0x0008 HAS_DATA    a payload follows the header
//!          * 0x0010 FRAGMENTED  fragment block present, payload is one slice of a
//!                                bigger message
//!          * 0x0020 COMPRESSED  payload is raw-deflate compressed
//!          * 0x0040 ENCRYPTED   reserved, not implemented
//!          * 0x0080 SESSION     session block present
//! 6      : message type (1 ASCII byte): 'C' command, 'Q' query, 'R' response,
//!           'E' event, 'K' keep-alive, 'H' hello, 'h' discovery hello.
//!           'S', 'F', 'k' and 's' are reserved.
//! 7..10  : command (4 alphanumeric ASCII bytes) - the application-defined verb
//! 11..14 : message id (u32) - correlates related messages
//! [+8]   : session id, iff SESSION
//! [+4]   : fragment index (u16), fragments total (u16), iff FRAGMENTED
//! [rest] : payload, iff HAS_DATA
//! ```
//!
//! An acknowledgement echoes signature, type, command and id of the datagram it confirms
//!  and carries no payload. Acks for a fragment echo the fragment block as well, so each
//!  fragment of a big message is retransmitted independently.

pub mod protocol;
pub mod util;

#[cfg(test)]
pub(crate) mod test_util;
