//! Deterministic string identifiers for the engine's transient state: pending acks,
//! pending reassemblies and pending responses are all keyed by the peer endpoint plus
//! message attributes. The ids only need to be unique within the lifetime window of the
//! cache that holds them, not cryptographically.
//!
//! All three share the base form `addr:port:TCCCCIIIIIIII` - type letter, command and
//! the id in fixed-width hex. `SocketAddr`'s `Display` brackets IPv6 addresses, which
//! keeps the colon separators unambiguous.

use std::fmt::Write;
use std::net::SocketAddr;

use crate::protocol::message::{Command, Message, MessageType};

fn base_id(peer: SocketAddr, msg_type: MessageType, command: Command, id: u32) -> String {
    let mut out = String::with_capacity(40);
    write!(out, "{}:{}{}{:08x}", peer, msg_type.as_char(), command, id)
        .expect("writing to a string cannot fail");
    out
}

/// key a sender tracks one in-flight fragment under, and the key an incoming ack
///  resolves; acks for a fragment carry an `:index/total` suffix
pub fn ack_id(peer: SocketAddr, msg: &Message) -> String {
    if msg.fragmented {
        fragment_ack_id(
            peer,
            msg.msg_type,
            msg.command,
            msg.id,
            msg.fragment_index,
            msg.fragments_total,
        )
    } else {
        base_id(peer, msg.msg_type, msg.command, msg.id)
    }
}

pub fn fragment_ack_id(
    peer: SocketAddr,
    msg_type: MessageType,
    command: Command,
    id: u32,
    fragment_index: u16,
    fragments_total: u16,
) -> String {
    let mut out = base_id(peer, msg_type, command, id);
    write!(out, ":{}/{}", fragment_index, fragments_total)
        .expect("writing to a string cannot fail");
    out
}

/// all fragments of one logical message share this key on the receiving side
pub fn reassembly_id(peer: SocketAddr, msg: &Message) -> String {
    let mut out = base_id(peer, msg.msg_type, msg.command, msg.id);
    write!(out, "/{}", msg.fragments_total).expect("writing to a string cannot fail");
    out
}

/// key a pending query waits under; `response_type` is the type the peer will answer
///  with (`Q` maps to `R`), so the arriving response builds the identical key from its
///  own header
pub fn response_id(
    peer: SocketAddr,
    response_type: MessageType,
    command: Command,
    id: u32,
) -> String {
    base_id(peer, response_type, command, id)
}
