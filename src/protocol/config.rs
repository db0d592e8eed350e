use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::protocol::inbox::InboxKey;
use crate::protocol::message::Command;

pub const DEFAULT_SIGNATURE: [u8; 3] = *b"UNP";

/// minimum MTU every IPv4 host must accept
pub const IPV4_MTU: usize = 576;
/// minimum MTU every IPv6 link must support
pub const IPV6_MTU: usize = 1280;
/// modeled IP + UDP header overhead per datagram
pub const IP_UDP_OVERHEAD: usize = 68;

/// usable datagram size for a given link MTU
pub fn effective_packet_size(mtu: usize) -> usize {
    mtu.saturating_sub(IP_UDP_OVERHEAD)
}

/// Parameters handed to the payload serializer, resolved per (type, command) with a
///  global fallback. The engine treats them as opaque; their meaning is owned by the
///  [crate::protocol::serializer::PayloadSerializer] implementation.
#[derive(Debug, Clone, Default)]
pub struct SerializerConfig {
    pub global: serde_json::Value,
    pub per_key: FxHashMap<InboxKey, serde_json::Value>,
}

impl SerializerConfig {
    pub fn params_for(&self, key: &InboxKey) -> &serde_json::Value {
        self.per_key.get(key).unwrap_or(&self.global)
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// 3-ASCII signature at the start of every datagram; packets carrying a different
    ///  one are rejected, which keeps overlapping services on a shared port apart
    pub protocol_signature: [u8; 3],
    /// if non-zero, `start_server` binds this port; clients bind an ephemeral one
    pub server_port: u16,
    /// maximum datagram size; if positive, larger payloads are fragmented. 0 disables
    ///  fragmentation entirely
    pub max_packet_size: usize,
    /// delay between retransmissions of an unacknowledged datagram
    pub ack_resend_timeout: Duration,
    /// overall deadline for an acknowledgement; reaching it fails the send
    pub ack_forget_timeout: Duration,
    /// default number of retransmissions for acked sends, overridable per send
    pub ack_retries: u32,
    /// how long a query waits for its response
    pub response_forget_timeout: Duration,
    /// age bound for partially reassembled messages - fragments older than this are
    ///  discarded, bounding memory under fragment loss
    pub reassembly_forget_timeout: Duration,
    /// if true, never send acks even when the peer requests them
    pub ignore_wanted_ack: bool,
    /// if true, accept SESSION-flagged packets. No session establishment exists, so
    ///  this only admits the header field
    pub enable_session: bool,
    /// allow-list of commands; `None` accepts any well-formed command
    pub supported_commands: Option<FxHashSet<Command>>,
    pub serializer_params: SerializerConfig,
}

impl Default for ProtocolConfig {
    fn default() -> ProtocolConfig {
        ProtocolConfig {
            protocol_signature: DEFAULT_SIGNATURE,
            server_port: 0,
            max_packet_size: 0,
            ack_resend_timeout: Duration::from_millis(200),
            ack_forget_timeout: Duration::from_millis(2000),
            ack_retries: 3,
            response_forget_timeout: Duration::from_millis(2000),
            reassembly_forget_timeout: Duration::from_millis(2000),
            ignore_wanted_ack: false,
            enable_session: false,
            supported_commands: None,
            serializer_params: SerializerConfig::default(),
        }
    }
}
