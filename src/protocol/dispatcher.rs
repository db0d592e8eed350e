use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::protocol::config::ProtocolConfig;
use crate::protocol::correlation;
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::frame;
use crate::protocol::inbox::{Inbox, InboxKey, Listeners};
use crate::protocol::message::{Message, MessageType, Payload};
use crate::protocol::reassembly::Reassembly;
use crate::protocol::reliability::{AckTracker, ResponseTracker};
use crate::protocol::serializer::{self, PayloadSerializer};
use crate::protocol::transport::{DatagramHandler, DatagramSocket};
use crate::util::ttl_cache::TtlCache;

/// Classifies every decoded inbound message and routes it: acks settle pending sends,
/// fragments feed the reassembly cache, responses settle pending queries, and every
/// full message ends up on the generic listener hub and the typed inbox.
///
/// Malformed datagrams are logged and discarded without notifying the sender - on a
/// public port, answering garbage is worse than dropping it.
pub(crate) struct InboundDispatcher {
    pub config: Arc<ProtocolConfig>,
    pub serializer: Arc<dyn PayloadSerializer>,
    pub socket: Arc<dyn DatagramSocket>,
    pub acks: Arc<AckTracker>,
    pub responses: Arc<ResponseTracker>,
    pub reassemblies: Arc<Mutex<TtlCache<Reassembly>>>,
    pub inbox: Arc<Inbox>,
    pub listeners: Arc<Listeners>,
}

#[async_trait]
impl DatagramHandler for InboundDispatcher {
    async fn on_datagram(&self, buf: &[u8], sender: SocketAddr) {
        trace!("received {} bytes from {}: {:?}", buf.len(), sender, buf);
        match frame::decode(buf, sender, &self.config) {
            Ok(msg) => self.classify(msg, sender).await,
            Err(e) => error!("discarding datagram from {}: {}", sender, e),
        }
    }
}

impl InboundDispatcher {
    async fn classify(&self, msg: Message, sender: SocketAddr) {
        if msg.is_ack {
            let key = correlation::ack_id(sender, &msg);
            if self.acks.resolve(&key).await {
                debug!("ack {} settled a pending send", key);
            } else {
                warn!("stray ack {} - no pending send matches it", key);
            }
            return;
        }
        if msg.is_nack {
            debug!("NACK from {} - selective retransmission is reserved, ignoring", sender);
            return;
        }

        if msg.want_ack && !self.config.ignore_wanted_ack {
            self.send_ack(&msg, sender).await;
        }

        if !msg.fragmented {
            self.handle_full_message(msg, sender).await;
        } else if let Some(complete) = self.accept_fragment(msg, sender).await {
            self.handle_full_message(complete, sender).await;
        }
    }

    async fn send_ack(&self, msg: &Message, sender: SocketAddr) {
        let mut ack = Message::ack_for(msg);
        let params = self
            .config
            .serializer_params
            .params_for(&InboxKey::of(&ack));
        match frame::encode(&mut ack, 0, self.serializer.as_ref(), params) {
            Ok(frames) => {
                if let Some(frame) = frames.first() {
                    if let Err(e) = self.socket.send(sender, frame).await {
                        error!("failed to send ack to {}: {}", sender, e);
                        self.listeners.emit_socket_error(&e).await;
                    }
                }
            }
            Err(e) => error!("failed to encode ack for {}: {}", sender, e),
        }
    }

    async fn accept_fragment(&self, msg: Message, sender: SocketAddr) -> Option<Message> {
        let key = correlation::reassembly_id(sender, &msg);
        let mut reassemblies = self.reassemblies.lock().await;

        if !reassemblies.contains_key(&key) {
            debug!("first fragment of {} - starting reassembly", key);
            reassemblies.insert(key.clone(), Reassembly::new(&msg));
        }
        let entry = reassemblies
            .get_mut(&key)
            .expect("the reassembly entry was just ensured");

        if let Err(e) = entry.accept(&msg) {
            warn!("dropping fragment from {}: {}", sender, e);
            return None;
        }
        if !entry.is_complete() {
            return None;
        }

        let entry = reassemblies
            .remove(&key)
            .expect("the reassembly entry was just ensured");
        debug!("reassembly {} complete", key);
        Some(entry.assemble())
    }

    async fn handle_full_message(&self, mut msg: Message, sender: SocketAddr) {
        if let Err(e) = self.decode_payload(&mut msg) {
            error!("discarding message from {}: {}", sender, e);
            return;
        }

        if msg.msg_type == MessageType::Response {
            let key = correlation::response_id(sender, msg.msg_type, msg.command, msg.id);
            if self.responses.resolve(&key, msg.clone()).await {
                debug!("response {} settled a pending query", key);
            } else {
                warn!("stray response {} - no pending query matches it", key);
            }
        }

        self.listeners.emit_message(&msg).await;
        self.inbox.dispatch(&msg).await;
    }

    /// flip the payload from its wire form to the application value before anyone
    ///  outside the engine sees the message
    fn decode_payload(&self, msg: &mut Message) -> Result<()> {
        if msg.encrypted {
            return Err(ProtocolError::Codec(
                "encrypted payloads are reserved and not supported".into(),
            ));
        }
        if let Payload::Encoded(buf) = &msg.payload {
            let raw = if msg.compressed {
                serializer::inflate(buf)?
            } else {
                buf.to_vec()
            };
            let params = self.config.serializer_params.params_for(&InboxKey::of(msg));
            let value = self.serializer.unserialize(&raw, params)?;
            msg.payload = Payload::Decoded(value);
        }
        Ok(())
    }
}
