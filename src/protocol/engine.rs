use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::config::ProtocolConfig;
use crate::protocol::correlation;
use crate::protocol::dispatcher::InboundDispatcher;
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::frame;
use crate::protocol::inbox::{EngineListener, Inbox, InboxKey, Listeners};
use crate::protocol::message::{Command, Message, MessageType, Payload};
use crate::protocol::reassembly::Reassembly;
use crate::protocol::reliability::{spawn_rotation, AckTracker, ResponseTracker};
use crate::protocol::serializer::{JsonSerializer, PayloadSerializer};
use crate::protocol::transport::{DatagramSocket, UdpDatagramSocket};
use crate::util::ttl_cache::{TtlCache, DEFAULT_NUM_SECTORS};

/// command verb of [Engine::send_hello]
pub const CMD_HELLO: Command = Command::new(b"helo");
/// command verb of [Engine::send_keep_alive]
pub const CMD_KEEP_ALIVE: Command = Command::new(b"kpal");

/// soft bound on messages under reassembly at any one time
const MAX_REASSEMBLY_ENTRIES: usize = 1024;

/// Per-send knobs. Everything not set here comes from the [ProtocolConfig].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// request an acknowledgement for every datagram of this message; the send then
    ///  only succeeds once all of them are confirmed
    pub want_ack: bool,
    /// retransmission count for acked sends; `None` uses the configured default
    pub retries: Option<u32>,
    /// deflate the serialized payload before sending
    pub compress: bool,
    pub session_id: Option<[u8; 8]>,
}

impl SendOptions {
    pub fn acked() -> SendOptions {
        SendOptions {
            want_ack: true,
            ..SendOptions::default()
        }
    }
}

/// One instance of the protocol core, bound to a single UDP socket.
///
/// The engine is a value that holds its collaborators - socket, serializer, hubs - it
/// does not inherit from any of them. Multiple engines on distinct sockets coexist in
/// one process without shared state.
///
/// Typical lifecycle: construct via [Engine::start_server] or [Engine::start_client],
/// register inbox handlers, then drive [Engine::recv] from a task of its own until
/// [Engine::shutdown].
pub struct Engine {
    config: Arc<ProtocolConfig>,
    socket: Arc<dyn DatagramSocket>,
    serializer: Arc<dyn PayloadSerializer>,
    pub(crate) acks: Arc<AckTracker>,
    pub(crate) responses: Arc<ResponseTracker>,
    reassemblies: Arc<Mutex<TtlCache<Reassembly>>>,
    inbox: Arc<Inbox>,
    listeners: Arc<Listeners>,
    reassembly_rotation: JoinHandle<()>,
}

impl Engine {
    /// Bind the configured server port and build an engine around it.
    pub async fn start_server(config: ProtocolConfig) -> Result<Engine> {
        if config.server_port == 0 {
            return Err(ProtocolError::Config(
                "server_port must be non-zero to start a server".into(),
            ));
        }
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.server_port);
        let socket = Arc::new(UdpDatagramSocket::bind(addr).await?);
        Ok(Engine::with_socket(config, socket, Arc::new(JsonSerializer)))
    }

    /// Bind an ephemeral port and build an engine around it.
    pub async fn start_client(config: ProtocolConfig) -> Result<Engine> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let socket = Arc::new(UdpDatagramSocket::bind(addr).await?);
        Ok(Engine::with_socket(config, socket, Arc::new(JsonSerializer)))
    }

    /// Build an engine around an existing socket and serializer. Must be called from
    ///  within a tokio runtime - the engine spawns its cache maintenance here.
    pub fn with_socket(
        config: ProtocolConfig,
        socket: Arc<dyn DatagramSocket>,
        serializer: Arc<dyn PayloadSerializer>,
    ) -> Engine {
        let config = Arc::new(config);
        let listeners = Arc::new(Listeners::new());
        let acks = Arc::new(AckTracker::new(
            config.clone(),
            socket.clone(),
            listeners.clone(),
        ));
        let responses = Arc::new(ResponseTracker::new(config.clone()));

        let reassemblies = Arc::new(Mutex::new(TtlCache::new(
            DEFAULT_NUM_SECTORS,
            MAX_REASSEMBLY_ENTRIES,
        )));
        let reassembly_rotation = spawn_rotation(
            reassemblies.clone(),
            config.reassembly_forget_timeout,
            "pending reassemblies",
        );

        Engine {
            config,
            socket,
            serializer,
            acks,
            responses,
            reassemblies,
            inbox: Arc::new(Inbox::new()),
            listeners,
            reassembly_rotation,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// the typed inbox: register handlers per (type, command) here
    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// subscribe to the generic stream of all decoded messages and socket errors
    pub async fn add_listener(&self, listener: Arc<dyn EngineListener>) {
        self.listeners.add(listener).await;
    }

    /// Drive the receive side: decode datagrams, settle acks and queries, reassemble
    ///  fragments and dispatch messages, until [Engine::shutdown] is called. Typically
    ///  spawned as a task of its own.
    pub async fn recv(&self) -> Result<()> {
        let dispatcher = Arc::new(InboundDispatcher {
            config: self.config.clone(),
            serializer: self.serializer.clone(),
            socket: self.socket.clone(),
            acks: self.acks.clone(),
            responses: self.responses.clone(),
            reassemblies: self.reassemblies.clone(),
            inbox: self.inbox.clone(),
            listeners: self.listeners.clone(),
        });
        self.socket.recv_loop(dispatcher).await
    }

    pub fn shutdown(&self) {
        debug!("shutting down engine");
        self.socket.cancel_recv_loop();
    }

    /// Fire a command at the peer. With [SendOptions::want_ack] the returned future
    ///  resolves once the peer confirmed reception, or fails with a timeout.
    pub async fn send_command(
        &self,
        to: SocketAddr,
        command: Command,
        data: Option<serde_json::Value>,
        options: SendOptions,
    ) -> Result<()> {
        let msg = self.build_message(MessageType::Command, command, rand::random(), data, &options);
        self.send_message(msg, to, &options).await
    }

    pub async fn send_event(
        &self,
        to: SocketAddr,
        command: Command,
        data: Option<serde_json::Value>,
        options: SendOptions,
    ) -> Result<()> {
        let msg = self.build_message(MessageType::Event, command, rand::random(), data, &options);
        self.send_message(msg, to, &options).await
    }

    pub async fn send_hello(&self, to: SocketAddr, options: SendOptions) -> Result<()> {
        let msg = self.build_message(MessageType::Hello, CMD_HELLO, rand::random(), None, &options);
        self.send_message(msg, to, &options).await
    }

    pub async fn send_keep_alive(&self, to: SocketAddr) -> Result<()> {
        let options = SendOptions::default();
        let msg = self.build_message(
            MessageType::KeepAlive,
            CMD_KEEP_ALIVE,
            rand::random(),
            None,
            &options,
        );
        self.send_message(msg, to, &options).await
    }

    /// Send a query and wait for the matching response, decoded. Fails with
    ///  [ProtocolError::Timeout] when none arrives within `response_forget_timeout`.
    pub async fn send_query(
        &self,
        to: SocketAddr,
        command: Command,
        data: Option<serde_json::Value>,
        options: SendOptions,
    ) -> Result<Message> {
        let msg = self.build_message(MessageType::Query, command, rand::random(), data, &options);
        let response_type = msg
            .msg_type
            .response_type()
            .expect("queries always have a response type");

        // register before sending: the response could arrive before the send call
        //  returns
        let key = correlation::response_id(to, response_type, command, msg.id);
        let waiter = self.responses.register(key.clone()).await;

        if let Err(e) = self.send_message(msg, to, &options).await {
            self.responses.discard(&key).await;
            return Err(e);
        }
        waiter.await.map_err(|_| ProtocolError::Timeout)
    }

    /// Answer a received query: the response echoes the query's id and goes back to its
    ///  sender.
    pub async fn send_response_for(
        &self,
        query: &Message,
        data: Option<serde_json::Value>,
        options: SendOptions,
    ) -> Result<()> {
        let to = query.sender.ok_or_else(|| {
            ProtocolError::InvalidMessage("cannot respond to a message without a sender".into())
        })?;
        let response_type = query.msg_type.response_type().ok_or_else(|| {
            ProtocolError::InvalidMessage(format!(
                "message type {:?} has no response counterpart",
                query.msg_type
            ))
        })?;

        let msg = self.build_message(response_type, query.command, query.id, data, &options);
        self.send_message(msg, to, &options).await
    }

    fn build_message(
        &self,
        msg_type: MessageType,
        command: Command,
        id: u32,
        data: Option<serde_json::Value>,
        options: &SendOptions,
    ) -> Message {
        let mut msg = Message::new(msg_type, command, id);
        msg.signature = self.config.protocol_signature;
        msg.want_ack = options.want_ack;
        msg.session_id = options.session_id;
        if let Some(value) = data {
            msg.compressed = options.compress;
            msg.payload = Payload::Decoded(value);
        }
        msg
    }

    async fn send_message(
        &self,
        mut msg: Message,
        to: SocketAddr,
        options: &SendOptions,
    ) -> Result<()> {
        let params = self
            .config
            .serializer_params
            .params_for(&InboxKey::new(msg.msg_type, msg.command));
        let frames = frame::encode(
            &mut msg,
            self.config.max_packet_size,
            self.serializer.as_ref(),
            params,
        )?;
        debug!(
            "sending {:?} {} (id {:08x}) to {} in {} datagram(s)",
            msg.msg_type,
            msg.command,
            msg.id,
            to,
            frames.len()
        );

        let retries = options.retries.unwrap_or(self.config.ack_retries);
        self.acks.send_frames(&msg, &frames, to, retries).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.reassembly_rotation.abort();
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;
    use std::time::Duration;

    use crate::protocol::frame::decode;
    use crate::test_util::{CollectingListener, RecordingSocket};

    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from_str("192.168.1.20:4711").unwrap()
    }

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            ack_resend_timeout: Duration::from_millis(200),
            ack_forget_timeout: Duration::from_millis(2000),
            response_forget_timeout: Duration::from_millis(500),
            ..ProtocolConfig::default()
        }
    }

    fn engine_with(config: ProtocolConfig) -> (Arc<Engine>, Arc<RecordingSocket>) {
        let socket = Arc::new(RecordingSocket::new());
        let engine = Arc::new(Engine::with_socket(
            config,
            socket.clone(),
            Arc::new(JsonSerializer),
        ));
        (engine, socket)
    }

    fn spawn_recv(engine: &Arc<Engine>) -> tokio::task::JoinHandle<Result<()>> {
        let engine = engine.clone();
        tokio::spawn(async move { engine.recv().await })
    }

    async fn wait_for_sends(socket: &RecordingSocket, count: usize) {
        for _ in 0..1000 {
            if socket.sent_count() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {} sends, saw {}", count, socket.sent_count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_command_completes_after_one_send() {
        let (engine, socket) = engine_with(test_config());
        engine
            .send_command(peer(), Command::new(b"ping"), None, SendOptions::default())
            .await
            .unwrap();

        let sent = socket.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, peer());

        let msg = decode(&sent[0].1, peer(), engine.config()).unwrap();
        assert_eq!(msg.msg_type, MessageType::Command);
        assert_eq!(msg.command, Command::new(b"ping"));
        assert!(!msg.want_ack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_command_retries_then_times_out() {
        let (engine, socket) = engine_with(test_config());

        let options = SendOptions {
            want_ack: true,
            retries: Some(1),
            ..SendOptions::default()
        };
        let result = engine
            .send_command(peer(), Command::new(b"ping"), None, options)
            .await;

        assert!(matches!(result, Err(ProtocolError::Timeout)));
        // initial send plus exactly one retransmission
        assert_eq!(socket.sent_count(), 2);
        assert_eq!(socket.sent()[0].1, socket.sent()[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_command_resolves_on_injected_ack() {
        let (engine, socket) = engine_with(test_config());
        let recv = spawn_recv(&engine);

        let send = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .send_command(peer(), Command::new(b"ping"), None, SendOptions::acked())
                    .await
            })
        };

        wait_for_sends(&socket, 1).await;
        let outbound = decode(&socket.sent()[0].1, peer(), engine.config()).unwrap();
        assert!(outbound.want_ack);

        let mut ack = Message::ack_for(&outbound);
        let frames = frame::encode(&mut ack, 0, &JsonSerializer, &serde_json::Value::Null).unwrap();
        socket.inject(frames[0].to_vec(), peer());

        assert!(send.await.unwrap().is_ok());
        // the single send sufficed - the ack cancelled all retransmissions
        assert_eq!(socket.sent_count(), 1);

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_ack_is_swallowed() {
        let (engine, socket) = engine_with(test_config());
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;
        let recv = spawn_recv(&engine);

        let mut ack = Message::new(MessageType::Command, Command::new(b"ping"), 0x77);
        ack.is_ack = true;
        let frames = frame::encode(&mut ack, 0, &JsonSerializer, &serde_json::Value::Null).unwrap();
        socket.inject(frames[0].to_vec(), peer());

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        // no event, no ack reply, no crash
        assert!(listener.messages().is_empty());
        assert_eq!(socket.sent_count(), 0);

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_command_is_acked_and_dispatched() {
        let (engine, socket) = engine_with(test_config());
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;
        let recv = spawn_recv(&engine);

        let mut inbound = Message::new(MessageType::Command, Command::new(b"ping"), 0xbeef);
        inbound.want_ack = true;
        inbound.payload = Payload::Decoded(serde_json::json!({"seq": 1}));
        let frames =
            frame::encode(&mut inbound, 0, &JsonSerializer, &serde_json::Value::Null).unwrap();
        socket.inject(frames[0].to_vec(), peer());

        wait_for_sends(&socket, 1).await;

        // the engine acked the message back to its sender
        let (ack_to, ack_frame) = socket.sent()[0].clone();
        assert_eq!(ack_to, peer());
        let ack = decode(&ack_frame, peer(), engine.config()).unwrap();
        assert!(ack.is_ack);
        assert!(!ack.has_data());
        assert_eq!(ack.msg_type, MessageType::Command);
        assert_eq!(ack.command, Command::new(b"ping"));
        assert_eq!(ack.id, 0xbeef);

        // and the listener saw the decoded message
        let messages = listener.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].payload.as_decoded(),
            Some(&serde_json::json!({"seq": 1}))
        );

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_wanted_ack_suppresses_acks() {
        let mut config = test_config();
        config.ignore_wanted_ack = true;
        let (engine, socket) = engine_with(config);
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;
        let recv = spawn_recv(&engine);

        let mut inbound = Message::new(MessageType::Command, Command::new(b"ping"), 1);
        inbound.want_ack = true;
        let frames =
            frame::encode(&mut inbound, 0, &JsonSerializer, &serde_json::Value::Null).unwrap();
        socket.inject(frames[0].to_vec(), peer());

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(socket.sent_count(), 0);
        assert_eq!(listener.messages().len(), 1);

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_times_out_without_response() {
        let (engine, socket) = engine_with(test_config());

        let result = engine
            .send_query(peer(), Command::new(b"time"), None, SendOptions::default())
            .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));

        // the pending entry is gone afterwards
        let sent = decode(&socket.sent()[0].1, peer(), engine.config()).unwrap();
        let key = correlation::response_id(peer(), MessageType::Response, sent.command, sent.id);
        assert!(!engine.responses.is_pending(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_resolves_on_matching_response() {
        let (engine, socket) = engine_with(test_config());
        let recv = spawn_recv(&engine);

        let query = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .send_query(
                        peer(),
                        Command::new(b"time"),
                        Some(serde_json::json!({"tz": "UTC"})),
                        SendOptions::default(),
                    )
                    .await
            })
        };

        wait_for_sends(&socket, 1).await;
        let outbound = decode(&socket.sent()[0].1, peer(), engine.config()).unwrap();
        assert_eq!(outbound.msg_type, MessageType::Query);

        let mut response = Message::new(MessageType::Response, outbound.command, outbound.id);
        response.payload = Payload::Decoded(serde_json::json!({"epoch": 1234567}));
        let frames =
            frame::encode(&mut response, 0, &JsonSerializer, &serde_json::Value::Null).unwrap();
        socket.inject(frames[0].to_vec(), peer());

        let received = query.await.unwrap().unwrap();
        assert_eq!(received.msg_type, MessageType::Response);
        assert_eq!(received.id, outbound.id);
        assert_eq!(
            received.payload.as_decoded(),
            Some(&serde_json::json!({"epoch": 1234567}))
        );

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_response_still_reaches_listeners() {
        let (engine, socket) = engine_with(test_config());
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;
        let recv = spawn_recv(&engine);

        let mut response = Message::new(MessageType::Response, Command::new(b"time"), 99);
        let frames =
            frame::encode(&mut response, 0, &JsonSerializer, &serde_json::Value::Null).unwrap();
        socket.inject(frames[0].to_vec(), peer());

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(listener.messages().len(), 1);

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_for_echoes_id_and_targets_query_sender() {
        let (engine, socket) = engine_with(test_config());

        let mut query = Message::new(MessageType::Query, Command::new(b"time"), 0xabcd);
        query.sender = Some(peer());
        engine
            .send_response_for(&query, Some(serde_json::json!(42)), SendOptions::default())
            .await
            .unwrap();

        let (to, frame) = socket.sent()[0].clone();
        assert_eq!(to, peer());
        let response = decode(&frame, peer(), engine.config()).unwrap();
        assert_eq!(response.msg_type, MessageType::Response);
        assert_eq!(response.id, 0xabcd);
        assert_eq!(response.command, Command::new(b"time"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_for_rejects_unanswerable_types() {
        let (engine, _socket) = engine_with(test_config());

        let mut event = Message::new(MessageType::Event, Command::new(b"stat"), 1);
        event.sender = Some(peer());
        let result = engine
            .send_response_for(&event, None, SendOptions::default())
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_inbound_message_is_reassembled() {
        let mut sender_config = test_config();
        sender_config.max_packet_size = 64;
        let payload = serde_json::json!({
            "text": "a rather long string that certainly does not fit into one \
                     sixty-four byte datagram and therefore must be fragmented"
        });

        let mut outbound = Message::new(MessageType::Command, Command::new(b"blob"), 0x1001);
        outbound.payload = Payload::Decoded(payload.clone());
        let frames = frame::encode(
            &mut outbound,
            sender_config.max_packet_size,
            &JsonSerializer,
            &serde_json::Value::Null,
        )
        .unwrap();
        assert!(frames.len() > 1);

        let (engine, socket) = engine_with(test_config());
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;
        let recv = spawn_recv(&engine);

        // deliver out of order: reassembly must sort by index, not arrival
        for frame in frames.iter().rev() {
            socket.inject(frame.to_vec(), peer());
        }

        for _ in 0..200 {
            if !listener.messages().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let messages = listener.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].reassembled);
        assert!(!messages[0].fragmented);
        assert_eq!(messages[0].payload.as_decoded(), Some(&payload));

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_inbound_fragment_is_acked_individually() {
        let mut sender_config = test_config();
        sender_config.max_packet_size = 64;

        let mut outbound = Message::new(MessageType::Command, Command::new(b"blob"), 0x2002);
        outbound.want_ack = true;
        outbound.payload = Payload::Decoded(serde_json::json!(
            "fragmented payloads are acknowledged one datagram at a time, \
             so retransmission stays addressable per fragment"
        ));
        let frames = frame::encode(
            &mut outbound,
            sender_config.max_packet_size,
            &JsonSerializer,
            &serde_json::Value::Null,
        )
        .unwrap();
        assert!(frames.len() > 1);

        let (engine, socket) = engine_with(test_config());
        let recv = spawn_recv(&engine);

        for frame in &frames {
            socket.inject(frame.to_vec(), peer());
        }
        wait_for_sends(&socket, frames.len()).await;

        let mut acked_indices = Vec::new();
        for (_, ack_frame) in socket.sent() {
            let ack = decode(&ack_frame, peer(), engine.config()).unwrap();
            assert!(ack.is_ack);
            assert!(ack.fragmented);
            assert_eq!(ack.fragments_total, frames.len() as u16);
            assert_eq!(ack.id, 0x2002);
            acked_indices.push(ack.fragment_index);
        }
        acked_indices.sort_unstable();
        let expected = (0..frames.len() as u16).collect::<Vec<_>>();
        assert_eq!(acked_indices, expected);

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_compressed_payload_round_trips_through_dispatch() {
        let (engine, socket) = engine_with(test_config());
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;
        let recv = spawn_recv(&engine);

        let payload = serde_json::json!({"log": "repetitive repetitive repetitive repetitive"});
        let options = SendOptions {
            compress: true,
            ..SendOptions::default()
        };
        engine
            .send_command(peer(), Command::new(b"logs"), Some(payload.clone()), options)
            .await
            .unwrap();

        let (_, frame) = socket.sent()[0].clone();
        let on_wire = decode(&frame, peer(), engine.config()).unwrap();
        assert!(on_wire.compressed);

        // loop the wire bytes back into the same engine and compare the decoded value
        socket.inject(frame, peer());
        for _ in 0..100 {
            if !listener.messages().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let messages = listener.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_decoded(), Some(&payload));

        engine.shutdown();
        recv.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_and_hello_wire_shape() {
        let (engine, socket) = engine_with(test_config());

        engine.send_keep_alive(peer()).await.unwrap();
        engine
            .send_hello(peer(), SendOptions::default())
            .await
            .unwrap();

        let sent = socket.sent();
        let keep_alive = decode(&sent[0].1, peer(), engine.config()).unwrap();
        assert_eq!(keep_alive.msg_type, MessageType::KeepAlive);
        assert_eq!(keep_alive.command, CMD_KEEP_ALIVE);
        assert!(!keep_alive.has_data());

        let hello = decode(&sent[1].1, peer(), engine.config()).unwrap();
        assert_eq!(hello.msg_type, MessageType::Hello);
        assert_eq!(hello.command, CMD_HELLO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_socket_send_is_soft_and_published() {
        let (engine, socket) = engine_with(test_config());
        let listener = Arc::new(CollectingListener::new());
        engine.add_listener(listener.clone()).await;

        socket.fail_sends();
        engine
            .send_command(peer(), Command::new(b"ping"), None, SendOptions::default())
            .await
            .unwrap();

        assert_eq!(socket.sent_count(), 0);
        assert_eq!(listener.socket_errors().len(), 1);
    }
}
