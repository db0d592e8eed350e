//! Server and client in one process: the client fires an acked `ping` command at the
//! server, then asks it for the time via query / response.
//!
//! Run with `cargo run --example ping`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, Level};

use unproto::protocol::config::{effective_packet_size, IPV4_MTU};
use unproto::protocol::{
    Command, Engine, InboxHandler, InboxKey, Message, MessageType, ProtocolConfig, SendOptions,
};

const SERVER_PORT: u16 = 47500;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();
}

struct PingHandler;

#[async_trait::async_trait]
impl InboxHandler for PingHandler {
    async fn on_message(&self, message: &Message) {
        info!(
            "server: ping {:08x} from {:?}: {:?}",
            message.id, message.sender, message.payload
        );
    }
}

struct TimeResponder {
    engine: Arc<Engine>,
}

#[async_trait::async_trait]
impl InboxHandler for TimeResponder {
    async fn on_message(&self, message: &Message) {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Err(e) = self
            .engine
            .send_response_for(message, Some(serde_json::json!({ "epoch": epoch })), SendOptions::default())
            .await
        {
            info!("server: failed to answer time query: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let server_config = ProtocolConfig {
        server_port: SERVER_PORT,
        max_packet_size: effective_packet_size(IPV4_MTU),
        ..ProtocolConfig::default()
    };
    let server = Arc::new(Engine::start_server(server_config).await?);
    server
        .inbox()
        .register(
            InboxKey::new(MessageType::Command, Command::new(b"ping")),
            Arc::new(PingHandler),
        )
        .await?;
    server
        .inbox()
        .register(
            InboxKey::new(MessageType::Query, Command::new(b"time")),
            Arc::new(TimeResponder {
                engine: server.clone(),
            }),
        )
        .await?;
    {
        let server = server.clone();
        tokio::spawn(async move { server.recv().await });
    }

    let client = Arc::new(Engine::start_client(ProtocolConfig::default()).await?);
    {
        let client = client.clone();
        tokio::spawn(async move { client.recv().await });
    }

    let server_addr = format!("127.0.0.1:{}", SERVER_PORT).parse()?;

    client
        .send_command(
            server_addr,
            Command::new(b"ping"),
            Some(serde_json::json!({"greeting": "hello over UDP"})),
            SendOptions::acked(),
        )
        .await?;
    info!("client: ping delivered and acknowledged");

    let response = client
        .send_query(
            server_addr,
            Command::new(b"time"),
            None,
            SendOptions::default(),
        )
        .await?;
    info!("client: server time is {:?}", response.payload);

    client.shutdown();
    server.shutdown();
    Ok(())
}
