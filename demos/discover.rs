//! Discovery sweep: fan an acked hello out across a port range on a host and report
//! every endpoint that acknowledged, i.e. every port where a protocol peer listens.
//!
//! Run with `cargo run --example discover [host] [start_port] [end_port]`.
//! Start the ping demo first to have something to discover.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, Level};

use unproto::protocol::{Engine, ProtocolConfig, SendOptions};

/// the engine does not rate-limit fan-out, so the sweep bounds its own concurrency
const MAX_IN_FLIGHT: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .try_init()
        .ok();

    let mut args = std::env::args().skip(1);
    let host: IpAddr = args.next().unwrap_or("127.0.0.1".to_string()).parse()?;
    let start_port: u16 = args.next().unwrap_or("47500".to_string()).parse()?;
    let end_port: u16 = args.next().unwrap_or("47509".to_string()).parse()?;

    // short deadlines: a peer that does not ack promptly is not there
    let config = ProtocolConfig {
        ack_resend_timeout: Duration::from_millis(150),
        ack_forget_timeout: Duration::from_millis(500),
        ..ProtocolConfig::default()
    };
    let engine = Arc::new(Engine::start_client(config).await?);
    {
        let engine = engine.clone();
        tokio::spawn(async move { engine.recv().await });
    }

    info!("sweeping {}:{}..={}", host, start_port, end_port);

    let mut found = Vec::new();
    let mut in_flight = JoinSet::new();
    for port in start_port..=end_port {
        if in_flight.len() >= MAX_IN_FLIGHT {
            if let Some(Ok((addr, alive))) = in_flight.join_next().await {
                if alive {
                    found.push(addr);
                }
            }
        }

        let engine = engine.clone();
        let target = SocketAddr::new(host, port);
        in_flight.spawn(async move {
            let options = SendOptions {
                want_ack: true,
                retries: Some(1),
                ..SendOptions::default()
            };
            let alive = engine.send_hello(target, options).await.is_ok();
            (target, alive)
        });
    }
    while let Some(result) = in_flight.join_next().await {
        if let Ok((addr, true)) = result {
            found.push(addr);
        }
    }

    found.sort();
    if found.is_empty() {
        info!("no peers found");
    } else {
        for addr in found {
            info!("peer at {}", addr);
        }
    }

    engine.shutdown();
    Ok(())
}
