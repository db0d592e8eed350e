use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::protocol::error::Result;

/// largest possible UDP payload; receive buffers are sized for it so no datagram is
///  ever truncated before the codec can reject it
const RECV_BUFFER_SIZE: usize = 65536;

/// The datagram socket as the engine consumes it. Send errors are reported but the
///  engine treats them as soft failures - UDP is best-effort, and a lost datagram
///  surfaces through the ack machinery if the caller asked for reliability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Sync + Send {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> Result<()>;

    /// Receive datagrams and feed them to `handler` until [DatagramSocket::cancel_recv_loop]
    ///  is called. At most one receive loop runs per socket.
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> Result<()>;

    fn cancel_recv_loop(&self);

    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Decouples receiving datagrams from handling them, so socket implementations carry no
///  dependency on the protocol engine. Passed around as `Arc<dyn ...>`.
#[async_trait]
pub trait DatagramHandler: Sync + Send {
    async fn on_datagram(&self, buf: &[u8], sender: SocketAddr);
}

pub struct UdpDatagramSocket {
    socket: UdpSocket,
    cancelled: AtomicBool,
    cancel: Notify,
}

impl UdpDatagramSocket {
    pub async fn bind(addr: SocketAddr) -> Result<UdpDatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        info!("listening on {}", socket.local_addr()?);
        Ok(UdpDatagramSocket {
            socket,
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        })
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> Result<()> {
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        while !self.cancelled.load(Ordering::Acquire) {
            select! {
                _ = self.cancel.notified() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, sender)) => handler.on_datagram(&buf[..len], sender).await,
                        Err(e) => error!("error receiving UDP datagram: {}", e),
                    }
                }
            }
        }
        info!("receive loop shut down");
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancelled.store(true, Ordering::Release);
        // notify_one stores a permit, so cancellation is not lost if the loop is
        //  currently inside a handler rather than parked on the Notify
        self.cancel.notify_one();
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
