//! Shared doubles for unit tests: an in-memory socket that records outbound datagrams
//! and lets tests inject inbound ones, plus collecting observers.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::inbox::EngineListener;
use crate::protocol::message::Message;
use crate::protocol::transport::{DatagramHandler, DatagramSocket};

pub(crate) struct RecordingSocket {
    sent: StdMutex<Vec<(SocketAddr, Vec<u8>)>>,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    fail_sends: AtomicBool,
    cancel: Notify,
}

impl RecordingSocket {
    pub fn new() -> RecordingSocket {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        RecordingSocket {
            sent: StdMutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            fail_sends: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    /// queue a datagram for the receive loop, as if it arrived from `sender`
    pub fn inject(&self, buf: Vec<u8>, sender: SocketAddr) {
        self.inbound_tx
            .send((buf, sender))
            .expect("the receive loop is gone");
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// make every subsequent send fail with an I/O error
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatagramSocket for RecordingSocket {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected send failure",
            )));
        }
        self.sent.lock().unwrap().push((to, buf.to_vec()));
        Ok(())
    }

    async fn recv_loop(&self, handler: std::sync::Arc<dyn DatagramHandler>) -> Result<()> {
        let mut inbound = self.inbound_rx.lock().await;
        loop {
            select! {
                _ = self.cancel.notified() => return Ok(()),
                next = inbound.recv() => {
                    match next {
                        Some((buf, sender)) => handler.on_datagram(&buf, sender).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn cancel_recv_loop(&self) {
        self.cancel.notify_one();
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from_str("127.0.0.1:45000").expect("valid literal"))
    }
}

/// generic listener that stores everything it sees
pub(crate) struct CollectingListener {
    messages: StdMutex<Vec<Message>>,
    socket_errors: StdMutex<Vec<String>>,
}

impl CollectingListener {
    pub fn new() -> CollectingListener {
        CollectingListener {
            messages: StdMutex::new(Vec::new()),
            socket_errors: StdMutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn socket_errors(&self) -> Vec<String> {
        self.socket_errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineListener for CollectingListener {
    async fn on_message(&self, message: &Message) {
        self.messages.lock().unwrap().push(message.clone());
    }

    async fn on_socket_error(&self, error: &ProtocolError) {
        self.socket_errors.lock().unwrap().push(error.to_string());
    }
}
