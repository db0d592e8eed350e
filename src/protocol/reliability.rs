use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::protocol::config::ProtocolConfig;
use crate::protocol::correlation;
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::inbox::Listeners;
use crate::protocol::message::Message;
use crate::protocol::transport::DatagramSocket;
use crate::util::ttl_cache::{TtlCache, DEFAULT_NUM_SECTORS};

/// soft bound on simultaneously tracked entries per cache
pub(crate) const MAX_PENDING_ENTRIES: usize = 4096;

/// Periodically age a pending cache so that no entry older than `forget_timeout` stays
///  visible. The returned task runs until aborted; its owner does that on drop.
pub(crate) fn spawn_rotation<V: Send + 'static>(
    cache: Arc<Mutex<TtlCache<V>>>,
    forget_timeout: std::time::Duration,
    what: &'static str,
) -> JoinHandle<()> {
    let period = forget_timeout / DEFAULT_NUM_SECTORS as u32;
    tokio::spawn(async move {
        loop {
            time::sleep(period).await;
            let evicted = cache.lock().await.rotate();
            if !evicted.is_empty() {
                debug!("aging out {} {}", evicted.len(), what);
            }
            // dropping the evicted entries cancels their timers and fails their waiters
        }
    })
}

/// One in-flight datagram that asked for an acknowledgement.
///
/// The entry lives in the pending-ack cache under its ack id; the resend and timeout
/// tasks hold the key plus the shared `done` flag rather than a reference back to the
/// entry, so there is no cycle. Whoever takes the entry out of the cache settles it;
/// dropping an unsettled entry (age eviction, engine shutdown) cancels the timers and
/// closes the completion slot, which the waiting sender observes as a timeout.
pub(crate) struct PendingAck {
    completion: Option<oneshot::Sender<Result<()>>>,
    retries_left: u32,
    done: Arc<AtomicBool>,
    resend_task: Option<JoinHandle<()>>,
    timeout_task: Option<JoinHandle<()>>,
}

impl PendingAck {
    pub fn resolve(mut self) {
        self.settle(Ok(()));
    }

    pub fn reject(mut self, error: ProtocolError) {
        self.settle(Err(error));
    }

    fn settle(&mut self, result: Result<()>) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
        self.cancel_timers();
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.resend_task.take() {
            task.abort();
        }
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        self.cancel_timers();
    }
}

/// Sends datagrams and, where the message asks for it, tracks the expected
/// acknowledgements with bounded retransmission.
pub(crate) struct AckTracker {
    config: Arc<ProtocolConfig>,
    socket: Arc<dyn DatagramSocket>,
    listeners: Arc<Listeners>,
    pending: Arc<Mutex<TtlCache<PendingAck>>>,
    rotation_task: JoinHandle<()>,
}

impl AckTracker {
    pub fn new(
        config: Arc<ProtocolConfig>,
        socket: Arc<dyn DatagramSocket>,
        listeners: Arc<Listeners>,
    ) -> AckTracker {
        let pending = Arc::new(Mutex::new(TtlCache::new(
            DEFAULT_NUM_SECTORS,
            MAX_PENDING_ENTRIES,
        )));
        let rotation_task =
            spawn_rotation(pending.clone(), config.ack_forget_timeout, "pending acks");

        AckTracker {
            config,
            socket,
            listeners,
            pending,
            rotation_task,
        }
    }

    /// Send the encoded datagrams of one message. Without `want_ack` this completes
    ///  once all buffers are handed to the socket. With it, every fragment is tracked
    ///  individually: all fragments go out before any completion is awaited, the
    ///  per-fragment acks may resolve in any order, and the overall send succeeds iff
    ///  every one of them does.
    pub async fn send_frames(
        &self,
        msg: &Message,
        frames: &[Bytes],
        to: SocketAddr,
        retries: u32,
    ) -> Result<()> {
        let mut waiters = Vec::new();
        for (index, frame) in frames.iter().enumerate() {
            self.send_soft(to, frame).await;
            if msg.want_ack {
                let key = if msg.fragmented {
                    correlation::fragment_ack_id(
                        to,
                        msg.msg_type,
                        msg.command,
                        msg.id,
                        index as u16,
                        msg.fragments_total,
                    )
                } else {
                    correlation::ack_id(to, msg)
                };
                waiters.push(self.track(key, to, frame.clone(), retries).await);
            }
        }

        for waiter in waiters {
            match waiter.await {
                Ok(result) => result?,
                // the entry was aged out of the cache before it was settled
                Err(_) => return Err(ProtocolError::Timeout),
            }
        }
        Ok(())
    }

    /// UDP sends are best-effort: a synchronous socket error is logged and published,
    ///  but the send goes on - if reliability was requested, the missing datagram
    ///  surfaces through the ack timeout instead.
    async fn send_soft(&self, to: SocketAddr, frame: &Bytes) {
        if let Err(e) = self.socket.send(to, frame).await {
            error!("socket send to {} failed: {}", to, e);
            self.listeners.emit_socket_error(&e).await;
        }
    }

    async fn track(
        &self,
        key: String,
        to: SocketAddr,
        frame: Bytes,
        retries: u32,
    ) -> oneshot::Receiver<Result<()>> {
        let (completion, waiter) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));

        let resend_task = if retries > 0 {
            let socket = self.socket.clone();
            let pending = self.pending.clone();
            let resend_timeout = self.config.ack_resend_timeout;
            let done = done.clone();
            let key = key.clone();
            Some(tokio::spawn(async move {
                loop {
                    time::sleep(resend_timeout).await;
                    if done.load(Ordering::SeqCst) {
                        break;
                    }
                    {
                        let mut pending = pending.lock().await;
                        match pending.get_mut(&key) {
                            None => break,
                            Some(entry) if entry.retries_left == 0 => break,
                            Some(entry) => entry.retries_left -= 1,
                        }
                    }
                    debug!("no ack for {} yet - resending", key);
                    if let Err(e) = socket.send(to, &frame).await {
                        error!("resend to {} failed: {}", to, e);
                    }
                }
            }))
        } else {
            None
        };

        let timeout_task = {
            let pending = self.pending.clone();
            let forget_timeout = self.config.ack_forget_timeout;
            let done = done.clone();
            let key = key.clone();
            tokio::spawn(async move {
                time::sleep(forget_timeout).await;
                if done.load(Ordering::SeqCst) {
                    return;
                }
                let entry = pending.lock().await.remove(&key);
                if let Some(entry) = entry {
                    warn!("ack for {} never arrived - giving up", key);
                    entry.reject(ProtocolError::Timeout);
                }
            })
        };

        let entry = PendingAck {
            completion: Some(completion),
            retries_left: retries,
            done,
            resend_task,
            timeout_task: Some(timeout_task),
        };
        self.pending.lock().await.insert(key, entry);
        waiter
    }

    /// called by the dispatcher when an ack arrives; true iff a pending send matched
    pub async fn resolve(&self, key: &str) -> bool {
        let entry = self.pending.lock().await.remove(key);
        match entry {
            Some(entry) => {
                entry.resolve();
                true
            }
            None => false,
        }
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        self.rotation_task.abort();
    }
}

/// A query waiting for its response.
///
/// Rejection is expressed by dropping the entry: the closed completion slot surfaces as
/// a timeout on the waiting side.
pub(crate) struct PendingResponse {
    completion: Option<oneshot::Sender<Message>>,
    done: Arc<AtomicBool>,
    timeout_task: Option<JoinHandle<()>>,
}

impl PendingResponse {
    pub fn resolve(mut self, message: Message) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(message);
        }
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

pub(crate) struct ResponseTracker {
    config: Arc<ProtocolConfig>,
    pending: Arc<Mutex<TtlCache<PendingResponse>>>,
    rotation_task: JoinHandle<()>,
}

impl ResponseTracker {
    pub fn new(config: Arc<ProtocolConfig>) -> ResponseTracker {
        let pending = Arc::new(Mutex::new(TtlCache::new(
            DEFAULT_NUM_SECTORS,
            MAX_PENDING_ENTRIES,
        )));
        let rotation_task = spawn_rotation(
            pending.clone(),
            config.response_forget_timeout,
            "pending responses",
        );

        ResponseTracker {
            config,
            pending,
            rotation_task,
        }
    }

    /// Register a waiter for the response identified by `key` and arm its deadline.
    ///  The returned slot yields the response message, or closes when the deadline
    ///  passes or the entry is aged out.
    pub async fn register(&self, key: String) -> oneshot::Receiver<Message> {
        let (completion, waiter) = oneshot::channel();
        let done = Arc::new(AtomicBool::new(false));

        let timeout_task = {
            let pending = self.pending.clone();
            let forget_timeout = self.config.response_forget_timeout;
            let done = done.clone();
            let key = key.clone();
            tokio::spawn(async move {
                time::sleep(forget_timeout).await;
                if done.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(entry) = pending.lock().await.remove(&key) {
                    warn!("query {} timed out without a response", key);
                    drop(entry);
                }
            })
        };

        let entry = PendingResponse {
            completion: Some(completion),
            done,
            timeout_task: Some(timeout_task),
        };
        self.pending.lock().await.insert(key, entry);
        waiter
    }

    /// called by the dispatcher for every inbound response; true iff a query waited
    pub async fn resolve(&self, key: &str, message: Message) -> bool {
        let entry = self.pending.lock().await.remove(key);
        match entry {
            Some(entry) => {
                entry.resolve(message);
                true
            }
            None => false,
        }
    }

    /// drop a registration whose send never went out
    pub async fn discard(&self, key: &str) {
        let _ = self.pending.lock().await.remove(key);
    }

    #[cfg(test)]
    pub async fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().await.contains_key(key)
    }
}

impl Drop for ResponseTracker {
    fn drop(&mut self) {
        self.rotation_task.abort();
    }
}
