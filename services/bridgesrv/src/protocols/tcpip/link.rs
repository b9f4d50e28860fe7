//! Byte-stream links
//!
//! A link pushes inbound chunks and its own closure into the channel handed
//! to `open`. Each chunk is one receive event; no framing is applied. Every
//! event carries the epoch of the connection that produced it, so a consumer
//! can tell leftovers of a previous connection from current traffic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

const READ_BUFFER: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Bytes),
    Closed(String),
}

pub type StreamEventReceiver = mpsc::UnboundedReceiver<(u64, StreamEvent)>;

/// Event sender for one connection
#[derive(Debug, Clone)]
pub struct StreamEvents {
    epoch: u64,
    sender: mpsc::UnboundedSender<(u64, StreamEvent)>,
}

impl StreamEvents {
    /// New channel, senders tagged with epoch 0
    pub fn channel() -> (Self, StreamEventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { epoch: 0, sender }, receiver)
    }

    /// Sender on the same channel for another connection
    pub fn with_epoch(&self, epoch: u64) -> Self {
        Self {
            epoch,
            sender: self.sender.clone(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// `false` once the receiver is gone
    pub fn send(&self, event: StreamEvent) -> bool {
        self.sender.send((self.epoch, event)).is_ok()
    }
}

#[async_trait]
pub trait StreamLink: Send + Sync {
    async fn open(&self, events: StreamEvents) -> Result<()>;

    async fn close(&self);

    async fn send(&self, data: Bytes) -> Result<()>;
}

// ============================================================================
// TCP
// ============================================================================

struct Reader {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TcpStreamLink {
    host: String,
    port: u16,
    timeout: Duration,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<Reader>>,
}

impl TcpStreamLink {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

async fn read_loop(
    mut half: tokio::net::tcp::OwnedReadHalf,
    events: StreamEvents,
    token: CancellationToken,
    addr: String,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    loop {
        buf.clear();
        buf.reserve(READ_BUFFER);
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = half.read_buf(&mut buf) => read,
        };
        let event = match read {
            Ok(0) => StreamEvent::Closed(format!("{addr} closed by peer")),
            Ok(n) => {
                debug!(length = n, direction = "recv", "[TCP] {}", addr);
                StreamEvent::Data(buf.split().freeze())
            },
            Err(e) => StreamEvent::Closed(format!("{addr} read failed: {e}")),
        };
        let closed = matches!(event, StreamEvent::Closed(_));
        if !events.send(event) || closed {
            return;
        }
    }
}

#[async_trait]
impl StreamLink for TcpStreamLink {
    async fn open(&self, events: StreamEvents) -> Result<()> {
        let addr = self.addr();
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BridgeError::connection(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                return Err(BridgeError::timeout(format!(
                    "Connection to {addr} timed out"
                )))
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {addr}: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let token = CancellationToken::new();
        let handle = tokio::spawn(read_loop(read_half, events, token.clone(), addr.clone()));

        *self.writer.lock().await = Some(write_half);
        if let Some(previous) = self.reader.lock().replace(Reader { token, handle }) {
            previous.token.cancel();
        }
        info!("Connected to TCP endpoint: {addr}");
        Ok(())
    }

    async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.token.cancel();
            reader.handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("TCP shutdown of {}: {e}", self.addr());
            }
        }
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(BridgeError::not_connected)?;
        writer
            .write_all(&data)
            .await
            .map_err(|e| BridgeError::connection(format!("Send to {} failed: {e}", self.addr())))?;
        debug!(length = data.len(), direction = "send", "[TCP] {}", self.addr());
        Ok(())
    }
}

// ============================================================================
// Simulated
// ============================================================================

/// Echoes every sent chunk back as a receive event
#[derive(Default)]
pub struct EchoStream {
    events: Mutex<Option<StreamEvents>>,
    sent: Mutex<Vec<Bytes>>,
    echo_disabled: AtomicBool,
    unreachable: AtomicBool,
    connect_failures: AtomicU32,
}

impl EchoStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_echo(&self, echo: bool) {
        self.echo_disabled.store(!echo, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Deliver bytes as if the peer had sent them
    pub fn inject(&self, data: impl Into<Bytes>) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(StreamEvent::Data(data.into())),
            None => false,
        }
    }

    /// Close the stream from the peer side
    pub fn drop_link(&self, reason: &str) {
        if let Some(events) = self.events.lock().take() {
            events.send(StreamEvent::Closed(reason.to_string()));
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.events.lock().is_some()
    }
}

#[async_trait]
impl StreamLink for EchoStream {
    async fn open(&self, events: StreamEvents) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BridgeError::connection("stream peer unreachable"));
        }
        let pending = self.connect_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.connect_failures.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::connection("simulated connect failure"));
        }
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn close(&self) {
        self.events.lock().take();
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let events = self.events.lock().clone().ok_or_else(BridgeError::not_connected)?;
        self.sent.lock().push(data.clone());
        if !self.echo_disabled.load(Ordering::SeqCst) {
            events.send(StreamEvent::Data(data));
        }
        Ok(())
    }
}
