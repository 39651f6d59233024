//! Peer connection: one TCP stream to one peer.
//!
//! The dialing side writes its party identity as a single byte before any
//! frame; the accepting side reads that byte to learn who dialed. After the
//! handshake, the write half is used directly by [`PeerConnection::send`] and
//! the read half is consumed by a background task that decodes frames into a
//! [`Mailbox`] keyed by sequence tag.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result, RuntimeError};
use crate::frame::{self, Tag};

/// Lifecycle of a peer connection. A connection only exists once its
/// socket is up; dialing is retried by the runtime before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket is up and the identity byte has been exchanged, but the
    /// connection is not yet registered with the party registry.
    Handshaking,
    /// Registered; part of the session.
    Established,
    /// Transport released.
    Closed,
}

// ---------------------------------------------------------------------------
// Delivery buffer
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Delivery {
    /// Payload arrived before anyone asked for it.
    Arrived(Bytes),
    /// A consumer asked before the payload arrived.
    Waiting(oneshot::Sender<Bytes>),
    /// Delivered to its consumer; the tag is spent on this connection.
    Consumed,
}

/// Result of asking the mailbox for a tag.
#[derive(Debug)]
pub enum Receipt {
    /// The payload was already buffered.
    Ready(Bytes),
    /// The payload will be sent on this channel when it arrives. The sender
    /// is dropped if the connection closes first.
    Pending(oneshot::Receiver<Bytes>),
}

/// Per-connection delivery buffer. For any tag, at most one of a buffered
/// payload or a waiting consumer exists, and each tag is delivered at most
/// once.
#[derive(Debug, Default)]
pub struct Mailbox {
    slots: HashMap<Tag, Delivery>,
    closed: bool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand an incoming payload to its waiting consumer, or buffer it.
    pub fn deliver(&mut self, tag: Tag, payload: Bytes) -> Result<(), ProtocolError> {
        match self.slots.remove(&tag) {
            None => {
                self.slots.insert(tag, Delivery::Arrived(payload));
                Ok(())
            }
            Some(Delivery::Waiting(tx)) => {
                self.slots.insert(tag, Delivery::Consumed);
                // The consumer may have given up; the tag is spent either way.
                let _ = tx.send(payload);
                Ok(())
            }
            Some(previous) => {
                self.slots.insert(tag, previous);
                Err(ProtocolError::DuplicateTag(tag))
            }
        }
    }

    /// Take the buffered payload for `tag`, or register interest in it.
    ///
    /// Payloads buffered before the connection closed stay retrievable; a
    /// request for anything else on a closed mailbox gets a receiver that
    /// is already disconnected.
    pub fn request(&mut self, tag: Tag) -> Result<Receipt> {
        match self.slots.remove(&tag) {
            None if self.closed => {
                let (_, rx) = oneshot::channel();
                Ok(Receipt::Pending(rx))
            }
            None => {
                let (tx, rx) = oneshot::channel();
                self.slots.insert(tag, Delivery::Waiting(tx));
                Ok(Receipt::Pending(rx))
            }
            Some(Delivery::Arrived(payload)) => {
                self.slots.insert(tag, Delivery::Consumed);
                Ok(Receipt::Ready(payload))
            }
            Some(previous) => {
                self.slots.insert(tag, previous);
                Err(RuntimeError::AlreadyRequested(tag))
            }
        }
    }

    /// Number of payloads buffered without a consumer.
    pub fn buffered(&self) -> usize {
        self.slots
            .values()
            .filter(|d| matches!(d, Delivery::Arrived(_)))
            .count()
    }

    /// Number of consumers still waiting.
    pub fn waiting(&self) -> usize {
        self.slots
            .values()
            .filter(|d| matches!(d, Delivery::Waiting(_)))
            .count()
    }

    /// Drop every waiting consumer's sender so their receivers observe the
    /// closure.
    fn close(&mut self) {
        self.closed = true;
        self.slots.retain(|_, d| !matches!(d, Delivery::Waiting(_)));
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// State shared between the connection handle and its read loop.
struct Shared {
    peer: u8,
    state: Mutex<ConnectionState>,
    mailbox: Mutex<Mailbox>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
}

impl Shared {
    async fn release(&self) {
        *self.state.lock() = ConnectionState::Closed;
        self.mailbox.lock().close();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// A handshaken connection to one peer.
pub struct PeerConnection {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    /// Dial `addr`, then send the local identity as the handshake preamble.
    pub async fn dial(local: u8, peer: u8, addr: &str, max_payload: u32) -> Result<Arc<Self>> {
        debug!("Party {local}: connecting to party {peer} at {addr}");
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_u8(local).await?;
        debug!("Party {local}: sent handshake to party {peer}");
        Ok(Self::start(peer, stream, max_payload))
    }

    /// Read the handshake preamble from an accepted socket. Returns the
    /// identity the peer announced together with the connection.
    pub async fn accept(mut stream: TcpStream, max_payload: u32) -> Result<(u8, Arc<Self>)> {
        stream.set_nodelay(true)?;
        let peer = stream.read_u8().await?;
        debug!("Received handshake from party {peer}");
        Ok((peer, Self::start(peer, stream, max_payload)))
    }

    fn start(peer: u8, stream: TcpStream, max_payload: u32) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let shared = Arc::new(Shared {
            peer,
            state: Mutex::new(ConnectionState::Handshaking),
            mailbox: Mutex::new(Mailbox::new()),
            writer: tokio::sync::Mutex::new(Some(writer)),
        });
        let handle = tokio::spawn(read_loop(Arc::clone(&shared), reader, max_payload));
        Arc::new(Self {
            shared,
            reader: Mutex::new(Some(handle)),
        })
    }

    /// Identity of the party at the other end.
    pub fn peer(&self) -> u8 {
        self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Mark the connection as registered. Has no effect once closed.
    pub(crate) fn mark_established(&self) {
        let mut state = self.shared.state.lock();
        if *state == ConnectionState::Handshaking {
            *state = ConnectionState::Established;
        }
    }

    /// Frame and write one payload. No acknowledgement, no retry.
    pub async fn send(&self, tag: Tag, payload: &[u8]) -> Result<()> {
        let bytes = frame::encode(tag, payload)?;
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                writer.write_all(&bytes).await?;
                Ok(())
            }
            None => Err(RuntimeError::ConnectionClosed(self.peer())),
        }
    }

    /// Take the payload buffered for `tag`, or register to receive it.
    pub fn request(&self, tag: Tag) -> Result<Receipt> {
        self.shared.mailbox.lock().request(tag)
    }

    /// Counts of `(buffered, waiting)` entries in the delivery buffer.
    pub fn pending(&self) -> (usize, usize) {
        let mailbox = self.shared.mailbox.lock();
        (mailbox.buffered(), mailbox.waiting())
    }

    /// Release the transport. Idempotent.
    pub async fn close(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.shared.release().await;
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

/// Decode incoming bytes into the mailbox until EOF, an I/O error, or a
/// protocol violation; then release the connection.
async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, max_payload: u32) {
    let peer = shared.peer;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                debug!("Party {peer} closed the connection");
                break;
            }
            Ok(_) => {
                let delivered = frame::drain(&mut buf, max_payload).and_then(|frames| {
                    let mut mailbox = shared.mailbox.lock();
                    for frame in frames {
                        debug!("Received tag {} ({} bytes) from party {peer}", frame.tag, frame.payload.len());
                        mailbox.deliver(frame.tag, frame.payload)?;
                    }
                    Ok(())
                });
                if let Err(e) = delivered {
                    warn!("Protocol error from party {peer}, closing connection: {e}");
                    break;
                }
            }
            Err(e) => {
                debug!("Read error from party {peer}: {e}");
                break;
            }
        }
    }
    shared.release().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
