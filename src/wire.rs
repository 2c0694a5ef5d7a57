//! The framed peer channel and its handshake-phase adapter.
//!
//! A freshly accepted or dialed TCP stream is wrapped in a [`WireAdapter`],
//! which owns the handshake exchange and its deadline. Once both handshakes
//! are in, the adapter is torn apart into a [`Wire`]: the duplex payload
//! channel handed to the application, plus a driver task that pumps bytes
//! in both directions and reports per-chunk deltas through a [`ByteCounter`].
//!
//! A wire terminates on end-of-stream, a transport error, an explicit
//! [`Wire::destroy`], or the application dropping its handle. However it
//! ends, the driver returns exactly once, so teardown bookkeeping upstream
//! runs exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::handshake::{Extensions, Handshake, HandshakeError, HANDSHAKE_LEN};
use crate::peer_id::PeerId;

/// Deadline for a peer's handshake after the transport is attached.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur on a wire.
#[derive(Debug, Error)]
pub enum WireError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake deadline expired.
    #[error("handshake timeout")]
    Timeout,

    /// The peer sent a malformed handshake.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// The connection was closed.
    #[error("wire closed")]
    Closed,
}

/// Sink for byte-flow deltas observed on a wire.
///
/// Implemented by the swarm to keep its cumulative download/upload
/// counters and re-publish the deltas as events.
pub trait ByteCounter: Send + Sync + 'static {
    fn on_download(&self, n: usize);
    fn on_upload(&self, n: usize);
}

pub(crate) struct WireAdapter {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl WireAdapter {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(HANDSHAKE_LEN),
        }
    }

    pub(crate) fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub(crate) async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), WireError> {
        let data = handshake.encode();
        timeout(HANDSHAKE_TIMEOUT, self.stream.write_all(&data))
            .await
            .map_err(|_| WireError::Timeout)??;
        Ok(())
    }

    pub(crate) async fn receive_handshake(&mut self) -> Result<Handshake, WireError> {
        timeout(HANDSHAKE_TIMEOUT, async {
            while self.read_buf.len() < HANDSHAKE_LEN {
                let n = self.stream.read_buf(&mut self.read_buf).await?;
                if n == 0 {
                    return Err(WireError::Closed);
                }
            }
            let data = self.read_buf.split_to(HANDSHAKE_LEN);
            Ok(Handshake::decode(&data)?)
        })
        .await
        .map_err(|_| WireError::Timeout)?
    }

    /// Splits the adapter into the raw stream plus any bytes buffered
    /// beyond the handshake. Those bytes are payload.
    pub(crate) fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.stream, self.read_buf)
    }
}

/// An established peer channel: the framed connection after handshake.
///
/// Payload bytes are exchanged as opaque chunks; the swarm does not
/// interpret them. Dropping all handles, calling [`Wire::destroy`], or the
/// remote closing the transport ends the wire.
pub struct Wire {
    remote_addr: SocketAddr,
    remote_peer_id: PeerId,
    remote_extensions: Extensions,
    outgoing: mpsc::UnboundedSender<Bytes>,
    incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    cancel: CancellationToken,
}

impl Wire {
    /// Builds a wire over a post-handshake stream, returning the handle and
    /// the driver that must be run to completion by the owning task.
    pub(crate) fn attach(
        stream: TcpStream,
        leftover: BytesMut,
        remote_addr: SocketAddr,
        remote: &Handshake,
        counter: Arc<dyn ByteCounter>,
        cancel: CancellationToken,
    ) -> (Arc<Wire>, WireDriver) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let wire = Arc::new(Wire {
            remote_addr,
            remote_peer_id: remote.peer_id,
            remote_extensions: remote.extensions,
            outgoing: outgoing_tx,
            incoming: Mutex::new(incoming_rx),
            cancel: cancel.clone(),
        });

        let driver = WireDriver {
            stream,
            leftover,
            outgoing_rx,
            incoming_tx,
            counter,
            cancel,
        };

        (wire, driver)
    }

    /// The remote end of the underlying transport.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The peer id received in the remote handshake.
    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    /// The extensions advertised in the remote handshake.
    pub fn remote_extensions(&self) -> Extensions {
        self.remote_extensions
    }

    /// Queues a payload chunk for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Closed`] once the wire has terminated.
    pub fn send(&self, data: Bytes) -> Result<(), WireError> {
        if self.cancel.is_cancelled() {
            return Err(WireError::Closed);
        }
        self.outgoing.send(data).map_err(|_| WireError::Closed)
    }

    /// Receives the next payload chunk, or `None` once the wire has ended.
    pub async fn recv(&self) -> Option<Bytes> {
        self.incoming.lock().await.recv().await
    }

    /// Terminates the wire and its transport. Idempotent.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wire")
            .field("remote_addr", &self.remote_addr)
            .field("remote_peer_id", &self.remote_peer_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Pumps bytes between the transport and the wire's channels.
///
/// Runs inside the connection task that owns the peer slot; returning is
/// the single terminal event for the connection.
pub(crate) struct WireDriver {
    stream: TcpStream,
    leftover: BytesMut,
    outgoing_rx: mpsc::UnboundedReceiver<Bytes>,
    incoming_tx: mpsc::UnboundedSender<Bytes>,
    counter: Arc<dyn ByteCounter>,
    cancel: CancellationToken,
}

impl WireDriver {
    pub(crate) async fn run(mut self) {
        if !self.leftover.is_empty() {
            let chunk = self.leftover.split().freeze();
            self.counter.on_download(chunk.len());
            let _ = self.incoming_tx.send(chunk);
        }

        let (mut reader, mut writer) = self.stream.into_split();
        let mut buf = BytesMut::with_capacity(16 * 1024);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = reader.read_buf(&mut buf) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        self.counter.on_download(n);
                        let _ = self.incoming_tx.send(buf.split().freeze());
                    }
                },
                msg = self.outgoing_rx.recv() => match msg {
                    None => break,
                    Some(data) => {
                        let len = data.len();
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                        self.counter.on_upload(len);
                    }
                },
            }
        }

        // Marks the wire destroyed for anyone still holding a handle.
        self.cancel.cancel();
    }
}
