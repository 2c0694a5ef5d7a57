//! Per-torrent peer population management.
//!
//! A [`Swarm`] keeps a bounded set of live peer connections for one
//! torrent: candidate addresses queue up, a drain scheduler turns them
//! into outbound dials up to the connection ceiling, inbound connections
//! arrive routed by info hash from the shared listen [`pool`], and every
//! established wire is published through the swarm's event stream along
//! with cumulative byte accounting.
//!
//! # Examples
//!
//! ```no_run
//! use rswarm::{InfoHash, PeerId, Swarm, SwarmEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let info_hash = InfoHash::from_hex("d2474e86c95b19b8bcfdb92bc12c9d44667cfa36")?;
//! let swarm = Swarm::new(info_hash, PeerId::generate());
//! let mut events = swarm.subscribe();
//!
//! swarm.listen(6881);
//! swarm.add("127.0.0.1:51413");
//!
//! while let Ok(event) = events.recv().await {
//!     if let SwarmEvent::Wire(wire) = event {
//!         println!("connected to {}", wire.remote_addr());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`pool`]: crate::pool

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::debug;

use crate::handshake::{Extensions, Handshake};
use crate::info_hash::InfoHash;
use crate::peer::{ConnHandle, PeerRecord, RECONNECT_WAIT};
use crate::peer_id::PeerId;
use crate::pool::PoolRegistry;
use crate::wire::{ByteCounter, Wire, WireAdapter, WireError};

/// Default ceiling on peers holding a transport (dialing or connected).
pub const MAX_CONNS: usize = 100;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors surfaced through [`SwarmEvent::Error`].
#[derive(Debug, Clone, Error)]
pub enum SwarmError {
    /// Another swarm with the same info hash is already registered on this port.
    #[error("info hash already registered on port {port}")]
    PortCollision { port: u16 },

    /// The shared listener could not bind its port.
    #[error("listen failed: {message}")]
    ListenFailed { message: String },
}

/// Lifecycle and traffic notifications from a swarm.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// The shared listener for our port is bound.
    Listening,
    /// A peer completed the handshake, in either direction.
    Wire(Arc<Wire>),
    /// Payload bytes arrived on some wire.
    Download(usize),
    /// Payload bytes were sent on some wire.
    Upload(usize),
    /// A surfaced failure; see [`SwarmError`].
    Error(SwarmError),
    /// The swarm was destroyed.
    Close,
}

/// Construction knobs for a [`Swarm`].
#[derive(Clone)]
pub struct SwarmConfig {
    /// Extension bits advertised in our handshake.
    pub extensions: Extensions,
    /// Ceiling on peers holding a transport; queue entries do not count.
    pub max_connections: usize,
    /// Re-queue lost outbound peers on the [`RECONNECT_WAIT`] schedule.
    /// Off by default; no reconnection happens unless explicitly enabled.
    pub reconnect: bool,
    /// Registry of shared listen ports. Defaults to the process-wide
    /// registry; tests inject their own.
    pub registry: Option<Arc<PoolRegistry>>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            extensions: Extensions::default(),
            max_connections: MAX_CONNS,
            reconnect: false,
            registry: None,
        }
    }
}

struct SwarmState {
    peers: HashMap<String, PeerRecord>,
    queue: VecDeque<String>,
    wires: Vec<Arc<Wire>>,
    paused: bool,
    destroyed: bool,
    next_conn_id: u64,
}

impl SwarmState {
    fn live_conns(&self) -> usize {
        self.peers.values().filter(|p| p.conn.is_some()).count()
    }
}

/// One torrent's connection population.
///
/// See the [module documentation](self) for an overview.
pub struct Swarm {
    info_hash: InfoHash,
    peer_id: PeerId,
    extensions: Extensions,
    max_connections: usize,
    reconnect: bool,
    registry: Arc<PoolRegistry>,
    port: AtomicU16,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    state: Mutex<SwarmState>,
    events: broadcast::Sender<SwarmEvent>,
}

impl Swarm {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Arc<Self> {
        Self::with_config(info_hash, peer_id, SwarmConfig::default())
    }

    pub fn with_config(info_hash: InfoHash, peer_id: PeerId, config: SwarmConfig) -> Arc<Self> {
        let registry = config.registry.unwrap_or_else(PoolRegistry::global);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            info_hash,
            peer_id,
            extensions: config.extensions,
            max_connections: config.max_connections,
            reconnect: config.reconnect,
            registry,
            port: AtomicU16::new(0),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            state: Mutex::new(SwarmState {
                peers: HashMap::new(),
                queue: VecDeque::new(),
                wires: Vec::new(),
                paused: false,
                destroyed: false,
                next_conn_id: 0,
            }),
            events,
        })
    }

    /// Subscribes to the swarm's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn extensions(&self) -> Extensions {
        self.extensions
    }

    /// The listen port, or 0 before [`Swarm::listen`] is called.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    /// Total payload bytes received across all wires, ever.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Total payload bytes sent across all wires, ever.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// The wires that have completed the handshake, in adoption order.
    pub fn wires(&self) -> Vec<Arc<Wire>> {
        self.state.lock().wires.clone()
    }

    /// Number of addresses waiting in the dial queue.
    pub fn num_queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Number of peers holding a transport: in-flight dials plus
    /// established connections, regardless of handshake state.
    pub fn num_conns(&self) -> usize {
        self.state.lock().live_conns()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Queues a candidate peer address (`host:port`) for dialing.
    ///
    /// A no-op when the swarm is destroyed or the address is already known.
    pub fn add(self: &Arc<Self>, addr: &str) {
        {
            let mut state = self.state.lock();
            if state.destroyed || state.peers.contains_key(addr) {
                return;
            }
            state.peers.insert(addr.to_string(), PeerRecord::outbound(addr));
            state.queue.push_back(addr.to_string());
        }
        self.drain();
    }

    /// Forgets a peer: detaches it from the queue, cancels any pending
    /// retry timer, and tears down its connection and wire.
    pub fn remove(self: &Arc<Self>, addr: &str) {
        self.remove_peer(addr);
        self.drain();
    }

    /// Suppresses future outbound dials. Existing connections, the
    /// listener, and inbound acceptance are unaffected.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Clears the pause flag and dials queued peers up to the ceiling.
    pub fn resume(self: &Arc<Self>) {
        self.state.lock().paused = false;
        self.drain();
    }

    /// Registers this swarm on the shared listener for `port`.
    ///
    /// [`SwarmEvent::Listening`] fires once the socket is bound. If another
    /// swarm with the same info hash already occupies the port,
    /// [`SwarmError::PortCollision`] is delivered instead and the existing
    /// swarm is untouched. Only the first `listen` takes effect.
    pub fn listen(self: &Arc<Self>, port: u16) {
        if self.state.lock().destroyed {
            return;
        }
        if self
            .port
            .compare_exchange(0, port, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.registry.attach(self);
    }

    /// Tears the swarm down: every peer is removed, the listen pool entry
    /// is released, and a single [`SwarmEvent::Close`] is emitted on a
    /// later tick. Idempotent; all further mutations become no-ops.
    pub fn destroy(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            for (_, peer) in state.peers.drain() {
                if let Some(timer) = peer.retry_timer {
                    timer.cancel();
                }
                if let Some(conn) = peer.conn {
                    conn.cancel.cancel();
                }
                if let Some(wire) = peer.wire {
                    wire.destroy();
                }
            }
            state.queue.clear();
            state.wires.clear();
        }
        self.registry.detach(self);
        self.emit_async(SwarmEvent::Close);
    }

    pub(crate) fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }

    /// Emits an event from a fresh task, after the current call returns.
    pub(crate) fn emit_async(&self, event: SwarmEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(event);
        });
    }

    fn remove_peer(&self, addr: &str) {
        let mut state = self.state.lock();
        let Some(peer) = state.peers.remove(addr) else {
            return;
        };
        if peer.queued {
            state.queue.retain(|a| a != addr);
        }
        if let Some(timer) = peer.retry_timer {
            timer.cancel();
        }
        if let Some(conn) = peer.conn {
            conn.cancel.cancel();
        }
        if let Some(wire) = peer.wire {
            state.wires.retain(|w| !Arc::ptr_eq(w, &wire));
            wire.destroy();
        }
    }

    /// Admits queued addresses into dials while a connection slot, a
    /// queued peer, and an unpaused swarm allow it.
    fn drain(self: &Arc<Self>) {
        while let Some((addr, conn)) = self.next_dial() {
            let swarm = Arc::clone(self);
            tokio::spawn(async move {
                swarm.dial(addr, conn).await;
            });
        }
    }

    fn next_dial(&self) -> Option<(String, ConnHandle)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.destroyed || state.paused {
            return None;
        }
        loop {
            if state.peers.values().filter(|p| p.conn.is_some()).count() >= self.max_connections {
                return None;
            }
            let addr = state.queue.pop_front()?;
            // the record may have been removed while queued
            let Some(peer) = state.peers.get_mut(&addr) else {
                continue;
            };
            peer.queued = false;
            let conn = ConnHandle::next(&mut state.next_conn_id);
            peer.conn = Some(conn.clone());
            return Some((addr, conn));
        }
    }

    async fn dial(self: Arc<Self>, addr: String, conn: ConnHandle) {
        debug!("dialing {}", addr);
        let outcome = tokio::select! {
            _ = conn.cancel.cancelled() => Err(WireError::Closed),
            res = self.connect_and_shake(&addr) => res,
        };

        let (adapter, remote) = match outcome {
            Ok(pair) => pair,
            Err(err) => {
                debug!("outbound connection to {} failed: {}", addr, err);
                self.release_conn(&addr, conn.id, None);
                self.drain();
                return;
            }
        };

        if remote.info_hash != self.info_hash {
            debug!("peer {} sent handshake for a different info hash", addr);
            self.release_conn(&addr, conn.id, None);
            self.drain();
            return;
        }

        self.adopt(&addr, adapter, remote, conn).await;
    }

    async fn connect_and_shake(&self, addr: &str) -> Result<(WireAdapter, Handshake), WireError> {
        let stream = TcpStream::connect(addr).await?;
        let mut adapter = WireAdapter::new(stream);
        adapter
            .send_handshake(&Handshake::new(self.info_hash, self.peer_id, self.extensions))
            .await?;
        let remote = adapter.receive_handshake().await?;
        Ok((adapter, remote))
    }

    /// Takes over an inbound transport whose handshake routed here.
    ///
    /// The record is keyed by the transport's remote `host:port`,
    /// displacing any prior entry at that address. Inbound peers are
    /// never enqueued; they are already connected.
    pub(crate) async fn handle_incoming(self: &Arc<Self>, mut adapter: WireAdapter, remote: Handshake) {
        let Ok(remote_addr) = adapter.peer_addr() else {
            return;
        };
        let addr = remote_addr.to_string();

        let conn = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                return;
            }
            if let Some(prev) = state.peers.remove(&addr) {
                if prev.queued {
                    state.queue.retain(|a| a != &addr);
                }
                if let Some(timer) = prev.retry_timer {
                    timer.cancel();
                }
                if let Some(conn) = prev.conn {
                    conn.cancel.cancel();
                }
                if let Some(wire) = prev.wire {
                    state.wires.retain(|w| !Arc::ptr_eq(w, &wire));
                    wire.destroy();
                }
            }
            let conn = ConnHandle::next(&mut state.next_conn_id);
            let mut peer = PeerRecord::inbound(&addr);
            peer.conn = Some(conn.clone());
            state.peers.insert(addr.clone(), peer);
            conn
        };

        if let Err(err) = adapter
            .send_handshake(&Handshake::new(self.info_hash, self.peer_id, self.extensions))
            .await
        {
            debug!("handshake reply to {} failed: {}", addr, err);
            self.release_conn(&addr, conn.id, None);
            self.drain();
            return;
        }

        self.adopt(&addr, adapter, remote, conn).await;
    }

    /// Publishes a handshaken connection as a wire and pumps it until a
    /// terminal event, shared by the inbound and outbound paths.
    async fn adopt(self: &Arc<Self>, addr: &str, adapter: WireAdapter, remote: Handshake, conn: ConnHandle) {
        let Ok(remote_addr) = adapter.peer_addr() else {
            self.release_conn(addr, conn.id, None);
            self.drain();
            return;
        };
        let (stream, leftover) = adapter.into_parts();
        let counter: Arc<dyn ByteCounter> = Arc::clone(self) as Arc<dyn ByteCounter>;
        let (wire, driver) = Wire::attach(
            stream,
            leftover,
            remote_addr,
            &remote,
            counter,
            conn.cancel.clone(),
        );

        let registered = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.destroyed {
                false
            } else {
                match state.peers.get_mut(addr) {
                    Some(peer) if peer.conn.as_ref().map(|c| c.id) == Some(conn.id) => {
                        peer.wire = Some(Arc::clone(&wire));
                        state.wires.push(Arc::clone(&wire));
                        true
                    }
                    _ => false,
                }
            }
        };

        if !registered {
            wire.destroy();
            self.release_conn(addr, conn.id, Some(&wire));
            self.drain();
            return;
        }

        debug!("wire established with {}", remote_addr);
        self.emit(SwarmEvent::Wire(Arc::clone(&wire)));
        driver.run().await;
        self.release_conn(addr, conn.id, Some(&wire));
        self.drain();
    }

    /// Releases a peer's connection slot and wire. Safe to call from every
    /// failure path; the slot id guards against clearing a newer
    /// connection that displaced this one.
    fn release_conn(self: &Arc<Self>, addr: &str, conn_id: u64, wire: Option<&Arc<Wire>>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(w) = wire {
            state.wires.retain(|x| !Arc::ptr_eq(x, w));
            w.destroy();
        }
        let destroyed = state.destroyed;
        let Some(peer) = state.peers.get_mut(addr) else {
            return;
        };
        if peer.conn.as_ref().map(|c| c.id) != Some(conn_id) {
            return;
        }
        peer.conn = None;
        peer.wire = None;

        if self.reconnect
            && peer.reconnect
            && !destroyed
            && peer.retry_timer.is_none()
            && (peer.retries as usize) < RECONNECT_WAIT.len()
        {
            let delay = RECONNECT_WAIT[peer.retries as usize];
            peer.retries += 1;
            let timer = tokio_util::sync::CancellationToken::new();
            peer.retry_timer = Some(timer.clone());
            let swarm = Arc::clone(self);
            let peer_addr = peer.addr.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(delay) => swarm.requeue(&peer_addr),
                }
            });
        }
    }

    /// Puts a lost outbound peer back on the dial queue after its backoff.
    fn requeue(self: &Arc<Self>, addr: &str) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            let Some(peer) = state.peers.get_mut(addr) else {
                return;
            };
            peer.retry_timer = None;
            if peer.queued || peer.conn.is_some() {
                return;
            }
            peer.queued = true;
            state.queue.push_back(addr.to_string());
        }
        self.drain();
    }
}

impl ByteCounter for Swarm {
    fn on_download(&self, n: usize) {
        self.downloaded.fetch_add(n as u64, Ordering::Relaxed);
        self.emit(SwarmEvent::Download(n));
    }

    fn on_upload(&self, n: usize) {
        self.uploaded.fetch_add(n as u64, Ordering::Relaxed);
        self.emit(SwarmEvent::Upload(n));
    }
}

#[cfg(test)]
mod tests;
