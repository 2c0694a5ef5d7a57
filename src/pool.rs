//! Shared TCP listen ports across swarms.
//!
//! Several swarms can listen on the same port: one [`Pool`] owns the
//! TCP listener for that port and routes each inbound connection to the
//! right swarm by the info hash found in the peer's handshake. The
//! process-wide [`PoolRegistry`] maps ports to pools, creating a pool on
//! the first attach and destroying it when the last swarm detaches.
//!
//! A pool owns an accepted transport only until its handshake routes it
//! to a swarm (or the remote closes); from then on the swarm is
//! responsible for teardown.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::swarm::{Swarm, SwarmError, SwarmEvent};
use crate::wire::WireAdapter;

const MAX_LISTEN_RETRIES: u32 = 5;
const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(1);

struct PoolState {
    swarms: HashMap<String, Arc<Swarm>>,
    listening: bool,
    failed: Option<String>,
    accepted: HashMap<u64, CancellationToken>,
    next_accept_id: u64,
    retries: u32,
}

/// A shared TCP listener serving every swarm registered on one port.
pub struct Pool {
    port: u16,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
}

impl Pool {
    fn start(port: u16) -> Arc<Self> {
        let pool = Arc::new(Self {
            port,
            state: Mutex::new(PoolState {
                swarms: HashMap::new(),
                listening: false,
                failed: None,
                accepted: HashMap::new(),
                next_accept_id: 0,
                retries: 0,
            }),
            shutdown: CancellationToken::new(),
        });
        let task = Arc::clone(&pool);
        tokio::spawn(async move {
            task.run().await;
        });
        pool
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().listening
    }

    /// Number of swarms registered on this port.
    pub fn swarm_count(&self) -> usize {
        self.state.lock().swarms.len()
    }

    /// Registers a swarm under its info hash.
    ///
    /// A second swarm with the same info hash gets an asynchronous
    /// [`SwarmError::PortCollision`]; the registered swarm is untouched.
    /// If the port is already bound (or has already failed to bind), the
    /// arriving swarm is told so asynchronously.
    fn attach(&self, swarm: &Arc<Swarm>) {
        let hex = swarm.info_hash().to_hex();
        let mut state = self.state.lock();
        if let Some(existing) = state.swarms.get(&hex) {
            if !Arc::ptr_eq(existing, swarm) {
                swarm.emit_async(SwarmEvent::Error(SwarmError::PortCollision {
                    port: self.port,
                }));
            }
            return;
        }
        state.swarms.insert(hex, Arc::clone(swarm));
        if state.listening {
            swarm.emit_async(SwarmEvent::Listening);
        } else if let Some(message) = &state.failed {
            swarm.emit_async(SwarmEvent::Error(SwarmError::ListenFailed {
                message: message.clone(),
            }));
        }
    }

    /// Removes a swarm; identity-compared so a collision loser cannot
    /// evict the registered swarm. Returns true when the pool is empty.
    fn detach(&self, swarm: &Arc<Swarm>) -> bool {
        let hex = swarm.info_hash().to_hex();
        let mut state = self.state.lock();
        if let Some(existing) = state.swarms.get(&hex) {
            if Arc::ptr_eq(existing, swarm) {
                state.swarms.remove(&hex);
            }
        }
        state.swarms.is_empty()
    }

    /// Stops accepting, drops the listener, and closes every transport
    /// still owned by the pool.
    fn teardown(&self) {
        self.shutdown.cancel();
        let accepted: Vec<CancellationToken> = {
            let mut state = self.state.lock();
            state.accepted.drain().map(|(_, token)| token).collect()
        };
        for token in accepted {
            token.cancel();
        }
        debug!("listener pool on port {} torn down", self.port);
    }

    async fn run(self: Arc<Self>) {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(message) => {
                warn!("failed to bind port {}: {}", self.port, message);
                let swarms: Vec<Arc<Swarm>> = {
                    let mut state = self.state.lock();
                    state.failed = Some(message.clone());
                    state.swarms.values().cloned().collect()
                };
                for swarm in swarms {
                    swarm.emit(SwarmEvent::Error(SwarmError::ListenFailed {
                        message: message.clone(),
                    }));
                }
                return;
            }
        };

        info!("listening on port {}", self.port);
        let swarms: Vec<Arc<Swarm>> = {
            let mut state = self.state.lock();
            state.listening = true;
            state.swarms.values().cloned().collect()
        };
        for swarm in swarms {
            swarm.emit(SwarmEvent::Listening);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(err) => debug!("accept on port {} failed: {}", self.port, err),
                },
            }
        }
    }

    async fn bind(&self) -> Result<TcpListener, String> {
        loop {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).await {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == ErrorKind::AddrInUse => {
                    let attempts = {
                        let mut state = self.state.lock();
                        state.retries += 1;
                        state.retries
                    };
                    if attempts > MAX_LISTEN_RETRIES {
                        return Err(err.to_string());
                    }
                    debug!(
                        "port {} in use, retrying ({}/{})",
                        self.port, attempts, MAX_LISTEN_RETRIES
                    );
                    tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                }
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        debug!("inbound connection from {} on port {}", addr, self.port);
        let (id, token) = {
            let mut state = self.state.lock();
            let id = state.next_accept_id;
            state.next_accept_id += 1;
            let token = CancellationToken::new();
            state.accepted.insert(id, token.clone());
            (id, token)
        };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.route(stream, addr, id, token).await;
        });
    }

    /// Reads the peer's handshake under the deadline and hands the
    /// transport to the swarm registered under its info hash. No match,
    /// timeout, or teardown all end with the transport silently closed.
    async fn route(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, id: u64, token: CancellationToken) {
        let mut adapter = WireAdapter::new(stream);
        let handshake = tokio::select! {
            _ = token.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            res = adapter.receive_handshake() => res.ok(),
        };

        let target = handshake
            .as_ref()
            .and_then(|hs| self.state.lock().swarms.get(&hs.info_hash.to_hex()).cloned());
        self.state.lock().accepted.remove(&id);

        match (handshake, target) {
            (Some(hs), Some(swarm)) => swarm.handle_incoming(adapter, hs).await,
            (Some(hs), None) => {
                debug!("no swarm for {} from {} on port {}", hs.info_hash, addr, self.port);
            }
            _ => {}
        }
    }
}

/// Process-wide mapping from listen port to [`Pool`].
///
/// The default registry is a process singleton created on first use;
/// tests build isolated instances and hand them to swarms through
/// [`SwarmConfig::registry`](crate::swarm::SwarmConfig::registry).
pub struct PoolRegistry {
    pools: DashMap<u16, Arc<Pool>>,
}

static GLOBAL: OnceLock<Arc<PoolRegistry>> = OnceLock::new();

impl PoolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
        })
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(Self::new).clone()
    }

    pub(crate) fn attach(&self, swarm: &Arc<Swarm>) {
        let port = swarm.port();
        let entry = self
            .pools
            .entry(port)
            .or_insert_with(|| Pool::start(port));
        entry.value().attach(swarm);
    }

    pub(crate) fn detach(&self, swarm: &Arc<Swarm>) {
        let port = swarm.port();
        if let Some((_, pool)) = self.pools.remove_if(&port, |_, pool| pool.detach(swarm)) {
            pool.teardown();
        }
    }

    pub fn get(&self, port: u16) -> Option<Arc<Pool>> {
        self.pools.get(&port).map(|p| Arc::clone(p.value()))
    }

    pub fn contains(&self, port: u16) -> bool {
        self.pools.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
