//! Per-address peer state inside a swarm.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::wire::Wire;

/// Backoff schedule for re-queueing lost outbound peers.
///
/// The schedule is only consulted when reconnection is explicitly enabled
/// on the swarm; the fields that drive it exist on every peer record so
/// the feature can be switched on without reshaping state.
pub const RECONNECT_WAIT: [Duration; 8] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
    Duration::from_secs(600),
];

/// A connection slot claimed by an outbound dial or an accepted transport.
///
/// The slot exists from the moment a dial is admitted (or an inbound
/// handshake routed) until its connection task has fully torn down; the
/// swarm's connection ceiling counts these slots. Cancelling the token
/// aborts the dial or destroys the wire.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
}

impl ConnHandle {
    pub(crate) fn next(next_id: &mut u64) -> Self {
        let id = *next_id;
        *next_id += 1;
        Self {
            id,
            cancel: CancellationToken::new(),
        }
    }
}

pub(crate) struct PeerRecord {
    pub(crate) addr: String,
    pub(crate) conn: Option<ConnHandle>,
    pub(crate) wire: Option<Arc<Wire>>,
    pub(crate) queued: bool,
    pub(crate) retries: u32,
    pub(crate) reconnect: bool,
    pub(crate) retry_timer: Option<CancellationToken>,
}

impl PeerRecord {
    /// A dial candidate entering the queue.
    pub(crate) fn outbound(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            conn: None,
            wire: None,
            queued: true,
            retries: 0,
            reconnect: true,
            retry_timer: None,
        }
    }

    /// An already-connected peer accepted through the listen pool.
    pub(crate) fn inbound(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            conn: None,
            wire: None,
            queued: false,
            retries: 0,
            reconnect: false,
            retry_timer: None,
        }
    }
}
