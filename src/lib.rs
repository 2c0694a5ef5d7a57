//! rswarm - BitTorrent swarm management
//!
//! This library implements the connection-management core of a BitTorrent
//! client: each [`Swarm`] maintains a bounded population of live peer
//! connections for one torrent, performs the peer-wire handshake on every
//! connection, and accounts for the bytes flowing over every established
//! wire. A single listening TCP port is shared across swarms, with inbound
//! connections routed by the info hash found in each peer's handshake.
//!
//! # Modules
//!
//! - [`swarm`] - Per-torrent peer population: dial queue, connection
//!   ceiling, wire adoption, lifecycle events
//! - [`pool`] - Shared listen ports and handshake-based routing
//! - [`wire`] - The framed peer channel and byte accounting
//! - [`handshake`] - BEP-3 handshake frame and extension bits
//! - [`info_hash`] - 20-byte torrent identifiers
//! - [`peer_id`] - 20-byte client identifiers
//! - [`peer`] - Per-address peer records and the reconnect schedule

pub mod handshake;
pub mod info_hash;
pub mod peer;
pub mod peer_id;
pub mod pool;
pub mod swarm;
pub mod wire;

pub use handshake::{Extensions, Handshake, HandshakeError, HANDSHAKE_LEN, PROTOCOL};
pub use info_hash::{InfoHash, InfoHashError};
pub use peer::RECONNECT_WAIT;
pub use peer_id::PeerId;
pub use pool::{Pool, PoolRegistry};
pub use swarm::{Swarm, SwarmConfig, SwarmError, SwarmEvent, MAX_CONNS};
pub use wire::{ByteCounter, Wire, WireError, HANDSHAKE_TIMEOUT};
