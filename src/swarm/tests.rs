use super::*;
use crate::handshake::{Extensions, Handshake};
use crate::info_hash::InfoHash;
use crate::peer_id::PeerId;
use crate::pool::PoolRegistry;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

const SPEC_HASH: &str = "d2474e86c95b19b8bcfdb92bc12c9d44667cfa36";
const EVENT_WAIT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn spawn_swarm(hash: InfoHash, registry: &Arc<PoolRegistry>) -> Arc<Swarm> {
    Swarm::with_config(
        hash,
        PeerId::generate(),
        SwarmConfig {
            registry: Some(Arc::clone(registry)),
            ..Default::default()
        },
    )
}

async fn expect_event<F>(events: &mut tokio::sync::broadcast::Receiver<SwarmEvent>, wait: Duration, pred: F) -> SwarmEvent
where
    F: Fn(&SwarmEvent) -> bool,
{
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(err) => panic!("event stream closed: {}", err),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    timeout(EVENT_WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A listening swarm other tests dial into.
async fn listening_swarm(hash: InfoHash, registry: &Arc<PoolRegistry>) -> (Arc<Swarm>, u16) {
    let swarm = spawn_swarm(hash, registry);
    let mut events = swarm.subscribe();
    let port = free_port();
    swarm.listen(port);
    expect_event(&mut events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Listening)).await;
    (swarm, port)
}

#[test]
fn test_construction_invariants() {
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let peer_id = PeerId::generate();
    let swarm = Swarm::new(hash, peer_id);

    assert_eq!(swarm.info_hash().to_hex(), SPEC_HASH);
    assert_eq!(swarm.info_hash().as_bytes().len(), 20);
    assert_eq!(swarm.peer_id(), peer_id);
    assert_eq!(swarm.downloaded(), 0);
    assert_eq!(swarm.uploaded(), 0);
    assert!(swarm.wires().is_empty());
    assert_eq!(swarm.port(), 0);
    assert_eq!(swarm.num_queued(), 0);
    assert_eq!(swarm.num_conns(), 0);
    assert!(!swarm.is_paused());
    assert!(!swarm.is_destroyed());
}

#[tokio::test]
async fn test_listen_emits_listening() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (swarm, port) = listening_swarm(hash, &registry).await;

    assert_eq!(swarm.port(), port);
    swarm.destroy();
}

#[tokio::test]
async fn test_port_sharing() {
    let registry = PoolRegistry::new();
    let a = spawn_swarm(InfoHash::from_bytes([1u8; 20]), &registry);
    let b = spawn_swarm(InfoHash::from_bytes([2u8; 20]), &registry);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let port = free_port();
    a.listen(port);
    b.listen(port);

    expect_event(&mut a_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Listening)).await;
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Listening)).await;

    assert_eq!(registry.len(), 1);
    let pool = registry.get(port).unwrap();
    assert_eq!(pool.swarm_count(), 2);

    a.destroy();
    assert!(registry.contains(port));
    b.destroy();
    assert!(!registry.contains(port));
}

#[tokio::test]
async fn test_port_collision() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let first = spawn_swarm(hash, &registry);
    let second = spawn_swarm(hash, &registry);
    let mut first_events = first.subscribe();
    let mut second_events = second.subscribe();

    let port = free_port();
    first.listen(port);
    second.listen(port);

    expect_event(&mut first_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Listening)).await;
    let event = expect_event(&mut second_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Error(_))).await;
    assert!(matches!(
        event,
        SwarmEvent::Error(SwarmError::PortCollision { port: p }) if p == port
    ));

    // the losing swarm's destroy must not evict the registered one
    second.destroy();
    assert!(registry.contains(port));
    assert_eq!(registry.get(port).unwrap().swarm_count(), 1);

    first.destroy();
    assert!(!registry.contains(port));
}

#[tokio::test]
async fn test_outbound_round_trip() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (a, port) = listening_swarm(hash, &registry).await;
    let b = spawn_swarm(hash, &registry);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    b.add(&format!("127.0.0.1:{}", port));

    expect_event(&mut a_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;

    assert_eq!(a.wires().len(), 1);
    assert_eq!(b.wires().len(), 1);
    assert_eq!(b.num_conns(), 1);

    // closing one side tears down the other
    b.wires()[0].destroy();
    wait_for(|| a.wires().is_empty() && b.wires().is_empty()).await;
    wait_for(|| a.num_conns() == 0).await;

    a.destroy();
    b.destroy();
}

#[tokio::test]
async fn test_connection_cap_and_slot_advance() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();

    let mut targets = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..4 {
        let (target, port) = listening_swarm(hash, &registry).await;
        addrs.push(format!("127.0.0.1:{}", port));
        targets.push(target);
    }

    let b = Swarm::with_config(
        hash,
        PeerId::generate(),
        SwarmConfig {
            max_connections: 2,
            registry: Some(Arc::clone(&registry)),
            ..Default::default()
        },
    );
    for addr in &addrs {
        b.add(addr);
    }

    wait_for(|| b.wires().len() == 2).await;
    assert_eq!(b.num_conns(), 2);
    assert_eq!(b.num_queued(), 2);

    // freeing one slot advances exactly one queued peer
    b.wires()[0].destroy();
    wait_for(|| b.wires().len() == 2 && b.num_queued() == 1).await;
    assert_eq!(b.num_conns(), 2);

    b.destroy();
    for target in targets {
        target.destroy();
    }
}

#[tokio::test]
async fn test_pause_queues_dials_but_accepts_inbound() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (t1, p1) = listening_swarm(hash, &registry).await;
    let (t2, p2) = listening_swarm(hash, &registry).await;

    let (b, b_port) = listening_swarm(hash, &registry).await;
    let mut b_events = b.subscribe();
    b.pause();
    b.add(&format!("127.0.0.1:{}", p1));
    b.add(&format!("127.0.0.1:{}", p2));
    assert_eq!(b.num_queued(), 2);
    assert_eq!(b.num_conns(), 0);

    // inbound connections are not blocked by pause
    let c = spawn_swarm(hash, &registry);
    c.add(&format!("127.0.0.1:{}", b_port));
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;
    assert_eq!(b.wires().len(), 1);
    assert_eq!(b.num_queued(), 2);

    b.resume();
    wait_for(|| b.wires().len() == 3).await;
    assert_eq!(b.num_queued(), 0);

    for swarm in [b, c, t1, t2] {
        swarm.destroy();
    }
}

#[tokio::test]
async fn test_byte_counters_rise_with_traffic() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (a, port) = listening_swarm(hash, &registry).await;
    let b = spawn_swarm(hash, &registry);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    b.add(&format!("127.0.0.1:{}", port));
    expect_event(&mut a_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;

    let wire_b = b.wires()[0].clone();
    let wire_a = a.wires()[0].clone();
    wire_b.send(Bytes::from_static(b"hello")).unwrap();

    let mut received = Vec::new();
    while received.len() < 5 {
        let chunk = timeout(EVENT_WAIT, wire_a.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("wire ended early");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"hello");

    wait_for(|| a.downloaded() == 5 && b.uploaded() == 5).await;
    expect_event(&mut a_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Download(_))).await;
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Upload(_))).await;

    // counters never move backwards on teardown
    wire_b.destroy();
    wait_for(|| a.wires().is_empty() && b.wires().is_empty()).await;
    assert_eq!(a.downloaded(), 5);
    assert_eq!(b.uploaded(), 5);

    a.destroy();
    b.destroy();
}

#[tokio::test]
async fn test_wire_cleanup_is_idempotent() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (a, port) = listening_swarm(hash, &registry).await;
    let b = spawn_swarm(hash, &registry);
    let mut b_events = b.subscribe();

    b.add(&format!("127.0.0.1:{}", port));
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;

    let wire = b.wires()[0].clone();
    wire.destroy();
    wire.destroy();
    assert!(wire.is_destroyed());
    assert!(wire.send(Bytes::from_static(b"late")).is_err());

    wait_for(|| b.wires().is_empty() && b.num_conns() == 0).await;
    wait_for(|| a.wires().is_empty() && a.num_conns() == 0).await;

    a.destroy();
    b.destroy();
}

#[tokio::test]
async fn test_destroy_finality() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (swarm, _port) = listening_swarm(hash, &registry).await;
    let mut events = swarm.subscribe();

    swarm.destroy();
    swarm.destroy();

    expect_event(&mut events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Close)).await;
    // a second close never arrives
    let extra = timeout(Duration::from_millis(300), async {
        loop {
            match events.recv().await {
                Ok(SwarmEvent::Close) => return,
                Ok(_) => {}
                Err(_) => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(extra.is_err());

    swarm.add("127.0.0.1:6881");
    assert_eq!(swarm.num_queued(), 0);
    assert_eq!(swarm.num_conns(), 0);
    assert!(swarm.is_destroyed());
}

#[tokio::test]
async fn test_unknown_info_hash_is_dropped() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_bytes([7u8; 20]);
    let (swarm, port) = listening_swarm(hash, &registry).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let other = Handshake::new(
        InfoHash::from_bytes([8u8; 20]),
        PeerId::generate(),
        Extensions::default(),
    );
    stream.write_all(&other.encode()).await.unwrap();

    // the pool closes the transport without replying
    let mut buf = [0u8; 68];
    let n = timeout(EVENT_WAIT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert_eq!(n, 0);
    assert!(swarm.wires().is_empty());

    swarm.destroy();
}

#[tokio::test]
async fn test_reconnect_requeues_lost_peer() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let (target, port) = listening_swarm(hash, &registry).await;

    let b = Swarm::with_config(
        hash,
        PeerId::generate(),
        SwarmConfig {
            reconnect: true,
            registry: Some(Arc::clone(&registry)),
            ..Default::default()
        },
    );
    let mut b_events = b.subscribe();
    b.add(&format!("127.0.0.1:{}", port));
    expect_event(&mut b_events, EVENT_WAIT, |e| matches!(e, SwarmEvent::Wire(_))).await;

    // pause so the re-queued address stays observable in the queue
    b.pause();
    target.destroy();

    wait_for(|| b.num_queued() == 1).await;
    assert_eq!(b.num_conns(), 0);

    b.destroy();
}

#[tokio::test]
async fn test_listen_failure_surfaces_after_retries() {
    let registry = PoolRegistry::new();
    let hash = InfoHash::from_hex(SPEC_HASH).unwrap();
    let swarm = spawn_swarm(hash, &registry);
    let mut events = swarm.subscribe();

    // occupy the port so every bind attempt fails
    let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    swarm.listen(port);
    let event = expect_event(&mut events, Duration::from_secs(10), |e| {
        matches!(e, SwarmEvent::Error(SwarmError::ListenFailed { .. }))
    })
    .await;
    assert!(matches!(event, SwarmEvent::Error(SwarmError::ListenFailed { .. })));

    drop(blocker);
    swarm.destroy();
}
