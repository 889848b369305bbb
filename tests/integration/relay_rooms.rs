//! Integration tests for room relaying.
//!
//! Drives a real relay over loopback TCP: clients create and join rooms
//! through the control plane, a `TcpListener` plays the backend service, and
//! each test checks what bytes arrive where and how rooms are torn down.
//!
//! Verification command: `cargo test --test relay_rooms`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use middleman_proto::codec::{self, HEADER_LEN};
use middleman_proto::control::{ControlRequest, ControlResponse};
use middleman_relay::directory::{BackendAddress, ServiceDirectory};
use middleman_relay::dispatcher::{DispatcherConfig, start_server};
use middleman_relay::registry::{RegistryConfig, RoomRegistry};
use middleman_relay::room::{RoomConfig, RoomHandle, RoomState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// =============================================================================
// Helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    backend: TcpListener,
}

fn room_config() -> RoomConfig {
    RoomConfig {
        poll_interval: Duration::from_millis(50),
        join_grace: Duration::from_secs(2),
        ..RoomConfig::default()
    }
}

/// Starts a relay with one backend service named `trivia`.
async fn start_relay() -> Harness {
    start_relay_with(room_config()).await
}

async fn start_relay_with(room: RoomConfig) -> Harness {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let services = Arc::new(ServiceDirectory::new());
    services.register("trivia", BackendAddress::from(backend.local_addr().unwrap()));

    let config = RegistryConfig {
        room,
        ..RegistryConfig::default()
    };
    let registry = Arc::new(RoomRegistry::new(services, config));
    let (addr, _handle) = start_server("127.0.0.1:0", Arc::clone(&registry), DispatcherConfig::default())
        .await
        .expect("failed to start test relay");

    Harness {
        addr,
        registry,
        backend,
    }
}

/// Sends one control request and reads the reply, returning the connection.
async fn request(addr: SocketAddr, request: &ControlRequest) -> (TcpStream, ControlResponse) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let framed = codec::frame(&codec::encode_request(request).unwrap()).unwrap();
    stream.write_all(&framed).await.unwrap();

    let mut header = [0u8; HEADER_LEN];
    tokio::time::timeout(WAIT, stream.read_exact(&mut header))
        .await
        .expect("reply timed out")
        .unwrap();
    let mut payload = vec![0u8; codec::payload_len(header)];
    stream.read_exact(&mut payload).await.unwrap();

    (stream, codec::decode_response(&payload).unwrap())
}

/// Creates a `trivia` room; returns the creator's connection and the code.
async fn create_room(addr: SocketAddr) -> (TcpStream, String) {
    let (stream, reply) = request(
        addr,
        &ControlRequest::CreateRoom {
            service_name: "trivia".to_string(),
        },
    )
    .await;
    assert!(reply.is_success(), "create failed: {reply:?}");
    let code = reply.join_code.expect("create reply carries a join code");
    (stream, code)
}

async fn join_room(addr: SocketAddr, code: &str) -> TcpStream {
    let (stream, reply) = request(
        addr,
        &ControlRequest::JoinRoom {
            join_code: code.to_string(),
        },
    )
    .await;
    assert!(reply.is_success(), "join failed: {reply:?}");
    assert_eq!(reply.join_code, None);
    stream
}

async fn accept_backend(listener: &TcpListener) -> TcpStream {
    tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("backend never dialed")
        .unwrap()
        .0
}

/// Polls until the room has `n` attached clients.
async fn wait_for_clients(room: &RoomHandle, n: usize) {
    tokio::time::timeout(WAIT, async {
        while room.client_count() != n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room never reached {n} clients (has {})", room.client_count()));
}

async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Asserts that the peer closed `stream`.
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(
        matches!(read, Ok(0) | Err(_)),
        "expected close, read {read:?}"
    );
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

// =============================================================================
// Relaying
// =============================================================================

#[tokio::test]
async fn single_client_round_trip() {
    let h = start_relay().await;
    let (mut client, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 1).await;

    let upstream = pattern(20_000);
    client.write_all(&upstream).await.unwrap();
    assert_eq!(read_exactly(&mut backend, upstream.len()).await, upstream);

    let downstream = b"question 1: what is 6 x 7?".to_vec();
    backend.write_all(&downstream).await.unwrap();
    assert_eq!(read_exactly(&mut client, downstream.len()).await, downstream);
}

#[tokio::test]
async fn backend_data_reaches_every_client() {
    let h = start_relay().await;
    let (mut alice, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let mut bob = join_room(h.addr, &code).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 2).await;

    let data = pattern(9_000);
    backend.write_all(&data).await.unwrap();

    assert_eq!(read_exactly(&mut alice, data.len()).await, data);
    assert_eq!(read_exactly(&mut bob, data.len()).await, data);
}

#[tokio::test]
async fn clients_share_one_backend_connection() {
    let h = start_relay().await;
    let (mut alice, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let mut bob = join_room(h.addr, &code).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 2).await;

    alice.write_all(b"alice:").await.unwrap();
    assert_eq!(read_exactly(&mut backend, 6).await, b"alice:");
    bob.write_all(b"bob:").await.unwrap();
    assert_eq!(read_exactly(&mut backend, 4).await, b"bob:");

    // Only one backend connection was ever made for the room.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), h.backend.accept())
            .await
            .is_err()
    );
}

// =============================================================================
// Fault isolation
// =============================================================================

#[tokio::test]
async fn broken_client_does_not_block_delivery() {
    let h = start_relay().await;
    let (alice, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let mut bob = join_room(h.addr, &code).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 2).await;

    drop(alice);

    for round in 0..5u8 {
        let data = vec![round; 1024];
        backend.write_all(&data).await.unwrap();
        assert_eq!(read_exactly(&mut bob, data.len()).await, data);
    }

    wait_for_clients(&room, 1).await;
    assert_eq!(room.state(), RoomState::Active);
}

#[tokio::test]
async fn stalled_client_is_dropped_while_others_get_every_byte() {
    let h = start_relay_with(RoomConfig {
        client_write_timeout: Duration::from_millis(200),
        ..room_config()
    })
    .await;
    // Attached first and never reads, so every broadcast hits it before bob.
    let (stalled, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let mut bob = join_room(h.addr, &code).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 2).await;

    let data = pattern(16 * 1024 * 1024);
    let expected = data.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(30), bob.read_exact(&mut buf))
            .await
            .expect("bob stopped receiving")
            .unwrap();
        assert!(buf == expected, "bob received corrupted data");
        bob
    });

    backend.write_all(&data).await.unwrap();
    let _bob = reader.await.unwrap();

    wait_for_clients(&room, 1).await;
    assert_eq!(room.state(), RoomState::Active);
    drop(stalled);
}

#[tokio::test]
async fn leaving_client_keeps_room_active() {
    let h = start_relay().await;
    let (alice, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let mut bob = join_room(h.addr, &code).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 2).await;

    drop(alice);
    wait_for_clients(&room, 1).await;
    assert_eq!(room.state(), RoomState::Active);
    assert!(h.registry.get_room(&code).is_some());

    bob.write_all(b"still here").await.unwrap();
    assert_eq!(read_exactly(&mut backend, 10).await, b"still here");
    backend.write_all(b"welcome back").await.unwrap();
    assert_eq!(read_exactly(&mut bob, 12).await, b"welcome back");
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn backend_close_tears_down_room() {
    let h = start_relay().await;
    let (mut alice, code) = create_room(h.addr).await;
    let backend = accept_backend(&h.backend).await;
    let mut bob = join_room(h.addr, &code).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 2).await;

    drop(backend);

    assert_closed(&mut alice).await;
    assert_closed(&mut bob).await;
    tokio::time::timeout(WAIT, room.wait_closed()).await.unwrap();
    assert_eq!(room.state(), RoomState::Closed);
    assert!(h.registry.get_room(&code).is_none());

    // Cleanup paths after close are no-ops.
    room.stop();
    assert!(!h.registry.remove_room(&code));
    assert_eq!(room.state(), RoomState::Closed);
    assert_eq!(room.client_count(), 0);
}

#[tokio::test]
async fn last_client_leaving_closes_room() {
    let h = start_relay().await;
    let (client, code) = create_room(h.addr).await;
    let mut backend = accept_backend(&h.backend).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 1).await;

    drop(client);

    tokio::time::timeout(WAIT, room.wait_closed()).await.unwrap();
    assert_closed(&mut backend).await;
    assert_eq!(h.registry.room_count(), 0);
}

#[tokio::test]
async fn join_after_close_is_rejected() {
    let h = start_relay().await;
    let (client, code) = create_room(h.addr).await;
    let _backend = accept_backend(&h.backend).await;
    let room = h.registry.get_room(&code).unwrap();
    wait_for_clients(&room, 1).await;

    drop(client);
    tokio::time::timeout(WAIT, room.wait_closed()).await.unwrap();

    let (mut stream, reply) = request(
        h.addr,
        &ControlRequest::JoinRoom {
            join_code: code.clone(),
        },
    )
    .await;
    assert!(!reply.is_success());
    assert!(reply.message.unwrap().contains(&code));
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn shutdown_closes_every_room() {
    let h = start_relay().await;
    let (mut first, first_code) = create_room(h.addr).await;
    let mut first_backend = accept_backend(&h.backend).await;
    let (mut second, second_code) = create_room(h.addr).await;
    let mut second_backend = accept_backend(&h.backend).await;
    assert_ne!(first_code, second_code);

    tokio::time::timeout(WAIT, h.registry.shutdown())
        .await
        .unwrap();

    assert_eq!(h.registry.room_count(), 0);
    assert_closed(&mut first).await;
    assert_closed(&mut second).await;
    assert_closed(&mut first_backend).await;
    assert_closed(&mut second_backend).await;
}

// =============================================================================
// Join codes
// =============================================================================

#[tokio::test]
async fn concurrent_rooms_have_distinct_codes() {
    let h = start_relay().await;

    let creators: Vec<_> = (0..16)
        .map(|_| tokio::spawn(create_room(h.addr)))
        .collect();

    let mut clients = Vec::new();
    let mut codes = Vec::new();
    for creator in creators {
        let (client, code) = creator.await.unwrap();
        clients.push(client);
        codes.push(code);
    }

    let live = h.registry.join_codes();
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), 16);
    assert_eq!(live, codes);
}
