//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on an ephemeral port and drives it with raw
//! `tokio-tungstenite` clients speaking the binary frame protocol.

use std::sync::Arc;

use collab_session::awareness::{AwarenessUpdate, AwarenessUpdateEntry};
use collab_session::protocol::{Frame, SyncMessage};
use collab_session::server::SyncServer;
use collab_session::storage::MemoryStore;
use collab_session::ServerConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and the server.
async fn start_test_server() -> (u16, Arc<SyncServer>) {
    start_server_with(ServerConfig::for_testing()).await
}

async fn start_server_with(config: ServerConfig) -> (u16, Arc<SyncServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(config, Arc::new(MemoryStore::new())));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (port, server)
}

async fn recv_frame(ws: &mut Ws) -> Option<Frame> {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return Some(Frame::decode(&data).unwrap()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

/// True if no binary frame arrives within `ms`.
async fn stays_silent(ws: &mut Ws, ms: u64) -> bool {
    loop {
        match timeout(Duration::from_millis(ms), ws.next()).await {
            Ok(Some(Ok(Message::Binary(_)))) => return false,
            Ok(Some(Ok(_))) => continue,
            _ => return true,
        }
    }
}

async fn send_frame(ws: &mut Ws, frame: &Frame) {
    ws.send(Message::Binary(frame.encode().into())).await.unwrap();
}

/// Connect to a room and consume the handshake summary request.
async fn join(port: u16, room: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/{room}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    match recv_frame(&mut ws).await {
        Some(Frame::Sync(SyncMessage::SyncStep1(_))) => {}
        other => panic!("expected a state summary request, got {other:?}"),
    }
    ws
}

fn insert_text(doc: &Doc, content: &str) -> Vec<u8> {
    let mut txn = doc.transact_mut();
    let text = txn.get_or_insert_text("content");
    text.push(&mut txn, content);
    txn.encode_update_v1()
}

fn apply(doc: &Doc, update: &[u8]) {
    doc.transact_mut()
        .apply_update(Update::decode_v1(update).unwrap())
        .unwrap();
}

fn read_text(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

fn presence(client_id: u64, clock: u64, state: Option<&str>) -> Frame {
    Frame::Awareness(AwarenessUpdate {
        entries: vec![AwarenessUpdateEntry {
            client_id,
            clock,
            state: state.map(str::to_string),
        }],
    })
}

async fn expect_update(ws: &mut Ws) -> Vec<u8> {
    match recv_frame(ws).await {
        Some(Frame::Sync(SyncMessage::Update(update))) => update,
        other => panic!("expected an update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, server) = start_test_server().await;
    let _ws = join(port, "lobby").await;
    assert_eq!(server.stats().active_connections, 1);
    assert!(server.registry().get("lobby").is_some());
}

#[tokio::test]
async fn test_empty_path_maps_to_default_room() {
    let (port, server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}/");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert!(recv_frame(&mut ws).await.is_some());
    assert!(server.registry().get("default").is_some());
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc").await;
    let mut bob = join(port, "doc").await;
    let alice_doc = Doc::new();
    let bob_doc = Doc::new();

    // Concurrent edits, delivered in either order
    let from_alice = insert_text(&alice_doc, "hello ");
    let from_bob = insert_text(&bob_doc, "world");
    send_frame(&mut alice, &Frame::Sync(SyncMessage::Update(from_alice))).await;
    send_frame(&mut bob, &Frame::Sync(SyncMessage::Update(from_bob))).await;

    apply(&bob_doc, &expect_update(&mut bob).await);
    apply(&alice_doc, &expect_update(&mut alice).await);

    assert_eq!(read_text(&alice_doc), read_text(&bob_doc));
    assert_eq!(read_text(&alice_doc).len(), "hello world".len());
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "doc").await;
    let alice_doc = Doc::new();
    send_frame(&mut alice, &Frame::Sync(SyncMessage::Update(insert_text(&alice_doc, "draft")))).await;

    // Let the server apply before the late joiner asks
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut carol = join(port, "doc").await;
    let carol_doc = Doc::new();
    let summary = carol_doc.transact().state_vector().encode_v1();
    send_frame(&mut carol, &Frame::Sync(SyncMessage::SyncStep1(summary))).await;

    match recv_frame(&mut carol).await {
        Some(Frame::Sync(SyncMessage::SyncStep2(diff))) => apply(&carol_doc, &diff),
        other => panic!("expected a state summary response, got {other:?}"),
    }
    assert_eq!(read_text(&carol_doc), "draft");

    // The response went to the requester only
    assert!(stays_silent(&mut alice, 200).await);
}

#[tokio::test]
async fn test_sender_never_receives_own_update() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "echo").await;
    let mut bob = join(port, "echo").await;

    let doc = Doc::new();
    send_frame(&mut alice, &Frame::Sync(SyncMessage::Update(insert_text(&doc, "x")))).await;

    expect_update(&mut bob).await;
    assert!(stays_silent(&mut alice, 200).await);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "room-a").await;
    let mut bob = join(port, "room-b").await;

    let doc = Doc::new();
    send_frame(&mut alice, &Frame::Sync(SyncMessage::Update(insert_text(&doc, "a only")))).await;
    assert!(stays_silent(&mut bob, 200).await);
}

#[tokio::test]
async fn test_awareness_broadcast_and_staleness() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "presence").await;
    let mut bob = join(port, "presence").await;

    send_frame(&mut alice, &presence(1, 1, Some(r#"{"cursor":[10,20]}"#))).await;
    match recv_frame(&mut bob).await {
        Some(Frame::Awareness(update)) => {
            assert_eq!(update.entries.len(), 1);
            assert_eq!(update.entries[0].client_id, 1);
        }
        other => panic!("expected awareness, got {other:?}"),
    }

    // Same clock again: ignored, nothing relayed
    send_frame(&mut alice, &presence(1, 1, Some(r#"{"cursor":[0,0]}"#))).await;
    assert!(stays_silent(&mut bob, 200).await);
    assert!(stays_silent(&mut alice, 50).await);
}

#[tokio::test]
async fn test_new_member_receives_presence_snapshot() {
    let (port, _server) = start_test_server().await;
    let mut alice = join(port, "snap").await;
    send_frame(&mut alice, &presence(5, 3, Some(r#"{"name":"alice"}"#))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let url = format!("ws://127.0.0.1:{port}/snap");
    let (mut bob, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    assert!(matches!(
        recv_frame(&mut bob).await,
        Some(Frame::Sync(SyncMessage::SyncStep1(_)))
    ));
    match recv_frame(&mut bob).await {
        Some(Frame::Awareness(snapshot)) => assert_eq!(snapshot.entries[0].clock, 3),
        other => panic!("expected presence snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_retires_presence_once() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "leave").await;
    let mut bob = join(port, "leave").await;

    send_frame(&mut alice, &presence(9, 4, Some("{}"))).await;
    assert!(matches!(recv_frame(&mut bob).await, Some(Frame::Awareness(_))));

    alice.close(None).await.unwrap();
    drop(alice);

    match recv_frame(&mut bob).await {
        Some(Frame::Awareness(removed)) => {
            assert_eq!(removed.entries.len(), 1);
            assert_eq!(removed.entries[0].client_id, 9);
            assert_eq!(removed.entries[0].clock, 5);
            assert_eq!(removed.entries[0].state, None);
        }
        other => panic!("expected removal, got {other:?}"),
    }
    assert!(stays_silent(&mut bob, 200).await);

    let session = server.registry().get("leave").unwrap();
    assert_eq!(session.awareness_len(), 0);
    assert_eq!(session.member_count(), 1);
}

#[tokio::test]
async fn test_cleanup_finishes_before_socket_closes() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "ordered").await;
    let mut bob = join(port, "ordered").await;
    send_frame(&mut alice, &presence(5, 1, Some("{}"))).await;
    assert!(matches!(recv_frame(&mut bob).await, Some(Frame::Awareness(_))));

    alice.close(None).await.unwrap();
    // Read until the server releases the socket
    loop {
        match timeout(Duration::from_secs(2), alice.next()).await {
            Ok(Some(Ok(_))) => continue,
            Ok(_) => break,
            Err(_) => panic!("server never released the socket"),
        }
    }

    let session = server.registry().get("ordered").unwrap();
    assert_eq!(session.awareness_len(), 0);
    assert_eq!(session.member_count(), 1);
}

#[tokio::test]
async fn test_idle_presence_is_swept() {
    let config = ServerConfig {
        awareness_timeout_secs: 1,
        ..ServerConfig::for_testing()
    };
    let (port, server) = start_server_with(config).await;
    let mut alice = join(port, "sweep").await;
    send_frame(&mut alice, &presence(11, 1, Some(r#"{"cursor":[0,0]}"#))).await;

    let mut bob = join(port, "sweep").await;
    match recv_frame(&mut bob).await {
        Some(Frame::Awareness(snapshot)) => assert_eq!(snapshot.entries[0].client_id, 11),
        other => panic!("expected presence snapshot, got {other:?}"),
    }

    // Nobody refreshes; the sweep retires the entry and tells the room
    for ws in [&mut bob, &mut alice] {
        match recv_frame(ws).await {
            Some(Frame::Awareness(removed)) => {
                assert_eq!(removed.entries.len(), 1);
                assert_eq!(removed.entries[0].client_id, 11);
                assert_eq!(removed.entries[0].clock, 2);
                assert_eq!(removed.entries[0].state, None);
            }
            other => panic!("expected presence removal, got {other:?}"),
        }
    }
    let session = server.registry().get("sweep").unwrap();
    assert_eq!(session.awareness_len(), 0);
}

#[tokio::test]
async fn test_sync_payload_with_impossible_counts_is_dropped() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "hostile").await;
    let mut bob = join(port, "hostile").await;

    // Summary request declaring u32::MAX state vector entries
    alice
        .send(Message::Binary(vec![0, 0, 5, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F].into()))
        .await
        .unwrap();
    let hostile = Frame::Sync(SyncMessage::Update(vec![0, 1, 1, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]));
    send_frame(&mut alice, &hostile).await;

    // The server is still up and the room still works
    let writer = Doc::new();
    send_frame(&mut alice, &Frame::Sync(SyncMessage::Update(insert_text(&writer, "alive")))).await;
    let replica = Doc::new();
    apply(&replica, &expect_update(&mut bob).await);
    assert_eq!(read_text(&replica), "alive");
    assert_eq!(server.stats().frames_rejected, 2);
}

#[tokio::test]
async fn test_property_updates_are_validated() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "props").await;
    let mut bob = join(port, "props").await;

    let invalid = Frame::PropertyUpdate(json!({"properties": {"width": 10}}));
    send_frame(&mut alice, &invalid).await;
    assert!(stays_silent(&mut bob, 200).await);

    let valid = Frame::PropertyUpdate(json!({
        "objectId": "shape-1",
        "type": "resize",
        "properties": {"width": 120, "height": 80}
    }));
    send_frame(&mut alice, &valid).await;
    let update = expect_update(&mut bob).await;

    let replica = Doc::new();
    apply(&replica, &update);
    let txn = replica.transact();
    assert!(txn.get_map("object:shape-1").is_some());

    let stats = server.stats();
    assert_eq!(stats.frames_rejected, 1);
}

#[tokio::test]
async fn test_unknown_frame_type_is_not_fatal() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "robust").await;
    let mut bob = join(port, "robust").await;

    alice.send(Message::Binary(vec![42, 1, 2, 3].into())).await.unwrap();
    alice.send(Message::Binary(vec![0, 2, 200].into())).await.unwrap();

    let doc = Doc::new();
    send_frame(&mut alice, &Frame::Sync(SyncMessage::Update(insert_text(&doc, "still here")))).await;
    expect_update(&mut bob).await;
    assert_eq!(server.stats().frames_rejected, 2);
}

#[tokio::test]
async fn test_ephemeral_relay() {
    let (port, server) = start_test_server().await;
    let mut alice = join(port, "drag").await;
    let mut bob = join(port, "drag").await;

    send_frame(&mut alice, &Frame::Ephemeral(vec![7, 7, 7])).await;
    assert_eq!(recv_frame(&mut bob).await, Some(Frame::Ephemeral(vec![7, 7, 7])));
    assert!(stays_silent(&mut alice, 100).await);

    let session = server.registry().get("drag").unwrap();
    assert!(!session.persistence().is_dirty());
}

#[tokio::test]
async fn test_ping_pong() {
    let (port, _server) = start_test_server().await;
    let mut ws = join(port, "ping").await;
    ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Pong(data))) => return Some(data.to_vec()),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(reply, Some(vec![1, 2, 3]));
}
