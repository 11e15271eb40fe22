//! Adverse peers
//!
//! Drives a listening session from raw sockets that split frames, send
//! garbage, skip the handshake or speak malformed JSON.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{recorded_session, test_config, wait_until};
use dualnet::core::frame;
use dualnet::protocol::message::Message;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const SETTLE: Duration = Duration::from_secs(3);

async fn read_messages(stream: &mut TcpStream) -> Vec<Message> {
    let mut buf = vec![0u8; 4096];
    let n = timeout(SETTLE, stream.read(&mut buf))
        .await
        .expect("server replied in time")
        .unwrap();
    frame::decode_batch(&buf[..n]).unwrap()
}

fn check(id: &str) -> Vec<u8> {
    frame::encode("_check_if_id_is_available", &json!({"id": id}), None)
        .unwrap()
        .to_vec()
}

fn counting_handler(session: &dualnet::Session, action: &'static str) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    session
        .dispatcher()
        .register(action, move |_ctx, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    hits
}

#[tokio::test]
async fn test_frames_written_byte_by_byte() {
    let (server, events) = recorded_session(test_config(Duration::from_secs(1)));
    let hello = counting_handler(&server, "hello");
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.set_nodelay(true).unwrap();

    let mut bytes = check("slow-snail-1");
    bytes.extend_from_slice(&frame::encode("hello", &[1, 2, 3], Some("slow-snail-1")).unwrap());
    for byte in bytes {
        raw.write_all(&[byte]).await.unwrap();
        raw.flush().await.unwrap();
    }

    assert!(wait_until(SETTLE, || hello.load(Ordering::SeqCst) == 1).await);
    assert_eq!(events.connected(), vec!["slow-snail-1".to_string()]);

    server.close();
}

#[tokio::test]
async fn test_noise_between_frames_is_skipped() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    let ping = counting_handler(&server, "ping");
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&check("noisy-crow-2")).await.unwrap();
    let reply = read_messages(&mut raw).await;
    assert_eq!(reply[0].action, "_confirm_id");

    let mut bytes = b"static\0---\0hiss".to_vec();
    bytes.extend_from_slice(&frame::encode("ping", &1, None).unwrap());
    raw.write_all(&bytes).await.unwrap();

    assert!(wait_until(SETTLE, || ping.load(Ordering::SeqCst) == 1).await);
    assert!(server.is_connected("noisy-crow-2"));

    server.close();
}

#[tokio::test]
async fn test_application_actions_before_handshake_are_dropped() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    let hello = counting_handler(&server, "hello");
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&frame::encode("hello", &"sneaky", None).unwrap())
        .await
        .unwrap();
    raw.write_all(&check("late-owl-3")).await.unwrap();
    let reply = read_messages(&mut raw).await;
    assert!(reply.iter().any(|m| m.action == "_confirm_id"));

    raw.write_all(&frame::encode("hello", &"legit", None).unwrap())
        .await
        .unwrap();
    assert!(wait_until(SETTLE, || hello.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hello.load(Ordering::SeqCst), 1);

    server.close();
}

#[tokio::test]
async fn test_taken_id_gets_a_proposition() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(&check("same-id-4")).await.unwrap();
    assert_eq!(read_messages(&mut first).await[0].action, "_confirm_id");

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(&check("same-id-4")).await.unwrap();
    let reply = read_messages(&mut second).await;
    assert_eq!(reply[0].action, "_send_id_proposition");

    second.write_all(&check("other-id-5")).await.unwrap();
    let reply = read_messages(&mut second).await;
    assert_eq!(reply[0].action, "_confirm_id");
    assert_eq!(reply[0].payload["id"], json!("other-id-5"));
    assert_eq!(
        reply[0].payload["udp_port"],
        json!(server.local_addrs().unreliable.unwrap().port())
    );

    server.close();
}

#[tokio::test]
async fn test_malformed_frame_terminates_connection() {
    let (server, events) = recorded_session(test_config(Duration::from_secs(1)));
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&check("broken-elk-6")).await.unwrap();
    read_messages(&mut raw).await;

    raw.write_all(b"\0+++\0{this is not json\0---\0").await.unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(SETTLE, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "server should close the connection");

    assert!(wait_until(SETTLE, || events.disconnected() == vec!["broken-elk-6".to_string()]).await);
    assert!(!server.is_connected("broken-elk-6"));
    assert_eq!(server.metrics().snapshot().protocol_errors, 1);

    server.close();
}

#[tokio::test]
async fn test_duplicates_in_one_read_are_suppressed() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    let state = counting_handler(&server, "state");
    let bye = counting_handler(&server, "bye");
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&check("quick-fox-7")).await.unwrap();
    read_messages(&mut raw).await;

    let mut batch = Vec::new();
    for tick in 0..3 {
        batch.extend_from_slice(&frame::encode("state", &json!({"tick": tick}), None).unwrap());
    }
    batch.extend_from_slice(&frame::encode("bye", &json!(null), None).unwrap());
    raw.write_all(&batch).await.unwrap();

    assert!(wait_until(SETTLE, || bye.load(Ordering::SeqCst) == 1).await);
    // Whole batch fits one read, so later states are superseded
    assert_eq!(state.load(Ordering::SeqCst), 1);
    assert_eq!(server.metrics().snapshot().duplicates_suppressed, 2);

    server.close();
}

#[tokio::test]
async fn test_garbage_datagrams_are_dropped() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    server.listen("127.0.0.1:0").await.unwrap();
    let udp_addr = server.local_addrs().unreliable.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"\0+++\0{nope\0---\0", udp_addr).await.unwrap();
    socket
        .send_to(&frame::encode("position", &[1, 2], Some("stranger")).unwrap(), udp_addr)
        .await
        .unwrap();

    assert!(wait_until(SETTLE, || server.metrics().snapshot().datagrams_dropped == 2).await);
    assert_eq!(server.metrics().snapshot().protocol_errors, 1);

    server.close();
}

#[tokio::test]
async fn test_unregistered_link_cannot_act_as_a_registered_peer() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    let admin = counting_handler(&server, "_admin");
    let punch_ids = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let punch_ids = punch_ids.clone();
        server
            .dispatcher()
            .register("_hole_punching", move |ctx, _data| {
                punch_ids.lock().unwrap().push(ctx.id.to_string());
                ctx.reply("pwned", &"to you")
            })
            .unwrap();
    }
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut victim = TcpStream::connect(addr).await.unwrap();
    victim.write_all(&check("victim-1")).await.unwrap();
    assert_eq!(read_messages(&mut victim).await[0].action, "_confirm_id");

    let mut intruder = TcpStream::connect(addr).await.unwrap();
    let mut bytes = frame::encode("_admin", &json!({"op": "kick"}), Some("victim-1"))
        .unwrap()
        .to_vec();
    bytes.extend_from_slice(
        &frame::encode("_hole_punching", &json!({"port": 1}), Some("victim-1")).unwrap(),
    );
    intruder.write_all(&bytes).await.unwrap();

    assert!(wait_until(SETTLE, || punch_ids.lock().unwrap().len() == 1).await);
    assert_eq!(*punch_ids.lock().unwrap(), vec![String::new()]);
    assert_eq!(admin.load(Ordering::SeqCst), 0);

    // Nothing was delivered to the peer whose id was claimed
    let mut buf = [0u8; 256];
    assert!(timeout(Duration::from_millis(200), victim.read(&mut buf))
        .await
        .is_err());

    server.close();
}

#[tokio::test]
async fn test_disconnect_stops_dispatch_of_the_current_batch() {
    let (server, events) = recorded_session(test_config(Duration::from_secs(1)));
    server
        .dispatcher()
        .register("leave", |ctx, _data| {
            ctx.session.disconnect(ctx.id);
            Ok(())
        })
        .unwrap();
    let after = counting_handler(&server, "after");
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&check("brief-moth-9")).await.unwrap();
    read_messages(&mut raw).await;

    let mut batch = frame::encode("leave", &json!(null), None).unwrap().to_vec();
    batch.extend_from_slice(&frame::encode("after", &json!(null), None).unwrap());
    raw.write_all(&batch).await.unwrap();

    assert!(wait_until(SETTLE, || events.disconnected() == vec!["brief-moth-9".to_string()]).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(events.disconnected().len(), 1);

    server.close();
}

#[tokio::test]
async fn test_link_counters_cover_unregistered_links() {
    let (server, _) = recorded_session(test_config(Duration::from_secs(1)));
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let raw = TcpStream::connect(addr).await.unwrap();
    assert!(wait_until(SETTLE, || server.metrics().snapshot().connections_active == 1).await);
    let snap = server.metrics().snapshot();
    assert_eq!(snap.connections_total, 1);
    assert_eq!(snap.handshakes_success, 0);

    drop(raw);
    assert!(wait_until(SETTLE, || server.metrics().snapshot().connections_active == 0).await);
    assert_eq!(server.metrics().snapshot().connections_total, 1);

    server.close();
}

fn punch(id: &str, port: u16) -> Vec<u8> {
    frame::encode("_hole_punching", &json!({"port": port}), Some(id))
        .unwrap()
        .to_vec()
}

async fn next_datagram(socket: &UdpSocket, action: &str) -> Message {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, _) = timeout(SETTLE, socket.recv_from(&mut buf))
            .await
            .expect("datagram arrived in time")
            .unwrap();
        if let Some(msg) = frame::decode_batch(&buf[..n])
            .unwrap()
            .into_iter()
            .find(|m| m.action == action)
        {
            return msg;
        }
    }
}

#[tokio::test]
async fn test_rebinding_is_announced_and_followed() {
    // Long interval so the server's own keep-alives stay out of the way
    let (server, events) = recorded_session(test_config(Duration::from_secs(30)));
    let addr = server.listen("127.0.0.1:0").await.unwrap();
    let udp_addr = server.local_addrs().unreliable.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&check("roamer-8")).await.unwrap();
    read_messages(&mut raw).await;

    // The first punch advertises a port the server does not observe
    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let first_port = first.local_addr().unwrap().port();
    let advertised = if first_port == 1 { 2 } else { 1 };
    first.send_to(&punch("roamer-8", advertised), udp_addr).await.unwrap();

    let reply = read_messages(&mut raw).await;
    assert_eq!(reply[0].action, "newudpport");
    assert_eq!(reply[0].payload, json!({"port": first_port}));
    assert_eq!(events.unreliable_connected(), vec!["roamer-8".to_string()]);
    assert_eq!(server.metrics().snapshot().rebindings, 0);

    // The same peer now sends from a new port
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second_port = second.local_addr().unwrap().port();
    second.send_to(&punch("roamer-8", second_port), udp_addr).await.unwrap();

    let reply = read_messages(&mut raw).await;
    assert_eq!(reply[0].action, "newudpport");
    assert_eq!(reply[0].payload, json!({"port": second_port}));
    assert_eq!(server.metrics().snapshot().rebindings, 1);
    assert_eq!(events.unreliable_connected().len(), 1);

    server
        .send_unreliable("position", &json!({"x": 3}), Some("roamer-8"))
        .unwrap();
    let msg = next_datagram(&second, "position").await;
    assert_eq!(msg.payload, json!({"x": 3}));
    assert_eq!(msg.sender_id.as_deref(), Some("roamer-8"));

    let snap = server.metrics().snapshot();
    assert_eq!(snap.datagrams_sent, 1);
    assert!(snap.datagram_bytes_sent > 0);
    // _confirm_id and the two announcements
    assert_eq!(snap.messages_sent, 3);

    server.close();
}
