//! # Unreliable Channel Manager
//!
//! One UDP socket per session. Two background tasks share it:
//! - the **receive loop** decodes datagrams, resolves the sender to a
//!   registered connection and dispatches the batch;
//! - the **hole-punching loop** sends `_hole_punching` to every known peer
//!   at a fixed interval, which opens and keeps alive the NAT mappings on
//!   both ends.
//!
//! A datagram is resolved by the `_id` it carries, provided it arrives from
//! the IP of that connection's reliable peer, and otherwise by the last port
//! recorded for the sender's IP. When a known peer's datagrams start
//! arriving from a new port the mapping is updated, and the peer is told its
//! new public port over the reliable channel.

use crate::core::frame;
use crate::error::Result;
use crate::protocol::dispatcher::{first_occurrence, HandlerContext};
use crate::protocol::message::{Channel, InternalAction, Message, PortPayload};
use crate::service::session::{Session, WeakSession};
use crate::transport::registry::Connection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Bind the unreliable socket and start both loops under `token`.
#[instrument(skip(session, token))]
pub(crate) async fn bind(
    session: &Session,
    addr: SocketAddr,
    token: CancellationToken,
) -> Result<Arc<UdpSocket>> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local = socket.local_addr()?;
    info!(%local, "Unreliable channel bound");

    let transport = &session.config().transport;
    tokio::spawn(receive_loop(
        session.downgrade(),
        socket.clone(),
        token.clone(),
        transport.datagram_buffer_size,
    ));
    tokio::spawn(hole_punch_loop(
        session.downgrade(),
        socket.clone(),
        token,
        transport.hole_punch_interval,
    ));
    Ok(socket)
}

async fn receive_loop(
    weak: WeakSession,
    socket: Arc<UdpSocket>,
    token: CancellationToken,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, src) = match received {
            Ok(received) => received,
            // ICMP port unreachable from a peer that went away surfaces here
            Err(e) => {
                debug!(error = %e, "Datagram receive failed");
                continue;
            }
        };

        let Some(session) = weak.upgrade() else { break };
        handle_datagram(&session, &buf[..len], src);
    }
    debug!("Unreliable receive loop stopped");
}

/// Decode, resolve and dispatch one datagram.
pub(crate) fn handle_datagram(session: &Session, bytes: &[u8], src: SocketAddr) {
    let metrics = session.metrics();
    metrics.datagram_received(bytes.len() as u64);

    let batch = match frame::decode_batch(bytes) {
        Ok(batch) if !batch.is_empty() => batch,
        Ok(_) => {
            trace!(%src, len = bytes.len(), "Datagram carried no complete frame");
            metrics.datagram_dropped();
            return;
        }
        Err(e) => {
            metrics.protocol_error();
            metrics.datagram_dropped();
            warn!(%src, error = %e, "Dropping malformed datagram");
            return;
        }
    };
    let (batch, dropped) = first_occurrence(batch);
    if dropped > 0 {
        metrics.duplicates_suppressed(dropped as u64);
    }

    let Some(conn) = resolve(session, &batch, src) else {
        trace!(%src, "Datagram from unknown peer, dropping");
        metrics.datagram_dropped();
        return;
    };

    update_mapping(session, &conn, &batch, src);

    for msg in batch {
        trace!(id = %conn.id, action = %msg.action, "Received datagram message");
        let ctx = HandlerContext {
            session,
            id: &conn.id,
            channel: Channel::Unreliable,
        };
        session.dispatcher().route(&ctx, session.listener(), msg);
    }
}

fn resolve(session: &Session, batch: &[Message], src: SocketAddr) -> Option<Connection> {
    let registry = session.registry();
    let src_ip = src.ip().to_canonical();

    let by_id = batch
        .iter()
        .find_map(|msg| msg.sender_id.as_deref())
        .and_then(|id| registry.lookup(id))
        .filter(|conn| conn.peer.ip().to_canonical() == src_ip);

    by_id.or_else(|| registry.find_by_unreliable_port(src_ip, src.port()))
}

fn update_mapping(session: &Session, conn: &Connection, batch: &[Message], src: SocketAddr) {
    let port = src.port();
    let Some(previous) = session.registry().set_unreliable_port(&conn.id, port) else {
        return;
    };

    match previous {
        None => {
            info!(id = %conn.id, %src, "Unreliable channel connected");
            session.listener().unreliable_connected(session, &conn.id);

            // The peer advertised the port it thinks it sends from; if the
            // NAT translated it, tell the peer what we actually see.
            let advertised = batch
                .iter()
                .filter(|msg| msg.internal() == Some(InternalAction::HolePunching))
                .find_map(|msg| serde_json::from_value::<PortPayload>(msg.payload.clone()).ok());
            if matches!(advertised, Some(PortPayload { port: p }) if p != port) {
                announce(session, conn, port);
            }
        }
        Some(old) if old != port => {
            session.metrics().rebinding();
            info!(id = %conn.id, old, new = port, "Peer re-bound its unreliable port");
            announce(session, conn, port);
        }
        Some(_) => {}
    }
}

fn announce(session: &Session, conn: &Connection, port: u16) {
    if !session.config().transport.announce_rebinding {
        return;
    }
    let action = InternalAction::NewUdpPort.name();
    if let Err(e) = session.send(action, &PortPayload { port }, Some(&conn.id)) {
        debug!(id = %conn.id, error = %e, "Failed to announce unreliable port");
    }
}

async fn hole_punch_loop(
    weak: WeakSession,
    socket: Arc<UdpSocket>,
    token: CancellationToken,
    period: Duration,
) {
    let local_port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            warn!(error = %e, "Unreliable socket has no local address, not hole punching");
            return;
        }
    };

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(session) = weak.upgrade() else { break };
                punch(&session, &socket, local_port);
            }
        }
    }
    debug!("Hole punching stopped");
}

fn punch(session: &Session, socket: &UdpSocket, local_port: u16) {
    for target in session.registry().punch_targets() {
        let payload = PortPayload {
            port: target.public_port.unwrap_or(local_port),
        };
        let bytes = match frame::encode(InternalAction::HolePunching.name(), &payload, Some(&target.id)) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode hole punch");
                continue;
            }
        };
        match send_datagram(socket, &bytes, target.addr) {
            Ok(()) => {
                session.metrics().hole_punch_sent();
                trace!(id = %target.id, addr = %target.addr, "Hole punch sent");
            }
            Err(e) => debug!(id = %target.id, addr = %target.addr, error = %e, "Hole punch not sent"),
        }
    }
}

/// Send without suspending; a full socket buffer drops the datagram.
pub(crate) fn send_datagram(socket: &UdpSocket, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
    let sent = socket.try_send_to(bytes, addr)?;
    if sent < bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "datagram truncated",
        ));
    }
    Ok(())
}
