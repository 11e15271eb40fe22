//! # Reliable Channel Manager
//!
//! Accepts and establishes TCP connections, drives the identity handshake on
//! each link, and forwards decoded batches to the dispatcher.
//!
//! Every link runs two tasks:
//! - a **reader** that owns the handshake state and the registry entry, and
//!   is the only place a link is registered or removed;
//! - a **writer** that drains the link's outbound queue, so `send` never
//!   suspends.
//!
//! Both observe the link's cancellation token, a child of the session's.
//! On cancellation the writer flushes frames already queued before shutting
//! the socket down.

use crate::core::codec::FrameCodec;
use crate::core::frame;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{first_occurrence, HandlerContext};
use crate::protocol::handshake::{self, ClientHandshake};
use crate::protocol::message::{Channel, InternalAction, Message, PortPayload};
use crate::service::session::{Session, WeakSession};
use crate::transport::registry::Connection;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Handler context id for internal actions on a link that has no id yet
pub(crate) const UNREGISTERED: &str = "";

/// Completion signal of a pending `connect`.
pub(crate) type HandshakeDone = oneshot::Sender<Result<String>>;

/// Where a link stands in the identity handshake.
pub(crate) enum LinkState {
    /// Accepted by the listener, waiting for a candidate id
    Accepted,
    /// Outbound link negotiating its id
    Negotiating {
        handshake: ClientHandshake,
        done: Option<HandshakeDone>,
    },
    /// Registered under this id
    Registered(String),
}

impl LinkState {
    fn registered_id(&self) -> Option<&str> {
        match self {
            LinkState::Registered(id) => Some(id),
            _ => None,
        }
    }
}

/// One reliable connection, as seen by its tasks.
pub(crate) struct Link {
    pub serial: u64,
    pub peer: SocketAddr,
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub token: CancellationToken,
}

impl Link {
    fn enqueue(&self, session: &Session, msg: &Message) -> Result<()> {
        let bytes = frame::encode(&msg.action, &msg.payload, msg.sender_id.as_deref())?;
        let len = bytes.len() as u64;
        self.outbound
            .send(bytes)
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        session.metrics().message_sent(len);
        Ok(())
    }

    fn connection(&self, id: String) -> Connection {
        Connection::new(
            id,
            self.serial,
            self.peer,
            self.outbound.clone(),
            self.token.clone(),
        )
    }
}

/// Accept inbound connections until `token` is cancelled.
#[instrument(skip_all, fields(local = ?listener.local_addr().ok()))]
pub(crate) async fn accept_loop(weak: WeakSession, listener: TcpListener, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let Some(session) = weak.upgrade() else { break };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection");
                        spawn_link(&session, stream, peer, LinkState::Accepted, None);
                    }
                    Err(e) => {
                        session.metrics().connection_error();
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

/// Start the reader and writer tasks of a new link.
///
/// `greeting` is queued before either task runs. Returns the link's
/// cancellation token.
pub(crate) fn spawn_link(
    session: &Session,
    stream: TcpStream,
    peer: SocketAddr,
    state: LinkState,
    greeting: Option<Message>,
) -> CancellationToken {
    if session.config().transport.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let link = Link {
        serial: session.next_serial(),
        peer,
        outbound: tx,
        token: session.shutdown_token().child_token(),
    };

    if let Some(msg) = greeting {
        if let Err(e) = link.enqueue(session, &msg) {
            warn!(%peer, error = %e, "Failed to queue greeting");
        }
    }

    let token = link.token.clone();
    session.metrics().connection_established();
    tokio::spawn(write_loop(write, rx, token.clone(), peer));
    tokio::spawn(read_loop(session.downgrade(), read, link, state));
    token
}

async fn write_loop(
    write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    token: CancellationToken,
    peer: SocketAddr,
) {
    let mut sink = FramedWrite::new(write, FrameCodec::default());
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(bytes) => {
                    if let Err(e) = sink.send(bytes).await {
                        debug!(%peer, error = %e, "Write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = token.cancelled() => {
                while let Ok(bytes) = rx.try_recv() {
                    if sink.feed(bytes).await.is_err() {
                        break;
                    }
                }
                if let Err(e) = SinkExt::<Bytes>::flush(&mut sink).await {
                    trace!(%peer, error = %e, "Flush on close failed");
                }
                break;
            }
        }
    }

    if let Err(e) = sink.into_inner().shutdown().await {
        trace!(%peer, error = %e, "Shutdown failed");
    }
    token.cancel();
}

async fn read_loop(weak: WeakSession, read: OwnedReadHalf, link: Link, mut state: LinkState) {
    let max_frame_size = match weak.upgrade() {
        Some(session) => session.config().transport.max_frame_size,
        None => return,
    };
    let mut frames = FramedRead::new(read, FrameCodec::new(max_frame_size));

    let outcome: Result<()> = loop {
        let next = tokio::select! {
            _ = link.token.cancelled() => break Ok(()),
            next = frames.next() => next,
        };

        let batch = match next {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };

        if link.token.is_cancelled() {
            break Ok(());
        }
        let Some(session) = weak.upgrade() else {
            break Ok(());
        };

        let bytes = frames.decoder_mut().take_consumed() as u64;
        if let Err(e) = process_batch(&session, &link, &mut state, batch, bytes) {
            break Err(e);
        }
    };

    link.token.cancel();
    let Some(session) = weak.upgrade() else { return };
    finish(&session, &link, state, outcome);
}

fn process_batch(
    session: &Session,
    link: &Link,
    state: &mut LinkState,
    batch: Vec<Message>,
    bytes: u64,
) -> Result<()> {
    let metrics = session.metrics();
    metrics.messages_received(batch.len() as u64, bytes);

    let (batch, dropped) = first_occurrence(batch);
    if dropped > 0 {
        trace!(peer = %link.peer, dropped, "Suppressed duplicate actions in batch");
        metrics.duplicates_suppressed(dropped as u64);
    }

    for msg in batch {
        // A disconnect may land while this batch is being dispatched
        if link.token.is_cancelled() {
            debug!(peer = %link.peer, action = %msg.action, "Link closed, dropping rest of batch");
            break;
        }
        trace!(peer = %link.peer, action = %msg.action, "Received message");
        match msg.internal() {
            Some(InternalAction::CheckIdAvailable) => {
                on_check(session, link, state, msg.payload.clone())?
            }
            Some(InternalAction::IdProposition) => on_proposition(session, link, state)?,
            Some(InternalAction::ConfirmId) => on_confirm(session, link, state, msg.payload.clone())?,
            Some(InternalAction::NewUdpPort) => on_new_udp_port(session, state, &msg),
            Some(InternalAction::HolePunching) | None => {}
        }

        // The registry, never the wire, names the peer
        let id = match state.registered_id() {
            Some(id) => id,
            None if msg.internal().is_some() => UNREGISTERED,
            None => {
                debug!(peer = %link.peer, action = %msg.action, "Dropping message from unregistered link");
                continue;
            }
        };
        let ctx = HandlerContext {
            session,
            id,
            channel: Channel::Reliable,
        };
        session.dispatcher().route(&ctx, session.listener(), msg);
    }
    Ok(())
}

/// Server side: a client proposes a candidate id.
fn on_check(
    session: &Session,
    link: &Link,
    state: &mut LinkState,
    payload: serde_json::Value,
) -> Result<()> {
    if let Some(id) = state.registered_id() {
        warn!(%id, peer = %link.peer, "Identity check on an already registered link, ignoring");
        return Ok(());
    }

    let metrics = session.metrics();
    metrics.handshake_attempt();
    let candidate = handshake::parse_candidate(payload)?;

    let limit = session.config().server.max_connections;
    match session
        .registry()
        .register_bounded(link.connection(candidate.clone()), limit)
    {
        Ok(()) => {
            link.enqueue(
                session,
                &handshake::confirmation(&candidate, session.unreliable_port()),
            )?;
            metrics.handshake_success();
            info!(id = %candidate, peer = %link.peer, "Client connected");
            *state = LinkState::Registered(candidate.clone());
            session.listener().connected(session, &candidate);
            Ok(())
        }
        Err(ProtocolError::IdentityConflict(id)) => {
            debug!(%id, peer = %link.peer, "Candidate id taken, asking for another");
            metrics.id_renegotiated();
            link.enqueue(session, &handshake::proposition())
        }
        Err(e) => {
            metrics.handshake_failed();
            warn!(peer = %link.peer, error = %e, "Refusing connection");
            Err(e)
        }
    }
}

/// Client side: the server rejected our candidate.
fn on_proposition(session: &Session, link: &Link, state: &mut LinkState) -> Result<()> {
    let LinkState::Negotiating { handshake, .. } = state else {
        debug!(peer = %link.peer, "Unsolicited id proposition, ignoring");
        return Ok(());
    };

    session.metrics().id_renegotiated();
    let msg = handshake.on_proposition(session.next_candidate())?;
    link.enqueue(session, &msg)
}

/// Client side: the server registered us.
fn on_confirm(
    session: &Session,
    link: &Link,
    state: &mut LinkState,
    payload: serde_json::Value,
) -> Result<()> {
    let LinkState::Negotiating { handshake, done } = state else {
        warn!(peer = %link.peer, "{}", constants::ERR_UNEXPECTED_CONFIRMATION);
        return Ok(());
    };

    let confirmed = handshake.on_confirm(payload)?;
    let mut conn = link.connection(confirmed.id.clone());
    conn.punch_target = confirmed
        .udp_port
        .map(|port| SocketAddr::new(link.peer.ip(), port));
    session
        .registry()
        .register(conn)
        .map_err(|e| ProtocolError::HandshakeError(e.to_string()))?;

    session.metrics().handshake_success();
    info!(id = %confirmed.id, server = %link.peer, attempts = handshake.attempts(), "Connected");

    let done = done.take();
    *state = LinkState::Registered(confirmed.id.clone());
    session.listener().connected(session, &confirmed.id);
    if let Some(done) = done {
        let _ = done.send(Ok(confirmed.id));
    }
    Ok(())
}

/// The peer tells us which port our datagrams arrive from.
fn on_new_udp_port(session: &Session, state: &LinkState, msg: &Message) {
    let Some(id) = state.registered_id() else { return };
    match serde_json::from_value::<PortPayload>(msg.payload.clone()) {
        Ok(PortPayload { port }) => {
            if session.registry().set_public_port(id, port) {
                info!(%id, port, "Peer observed a new unreliable port");
            }
        }
        Err(e) => debug!(%id, error = %e, "Ignoring malformed port update"),
    }
}

/// Tear down after the reader stopped.
fn finish(session: &Session, link: &Link, state: LinkState, outcome: Result<()>) {
    let metrics = session.metrics();
    metrics.connection_closed();

    if let Err(e) = &outcome {
        match e {
            ProtocolError::MalformedFrame { .. } | ProtocolError::OversizedFrame(_) => {
                metrics.protocol_error();
                error!(peer = %link.peer, error = %e, "Protocol error, closing connection");
            }
            ProtocolError::Io(_) => {
                metrics.connection_error();
                debug!(peer = %link.peer, error = %e, "Connection lost");
            }
            _ => warn!(peer = %link.peer, error = %e, "Closing connection"),
        }
    }

    match state {
        LinkState::Registered(id) => {
            if session.registry().remove_if(&id, link.serial).is_some() {
                info!(%id, peer = %link.peer, "Disconnected");
                session.listener().disconnected(session, &id);
            }
        }
        LinkState::Negotiating { done, .. } => {
            metrics.handshake_failed();
            if let Some(done) = done {
                let reason = match outcome {
                    Err(e) => e,
                    Ok(()) => ProtocolError::HandshakeError(
                        constants::ERR_HANDSHAKE_ABANDONED.to_string(),
                    ),
                };
                let _ = done.send(Err(reason));
            }
        }
        LinkState::Accepted => {
            trace!(peer = %link.peer, "Unregistered link closed");
        }
    }
}
