//! # Session
//!
//! The public face of the transport. A [`Session`] owns the registry, the
//! unreliable socket, the handler map and the listener, and hands them to
//! the channel managers. Sessions are independent: a process may run any
//! number of them, and a test can run a server and its clients side by side.
//!
//! ## Example
//! ```rust,no_run
//! use dualnet::{Session, SessionListener};
//! use serde_json::json;
//!
//! struct Lobby;
//! impl SessionListener for Lobby {
//!     fn connected(&self, _session: &Session, id: &str) {
//!         println!("{id} joined");
//!     }
//! }
//!
//! # async fn run() -> dualnet::Result<()> {
//! let server = Session::builder().listener(Lobby).build()?;
//! server.dispatcher().register("hello", |ctx, data| {
//!     ctx.reply("gotit", &json!({"echo": data}))
//! })?;
//! server.listen("0.0.0.0:31426").await?;
//! # Ok(())
//! # }
//! ```

use crate::config::NetworkConfig;
use crate::core::frame;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, NoopListener, SessionListener};
use crate::protocol::handshake::{generate_id, ClientHandshake, IdGenerator};
use crate::transport::registry::{Connection, SessionRegistry};
use crate::transport::reliable::{self, LinkState};
use crate::transport::unreliable;
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Fresh candidates drawn before accepting one that is already registered locally
const CANDIDATE_DRAWS: usize = 8;

/// Addresses a session is bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalAddrs {
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
}

struct RunState {
    root: CancellationToken,
    reliable: Option<SocketAddr>,
    unreliable: Option<Arc<UdpSocket>>,
}

struct SessionInner {
    config: NetworkConfig,
    dispatcher: Dispatcher,
    listener: Arc<dyn SessionListener>,
    registry: SessionRegistry,
    metrics: Metrics,
    id_generator: Mutex<IdGenerator>,
    serial: AtomicU64,
    state: Mutex<RunState>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.root.cancel();
    }
}

/// Handle to a session. Clones share the same session; dropping the last
/// handle stops every background task.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning handle held by background tasks.
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Handler map; register handlers here before traffic arrives.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Accept connections on `bind` and open the unreliable socket on the
    /// same IP at `server.unreliable_port`.
    ///
    /// Returns the bound reliable address.
    #[instrument(skip(self))]
    pub async fn listen(&self, bind: &str) -> Result<SocketAddr> {
        if let Some(addr) = self.state().reliable {
            return Err(ProtocolError::AlreadyListening(addr));
        }

        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        let token = {
            let mut state = self.state();
            if let Some(addr) = state.reliable {
                return Err(ProtocolError::AlreadyListening(addr));
            }
            state.reliable = Some(local);
            state.root.child_token()
        };

        let udp_addr = SocketAddr::new(local.ip(), self.config().server.unreliable_port);
        if let Err(e) = self.ensure_unreliable(udp_addr).await {
            self.state().reliable = None;
            return Err(e);
        }

        tokio::spawn(reliable::accept_loop(self.downgrade(), listener, token));
        info!(
            reliable = %local,
            unreliable = ?self.local_addrs().unreliable,
            "Listening"
        );
        Ok(local)
    }

    /// Connect to a listening session and negotiate an id.
    ///
    /// Resolves once the server confirmed the id and `connected` fired
    /// locally. Any number of connects may be in flight at once.
    #[instrument(skip(self))]
    pub async fn connect(&self, addr: &str) -> Result<String> {
        let _timer = Timer::start("connect");
        let client = &self.config().client;

        let stream = with_timeout_error(
            async {
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| ProtocolError::ConnectionError(format!("{addr}: {e}")))
            },
            client.connection_timeout,
        )
        .await
        .inspect_err(|e| {
            self.metrics().connection_error();
            warn!(error = %e, "Connection failed");
        })?;
        let peer = stream.peer_addr()?;

        let bind = unreliable_bind_for(&client.unreliable_bind, peer)?;
        self.ensure_unreliable(bind).await?;

        self.metrics().handshake_attempt();
        let (handshake, greeting) =
            ClientHandshake::start(self.next_candidate(), client.max_id_retries);
        debug!(candidate = handshake.candidate(), %peer, "Negotiating id");

        let (tx, rx) = oneshot::channel();
        let state = LinkState::Negotiating {
            handshake,
            done: Some(tx),
        };
        let link = reliable::spawn_link(self, stream, peer, state, Some(greeting));

        let outcome = with_timeout_error(
            async { rx.await.unwrap_or(Err(ProtocolError::ConnectionClosed)) },
            client.handshake_timeout,
        )
        .await;
        if let Err(e) = &outcome {
            link.cancel();
            warn!(%peer, error = %e, "Handshake failed");
        }
        outcome
    }

    /// Queue `payload` under `action` on the reliable channel.
    ///
    /// `to = None` sends to every registered connection. Never suspends.
    pub fn send<T>(&self, action: &str, payload: &T, to: Option<&str>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        for conn in self.targets(to)? {
            let bytes = frame::encode(action, payload, Some(&conn.id))?;
            let len = bytes.len() as u64;
            match conn.outbound.send(bytes) {
                Ok(()) => {
                    self.metrics().message_sent(len);
                    trace!(id = %conn.id, %action, "Queued message");
                }
                Err(_) if to.is_some() => return Err(ProtocolError::ConnectionClosed),
                Err(_) => debug!(id = %conn.id, "Connection closing, skipped broadcast"),
            }
        }
        Ok(())
    }

    /// Send `payload` under `action` as a datagram.
    ///
    /// Connections whose unreliable address is not resolved yet are
    /// skipped. Delivery is best effort.
    pub fn send_unreliable<T>(&self, action: &str, payload: &T, to: Option<&str>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let targets = self.targets(to)?;
        let Some(socket) = self.state().unreliable.clone() else {
            trace!(%action, "No unreliable socket, skipping send");
            return Ok(());
        };

        for conn in targets {
            let Some(addr) = conn.unreliable_addr() else {
                trace!(error = %ProtocolError::StaleMapping(conn.id.clone()), "Skipping send");
                continue;
            };
            let bytes = frame::encode(action, payload, Some(&conn.id))?;
            match unreliable::send_datagram(&socket, &bytes, addr) {
                Ok(()) => {
                    self.metrics().datagram_sent(bytes.len() as u64);
                }
                Err(e) => {
                    self.metrics().datagram_dropped();
                    debug!(id = %conn.id, %addr, error = %e, "Datagram not sent");
                }
            }
        }
        Ok(())
    }

    fn targets(&self, to: Option<&str>) -> Result<Vec<Connection>> {
        match to {
            Some(id) => self
                .registry()
                .lookup(id)
                .map(|conn| vec![conn])
                .ok_or_else(|| ProtocolError::NotConnected(id.to_string())),
            None => Ok(self.registry().snapshot()),
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.registry().contains(id)
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.registry().ids()
    }

    /// Close one connection. Returns whether `id` was connected.
    pub fn disconnect(&self, id: &str) -> bool {
        match self.registry().remove(id) {
            Some(conn) => {
                conn.token.cancel();
                info!(%id, peer = %conn.peer, "Disconnecting");
                self.listener().disconnected(self, id);
                true
            }
            None => false,
        }
    }

    /// Close every connection, the listener and the unreliable socket.
    ///
    /// `disconnected` fires for each registered connection before this
    /// returns. Closing twice is a no-op, and the session can listen or
    /// connect again afterwards.
    pub fn close(&self) {
        let (root, was_open) = {
            let mut state = self.state();
            let root = std::mem::replace(&mut state.root, CancellationToken::new());
            let listening = state.reliable.take().is_some();
            let bound = state.unreliable.take().is_some();
            (root, listening || bound)
        };

        let closed = self.registry().drain();
        root.cancel();

        for conn in &closed {
            info!(id = %conn.id, peer = %conn.peer, "Disconnected on close");
            self.listener().disconnected(self, &conn.id);
        }
        if was_open || !closed.is_empty() {
            info!(connections = closed.len(), "Session closed");
        }
    }

    pub fn local_addrs(&self) -> LocalAddrs {
        let state = self.state();
        LocalAddrs {
            reliable: state.reliable,
            unreliable: state
                .unreliable
                .as_ref()
                .and_then(|socket| socket.local_addr().ok()),
        }
    }

    async fn ensure_unreliable(&self, addr: SocketAddr) -> Result<()> {
        let token = {
            let state = self.state();
            if state.unreliable.is_some() {
                return Ok(());
            }
            state.root.child_token()
        };

        let socket = unreliable::bind(self, addr, token.clone()).await?;
        let mut state = self.state();
        if state.unreliable.is_some() {
            token.cancel();
        } else {
            state.unreliable = Some(socket);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub(crate) fn listener(&self) -> &dyn SessionListener {
        self.inner.listener.as_ref()
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.state().root.clone()
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.inner.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Unreliable port advertised to clients in `_confirm_id`.
    pub(crate) fn unreliable_port(&self) -> Option<u16> {
        self.local_addrs().unreliable.map(|addr| addr.port())
    }

    /// A candidate id not registered locally, if the generator yields one.
    pub(crate) fn next_candidate(&self) -> String {
        let mut generator = self
            .inner
            .id_generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let generate = &mut *generator;

        let mut candidate = generate();
        for _ in 1..CANDIDATE_DRAWS {
            if !self.registry().contains(&candidate) {
                break;
            }
            candidate = generate();
        }
        candidate
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.local_addrs())
            .field("connections", &self.registry().len())
            .finish()
    }
}

/// The client's unreliable socket must match the server's address family.
fn unreliable_bind_for(configured: &str, peer: SocketAddr) -> Result<SocketAddr> {
    let bind: SocketAddr = configured.parse().map_err(|e| {
        ProtocolError::ConfigError(format!("invalid unreliable bind '{configured}': {e}"))
    })?;
    if peer.is_ipv6() && bind.is_ipv4() && bind.ip().is_unspecified() {
        return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), bind.port()));
    }
    Ok(bind)
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: Option<NetworkConfig>,
    listener: Option<Arc<dyn SessionListener>>,
    dispatcher: Option<Dispatcher>,
    id_generator: Option<IdGenerator>,
}

impl SessionBuilder {
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn listener<L: SessionListener>(mut self, listener: L) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Use a listener the caller keeps a handle to.
    pub fn shared_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Start from a pre-populated handler map.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the random id generator.
    pub fn id_generator<F>(mut self, generator: F) -> Self
    where
        F: FnMut() -> String + Send + 'static,
    {
        self.id_generator = Some(Box::new(generator));
        self
    }

    pub fn build(self) -> Result<Session> {
        let config = self.config.unwrap_or_default();
        config.validate_strict()?;

        Ok(Session {
            inner: Arc::new(SessionInner {
                config,
                dispatcher: self.dispatcher.unwrap_or_default(),
                listener: self.listener.unwrap_or_else(|| Arc::new(NoopListener)),
                registry: SessionRegistry::new(),
                metrics: Metrics::new(),
                id_generator: Mutex::new(
                    self.id_generator
                        .unwrap_or_else(|| Box::new(generate_id)),
                ),
                serial: AtomicU64::new(0),
                state: Mutex::new(RunState {
                    root: CancellationToken::new(),
                    reliable: None,
                    unreliable: None,
                }),
            }),
        })
    }
}
