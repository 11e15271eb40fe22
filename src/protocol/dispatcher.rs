use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{Channel, Message};
use crate::service::session::Session;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

type HandlerFn = dyn Fn(&HandlerContext<'_>, Value) -> Result<()> + Send + Sync + 'static;

/// What a handler sees besides the payload.
pub struct HandlerContext<'a> {
    pub session: &'a Session,
    /// Id of the connection the message arrived on
    pub id: &'a str,
    pub channel: Channel,
}

impl HandlerContext<'_> {
    /// Send back to the originating peer over the reliable channel.
    pub fn reply<T: serde::Serialize + ?Sized>(&self, action: &str, payload: &T) -> Result<()> {
        self.session.send(action, payload, Some(self.id))
    }

    /// Send back to the originating peer over the unreliable channel.
    pub fn reply_unreliable<T: serde::Serialize + ?Sized>(
        &self,
        action: &str,
        payload: &T,
    ) -> Result<()> {
        self.session.send_unreliable(action, payload, Some(self.id))
    }
}

/// Channels a handler accepts messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Channels {
    #[default]
    Both,
    ReliableOnly,
    UnreliableOnly,
}

impl Channels {
    pub fn accepts(self, channel: Channel) -> bool {
        match self {
            Channels::Both => true,
            Channels::ReliableOnly => channel == Channel::Reliable,
            Channels::UnreliableOnly => channel == Channel::Unreliable,
        }
    }
}

struct Route {
    channels: Channels,
    handler: Arc<HandlerFn>,
}

/// Lifecycle hooks of the application.
///
/// Every method defaults to a no-op, so a listener only implements what it
/// cares about. Hooks run on the task that observed the event and must not
/// block.
pub trait SessionListener: Send + Sync + 'static {
    /// A connection completed the identity handshake
    fn connected(&self, _session: &Session, _id: &str) {}

    /// A registered connection went away. Fires exactly once per connection.
    fn disconnected(&self, _session: &Session, _id: &str) {}

    /// The first datagram from this connection's peer arrived
    fn unreliable_connected(&self, _session: &Session, _id: &str) {}

    /// Sees every message routed to the listener, before its handler
    fn intercept(&self, _ctx: &HandlerContext<'_>, _message: &Message) {}
}

/// Listener with no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Action name to handler routing.
///
/// Handlers are registered up front; a message whose action has no handler
/// is dropped with a warning.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HashMap<Cow<'static, str>, Route>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler for messages on either channel.
    pub fn register<F>(&self, action: impl Into<Cow<'static, str>>, handler: F) -> Result<()>
    where
        F: Fn(&HandlerContext<'_>, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.register_for(action, Channels::Both, handler)
    }

    /// Register a handler restricted to some channels.
    pub fn register_for<F>(
        &self,
        action: impl Into<Cow<'static, str>>,
        channels: Channels,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&HandlerContext<'_>, Value) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(
            action.into(),
            Route {
                channels,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Register a handler whose payload is deserialized into `T` first.
    ///
    /// A payload that does not fit `T` fails the dispatch with a
    /// serialization error; the connection stays up.
    pub fn register_typed<T, F>(
        &self,
        action: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> Result<()>
    where
        T: DeserializeOwned,
        F: Fn(&HandlerContext<'_>, T) -> Result<()> + Send + Sync + 'static,
    {
        self.register(action, move |ctx, payload| {
            let typed = serde_json::from_value::<T>(payload)?;
            handler(ctx, typed)
        })
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(action))
            .unwrap_or(false)
    }

    /// Invoke the handler for `msg`.
    ///
    /// The handler runs after the registry lock is released, so it may
    /// register further handlers or send.
    pub fn dispatch(&self, ctx: &HandlerContext<'_>, msg: Message) -> Result<()> {
        let route = {
            let handlers = self.handlers.read().map_err(|_| {
                ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
            })?;
            handlers
                .get(msg.action.as_str())
                .map(|route| (route.channels, route.handler.clone()))
        };

        match route {
            None => Err(ProtocolError::UnknownAction(msg.action)),
            Some((channels, _)) if !channels.accepts(ctx.channel) => {
                debug!(
                    action = %msg.action,
                    channel = %ctx.channel,
                    "Handler does not accept this channel, dropping"
                );
                Ok(())
            }
            Some((_, handler)) => handler(ctx, msg.payload),
        }
    }

    /// Run the interceptor and the handler, logging whatever goes wrong.
    ///
    /// Internal actions reach here after the transport has handled them;
    /// for those a missing handler is expected and stays silent.
    pub(crate) fn route(&self, ctx: &HandlerContext<'_>, listener: &dyn SessionListener, msg: Message) {
        listener.intercept(ctx, &msg);

        let internal = msg.internal().is_some();
        match self.dispatch(ctx, msg) {
            Ok(()) => {}
            Err(ProtocolError::UnknownAction(_)) if internal => {}
            Err(ProtocolError::UnknownAction(action)) => {
                ctx.session.metrics().unknown_action();
                warn!(id = ctx.id, %action, channel = %ctx.channel, "No handler for action, dropping");
            }
            Err(e) if e.is_fatal_for_connection() => {
                debug!(id = ctx.id, error = %e, "Handler lost its peer");
            }
            Err(e) => {
                warn!(id = ctx.id, channel = %ctx.channel, error = %e, "Handler failed");
            }
        }
    }
}

/// Keep the first message of each action in arrival order.
///
/// Returns the surviving messages and how many were discarded.
pub fn first_occurrence(batch: Vec<Message>) -> (Vec<Message>, usize) {
    let before = batch.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<Message> = batch
        .into_iter()
        .filter(|msg| seen.insert(msg.action.clone()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}
