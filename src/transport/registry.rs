//! # Session Registry
//!
//! Authoritative map from connection id to connection state. An entry exists
//! only for connections that completed the identity handshake, and each
//! entry is removed exactly once.
//!
//! ## Features
//! - **Unique ids**: `register` refuses an id held by an active connection
//! - **Owner-checked removal**: `remove_if` only removes the entry created by
//!   the caller's link, so a stale link can never evict a newer one
//! - **Unreliable mapping**: the last observed datagram port per id, used to
//!   resolve datagrams that carry no id
//!
//! The lock is held only for map operations. Nothing awaits or calls into
//! the application while holding it.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A registered connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    /// Identifies the link that created the entry
    pub serial: u64,
    /// Remote end of the reliable channel
    pub peer: SocketAddr,
    /// Last port datagrams from this peer arrived from
    pub unreliable_port: Option<u16>,
    /// Where to send hole punches before any datagram has arrived
    pub punch_target: Option<SocketAddr>,
    /// Our own unreliable port as the peer observes it
    pub public_unreliable_port: Option<u16>,
    pub(crate) outbound: mpsc::UnboundedSender<Bytes>,
    pub(crate) token: CancellationToken,
}

impl Connection {
    pub(crate) fn new(
        id: String,
        serial: u64,
        peer: SocketAddr,
        outbound: mpsc::UnboundedSender<Bytes>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            serial,
            peer,
            unreliable_port: None,
            punch_target: None,
            public_unreliable_port: None,
            outbound,
            token,
        }
    }

    /// Address unreliable sends go to, once hole punching has resolved it.
    pub fn unreliable_addr(&self) -> Option<SocketAddr> {
        self.unreliable_port
            .map(|port| SocketAddr::new(self.peer.ip(), port))
    }

    /// Address hole punches go to: the observed mapping if any, else the
    /// advertised target.
    pub fn hole_punch_addr(&self) -> Option<SocketAddr> {
        self.unreliable_addr().or(self.punch_target)
    }
}

/// Hole-punching work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchTarget {
    pub id: String,
    pub addr: SocketAddr,
    pub public_port: Option<u16>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still guards valid state.
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `conn` under its id.
    pub fn register(&self, conn: Connection) -> Result<()> {
        self.register_bounded(conn, usize::MAX)
    }

    /// Register `conn` unless the id is taken or `limit` entries already exist.
    pub fn register_bounded(&self, conn: Connection, limit: usize) -> Result<()> {
        let mut connections = self.lock();
        if connections.contains_key(&conn.id) {
            return Err(ProtocolError::IdentityConflict(conn.id));
        }
        if connections.len() >= limit {
            return Err(ProtocolError::ConnectionError(format!(
                "connection limit of {limit} reached"
            )));
        }
        trace!(id = %conn.id, peer = %conn.peer, "Registering connection");
        connections.insert(conn.id.clone(), conn);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<Connection> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn remove(&self, id: &str) -> Option<Connection> {
        self.lock().remove(id)
    }

    /// Remove `id` only if the entry was created by link `serial`.
    pub fn remove_if(&self, id: &str, serial: u64) -> Option<Connection> {
        let mut connections = self.lock();
        match connections.get(id) {
            Some(conn) if conn.serial == serial => connections.remove(id),
            _ => None,
        }
    }

    /// Find the connection whose datagrams last arrived from `ip:port`.
    pub fn find_by_unreliable_port(&self, ip: IpAddr, port: u16) -> Option<Connection> {
        let ip = ip.to_canonical();
        self.lock()
            .values()
            .find(|conn| {
                conn.peer.ip().to_canonical() == ip && conn.unreliable_port == Some(port)
            })
            .cloned()
    }

    /// Record the observed unreliable port for `id`.
    ///
    /// Returns the previous port, or `None` if `id` is not registered.
    pub fn set_unreliable_port(&self, id: &str, port: u16) -> Option<Option<u16>> {
        self.lock()
            .get_mut(id)
            .map(|conn| conn.unreliable_port.replace(port))
    }

    pub fn set_public_port(&self, id: &str, port: u16) -> bool {
        match self.lock().get_mut(id) {
            Some(conn) => {
                conn.public_unreliable_port = Some(port);
                true
            }
            None => false,
        }
    }

    pub fn punch_targets(&self) -> Vec<PunchTarget> {
        self.lock()
            .values()
            .filter_map(|conn| {
                conn.hole_punch_addr().map(|addr| PunchTarget {
                    id: conn.id.clone(),
                    addr,
                    public_port: conn.public_unreliable_port,
                })
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Copy of every entry, for broadcasts.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Connection> {
        self.lock().drain().map(|(_, conn)| conn).collect()
    }
}
