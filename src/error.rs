//! # Error Types
//!
//! Error handling for the session transport.
//!
//! This module defines every error variant that can occur while framing,
//! negotiating identities, or moving bytes over either channel.
//!
//! ## Error Categories
//! - **Transport Errors**: refused/reset connections, I/O failures, timeouts
//! - **Identity Errors**: id conflicts and exhausted renegotiation
//! - **Framing Errors**: malformed or oversized frames
//! - **Routing Errors**: unknown actions, unknown peers, stale unreliable mappings
//!
//! Only some of these ever reach the application. `IdentityConflict` is
//! recovered inside the handshake, `UnknownAction` and `StaleMapping` are
//! logged and dropped.
//!
//! ## Example Usage
//! ```rust
//! use dualnet::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse::<u16>()
//!         .map_err(|e| ProtocolError::ConfigError(format!("bad port '{raw}': {e}")))
//! }
//!
//! if let Err(e) = parse_port("udp") {
//!     error!(error = %e, "Invalid port");
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Handshake errors
    pub const ERR_HANDSHAKE_ABANDONED: &str = "Handshake abandoned before confirmation";
    pub const ERR_MISSING_CANDIDATE: &str = "Identity check carried no candidate id";
    pub const ERR_MISSING_CONFIRMED_ID: &str = "Identity confirmation carried no id";
    pub const ERR_UNEXPECTED_CONFIRMATION: &str = "Identity confirmation without a pending handshake";
}

/// `ProtocolError` is the primary error type for all session operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection refused or reset at the transport level
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The id is already registered by another active connection
    #[error("Identity conflict: id '{0}' is already registered")]
    IdentityConflict(String),

    /// Bytes between two sentinels were not a decodable message
    #[error("Malformed frame ({reason}): {bytes}")]
    MalformedFrame { reason: String, bytes: String },

    /// Accumulated bytes exceeded the frame ceiling without a complete frame
    #[error("Frame too large: {0} bytes buffered without a complete frame")]
    OversizedFrame(usize),

    #[error("No handler for action '{0}'")]
    UnknownAction(String),

    /// Unreliable send attempted before hole punching resolved the peer
    #[error("No unreliable mapping for '{0}' yet")]
    StaleMapping(String),

    #[error("Identity negotiation gave up after {0} attempts")]
    TooManyRetries(u32),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Not connected: '{0}'")]
    NotConnected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Already listening on {0}")]
    AlreadyListening(SocketAddr),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Build a `MalformedFrame` error, escaping the offending bytes for logs.
    pub fn malformed(reason: impl Into<String>, bytes: &[u8]) -> Self {
        ProtocolError::MalformedFrame {
            reason: reason.into(),
            bytes: bytes.escape_ascii().to_string(),
        }
    }

    /// Whether the error ends the connection it was raised on.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::MalformedFrame { .. }
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::ConnectionError(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
