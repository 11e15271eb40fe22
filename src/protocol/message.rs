//! Message model and the reserved internal actions.
//!
//! On the wire a message is the JSON object `{"action", "data", "_id"}`.
//! `data` is any JSON value; nothing beyond the action name is validated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    #[serde(rename = "data", default)]
    pub payload: Value,
    #[serde(rename = "_id", default)]
    pub sender_id: Option<String>,
}

impl Message {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
            sender_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.sender_id = Some(id.into());
        self
    }

    /// The internal action this message carries, if any. Only these are
    /// dispatched for a connection that is not registered yet.
    pub fn internal(&self) -> Option<InternalAction> {
        InternalAction::parse(&self.action)
    }
}

/// Borrowed form used when encoding, so payloads are never cloned for sending.
#[derive(Serialize)]
pub(crate) struct WireMessage<'a, T: ?Sized + Serialize> {
    pub action: &'a str,
    pub data: &'a T,
    #[serde(rename = "_id")]
    pub id: Option<&'a str>,
}

/// Actions the transport handles itself, regardless of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalAction {
    /// Client proposes a candidate id
    CheckIdAvailable,
    /// Server rejects a candidate; the client must propose another
    IdProposition,
    /// Server accepted the candidate
    ConfirmId,
    /// Keep-alive datagram that opens and maintains NAT mappings
    HolePunching,
    /// Tells a peer which unreliable port its datagrams arrive from
    NewUdpPort,
}

impl InternalAction {
    pub const ALL: [InternalAction; 5] = [
        InternalAction::CheckIdAvailable,
        InternalAction::IdProposition,
        InternalAction::ConfirmId,
        InternalAction::HolePunching,
        InternalAction::NewUdpPort,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            InternalAction::CheckIdAvailable => "_check_if_id_is_available",
            InternalAction::IdProposition => "_send_id_proposition",
            InternalAction::ConfirmId => "_confirm_id",
            InternalAction::HolePunching => "_hole_punching",
            InternalAction::NewUdpPort => "newudpport",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == action)
    }
}

impl fmt::Display for InternalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of `_check_if_id_is_available` and `_confirm_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPayload {
    pub id: String,
    /// Server's unreliable port, sent with `_confirm_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
}

/// Payload of `_hole_punching` and `newudpport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPayload {
    pub port: u16,
}

/// Channel a message travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Unreliable,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Reliable => f.write_str("reliable"),
            Channel::Unreliable => f.write_str("unreliable"),
        }
    }
}
