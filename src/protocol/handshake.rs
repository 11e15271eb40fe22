//! Identity negotiation.
//!
//! The client proposes human-readable candidate ids until the server finds
//! one that no active connection holds:
//!
//! ```text
//! client                                    server
//!   _check_if_id_is_available{id} ───────▶  register(id)?
//!   ◀─────────────── _send_id_proposition     taken
//!   _check_if_id_is_available{id'} ──────▶
//!   ◀──────────── _confirm_id{id', udp_port}  free, registered
//! ```
//!
//! State lives in a per-attempt [`ClientHandshake`] owned by the connection
//! that runs it, so any number of `connect` calls can negotiate at once.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{IdPayload, InternalAction, Message};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

/// Source of candidate ids.
pub type IdGenerator = Box<dyn FnMut() -> String + Send>;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively",
    "lucky", "mighty", "nimble", "proud", "quick", "quiet", "rapid", "shiny", "swift", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "cobra", "eagle", "falcon", "ferret", "gecko", "heron", "koala", "lemur",
    "lynx", "marten", "otter", "panda", "puffin", "python", "raven", "tapir", "viper", "walrus",
];

/// Random id like `swift-otter-417`.
pub fn generate_id() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("snake");
    let number: u16 = rng.random_range(0..1000);
    format!("{adjective}-{animal}-{number}")
}

/// Result of a confirmed handshake, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmed {
    pub id: String,
    /// Server's unreliable port, if it has one
    pub udp_port: Option<u16>,
}

/// Client side of one negotiation.
#[derive(Debug)]
pub struct ClientHandshake {
    candidate: String,
    attempts: u32,
    max_attempts: u32,
}

impl ClientHandshake {
    /// Begin negotiating with `candidate`; returns the state and the first message.
    #[instrument(level = "debug")]
    pub fn start(candidate: String, max_attempts: u32) -> (Self, Message) {
        let msg = check_message(&candidate);
        let state = Self {
            candidate,
            attempts: 1,
            max_attempts: max_attempts.max(1),
        };
        (state, msg)
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The server rejected the current candidate; propose `next`.
    pub fn on_proposition(&mut self, next: String) -> Result<Message> {
        if self.attempts >= self.max_attempts {
            warn!(attempts = self.attempts, "Giving up identity negotiation");
            return Err(ProtocolError::TooManyRetries(self.attempts));
        }
        debug!(rejected = %self.candidate, candidate = %next, "Candidate id taken, retrying");
        self.attempts += 1;
        self.candidate = next;
        Ok(check_message(&self.candidate))
    }

    /// The server confirmed an id.
    ///
    /// The server is authoritative: if it confirms something other than the
    /// current candidate, its id wins.
    pub fn on_confirm(&self, payload: Value) -> Result<Confirmed> {
        let confirmed: IdPayload = serde_json::from_value(payload).map_err(|_| {
            ProtocolError::HandshakeError(constants::ERR_MISSING_CONFIRMED_ID.to_string())
        })?;
        if confirmed.id != self.candidate {
            warn!(candidate = %self.candidate, confirmed = %confirmed.id, "Server confirmed a different id");
        }
        Ok(Confirmed {
            id: confirmed.id,
            udp_port: confirmed.udp_port,
        })
    }
}

/// Candidate carried by `_check_if_id_is_available`.
pub fn parse_candidate(payload: Value) -> Result<String> {
    serde_json::from_value::<IdPayload>(payload)
        .map(|p| p.id)
        .ok()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_MISSING_CANDIDATE.to_string()))
}

/// Server reply accepting `id`.
pub fn confirmation(id: &str, udp_port: Option<u16>) -> Message {
    let payload = match udp_port {
        Some(port) => json!({ "id": id, "udp_port": port }),
        None => json!({ "id": id }),
    };
    Message::new(InternalAction::ConfirmId.name(), payload).with_id(id)
}

/// Server reply rejecting the candidate.
pub fn proposition() -> Message {
    Message::new(InternalAction::IdProposition.name(), Value::Null)
}

fn check_message(candidate: &str) -> Message {
    Message::new(
        InternalAction::CheckIdAvailable.name(),
        json!({ "id": candidate }),
    )
}
