//! # Protocol Layer
//!
//! Everything above framing and below sockets.
//!
//! ## Components
//! - **Message**: the decoded message and the reserved internal actions
//! - **Dispatcher**: action name to handler routing, listener hooks and
//!   per-batch deduplication
//! - **Handshake**: identity negotiation and id generation

pub mod dispatcher;
pub mod handshake;
pub mod message;
