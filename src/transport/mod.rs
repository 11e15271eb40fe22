//! # Transport Layer
//!
//! ## Components
//! - **Registry**: id to connection map shared by both channels
//! - **Reliable**: TCP accept/connect, identity handshake, ordered delivery
//! - **Unreliable**: the UDP socket, hole punching, datagram resolution

pub mod registry;
pub(crate) mod reliable;
pub(crate) mod unreliable;
