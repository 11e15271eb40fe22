//! # Service Layer
//!
//! The [`Session`](session::Session) handle applications hold.

pub mod session;
