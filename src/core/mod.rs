//! # Core Framing Components
//!
//! Message framing shared by both channels.
//!
//! ## Components
//! - **Frame**: sentinel encoding and pure, lazy decoding over byte slices
//! - **Codec**: Tokio decoder that carries partial frames across reads
//!
//! ## Wire Format
//! ```text
//! \0+++\0 {"action": "...", "data": ..., "_id": "..."|null} \0---\0
//! ```
//!
//! A reliable connection is a stream of such frames. A datagram carries one
//! or more whole frames; partial frames in a datagram are discarded.

pub mod codec;
pub mod frame;
