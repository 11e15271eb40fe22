//! # dualnet
//!
//! A game-networking transport that pairs a reliable ordered channel (TCP)
//! with an unreliable low-latency channel (UDP) into one session per peer.
//!
//! ## Features
//! - **Sentinel framing**: `\0+++\0 {json} \0---\0`, decoded lazily with an
//!   accumulation buffer so frames split across reads survive
//! - **Identity handshake**: peers negotiate a human-readable id that is
//!   unique among active connections
//! - **Hole punching**: periodic keep-alive datagrams open NAT mappings and
//!   follow port re-binding
//! - **Action dispatch**: handlers are keyed by action name; within one
//!   read only the first message of each action is dispatched
//!
//! ## Example
//! ```rust,no_run
//! use dualnet::Session;
//!
//! # async fn run() -> dualnet::Result<()> {
//! let client = Session::builder().build()?;
//! client.dispatcher().register("gotit", |_ctx, data| {
//!     println!("server says {data}");
//!     Ok(())
//! })?;
//!
//! let id = client.connect("127.0.0.1:31426").await?;
//! client.send("hello", &[1, 2, 3, 4, 5], Some(&id))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::dispatcher::{Channels, Dispatcher, HandlerContext, SessionListener};
pub use protocol::message::{Channel, Message};
pub use service::session::{LocalAddrs, Session, SessionBuilder};
