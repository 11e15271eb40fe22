//! Timeout constants and async wrappers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for establishing a reliable connection
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the identity handshake once the socket is open
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between hole-punching keep-alive datagrams
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Run `future`, mapping expiry of `duration` to `ProtocolError::Timeout`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
