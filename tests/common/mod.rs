//! Shared helpers for the session integration tests.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use dualnet::config::NetworkConfig;
use dualnet::protocol::handshake::generate_id;
use dualnet::{Session, SessionListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Lifecycle events seen by a [`Recorder`].
#[derive(Debug, Default)]
pub struct Events {
    pub connected: Mutex<Vec<String>>,
    pub disconnected: Mutex<Vec<String>>,
    pub unreliable_connected: Mutex<Vec<String>>,
}

impl Events {
    pub fn connected(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().unwrap().clone()
    }

    pub fn unreliable_connected(&self) -> Vec<String> {
        self.unreliable_connected.lock().unwrap().clone()
    }
}

/// Listener that records every lifecycle hook.
pub struct Recorder(pub Arc<Events>);

impl SessionListener for Recorder {
    fn connected(&self, _session: &Session, id: &str) {
        self.0.connected.lock().unwrap().push(id.to_string());
    }

    fn disconnected(&self, _session: &Session, id: &str) {
        self.0.disconnected.lock().unwrap().push(id.to_string());
    }

    fn unreliable_connected(&self, _session: &Session, id: &str) {
        self.0.unreliable_connected.lock().unwrap().push(id.to_string());
    }
}

/// Config with ephemeral ports and a fast hole-punching interval.
pub fn test_config(hole_punch: Duration) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|config| {
        config.server.unreliable_port = 0;
        config.client.unreliable_bind = "127.0.0.1:0".to_string();
        config.client.connection_timeout = Duration::from_secs(2);
        config.client.handshake_timeout = Duration::from_secs(3);
        config.transport.hole_punch_interval = hole_punch;
    })
}

pub fn recorded_session(config: NetworkConfig) -> (Session, Arc<Events>) {
    let events = Arc::new(Events::default());
    let session = Session::builder()
        .config(config)
        .listener(Recorder(events.clone()))
        .build()
        .expect("test config is valid");
    (session, events)
}

/// Ids handed out in order, then random ones.
pub fn scripted_ids(ids: &[&str]) -> impl FnMut() -> String + Send + 'static {
    let mut ids = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .into_iter();
    move || ids.next().unwrap_or_else(generate_id)
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn wait_until<F: FnMut() -> bool>(within: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
