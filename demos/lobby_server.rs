//! Lobby server: greets clients, relays chat reliably and positions unreliably.
//!
//! ```text
//! cargo run --example lobby_server -- [config.toml]
//! ```

use dualnet::config::NetworkConfig;
use dualnet::utils::logging::init_logging;
use dualnet::{Channels, Session, SessionListener};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};

struct Lobby;

impl SessionListener for Lobby {
    fn connected(&self, session: &Session, id: &str) {
        if let Err(e) = session.send("joined", &json!({ "id": id }), None) {
            error!(error = %e, "Failed to announce player");
        }
    }

    fn disconnected(&self, session: &Session, id: &str) {
        let _ = session.send("left", &json!({ "id": id }), None);
    }

    fn unreliable_connected(&self, _session: &Session, id: &str) {
        info!(%id, "Player can now stream positions");
    }
}

#[derive(Debug, Deserialize)]
struct Position {
    x: f32,
    y: f32,
}

fn load_config() -> dualnet::Result<NetworkConfig> {
    match std::env::args().nth(1) {
        Some(path) => NetworkConfig::from_file(path),
        None => NetworkConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> dualnet::Result<()> {
    let config = load_config()?;
    init_logging(&config.logging)?;

    let bind = config.server.address.clone();
    let session = Session::builder().config(config).listener(Lobby).build()?;
    let dispatcher = session.dispatcher();

    dispatcher.register("hello", |ctx, data| {
        let count = data.as_array().map(Vec::len).unwrap_or_default();
        ctx.reply("gotit", &format!("Yeah, we got it: {count} elements"))
    })?;

    dispatcher.register_for("chat", Channels::ReliableOnly, |ctx, data| {
        ctx.session
            .send("chat", &json!({ "from": ctx.id, "text": data }), None)
    })?;

    dispatcher.register_typed("position", |ctx, pos: Position| {
        let update = json!({ "id": ctx.id, "x": pos.x, "y": pos.y });
        for id in ctx.session.connected_ids() {
            if id != ctx.id {
                ctx.session.send_unreliable("position", &update, Some(&id))?;
            }
        }
        Ok(())
    })?;

    dispatcher.register("_hole_punching", |ctx, data: Value| {
        tracing::trace!(id = ctx.id, ?data, "Keep-alive");
        Ok(())
    })?;

    let addr = session.listen(&bind).await?;
    info!(%addr, "Lobby open");

    let mut report = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => session.metrics().log_metrics(),
        }
    }

    info!("Shutting down lobby");
    session.close();
    Ok(())
}
