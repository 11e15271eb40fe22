//! Lobby client: says hello, chats, and streams its position.
//!
//! ```text
//! cargo run --example lobby_client -- [server-address]
//! ```

use dualnet::config::NetworkConfig;
use dualnet::utils::logging::init_logging;
use dualnet::{Channels, Session};
use serde_json::json;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> dualnet::Result<()> {
    let config = NetworkConfig::from_env()?;
    init_logging(&config.logging)?;

    let server = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.client.address.clone());
    let session = Session::builder().config(config).build()?;
    let dispatcher = session.dispatcher();

    dispatcher.register("gotit", |_ctx, data| {
        info!(%data, "Server acknowledged");
        Ok(())
    })?;
    dispatcher.register("joined", |_ctx, data| {
        info!(player = %data["id"], "Player joined");
        Ok(())
    })?;
    dispatcher.register("left", |_ctx, data| {
        info!(player = %data["id"], "Player left");
        Ok(())
    })?;
    dispatcher.register("chat", |_ctx, data| {
        info!(from = %data["from"], text = %data["text"], "Chat");
        Ok(())
    })?;
    dispatcher.register_for("position", Channels::UnreliableOnly, |_ctx, data| {
        tracing::debug!(%data, "Peer moved");
        Ok(())
    })?;

    let id = session.connect(&server).await?;
    info!(%id, %server, "Joined lobby");

    session.send("hello", &[1, 2, 3, 4, 5], Some(&id))?;
    session.send("chat", &"hi all", Some(&id))?;

    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut step = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                if !session.is_connected(&id) {
                    info!("Lost connection to lobby");
                    break;
                }
                step += 1;
                let angle = step as f32 / 10.0;
                session.send_unreliable(
                    "position",
                    &json!({ "x": angle.cos() * 5.0, "y": angle.sin() * 5.0 }),
                    Some(&id),
                )?;
            }
        }
    }

    session.close();
    Ok(())
}
