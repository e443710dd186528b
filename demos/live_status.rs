//! Live connection status monitor.
//!
//! Connects to a catalog WebSocket endpoint, subscribes to material updates and prints the
//! connection stats every few seconds, the way a status indicator would.
//!
//! Run with tracing enabled:
//! ```sh
//! CATALOG_WS_URL=wss://catalog.example.com/live RUST_LOG=info,catalog_realtime=debug \
//!     cargo run --example live_status --features tracing
//! ```

use std::time::Duration;

use catalog_realtime::ws::config::{Config, HeartbeatConfig, ReconnectConfig};
use catalog_realtime::ws::{ConnectionManager, Handlers};
use serde_json::json;
use tokio::time::{interval, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::var("CATALOG_WS_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:8080/live".to_owned());

    let config = Config::builder()
        .url(url)
        .reconnect(
            ReconnectConfig::default()
                .with_backoff(Duration::from_millis(500), Duration::from_secs(10))
                .with_max_attempts(Some(10)),
        )
        .heartbeat(HeartbeatConfig::default())
        .message_queue_limit(100)
        .build();

    let manager = ConnectionManager::new(config);
    manager.set_handlers(
        Handlers::new()
            .on_open(|| info!(event = "open"))
            .on_close(|| info!(event = "close"))
            .on_error(|e| warn!(event = "error", error = %e))
            .on_reconnect(|attempt| info!(event = "reconnect", attempt))
            .on_reconnect_failed(|| warn!(event = "reconnect_failed")),
    );

    // Queued until the socket opens
    manager.send_json("material.subscribe", &json!({ "category": "timber" }))?;

    if let Err(e) = manager.connect().await {
        warn!(error = %e, "Initial connection failed, retrying in the background");
    }

    let mut updates = manager.subscribe();
    let mut ticker = interval(Duration::from_secs(5));

    for _ in 0..12 {
        ticker.tick().await;
        let stats = manager.stats();
        info!(stats = %serde_json::to_string(&stats)?);

        while let Ok(Ok(message)) = timeout(Duration::from_millis(10), updates.recv()).await {
            info!(kind = %message.kind, payload = %message.payload, "update");
        }
    }

    manager.disconnect();
    info!(state = %manager.state(), "done");

    Ok(())
}
