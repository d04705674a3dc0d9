//! Watch a Home Assistant instance through the shared caches.
//!
//! Connects, loads the entity and configuration caches, lists the dashboard
//! views and logs every snapshot and raw event for a minute.
//!
//! ```sh
//! HASS_URL=ws://localhost:8123/api/websocket HASS_TOKEN=secret \
//!     RUST_LOG=info cargo run --example watch_entities --features tracing
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use hass_ws_client::views::{extract_views, get_view_entities, split_by_groups};
use hass_ws_client::ws::{Config, Connection};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::var("HASS_URL")
        .unwrap_or_else(|_| "ws://localhost:8123/api/websocket".to_owned());
    let config = match std::env::var("HASS_TOKEN") {
        Ok(token) => Config::builder().auth_token(token).build(),
        Err(_) => Config::default(),
    };

    let connection = Connection::connect(&url, config).await?;
    info!(state = ?connection.state(), "connected");

    let _entities = connection
        .subscribe_entities(|entities| info!(count = entities.len(), "entities updated"))
        .await?;
    let _config = connection
        .subscribe_config(|config| {
            info!(
                components = config.core.components.len(),
                domains = config.services.len(),
                panels = config.panels.len(),
                "configuration updated"
            );
        })
        .await?;

    if let Some(entities) = connection.entities() {
        for view in extract_views(&entities) {
            info!(
                view = %view.entity_id,
                entities = get_view_entities(&entities, &view).len(),
                "view"
            );
        }
        let split = split_by_groups(&entities);
        info!(
            groups = split.groups.len(),
            ungrouped = split.ungrouped.len(),
            "grouping"
        );
    }

    let mut events = connection.subscribe_events(None).await?;
    let mut lifecycle = connection.lifecycle();

    let watch = async {
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => info!(event_type = %event.event_type, "event"),
                    None => break,
                },
                notification = lifecycle.recv() => match notification {
                    Ok(notification) => info!(%notification, "lifecycle"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed lifecycle notifications"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    };
    _ = timeout(Duration::from_secs(60), watch).await;

    events.unsubscribe().await?;
    connection.close();
    Ok(())
}
