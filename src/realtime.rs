//! Realtime subscription to backend content changes.
//!
//! Keeps a WebSocket open against the backend's realtime endpoint and maps
//! record changes in the tour collections (hotspots, assets, playlists) to
//! refresh events, so an edit in the admin UI reaches running viewers
//! without a restart. Reconnects forever with a fixed delay.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
};
use url::Url;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Collections whose changes affect a running tour.
const WATCHED_COLLECTIONS: [&str; 3] = ["hotspots", "assets", "playlists"];

/// Events from the realtime subscription.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// Connection established.
    Connected,
    /// Connection lost.
    Disconnected,
    /// A watched collection changed for the given house, when known.
    ContentChanged { house_id: Option<u32> },
}

#[derive(Debug, Deserialize)]
struct RealtimeMessage {
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    record: Option<serde_json::Value>,
}

/// Realtime connection manager.
pub struct RealtimeManager {
    backend_url: String,
    event_tx: mpsc::Sender<RealtimeEvent>,
    is_connected: Arc<RwLock<bool>>,
}

impl RealtimeManager {
    pub fn new(backend_url: String, event_tx: mpsc::Sender<RealtimeEvent>) -> Self {
        Self {
            backend_url,
            event_tx,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }

    /// Build the WebSocket URL from the backend base URL.
    fn ws_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.backend_url).context("Invalid backend URL")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Failed to set WebSocket scheme"))?;
        url.set_path("/api/realtime");
        Ok(url)
    }

    /// Run the connect/subscribe loop until the process exits.
    pub async fn run(&self) {
        loop {
            tracing::info!("Connecting to backend realtime...");

            match self.connect_and_subscribe().await {
                Ok(()) => {
                    tracing::warn!("Realtime connection closed, reconnecting in 5s...");
                }
                Err(e) => {
                    tracing::error!("Realtime connection error: {}, reconnecting in 5s...", e);
                }
            }

            *self.is_connected.write().await = false;
            let _ = self.event_tx.send(RealtimeEvent::Disconnected).await;

            sleep(RECONNECT_DELAY).await;
        }
    }

    async fn connect_and_subscribe(&self) -> Result<()> {
        let url = self.ws_url()?;
        tracing::debug!("Connecting to: {}", url);

        let request = url.to_string().into_client_request()?;
        let (ws_stream, _response) = connect_async(request)
            .await
            .context("Failed to connect to WebSocket")?;

        let (mut write, mut read) = ws_stream.split();

        // The server opens with a client id we echo back in the subscription.
        let client_id = loop {
            if let Some(msg) = read.next().await {
                let msg = msg.context("Failed to receive message")?;
                if let Message::Text(text) = msg {
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                        if let Some(id) = json.get("clientId").and_then(|v| v.as_str()) {
                            break id.to_string();
                        }
                    }
                }
            }
        };

        tracing::debug!("Got client ID: {}", client_id);

        let subscribe_msg = serde_json::json!({
            "clientId": client_id,
            "subscriptions": WATCHED_COLLECTIONS,
        });
        write
            .send(Message::Text(subscribe_msg.to_string()))
            .await
            .context("Failed to send subscription")?;

        *self.is_connected.write().await = true;
        let _ = self.event_tx.send(RealtimeEvent::Connected).await;

        tracing::info!("Realtime connected and subscribed");

        while let Some(msg) = read.next().await {
            let msg = msg.context("Failed to receive message")?;

            match msg {
                Message::Text(text) => {
                    if let Some(event) = parse_change(&text) {
                        tracing::debug!("Realtime event: {:?}", event);
                        let _ = self.event_tx.send(event).await;
                    }
                }
                Message::Ping(data) => {
                    write
                        .send(Message::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Message::Close(_) => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Check if currently connected.
    pub async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }
}

/// Map a raw realtime message to a refresh event, if it concerns a watched
/// collection.
fn parse_change(text: &str) -> Option<RealtimeEvent> {
    let msg: RealtimeMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Failed to parse realtime message: {} - {}", e, text);
            return None;
        }
    };

    let collection = msg.collection?;
    if !WATCHED_COLLECTIONS.contains(&collection.as_str()) {
        return None;
    }
    match msg.action.as_deref() {
        Some("create") | Some("update") | Some("delete") => {}
        _ => return None,
    }

    let house_id = msg
        .record
        .as_ref()
        .and_then(|record| record.get("houseId"))
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok());

    Some(RealtimeEvent::ContentChanged { house_id })
}

/// Spawn the realtime manager as a background task.
pub fn spawn_realtime(backend_url: String) -> mpsc::Receiver<RealtimeEvent> {
    let (tx, rx) = mpsc::channel(100);

    let manager = RealtimeManager::new(backend_url, tx);

    tokio::spawn(async move {
        manager.run().await;
    });

    rx
}
