use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::protocol::ServerEvent;

/// Safety cap for outgoing WebSocket messages. Oversized payloads are
/// dropped whole rather than sent partially.
pub const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Registry of connected WebSocket clients. Each client gets a writer task
/// fed through an unbounded channel; senders here never block.
pub struct ClientHub {
    next_client_id: AtomicU64,
    clients: RwLock<Vec<(u64, mpsc::UnboundedSender<Message>)>>,
}

impl ClientHub {
    pub fn new() -> Self {
        Self {
            next_client_id: AtomicU64::new(1),
            clients: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_client(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().await.push((id, tx));
        id
    }

    pub async fn remove_client(&self, client_id: u64) {
        self.clients.write().await.retain(|(id, _)| *id != client_id);
    }

    pub async fn send(&self, client_id: u64, event: &ServerEvent) {
        let Some(text) = encode(event) else { return };
        let clients = self.clients.read().await;
        if let Some((_, tx)) = clients.iter().find(|(id, _)| *id == client_id) {
            let _ = tx.send(Message::Text(text.into()));
        }
    }

    /// Sends to the most recently connected client. Turn output outlives any
    /// single connection, so events go to whoever reconnected last.
    pub async fn send_latest(&self, event: &ServerEvent) {
        let Some(text) = encode(event) else { return };
        let clients = self.clients.read().await;
        if let Some((_, tx)) = clients.last() {
            let _ = tx.send(Message::Text(text.into()));
        }
    }

    pub async fn broadcast(&self, event: &ServerEvent) {
        let Some(text) = encode(event) else { return };
        let clients = self.clients.read().await;
        for (_, tx) in clients.iter() {
            let _ = tx.send(Message::Text(text.clone().into()));
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(error) => {
            warn!(%error, "failed to serialize websocket payload");
            return None;
        }
    };
    if text.len() > MAX_WS_MESSAGE_SIZE {
        warn!(size = text.len(), "dropping oversized websocket message");
        return None;
    }
    Some(text)
}
