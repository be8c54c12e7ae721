use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::warn;

use ovc_protocol::signal::ServerMessage;
use ovc_protocol::types::{ClientId, PlayerId, PlayerInfo};

/// Outcome of handing a packet to a client's audio transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Ok,
    /// Transport resource exhaustion. The caller must drop, not queue.
    Backpressure,
    Closed,
}

/// The seam between the router and a client's audio transport. Implemented
/// by the WebRTC session and by test doubles.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn send(&self, packet: Bytes) -> SendResult;
    fn is_open(&self) -> bool;
}

/// Coalesce drop warnings to at most one per this window per session.
const DROP_LOG_WINDOW: Duration = Duration::from_secs(5);

/// Per-client handle owned by the session registry. The signaling task owns
/// the connection; everyone else reaches the client through this.
pub struct ClientHandle {
    pub client_id: ClientId,
    pub player_id: PlayerId,
    pub username: String,
    /// Feeds the session's single writer task; enqueue order is delivery order.
    pub control_tx: mpsc::Sender<ServerMessage>,
    /// Signals the owning session task to close, with a reason.
    close: Arc<Notify>,
    close_reason: Mutex<Option<String>>,
    /// Set once the `audio` DataChannel opens.
    audio: RwLock<Option<Arc<dyn AudioSink>>>,
    /// Admin mute pushed in from the game; drops frames at ingress.
    pub server_muted: AtomicBool,
    /// Self-reported presence flags.
    pub is_muted: AtomicBool,
    pub is_deafened: AtomicBool,
    pub is_speaking: AtomicBool,
    /// Frames dropped towards this client (backpressure or closed transport).
    pub dropped_frames: AtomicU64,
    last_drop_log: Mutex<Option<Instant>>,
}

impl ClientHandle {
    pub fn new(
        client_id: ClientId,
        player_id: PlayerId,
        username: String,
        control_tx: mpsc::Sender<ServerMessage>,
        close: Arc<Notify>,
    ) -> Self {
        Self {
            client_id,
            player_id,
            username,
            control_tx,
            close,
            close_reason: Mutex::new(None),
            audio: RwLock::new(None),
            server_muted: AtomicBool::new(false),
            is_muted: AtomicBool::new(false),
            is_deafened: AtomicBool::new(false),
            is_speaking: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            last_drop_log: Mutex::new(None),
        }
    }

    pub async fn set_audio_sink(&self, sink: Arc<dyn AudioSink>) {
        *self.audio.write().await = Some(sink);
    }

    pub async fn clear_audio_sink(&self) {
        *self.audio.write().await = None;
    }

    pub async fn audio_sink(&self) -> Option<Arc<dyn AudioSink>> {
        self.audio.read().await.clone()
    }

    /// Ask the owning session task to shut the connection down.
    pub fn request_close(&self, reason: &str) {
        let mut stored = self.close_reason.lock().unwrap();
        if stored.is_none() {
            *stored = Some(reason.to_string());
        }
        self.close.notify_one();
    }

    pub fn take_close_reason(&self) -> Option<String> {
        self.close_reason.lock().unwrap().take()
    }

    /// Count a dropped frame; returns true when the caller should log it
    /// (at most once per coalescing window).
    pub fn note_drop(&self) -> bool {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_drop_log.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < DROP_LOG_WINDOW => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn info(&self, group_id: Option<uuid::Uuid>) -> PlayerInfo {
        PlayerInfo {
            player_id: self.player_id,
            username: self.username.clone(),
            group_id,
            is_muted: self.is_muted.load(Ordering::Relaxed),
            is_deafened: self.is_deafened.load(Ordering::Relaxed),
            is_speaking: self.is_speaking.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide index of connected clients. Insertion happens on
/// `auth_success`, removal on WebSocket close. Backed by sharded maps.
pub struct SessionRegistry {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    players: DashMap<PlayerId, ClientId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            players: DashMap::new(),
        }
    }

    pub fn insert(&self, handle: Arc<ClientHandle>) {
        self.players.insert(handle.player_id, handle.client_id);
        self.clients.insert(handle.client_id, handle);
    }

    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<ClientHandle>> {
        let (_, handle) = self.clients.remove(client_id)?;
        // Only unbind the player if it still points at this client; the
        // player may have been re-bound by a newer session already.
        self.players
            .remove_if(&handle.player_id, |_, bound| bound == client_id);
        Some(handle)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientHandle>> {
        self.clients.get(client_id).map(|e| e.clone())
    }

    pub fn by_player(&self, player_id: &PlayerId) -> Option<Arc<ClientHandle>> {
        let client_id = *self.players.get(player_id)?;
        self.get(&client_id)
    }

    pub fn all(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|e| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Enqueue a message to every connected client, optionally skipping one.
    /// Sender handles are collected first so no map shard lock is held
    /// across an await.
    pub async fn broadcast(&self, msg: &ServerMessage, except: Option<ClientId>) {
        let targets: Vec<(ClientId, mpsc::Sender<ServerMessage>)> = self
            .clients
            .iter()
            .filter(|e| Some(*e.key()) != except)
            .map(|e| (*e.key(), e.control_tx.clone()))
            .collect();

        for (client_id, tx) in targets {
            if tx.send(msg.clone()).await.is_err() {
                warn!(client = %client_id, "failed to enqueue broadcast message");
            }
        }
    }

    /// Enqueue a message to one player's session, if connected.
    pub async fn send_to_player(&self, player_id: &PlayerId, msg: ServerMessage) {
        if let Some(handle) = self.by_player(player_id) {
            let _ = handle.control_tx.send(msg).await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn handle(tx: mpsc::Sender<ServerMessage>) -> Arc<ClientHandle> {
        Arc::new(ClientHandle::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "alice".into(),
            tx,
            Arc::new(Notify::new()),
        ))
    }

    #[tokio::test]
    async fn insert_lookup_remove() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let h = handle(tx);
        reg.insert(h.clone());

        assert_eq!(reg.len(), 1);
        assert!(reg.get(&h.client_id).is_some());
        assert_eq!(
            reg.by_player(&h.player_id).unwrap().client_id,
            h.client_id
        );

        let removed = reg.remove(&h.client_id).unwrap();
        assert_eq!(removed.client_id, h.client_id);
        assert!(reg.by_player(&h.player_id).is_none());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn rebound_player_survives_old_removal() {
        let reg = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let old = handle(tx.clone());
        reg.insert(old.clone());

        // Same player, new client id.
        let new = Arc::new(ClientHandle::new(
            Uuid::new_v4(),
            old.player_id,
            "alice".into(),
            tx,
            Arc::new(Notify::new()),
        ));
        reg.insert(new.clone());

        reg.remove(&old.client_id);
        assert_eq!(
            reg.by_player(&old.player_id).unwrap().client_id,
            new.client_id
        );
    }

    #[tokio::test]
    async fn broadcast_skips_excluded() {
        let reg = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = handle(tx_a);
        let b = handle(tx_b);
        reg.insert(a.clone());
        reg.insert(b.clone());

        reg.broadcast(
            &ServerMessage::Pong { timestamp: 7 },
            Some(a.client_id),
        )
        .await;

        assert!(rx_a.try_recv().is_err());
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            ServerMessage::Pong { timestamp: 7 }
        ));
    }

    #[tokio::test]
    async fn close_request_stores_first_reason() {
        let (tx, _rx) = mpsc::channel(4);
        let h = handle(tx);
        h.request_close("idle timeout");
        h.request_close("second reason");
        assert_eq!(h.take_close_reason().as_deref(), Some("idle timeout"));
    }

    #[test]
    fn drop_logging_coalesces() {
        let (tx, _rx) = mpsc::channel(4);
        let h = handle(tx);
        assert!(h.note_drop());
        assert!(!h.note_drop());
        assert!(!h.note_drop());
        assert_eq!(h.dropped_frames.load(Ordering::Relaxed), 3);
    }
}
