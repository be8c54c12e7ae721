use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::watch;

use ovc_protocol::signal::ServerMessage;
use ovc_protocol::types::{PlayerId, PlayerInfo};

use crate::auth::AuthCodeStore;
use crate::config::Config;
use crate::groups::{GroupRegistry, MembershipUpdate};
use crate::position::PositionTracker;
use crate::registry::{ClientHandle, SessionRegistry};
use crate::router::AudioRouter;
use crate::webrtc::WebRtcEngine;

/// Throttle `authenticate` after this many failures per IP...
const AUTH_FAILURE_LIMIT: u32 = 5;
/// ...within this window.
const AUTH_FAILURE_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct AuthFailures {
    count: u32,
    window_start: Instant,
}

/// Everything the server is made of, constructed once in `main` so the
/// initialization order is written in one place.
pub struct ServerCtx {
    pub config: Config,
    pub auth: AuthCodeStore,
    pub positions: Arc<PositionTracker>,
    pub groups: Arc<GroupRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub router: AudioRouter,
    pub webrtc: WebRtcEngine,
    /// Players currently present in the game, fed by the game adapter.
    pub ingame: DashMap<PlayerId, String>,
    /// Held across a membership mutation and its presence fanout so every
    /// member observes `group_members_updated` events in one logical order.
    pub membership_gate: tokio::sync::Mutex<()>,
    auth_failures: DashMap<IpAddr, AuthFailures>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerCtx {
    pub fn new(config: Config) -> Result<Self> {
        let auth = AuthCodeStore::load(&config.auth_file);
        let positions = Arc::new(PositionTracker::new(&config));
        let groups = Arc::new(GroupRegistry::new(
            config.max_groups,
            config.group_max_members,
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let router = AudioRouter::new(
            &config,
            sessions.clone(),
            groups.clone(),
            positions.clone(),
        );
        let webrtc = WebRtcEngine::new(&config)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            auth,
            positions,
            groups,
            sessions,
            router,
            webrtc,
            ingame: DashMap::new(),
            membership_gate: tokio::sync::Mutex::new(()),
            auth_failures: DashMap::new(),
            shutdown_tx,
        })
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    // ── Auth failure throttling ────────────────────────────────────────

    pub fn auth_throttled(&self, ip: IpAddr) -> bool {
        match self.auth_failures.get(&ip) {
            Some(entry) => {
                entry.window_start.elapsed() < AUTH_FAILURE_WINDOW
                    && entry.count >= AUTH_FAILURE_LIMIT
            }
            None => false,
        }
    }

    pub fn record_auth_failure(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut entry = self.auth_failures.entry(ip).or_insert(AuthFailures {
            count: 0,
            window_start: now,
        });
        if entry.window_start.elapsed() >= AUTH_FAILURE_WINDOW {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
    }

    pub fn clear_auth_failures(&self, ip: IpAddr) {
        self.auth_failures.remove(&ip);
    }

    // ── Presence fanout ────────────────────────────────────────────────

    pub async fn player_info(&self, handle: &ClientHandle) -> PlayerInfo {
        handle.info(self.groups.group_of(&handle.player_id).await)
    }

    pub async fn player_list(&self) -> Vec<PlayerInfo> {
        let mut players = Vec::new();
        for handle in self.sessions.all() {
            players.push(self.player_info(&handle).await);
        }
        players.sort_by(|a, b| a.username.cmp(&b.username));
        players
    }

    pub async fn broadcast_group_list(&self) {
        let groups = self.groups.list().await;
        self.sessions
            .broadcast(&ServerMessage::GroupList { groups }, None)
            .await;
    }

    /// After any membership change: `group_members_updated` to each current
    /// member, then a `group_list` refresh for everyone.
    pub async fn fanout_membership(&self, update: &MembershipUpdate) {
        if !update.destroyed {
            let mut members = Vec::with_capacity(update.members.len());
            for player in &update.members {
                if let Some(handle) = self.sessions.by_player(player) {
                    members.push(handle.info(Some(update.group_id)));
                }
            }
            let msg = ServerMessage::GroupMembersUpdated {
                group_id: update.group_id,
                members,
            };
            for player in &update.members {
                self.sessions.send_to_player(player, msg.clone()).await;
            }
        }
        self.broadcast_group_list().await;
    }

    /// Presence events go to the player's group peers, or to everyone when
    /// the player is ungrouped.
    pub async fn broadcast_presence(&self, player: PlayerId, msg: ServerMessage) {
        match self.groups.group_of(&player).await {
            Some(group_id) => {
                for member in self.groups.members(&group_id).await {
                    if member != player {
                        self.sessions.send_to_player(&member, msg.clone()).await;
                    }
                }
            }
            None => {
                let except = self.sessions.by_player(&player).map(|h| h.client_id);
                self.sessions.broadcast(&msg, except).await;
            }
        }
    }
}
