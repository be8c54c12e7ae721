use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use ovc_protocol::signal::ServerMessage;
use ovc_protocol::types::{GroupInfo, GroupSettings, PlayerId};

use crate::groups::GroupError;
use crate::server::ServerCtx;

/// Initial state of a player entering the game.
#[derive(Debug, Clone)]
pub struct PlayerSpawn {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub pitch: f64,
    pub world_id: String,
}

/// Thin facade the game adapter drives. Every operation is idempotent and
/// translates to a single serialized mutation on the owning component.
pub struct ControlPlane {
    ctx: Arc<ServerCtx>,
}

impl ControlPlane {
    pub fn new(ctx: Arc<ServerCtx>) -> Self {
        Self { ctx }
    }

    /// Position sample pushed in from entity-component sampling. Throttled
    /// at the adapter edge and again by the tracker.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_position(
        &self,
        player: PlayerId,
        x: f64,
        y: f64,
        z: f64,
        yaw: f64,
        pitch: f64,
        world_id: &str,
    ) -> bool {
        self.ctx
            .positions
            .upsert(player, x, y, z, yaw, pitch, world_id)
    }

    /// A player appeared in-game; binds any waiting web session.
    pub fn on_player_join(&self, player: PlayerId, username: &str, spawn: PlayerSpawn) {
        self.ctx.ingame.insert(player, username.to_string());
        self.ctx.positions.upsert(
            player,
            spawn.x,
            spawn.y,
            spawn.z,
            spawn.yaw,
            spawn.pitch,
            &spawn.world_id,
        );
        info!(player = %player, username, "player joined the game");
    }

    /// A player left the game; their voice session ends with them.
    pub async fn on_player_leave(&self, player: PlayerId) {
        self.ctx.ingame.remove(&player);
        self.ctx.positions.remove(&player);
        if let Some(handle) = self.ctx.sessions.by_player(&player) {
            handle.request_close("player left the game");
        }
        debug!(player = %player, "player left the game");
    }

    /// Backs the `/vc login` command.
    pub fn get_or_create_code(&self, username: &str, player: PlayerId) -> String {
        self.ctx.auth.get_or_create(username, player)
    }

    pub fn reset_code(&self, username: &str, player: PlayerId) -> String {
        self.ctx.auth.reset(username, player)
    }

    pub fn validate_code(&self, username: &str, code: &str) -> bool {
        self.ctx.auth.validate(username, code)
    }

    pub fn remove_code(&self, username: &str) {
        self.ctx.auth.remove(username);
    }

    /// Create a group on a player's behalf (in-game command path).
    pub async fn create_group(
        &self,
        creator: PlayerId,
        name: &str,
        settings: GroupSettings,
    ) -> Result<GroupInfo, GroupError> {
        let _gate = self.ctx.membership_gate.lock().await;
        let (info, update, left) = self.ctx.groups.create(creator, name, settings).await?;
        if let Some(left) = left {
            self.ctx.fanout_membership(&left).await;
        }
        self.ctx
            .sessions
            .send_to_player(
                &creator,
                ServerMessage::GroupCreated {
                    group_id: info.group_id,
                    group_name: info.name.clone(),
                },
            )
            .await;
        self.ctx.fanout_membership(&update).await;
        Ok(info)
    }

    /// Replace a group's settings on the creator's behalf (in-game command
    /// path). Creator-only, enforced by the registry.
    pub async fn update_group_settings(
        &self,
        creator: PlayerId,
        group_id: ovc_protocol::types::GroupId,
        settings: GroupSettings,
    ) -> Result<GroupInfo, GroupError> {
        let info = self
            .ctx
            .groups
            .update_settings(creator, group_id, settings)
            .await?;
        self.ctx.broadcast_group_list().await;
        Ok(info)
    }

    /// Eject a player from their group. Idempotent: no group, no effect.
    pub async fn force_leave_group(&self, player: PlayerId) {
        let _gate = self.ctx.membership_gate.lock().await;
        match self.ctx.groups.leave(player).await {
            Ok(update) => {
                self.ctx
                    .sessions
                    .send_to_player(
                        &player,
                        ServerMessage::GroupLeft {
                            group_id: update.group_id,
                            member_count: update.members.len() as u32,
                        },
                    )
                    .await;
                self.ctx.fanout_membership(&update).await;
            }
            Err(GroupError::NotMember) => {}
            Err(e) => debug!(player = %player, "force leave failed: {e}"),
        }
    }

    /// Admin proximity override; `None` restores the default.
    pub fn set_proximity_override(&self, player: PlayerId, meters: Option<f64>) {
        self.ctx.router.set_proximity_override(player, meters);
    }

    pub fn clear_proximity_override(&self, player: PlayerId) {
        self.ctx.router.set_proximity_override(player, None);
    }

    /// Admin mute: the router drops the player's frames at ingress.
    pub async fn set_muted(&self, player: PlayerId, muted: bool) {
        if let Some(handle) = self.ctx.sessions.by_player(&player) {
            handle.server_muted.store(muted, Ordering::Relaxed);
            self.ctx
                .broadcast_presence(
                    player,
                    ServerMessage::UserMuted {
                        player_id: player,
                        is_muted: muted,
                    },
                )
                .await;
        }
    }

    /// Push a radar ping to one player's client.
    pub async fn send_radar_ping(&self, player: PlayerId, x: f64, y: f64, z: f64) {
        self.ctx
            .sessions
            .send_to_player(&player, ServerMessage::RadarPing { x, y, z })
            .await;
    }
}
