use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use ovc_protocol::packet::{AudioFrame, Packet, POSITION_SIZE};
use ovc_protocol::types::{ClientId, PlayerId};

use crate::config::Config;
use crate::groups::{GroupRegistry, Membership, RouteGroup, RoutingSnapshot};
use crate::position::{distance, Position, PositionTracker};
use crate::registry::{SendResult, SessionRegistry};

/// Distance attenuation: `clamp(0, 1, (1 - d/max)^k)`. Exactly 0 at and
/// beyond `max_distance`, exactly 1 at zero distance.
pub fn rolloff(d: f64, max_distance: f64, k: f64) -> f64 {
    if d <= 0.0 {
        return 1.0;
    }
    if d >= max_distance {
        return 0.0;
    }
    (1.0 - d / max_distance).powf(k).clamp(0.0, 1.0)
}

/// Per-recipient delivery plan: deliver or not, the attenuation the receiver
/// should end up with, and the recipient-relative position to append.
///
/// The transport carries opaque payloads, so the gain is not applied
/// server-side; it decides delivery, and receivers derive the same value
/// from the relative position.
struct Delivery {
    position: Option<[f32; 3]>,
    #[allow(dead_code)]
    gain: f64,
}

/// The single fan-out point. For every inbound audio frame it computes the
/// recipient set and per-recipient transform, then hands the frame to each
/// recipient's transport. Never buffers: congested recipients lose the frame.
pub struct AudioRouter {
    sessions: Arc<SessionRegistry>,
    groups: Arc<GroupRegistry>,
    positions: Arc<PositionTracker>,
    max_voice_distance: f64,
    rolloff_factor: f64,
    proximity_overrides: DashMap<PlayerId, f64>,
}

impl AudioRouter {
    pub fn new(
        config: &Config,
        sessions: Arc<SessionRegistry>,
        groups: Arc<GroupRegistry>,
        positions: Arc<PositionTracker>,
    ) -> Self {
        Self {
            sessions,
            groups,
            positions,
            max_voice_distance: config.max_voice_distance,
            rolloff_factor: config.rolloff_factor,
            proximity_overrides: DashMap::new(),
        }
    }

    /// Admin per-player proximity override, in world units.
    pub fn set_proximity_override(&self, player: PlayerId, meters: Option<f64>) {
        match meters {
            Some(m) => {
                self.proximity_overrides.insert(player, m);
            }
            None => {
                self.proximity_overrides.remove(&player);
            }
        }
    }

    /// Effective proximity range for a sender: admin override beats group
    /// override beats the default, all bounded by the hard cap.
    fn effective_range(&self, sender: &PlayerId, group: Option<&RouteGroup>) -> f64 {
        let base = self
            .proximity_overrides
            .get(sender)
            .map(|m| *m)
            .or_else(|| group.and_then(|g| g.proximity_override))
            .unwrap_or(self.max_voice_distance);
        base.clamp(0.0, self.max_voice_distance)
    }

    /// Route one inbound frame from `sender`. Per-sender frame order is the
    /// caller's responsibility (one routing call at a time per sender); this
    /// method preserves it by sending synchronously.
    pub async fn route(&self, sender: ClientId, frame: AudioFrame) {
        let Some(sender_handle) = self.sessions.get(&sender) else {
            return;
        };
        if sender_handle.server_muted.load(Ordering::Relaxed) {
            return;
        }

        let sender_player = sender_handle.player_id;
        let sender_pos = self.positions.get(&sender_player);
        let snapshot = self.groups.routing_snapshot(&sender_player).await;
        let range = self.effective_range(&sender_player, snapshot.sender_group.as_ref());

        // One base buffer for recipients without a position, one positional
        // buffer whose 12-byte tail is patched per recipient.
        let mut base: Option<Bytes> = None;
        let mut pos_buf: Option<Vec<u8>> = None;

        for recipient in self.sessions.all() {
            if recipient.client_id == sender {
                continue;
            }
            let Some(sink) = recipient.audio_sink().await else {
                continue;
            };
            if !sink.is_open() {
                continue;
            }

            let recipient_pos = self.positions.get(&recipient.player_id);
            let Some(delivery) = self.plan(
                &snapshot,
                &recipient.player_id,
                sender_pos.as_ref(),
                recipient_pos.as_ref(),
                range,
            ) else {
                continue;
            };

            let packet = match delivery.position {
                None => base
                    .get_or_insert_with(|| {
                        Bytes::from(
                            Packet::Audio(AudioFrame {
                                position: None,
                                ..frame.clone()
                            })
                            .encode(),
                        )
                    })
                    .clone(),
                Some(rel) => {
                    let buf = pos_buf.get_or_insert_with(|| {
                        Packet::Audio(AudioFrame {
                            position: Some([0.0; 3]),
                            ..frame.clone()
                        })
                        .encode()
                    });
                    let at = buf.len() - POSITION_SIZE;
                    buf[at..at + 4].copy_from_slice(&rel[0].to_be_bytes());
                    buf[at + 4..at + 8].copy_from_slice(&rel[1].to_be_bytes());
                    buf[at + 8..at + 12].copy_from_slice(&rel[2].to_be_bytes());
                    Bytes::copy_from_slice(buf)
                }
            };

            match sink.send(packet).await {
                SendResult::Ok => {}
                SendResult::Backpressure => {
                    if recipient.note_drop() {
                        warn!(
                            client = %recipient.client_id,
                            dropped = recipient.dropped_frames.load(Ordering::Relaxed),
                            "dropping audio for congested recipient"
                        );
                    }
                }
                SendResult::Closed => {
                    recipient.note_drop();
                    debug!(client = %recipient.client_id, "recipient transport closed mid-route");
                }
            }
        }
    }

    /// Decide delivery and transform for one recipient, or `None` to skip.
    fn plan(
        &self,
        snapshot: &RoutingSnapshot,
        recipient: &PlayerId,
        sender_pos: Option<&Position>,
        recipient_pos: Option<&Position>,
        range: f64,
    ) -> Option<Delivery> {
        let same_group = snapshot
            .sender_group
            .as_ref()
            .is_some_and(|g| g.members.contains(recipient));

        if let Some(group) = &snapshot.sender_group {
            if same_group {
                return self.plan_group_member(group, sender_pos, recipient_pos, range);
            }
            if group.is_isolated {
                return None;
            }
            // Non-isolated group: spills over to ungrouped players nearby.
            if snapshot.membership_of(recipient) != Membership::Ungrouped {
                return None;
            }
            return self.plan_proximity(sender_pos, recipient_pos, range);
        }

        // Ungrouped sender: reaches ungrouped players and members of
        // non-isolated groups, by proximity.
        if let Membership::Grouped { isolated: true } = snapshot.membership_of(recipient) {
            return None;
        }
        self.plan_proximity(sender_pos, recipient_pos, range)
    }

    fn plan_group_member(
        &self,
        group: &RouteGroup,
        sender_pos: Option<&Position>,
        recipient_pos: Option<&Position>,
        range: f64,
    ) -> Option<Delivery> {
        let relative = relative_position(sender_pos, recipient_pos);

        if group.global_voice {
            if !group.spatial {
                return Some(Delivery {
                    position: None,
                    gain: group.min_volume.max(1.0),
                });
            }
            // Spatial group voice: attenuate by distance but floor at the
            // group's minimum, and never drop.
            let gain = match (sender_pos, recipient_pos) {
                (Some(s), Some(r)) => {
                    rolloff(distance(s, r), range, self.rolloff_factor).max(group.min_volume)
                }
                _ => 1.0,
            };
            return Some(Delivery {
                position: relative,
                gain,
            });
        }

        // Proximity-bound group: distance rules apply between members, but a
        // member without a known position stays audible.
        match (sender_pos, recipient_pos) {
            (Some(s), Some(r)) => {
                let d = distance(s, r);
                if d >= range {
                    return None;
                }
                Some(Delivery {
                    position: relative,
                    gain: rolloff(d, range, self.rolloff_factor),
                })
            }
            _ => Some(Delivery {
                position: None,
                gain: 1.0,
            }),
        }
    }

    fn plan_proximity(
        &self,
        sender_pos: Option<&Position>,
        recipient_pos: Option<&Position>,
        range: f64,
    ) -> Option<Delivery> {
        let (s, r) = (sender_pos?, recipient_pos?);
        let d = distance(s, r);
        if d >= range {
            return None;
        }
        Some(Delivery {
            position: relative_position(Some(s), Some(r)),
            gain: rolloff(d, range, self.rolloff_factor),
        })
    }
}

/// Recipient-relative position `(Sx - Rx, Sy - Ry, Sz - Rz)`, absent when
/// either side is unknown or they are in different worlds.
fn relative_position(
    sender: Option<&Position>,
    recipient: Option<&Position>,
) -> Option<[f32; 3]> {
    let (s, r) = (sender?, recipient?);
    if s.world_id != r.world_id {
        return None;
    }
    Some([
        (s.x - r.x) as f32,
        (s.y - r.y) as f32,
        (s.z - r.z) as f32,
    ])
}
