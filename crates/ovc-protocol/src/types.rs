use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier assigned by the server on successful authentication.
/// Stable for the lifetime of one WebRTC session.
pub type ClientId = Uuid;

/// Identifier assigned by the game. A client maps to at most one player at a
/// time; a player may be re-bound after disconnect.
pub type PlayerId = Uuid;

/// Voice group identifier.
pub type GroupId = Uuid;

/// Sequence number for audio frames, monotonically increasing per sender.
pub type SequenceNumber = u32;

/// Audio codec carried in an audio frame. The server never inspects the
/// payload; the tag exists so receivers know how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecTag {
    Pcm = 0x00,
    Opus = 0x01,
}

impl CodecTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Pcm),
            0x01 => Some(Self::Opus),
            _ => None,
        }
    }
}

/// Settings of a voice group as submitted by a client on `create_group`.
///
/// The password travels in plaintext inside the (TLS-terminated) signaling
/// channel; the server only ever stores a hash of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    /// Restrict audio delivery strictly to group members.
    #[serde(default)]
    pub is_isolated: bool,
    /// Overrides the default proximity range for members, in world units.
    #[serde(default)]
    pub proximity_override: Option<f64>,
    #[serde(default)]
    pub password: Option<String>,
    /// Permanent groups survive becoming empty.
    #[serde(default)]
    pub permanent: bool,
    /// Members hear each other regardless of distance.
    #[serde(default = "default_true")]
    pub global_voice: bool,
    /// Apply positional attenuation between members.
    #[serde(default = "default_true")]
    pub spatial: bool,
    /// Attenuation floor for spatial group voice, in [0, 1].
    #[serde(default)]
    pub min_volume: f64,
    #[serde(default = "default_max_members")]
    pub max_members: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_members() -> u32 {
    16
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            is_isolated: false,
            proximity_override: None,
            password: None,
            permanent: false,
            global_voice: true,
            spatial: true,
            min_volume: 0.0,
            max_members: default_max_members(),
        }
    }
}

/// Public view of a group, sent to clients in `group_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub name: String,
    pub is_isolated: bool,
    pub has_password: bool,
    pub permanent: bool,
    pub member_count: u32,
    pub max_members: u32,
}

/// Public view of a connected player, sent in `player_list` and presence
/// events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub username: String,
    pub group_id: Option<GroupId>,
    pub is_muted: bool,
    #[serde(default)]
    pub is_deafened: bool,
    #[serde(default)]
    pub is_speaking: bool,
}
