use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::*;

/// Maximum accepted size of one signaling message: 64 KiB.
pub const MAX_SIGNAL_MSG_SIZE: usize = 65_536;

/// Messages sent from a web client to the server over the signaling
/// WebSocket. All messages are JSON of shape `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a fresh connection.
    #[serde(rename_all = "camelCase")]
    Authenticate { username: String, auth_code: String },

    #[serde(rename_all = "camelCase")]
    CreateGroup {
        group_name: String,
        #[serde(default)]
        settings: Option<GroupSettings>,
    },

    #[serde(rename_all = "camelCase")]
    JoinGroup {
        group_id: GroupId,
        #[serde(default)]
        password: Option<String>,
    },

    LeaveGroup {},
    ListGroups {},
    ListPlayers {},

    /// Client toggled its microphone mute; forwarded to peers as presence.
    #[serde(rename_all = "camelCase")]
    UserMute { is_muted: bool },

    #[serde(rename_all = "camelCase")]
    UserDeafen { is_deafened: bool },

    #[serde(rename_all = "camelCase")]
    UserSpeaking { is_speaking: bool },

    Ping { timestamp: u64 },

    WebrtcOffer { sdp: String },

    /// Trickled ICE candidate. A terminal `{complete: true}` without a
    /// candidate marks end-of-candidates.
    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        #[serde(default)]
        candidate: Option<String>,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        #[serde(default)]
        complete: bool,
    },

    /// Hint that ICE is connected and the client is opening the channel.
    StartDataChannel {},

    Disconnect {},
}

/// Messages sent from the server to a web client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AuthSuccess { client_id: ClientId, username: String },

    Error { message: String },

    #[serde(rename_all = "camelCase")]
    GroupCreated { group_id: GroupId, group_name: String },

    #[serde(rename_all = "camelCase")]
    GroupJoined { group_id: GroupId },

    #[serde(rename_all = "camelCase")]
    GroupLeft {
        group_id: GroupId,
        member_count: u32,
    },

    GroupList { groups: Vec<GroupInfo> },

    PlayerList { players: Vec<PlayerInfo> },

    #[serde(rename_all = "camelCase")]
    GroupMembersUpdated {
        group_id: GroupId,
        members: Vec<PlayerInfo>,
    },

    PlayerJoined { player: PlayerInfo },

    #[serde(rename_all = "camelCase")]
    PlayerLeft { player_id: PlayerId },

    #[serde(rename_all = "camelCase")]
    UserMuted { player_id: PlayerId, is_muted: bool },

    #[serde(rename_all = "camelCase")]
    UserDeafened {
        player_id: PlayerId,
        is_deafened: bool,
    },

    #[serde(rename_all = "camelCase")]
    UserSpeaking {
        player_id: PlayerId,
        is_speaking: bool,
    },

    Pong { timestamp: u64 },

    WebrtcAnswer { sdp: String },

    #[serde(rename_all = "camelCase")]
    WebrtcIceCandidate {
        #[serde(default)]
        candidate: Option<String>,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default, rename = "sdpMLineIndex")]
        sdp_mline_index: Option<u16>,
        #[serde(default)]
        complete: bool,
    },

    /// Pushed by the game to highlight a position on the client's radar.
    RadarPing { x: f64, y: f64, z: f64 },

    /// The peer transport is gone; the client may renegotiate.
    Disconnected { reason: String },
}

pub fn encode_server_msg(msg: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

pub fn decode_client_msg(raw: &str) -> Result<ClientMessage, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn decode_authenticate() {
        let raw = r#"{"type":"authenticate","data":{"username":"alice","authCode":"ABCDEF"}}"#;
        match decode_client_msg(raw).unwrap() {
            ClientMessage::Authenticate {
                username,
                auth_code,
            } => {
                assert_eq!(username, "alice");
                assert_eq!(auth_code, "ABCDEF");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decode_create_group_without_settings() {
        let raw = r#"{"type":"create_group","data":{"groupName":"party"}}"#;
        match decode_client_msg(raw).unwrap() {
            ClientMessage::CreateGroup {
                group_name,
                settings,
            } => {
                assert_eq!(group_name, "party");
                assert!(settings.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decode_empty_data_messages() {
        let raw = r#"{"type":"leave_group","data":{}}"#;
        assert!(matches!(
            decode_client_msg(raw).unwrap(),
            ClientMessage::LeaveGroup {}
        ));
        let raw = r#"{"type":"list_players","data":{}}"#;
        assert!(matches!(
            decode_client_msg(raw).unwrap(),
            ClientMessage::ListPlayers {}
        ));
    }

    #[test]
    fn decode_terminal_ice_candidate() {
        let raw = r#"{"type":"webrtc_ice_candidate","data":{"complete":true}}"#;
        match decode_client_msg(raw).unwrap() {
            ClientMessage::WebrtcIceCandidate {
                candidate,
                complete,
                ..
            } => {
                assert!(candidate.is_none());
                assert!(complete);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decode_trickled_ice_candidate() {
        let raw = r#"{"type":"webrtc_ice_candidate","data":{"candidate":"candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        match decode_client_msg(raw).unwrap() {
            ClientMessage::WebrtcIceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                complete,
            } => {
                assert!(candidate.unwrap().starts_with("candidate:"));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
                assert_eq!(sdp_mline_index, Some(0));
                assert!(!complete);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn encode_auth_success_shape() {
        let id = Uuid::new_v4();
        let json = encode_server_msg(&ServerMessage::AuthSuccess {
            client_id: id,
            username: "alice".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "auth_success");
        assert_eq!(value["data"]["clientId"], id.to_string());
        assert_eq!(value["data"]["username"], "alice");
    }

    #[test]
    fn encode_pong_echoes_timestamp() {
        let json = encode_server_msg(&ServerMessage::Pong { timestamp: 1234 }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["data"]["timestamp"], 1234);
    }

    #[test]
    fn encode_group_left_shape() {
        let id = Uuid::new_v4();
        let json = encode_server_msg(&ServerMessage::GroupLeft {
            group_id: id,
            member_count: 2,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "group_left");
        assert_eq!(value["data"]["memberCount"], 2);
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(decode_client_msg("{not json").is_err());
        assert!(decode_client_msg(r#"{"type":"no_such_message","data":{}}"#).is_err());
    }

    #[test]
    fn roundtrip_webrtc_offer() {
        let raw = r#"{"type":"webrtc_offer","data":{"sdp":"v=0\r\n"}}"#;
        match decode_client_msg(raw).unwrap() {
            ClientMessage::WebrtcOffer { sdp } => assert!(sdp.starts_with("v=0")),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
