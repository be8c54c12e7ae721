use std::path::PathBuf;

use serde::Deserialize;

/// Resolved server configuration, loaded from `ovc.conf` (TOML).
///
/// Every key has a default so an empty file is a valid configuration. The
/// core components receive this struct fully resolved and never read files
/// or the environment themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// IP address to bind the signaling listener on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// TCP port for the signaling WebSocket (path `/voice`).
    #[serde(default = "default_signaling_port")]
    pub signaling_port: u16,

    /// Exact-match Origin allow-list for WebSocket handshakes.
    /// `"*"` accepts any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Optional UDP port for the legacy audio ingress. Absent = disabled.
    #[serde(default)]
    pub udp_port: Option<u16>,

    /// STUN server URLs handed to the ICE agent.
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,

    /// Optional TURN relay.
    #[serde(default)]
    pub turn_urls: Vec<String>,
    #[serde(default)]
    pub turn_username: String,
    #[serde(default)]
    pub turn_credential: String,

    /// Restrict ICE host candidates to this UDP port range when both ends
    /// are set. Falls back to ephemeral ports (with a warning) when the
    /// range is unusable.
    #[serde(default)]
    pub ice_port_min: Option<u16>,
    #[serde(default)]
    pub ice_port_max: Option<u16>,

    /// Hard cap on the voice proximity range, in world units.
    #[serde(default = "default_max_voice_distance")]
    pub max_voice_distance: f64,

    /// Exponent shaping distance attenuation; higher fades faster.
    #[serde(default = "default_rolloff_factor")]
    pub rolloff_factor: f64,

    /// Upper bound for `max_members` of newly created groups.
    #[serde(default = "default_group_max_members")]
    pub group_max_members: u32,

    /// Maximum number of groups that may exist at once.
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    /// Opus parameters advertised to clients. The server never decodes.
    #[serde(default = "default_opus_sample_rate")]
    pub opus_sample_rate: u32,
    #[serde(default = "default_opus_frame_ms")]
    pub opus_frame_ms: u32,
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate: u32,

    /// Close a session after this many seconds without any client frame.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Abort peer negotiation when DTLS is not up within this window.
    #[serde(default = "default_dtls_handshake_timeout_secs")]
    pub dtls_handshake_timeout_secs: u64,

    /// Disconnect authenticated clients whose player never appears in-game.
    #[serde(default = "default_pending_join_timeout_secs")]
    pub pending_join_timeout_secs: u64,

    /// Position update throttle: minimum interval per player.
    #[serde(default = "default_position_min_interval_ms")]
    pub position_min_interval_ms: u64,

    /// Position update throttle: translation that always passes.
    #[serde(default = "default_position_min_distance")]
    pub position_min_distance: f64,

    /// Position update throttle: yaw/pitch delta that always passes, degrees.
    #[serde(default = "default_position_rotation_threshold")]
    pub position_rotation_threshold: f64,

    /// Positions not refreshed within this window route as absent.
    #[serde(default = "default_position_ttl_secs")]
    pub position_ttl_secs: u64,

    /// Auth-code persistence file.
    #[serde(default = "default_auth_file")]
    pub auth_file: PathBuf,
}

fn default_bind_host() -> String {
    "0.0.0.0".into()
}
fn default_signaling_port() -> u16 {
    9090
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".into()]
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".into()]
}
fn default_max_voice_distance() -> f64 {
    100.0
}
fn default_rolloff_factor() -> f64 {
    1.5
}
fn default_group_max_members() -> u32 {
    200
}
fn default_max_groups() -> usize {
    100
}
fn default_opus_sample_rate() -> u32 {
    48_000
}
fn default_opus_frame_ms() -> u32 {
    20
}
fn default_opus_bitrate() -> u32 {
    48_000
}
fn default_idle_timeout_secs() -> u64 {
    60
}
fn default_dtls_handshake_timeout_secs() -> u64 {
    10
}
fn default_pending_join_timeout_secs() -> u64 {
    60
}
fn default_position_min_interval_ms() -> u64 {
    50
}
fn default_position_min_distance() -> f64 {
    0.25
}
fn default_position_rotation_threshold() -> f64 {
    2.0
}
fn default_position_ttl_secs() -> u64 {
    30
}
fn default_auth_file() -> PathBuf {
    "voice-chat-auth.properties".into()
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Clamp throttle knobs into their documented ranges.
    pub fn normalized(mut self) -> Self {
        self.position_min_interval_ms = self.position_min_interval_ms.min(1000);
        self.position_min_distance = self.position_min_distance.clamp(0.0, 10.0);
        self.position_rotation_threshold = self.position_rotation_threshold.clamp(0.0, 90.0);
        self.max_voice_distance = self.max_voice_distance.max(1.0);
        self.group_max_members = self.group_max_members.clamp(1, 200);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.signaling_port, 9090);
        assert_eq!(config.max_voice_distance, 100.0);
        assert_eq!(config.rolloff_factor, 1.5);
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.dtls_handshake_timeout_secs, 10);
        assert!(config.udp_port.is_none());
        assert_eq!(config.auth_file, PathBuf::from("voice-chat-auth.properties"));
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            bind_host = "127.0.0.1"
            signaling_port = 1234
            allowed_origins = ["https://voice.example.com"]
            udp_port = 24455
            ice_port_min = 50000
            ice_port_max = 50100
            max_voice_distance = 48.0
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.signaling_port, 1234);
        assert_eq!(config.udp_port, Some(24455));
        assert_eq!(config.ice_port_min, Some(50000));
        assert_eq!(config.max_voice_distance, 48.0);
        assert_eq!(
            config.allowed_origins,
            vec!["https://voice.example.com".to_string()]
        );
    }

    #[test]
    fn normalized_clamps_throttle() {
        let config: Config = toml::from_str(
            r#"
            position_min_interval_ms = 10000
            position_min_distance = 50.0
            position_rotation_threshold = 360.0
            group_max_members = 5000
        "#,
        )
        .unwrap();
        let config = config.normalized();
        assert_eq!(config.position_min_interval_ms, 1000);
        assert_eq!(config.position_min_distance, 10.0);
        assert_eq!(config.position_rotation_threshold, 90.0);
        assert_eq!(config.group_max_members, 200);
    }
}
