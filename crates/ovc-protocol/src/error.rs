use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("unknown codec tag: 0x{0:02x}")]
    UnknownCodec(u8),

    #[error("audio payload is empty")]
    EmptyAudio,

    #[error("audio payload too large: {len} bytes (max {max})")]
    AudioTooLarge { len: usize, max: usize },

    #[error("declared length {declared} does not match remaining bytes {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_too_short_display() {
        let e = ProtocolError::PacketTooShort { expected: 26, got: 4 };
        let msg = e.to_string();
        assert!(msg.contains("26"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn unknown_packet_type_display() {
        let e = ProtocolError::UnknownPacketType(0xAB);
        assert!(e.to_string().contains("0xab"));
    }

    #[test]
    fn audio_too_large_display() {
        let e = ProtocolError::AudioTooLarge { len: 1400, max: 1000 };
        let msg = e.to_string();
        assert!(msg.contains("1400"));
        assert!(msg.contains("1000"));
    }
}
