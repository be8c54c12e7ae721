use bytes::Bytes;
use tracing::trace;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{ClientId, CodecTag, SequenceNumber};

/// Maximum audio payload per frame. Keeps SCTP user messages safely below the
/// 1200-byte DTLS/UDP ceiling on common WAN paths.
pub const AUDIO_MTU: usize = 1000;

/// High bit of the codec byte: a 3-float relative position trails the payload.
pub const POSITION_FLAG: u8 = 0x80;

/// Audio header: tag(1) + codec(1) + sender(16) + sequence(4) + audio_len(4).
pub const AUDIO_HEADER_SIZE: usize = 26;

/// Legacy audio header without the codec byte.
pub const LEGACY_AUDIO_HEADER_SIZE: usize = 25;

/// Size of the optional trailing position: 3 big-endian f32.
pub const POSITION_SIZE: usize = 12;

const TAG_AUTH: u8 = 0x01;
const TAG_AUDIO: u8 = 0x02;
const TAG_AUTH_ACK: u8 = 0x03;
const TAG_DISCONNECT: u8 = 0x04;

/// One encoded audio frame. The payload is opaque to the server.
///
/// Wire format (big-endian):
/// ```text
/// [0x02] [codec|flag: u8] [sender: 16] [sequence: u32] [audio_len: u32]
/// [audio: audio_len bytes] [x y z: 3xf32, only if flag]
/// ```
///
/// Inbound frames carry the sender's absolute world position in the tail;
/// outbound frames carry a recipient-relative position.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub sender: ClientId,
    pub codec: CodecTag,
    pub sequence: SequenceNumber,
    pub payload: Bytes,
    pub position: Option<[f32; 3]>,
}

/// The packets exchanged over the `audio` DataChannel and the legacy UDP
/// ingress. A tagged union; the codec pattern-matches on the tag byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `[0x01][sender: 16][username_len: u32][username UTF-8]`
    Auth { sender: ClientId, username: String },
    Audio(AudioFrame),
    /// `[0x03][client_id: 16][accepted: u8][msg_len: u16][message UTF-8]`
    AuthAck {
        client_id: ClientId,
        accepted: bool,
        message: String,
    },
    /// `[0x04][client_id: 16]`
    Disconnect { client_id: ClientId },
}

impl Packet {
    /// Exact number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Auth { username, .. } => 1 + 16 + 4 + username.len(),
            Packet::Audio(frame) => {
                AUDIO_HEADER_SIZE
                    + frame.payload.len()
                    + if frame.position.is_some() { POSITION_SIZE } else { 0 }
            }
            Packet::AuthAck { message, .. } => 1 + 16 + 1 + 2 + message.len(),
            Packet::Disconnect { .. } => 1 + 16,
        }
    }

    /// Serialize into a buffer of exactly `encoded_len` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        match self {
            Packet::Auth { sender, username } => {
                buf.push(TAG_AUTH);
                buf.extend_from_slice(sender.as_bytes());
                buf.extend_from_slice(&(username.len() as u32).to_be_bytes());
                buf.extend_from_slice(username.as_bytes());
            }
            Packet::Audio(frame) => {
                buf.push(TAG_AUDIO);
                let mut codec = frame.codec as u8;
                if frame.position.is_some() {
                    codec |= POSITION_FLAG;
                }
                buf.push(codec);
                buf.extend_from_slice(frame.sender.as_bytes());
                buf.extend_from_slice(&frame.sequence.to_be_bytes());
                buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(&frame.payload);
                if let Some([x, y, z]) = frame.position {
                    buf.extend_from_slice(&x.to_be_bytes());
                    buf.extend_from_slice(&y.to_be_bytes());
                    buf.extend_from_slice(&z.to_be_bytes());
                }
            }
            Packet::AuthAck {
                client_id,
                accepted,
                message,
            } => {
                buf.push(TAG_AUTH_ACK);
                buf.extend_from_slice(client_id.as_bytes());
                buf.push(u8::from(*accepted));
                buf.extend_from_slice(&(message.len() as u16).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
            }
            Packet::Disconnect { client_id } => {
                buf.push(TAG_DISCONNECT);
                buf.extend_from_slice(client_id.as_bytes());
            }
        }
        buf
    }

    /// Deserialize a packet from raw bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let tag = *data.first().ok_or(ProtocolError::PacketTooShort {
            expected: 1,
            got: 0,
        })?;

        match tag {
            TAG_AUTH => decode_auth(data),
            TAG_AUDIO => decode_audio(data),
            TAG_AUTH_ACK => decode_auth_ack(data),
            TAG_DISCONNECT => decode_disconnect(data),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

fn read_uuid(data: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&data[..16]);
    Uuid::from_bytes(raw)
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn decode_auth(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < 21 {
        return Err(ProtocolError::PacketTooShort {
            expected: 21,
            got: data.len(),
        });
    }
    let sender = read_uuid(&data[1..]);
    let len = read_u32(&data[17..]) as usize;
    let rest = &data[21..];
    if rest.len() != len {
        return Err(ProtocolError::LengthMismatch {
            declared: len,
            actual: rest.len(),
        });
    }
    let username = String::from_utf8(rest.to_vec())?;
    Ok(Packet::Auth { sender, username })
}

fn decode_audio(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < 2 {
        return Err(ProtocolError::PacketTooShort {
            expected: AUDIO_HEADER_SIZE,
            got: data.len(),
        });
    }

    // A recognized codec byte (with or without the position flag) marks the
    // current layout. Anything else is the legacy variant, which starts the
    // sender id directly after the tag and never carries a position.
    let codec_byte = data[1];
    let (codec, has_position, header, body_at) =
        match CodecTag::from_byte(codec_byte & !POSITION_FLAG) {
            Some(codec) => (
                codec,
                codec_byte & POSITION_FLAG != 0,
                AUDIO_HEADER_SIZE,
                2usize,
            ),
            None => {
                trace!("legacy audio packet without codec byte");
                (CodecTag::Opus, false, LEGACY_AUDIO_HEADER_SIZE, 1usize)
            }
        };

    if data.len() < header {
        return Err(ProtocolError::PacketTooShort {
            expected: header,
            got: data.len(),
        });
    }

    let sender = read_uuid(&data[body_at..]);
    let sequence = read_u32(&data[body_at + 16..]);
    let audio_len = read_u32(&data[body_at + 20..]) as usize;

    if audio_len == 0 {
        return Err(ProtocolError::EmptyAudio);
    }
    if audio_len > AUDIO_MTU {
        return Err(ProtocolError::AudioTooLarge {
            len: audio_len,
            max: AUDIO_MTU,
        });
    }

    let rest = &data[header..];
    let expected = audio_len + if has_position { POSITION_SIZE } else { 0 };
    if rest.len() != expected {
        return Err(ProtocolError::LengthMismatch {
            declared: expected,
            actual: rest.len(),
        });
    }

    let payload = Bytes::copy_from_slice(&rest[..audio_len]);
    let position = has_position.then(|| {
        let tail = &rest[audio_len..];
        [
            f32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]),
            f32::from_be_bytes([tail[4], tail[5], tail[6], tail[7]]),
            f32::from_be_bytes([tail[8], tail[9], tail[10], tail[11]]),
        ]
    });

    Ok(Packet::Audio(AudioFrame {
        sender,
        codec,
        sequence,
        payload,
        position,
    }))
}

fn decode_auth_ack(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < 20 {
        return Err(ProtocolError::PacketTooShort {
            expected: 20,
            got: data.len(),
        });
    }
    let client_id = read_uuid(&data[1..]);
    let accepted = data[17] != 0;
    let msg_len = u16::from_be_bytes([data[18], data[19]]) as usize;
    let rest = &data[20..];
    if rest.len() != msg_len {
        return Err(ProtocolError::LengthMismatch {
            declared: msg_len,
            actual: rest.len(),
        });
    }
    let message = String::from_utf8(rest.to_vec())?;
    Ok(Packet::AuthAck {
        client_id,
        accepted,
        message,
    })
}

fn decode_disconnect(data: &[u8]) -> Result<Packet, ProtocolError> {
    if data.len() < 17 {
        return Err(ProtocolError::PacketTooShort {
            expected: 17,
            got: data.len(),
        });
    }
    Ok(Packet::Disconnect {
        client_id: read_uuid(&data[1..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(position: Option<[f32; 3]>) -> AudioFrame {
        AudioFrame {
            sender: Uuid::new_v4(),
            codec: CodecTag::Opus,
            sequence: 42,
            payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
            position,
        }
    }

    #[test]
    fn roundtrip_audio_without_position() {
        let original = Packet::Audio(frame(None));
        let bytes = original.encode();
        assert_eq!(bytes.len(), original.encoded_len());
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn roundtrip_audio_with_position() {
        let original = Packet::Audio(frame(Some([1.5, -2.0, 300.25])));
        let bytes = original.encode();
        assert_eq!(bytes.len(), original.encoded_len());
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn position_flag_set_on_wire() {
        let with_pos = Packet::Audio(frame(Some([0.0, 0.0, 0.0]))).encode();
        let without = Packet::Audio(frame(None)).encode();
        assert_eq!(with_pos[1] & POSITION_FLAG, POSITION_FLAG);
        assert_eq!(without[1] & POSITION_FLAG, 0);
    }

    #[test]
    fn roundtrip_pcm_codec() {
        let mut f = frame(None);
        f.codec = CodecTag::Pcm;
        let decoded = Packet::decode(&Packet::Audio(f.clone()).encode()).unwrap();
        match decoded {
            Packet::Audio(d) => assert_eq!(d.codec, CodecTag::Pcm),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn legacy_audio_without_codec_byte() {
        // [0x02][sender:16][seq:u32][len:u32][audio]; the first sender byte is
        // forced outside the recognized codec range so the decoder takes the
        // legacy path.
        let mut sender_raw = [0x42u8; 16];
        sender_raw[0] = 0x77;
        let sender = Uuid::from_bytes(sender_raw);
        let mut buf = vec![0x02];
        buf.extend_from_slice(sender.as_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&[9, 9, 9]);

        match Packet::decode(&buf).unwrap() {
            Packet::Audio(f) => {
                assert_eq!(f.sender, sender);
                assert_eq!(f.codec, CodecTag::Opus);
                assert_eq!(f.sequence, 7);
                assert_eq!(&f.payload[..], &[9, 9, 9]);
                assert!(f.position.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn empty_audio_rejected() {
        let mut f = frame(None);
        f.payload = Bytes::new();
        let bytes = Packet::Audio(f).encode();
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::EmptyAudio)
        ));
    }

    #[test]
    fn oversized_audio_rejected() {
        let mut f = frame(None);
        f.payload = Bytes::from(vec![0u8; AUDIO_MTU + 1]);
        let bytes = Packet::Audio(f).encode();
        assert!(matches!(
            Packet::decode(&bytes),
            Err(ProtocolError::AudioTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_audio_rejected() {
        let bytes = Packet::Audio(frame(None)).encode();
        assert!(Packet::decode(&bytes[..bytes.len() - 2]).is_err());
        assert!(Packet::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn missing_position_tail_rejected() {
        let bytes = Packet::Audio(frame(Some([1.0, 2.0, 3.0]))).encode();
        let truncated = &bytes[..bytes.len() - POSITION_SIZE];
        assert!(matches!(
            Packet::decode(truncated),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn roundtrip_auth() {
        let original = Packet::Auth {
            sender: Uuid::new_v4(),
            username: "alice".into(),
        };
        let decoded = Packet::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn roundtrip_auth_ack() {
        let original = Packet::AuthAck {
            client_id: Uuid::new_v4(),
            accepted: true,
            message: "welcome".into(),
        };
        let bytes = original.encode();
        assert_eq!(bytes.len(), original.encoded_len());
        assert_eq!(Packet::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn roundtrip_auth_ack_rejected() {
        let original = Packet::AuthAck {
            client_id: Uuid::new_v4(),
            accepted: false,
            message: "bad code".into(),
        };
        assert_eq!(Packet::decode(&original.encode()).unwrap(), original);
    }

    #[test]
    fn roundtrip_disconnect() {
        let original = Packet::Disconnect {
            client_id: Uuid::new_v4(),
        };
        let bytes = original.encode();
        assert_eq!(bytes.len(), 17);
        assert_eq!(Packet::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            Packet::decode(&[0x7F, 0, 0]),
            Err(ProtocolError::UnknownPacketType(0x7F))
        ));
    }

    #[test]
    fn empty_input_rejected() {
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn max_sequence_roundtrip() {
        let mut f = frame(None);
        f.sequence = u32::MAX;
        match Packet::decode(&Packet::Audio(f).encode()).unwrap() {
            Packet::Audio(d) => assert_eq!(d.sequence, u32::MAX),
            _ => panic!("wrong variant"),
        }
    }
}
