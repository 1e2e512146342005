//! Typed length-prefixed envelopes for the overlay wire protocol.
//!
//! Layout: `[1 byte type][4 bytes big-endian length][N bytes payload]`.
//! Payloads are MessagePack maps (field names preserved), so peers running
//! older schemas can decode newer envelopes — unknown fields are ignored.
//!
//! Decoding errors are fatal for the stream that produced them. They are
//! never retried and never answered in-band.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope header: type byte + u32 payload length.
pub const HEADER_SIZE: usize = 5;

/// Hard cap on a single payload. Oversize is a protocol violation.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// Wire-level message types. Hex values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    TextMessage = 0x01,
    TextEdit = 0x02,
    TextDelete = 0x03,
    VoiceStart = 0x10,
    VoiceData = 0x11,
    VoiceStop = 0x12,
    VoiceState = 0x13,
    FileOffer = 0x20,
    FileAccept = 0x21,
    FileChunk = 0x22,
    FileComplete = 0x23,
    ServerSync = 0x30,
    Presence = 0x31,
    TypingStart = 0x32,
    TypingStop = 0x33,
    Ping = 0xFE,
    Pong = 0xFF,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::TextMessage,
            0x02 => Self::TextEdit,
            0x03 => Self::TextDelete,
            0x10 => Self::VoiceStart,
            0x11 => Self::VoiceData,
            0x12 => Self::VoiceStop,
            0x13 => Self::VoiceState,
            0x20 => Self::FileOffer,
            0x21 => Self::FileAccept,
            0x22 => Self::FileChunk,
            0x23 => Self::FileComplete,
            0x30 => Self::ServerSync,
            0x31 => Self::Presence,
            0x32 => Self::TypingStart,
            0x33 => Self::TypingStop,
            0xFE => Self::Ping,
            0xFF => Self::Pong,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error("truncated envelope: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("payload decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// A decoded envelope: type tag plus the raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Deserialize the payload into a concrete schema struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// Encode a typed payload into a framed envelope.
pub fn encode<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Vec<u8>, WireError> {
    // to_vec_named keeps field names so decoders can skip unknown fields.
    let body = rmp_serde::to_vec_named(payload)?;
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.push(msg_type.as_u8());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode one envelope from `buf`. Reads exactly `HEADER_SIZE + length`
/// bytes; anything shorter is a truncation error.
pub fn decode(buf: &[u8]) -> Result<Envelope, WireError> {
    if buf.len() < HEADER_SIZE {
        return Err(WireError::Truncated {
            need: HEADER_SIZE,
            have: buf.len(),
        });
    }
    let msg_type = MessageType::from_u8(buf[0]).ok_or(WireError::UnknownType(buf[0]))?;
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(len));
    }
    let need = HEADER_SIZE + len;
    if buf.len() < need {
        return Err(WireError::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(Envelope {
        msg_type,
        payload: buf[HEADER_SIZE..need].to_vec(),
    })
}

/// Write one envelope to an async stream.
pub async fn write_envelope<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read exactly one envelope from an async stream: the 5-byte header, then
/// exactly `length` payload bytes. A stream that ends early yields an
/// `UnexpectedEof` read error; an oversize length claim is rejected before
/// any payload is read.
pub async fn read_envelope<R>(reader: &mut R) -> std::io::Result<Envelope>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let msg_type = MessageType::from_u8(header[0]).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, WireError::UnknownType(header[0]))
    })?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            WireError::PayloadTooLarge(len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Envelope { msg_type, payload })
}

// ── Payload schemas ────────────────────────────────────────────────────
//
// Each message type carries a fixed schema. Decoders ignore fields they
// don't know about, so adding a field is not a breaking change.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub sent_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub edited_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelete {
    pub id: String,
    pub channel: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStart {
    pub channel: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceData {
    pub channel: String,
    pub sender: String,
    pub seq: u32,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStop {
    pub channel: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    pub channel: String,
    pub sender: String,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub transfer_id: String,
    pub sender: String,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccept {
    pub transfer_id: String,
    pub receiver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: String,
    pub seq: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComplete {
    pub transfer_id: String,
    pub chunks: u32,
}

/// Snapshot of guild/channel metadata pushed between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSync {
    pub server_id: String,
    pub name: String,
    pub channels: Vec<String>,
    pub synced_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user: String,
    pub online: bool,
    pub seen_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    pub channel: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_text_message() {
        let msg = TextMessage {
            id: "01ABC".into(),
            channel: "general".into(),
            sender: "peer-a".into(),
            content: "hello".into(),
            sent_at: 1_700_000_000_000,
        };
        let bytes = encode(MessageType::TextMessage, &msg).unwrap();
        assert_eq!(bytes[0], 0x01);

        let env = decode(&bytes).unwrap();
        assert_eq!(env.msg_type, MessageType::TextMessage);
        assert_eq!(env.payload_as::<TextMessage>().unwrap(), msg);
    }

    #[test]
    fn roundtrip_every_type() {
        let cases: Vec<(MessageType, Vec<u8>)> = vec![
            (
                MessageType::TextEdit,
                encode(
                    MessageType::TextEdit,
                    &TextEdit {
                        id: "1".into(),
                        channel: "c".into(),
                        sender: "s".into(),
                        content: "x".into(),
                        edited_at: 2,
                    },
                )
                .unwrap(),
            ),
            (
                MessageType::TextDelete,
                encode(
                    MessageType::TextDelete,
                    &TextDelete {
                        id: "1".into(),
                        channel: "c".into(),
                        sender: "s".into(),
                    },
                )
                .unwrap(),
            ),
            (
                MessageType::VoiceData,
                encode(
                    MessageType::VoiceData,
                    &VoiceData {
                        channel: "c".into(),
                        sender: "s".into(),
                        seq: 7,
                        frame: vec![0, 1, 2, 255],
                    },
                )
                .unwrap(),
            ),
            (
                MessageType::FileChunk,
                encode(
                    MessageType::FileChunk,
                    &FileChunk {
                        transfer_id: "t".into(),
                        seq: 0,
                        data: vec![9; 64],
                    },
                )
                .unwrap(),
            ),
            (
                MessageType::ServerSync,
                encode(
                    MessageType::ServerSync,
                    &ServerSync {
                        server_id: "s1".into(),
                        name: "home".into(),
                        channels: vec!["a".into(), "b".into()],
                        synced_at: 0,
                    },
                )
                .unwrap(),
            ),
            (
                MessageType::Presence,
                encode(
                    MessageType::Presence,
                    &Presence {
                        user: "u".into(),
                        online: true,
                        seen_at: 1,
                    },
                )
                .unwrap(),
            ),
            (
                MessageType::Ping,
                encode(MessageType::Ping, &Ping { nonce: 42 }).unwrap(),
            ),
            (
                MessageType::Pong,
                encode(MessageType::Pong, &Pong { nonce: 42 }).unwrap(),
            ),
        ];
        for (ty, bytes) in cases {
            let env = decode(&bytes).unwrap();
            assert_eq!(env.msg_type, ty);
        }
    }

    #[test]
    fn voice_data_roundtrips_binary_frame() {
        let v = VoiceData {
            channel: "c".into(),
            sender: "s".into(),
            seq: 3,
            frame: (0..=255).collect(),
        };
        let bytes = encode(MessageType::VoiceData, &v).unwrap();
        let out: VoiceData = decode(&bytes).unwrap().payload_as().unwrap();
        assert_eq!(out, v);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        #[derive(Serialize)]
        struct TextMessageV2 {
            id: String,
            channel: String,
            sender: String,
            content: String,
            sent_at: i64,
            reply_to: Option<String>,
        }
        let bytes = encode(
            MessageType::TextMessage,
            &TextMessageV2 {
                id: "1".into(),
                channel: "c".into(),
                sender: "s".into(),
                content: "hi".into(),
                sent_at: 5,
                reply_to: Some("0".into()),
            },
        )
        .unwrap();
        let msg: TextMessage = decode(&bytes).unwrap().payload_as().unwrap();
        assert_eq!(msg.content, "hi");
    }

    #[test]
    fn oversize_encode_rejected() {
        let big = FileChunk {
            transfer_id: "t".into(),
            seq: 0,
            data: vec![0u8; MAX_PAYLOAD_SIZE + 1],
        };
        match encode(MessageType::FileChunk, &big) {
            Err(WireError::PayloadTooLarge(_)) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn oversize_header_rejected() {
        let mut buf = vec![0x01];
        buf.extend_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
        match decode(&buf) {
            Err(WireError::PayloadTooLarge(_)) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_rejected() {
        let bytes = encode(MessageType::Ping, &Ping { nonce: 1 }).unwrap();
        match decode(&bytes[..bytes.len() - 1]) {
            Err(WireError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn short_header_rejected() {
        match decode(&[0x01, 0x00]) {
            Err(WireError::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let mut buf = vec![0x7Au8];
        buf.extend_from_slice(&0u32.to_be_bytes());
        match decode(&buf) {
            Err(WireError::UnknownType(0x7A)) => {}
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_framing_roundtrip() {
        let first = encode(MessageType::Ping, &Ping { nonce: 1 }).unwrap();
        let second = encode(
            MessageType::TypingStart,
            &Typing {
                channel: "c".into(),
                user: "u".into(),
            },
        )
        .unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        write_envelope(&mut client, &first).await.unwrap();
        write_envelope(&mut client, &second).await.unwrap();

        let a = read_envelope(&mut server).await.unwrap();
        let b = read_envelope(&mut server).await.unwrap();
        assert_eq!(a.msg_type, MessageType::Ping);
        assert_eq!(b.msg_type, MessageType::TypingStart);
        assert_eq!(b.payload_as::<Typing>().unwrap().user, "u");
    }

    #[tokio::test]
    async fn stream_truncation_is_a_read_error() {
        let bytes = encode(MessageType::Ping, &Ping { nonce: 1 }).unwrap();
        let (mut client, mut server) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        let err = read_envelope(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn stream_oversize_header_rejected_before_payload() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        use tokio::io::AsyncWriteExt;
        let mut header = vec![0x01u8];
        header.extend_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());
        client.write_all(&header).await.unwrap();

        let err = read_envelope(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn reserved_hex_values_stable() {
        assert_eq!(MessageType::TextMessage.as_u8(), 0x01);
        assert_eq!(MessageType::VoiceStart.as_u8(), 0x10);
        assert_eq!(MessageType::FileOffer.as_u8(), 0x20);
        assert_eq!(MessageType::ServerSync.as_u8(), 0x30);
        assert_eq!(MessageType::Presence.as_u8(), 0x31);
        assert_eq!(MessageType::TypingStart.as_u8(), 0x32);
        assert_eq!(MessageType::TypingStop.as_u8(), 0x33);
        assert_eq!(MessageType::Ping.as_u8(), 0xFE);
        assert_eq!(MessageType::Pong.as_u8(), 0xFF);
        assert_eq!(MessageType::from_u8(0x11), Some(MessageType::VoiceData));
    }
}
