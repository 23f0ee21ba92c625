use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::{CodecKind, Framing, WireConfig};
use crate::error::TransportError;

/// `[u64 seq BE][u64 timestamp_us BE]`
pub const HEADER_LEN: usize = 16;

/// The unit the transport carries: one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub seq: u64,
    pub timestamp_us: u64,
    pub payload: Bytes,
}

impl EncodedFrame {
    pub fn new(seq: u64, timestamp_us: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            timestamp_us,
            payload: payload.into(),
        }
    }

    /// Serialize for the wire.
    pub fn to_wire(&self, framing: Framing) -> Bytes {
        match framing {
            Framing::Raw => self.payload.clone(),
            Framing::Framed => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
                buf.put_u64(self.seq);
                buf.put_u64(self.timestamp_us);
                buf.put_slice(&self.payload);
                buf.freeze()
            }
        }
    }

    /// Parse a binary message. Raw messages carry no header, so `seq` and
    /// `timestamp_us` are left at zero for the pipeline to assign.
    pub fn from_wire(mut data: Bytes, framing: Framing) -> Result<Self, TransportError> {
        match framing {
            Framing::Raw => Ok(Self::new(0, 0, data)),
            Framing::Framed => {
                if data.len() < HEADER_LEN {
                    return Err(TransportError::Malformed(format!(
                        "{} bytes, header needs {}",
                        data.len(),
                        HEADER_LEN
                    )));
                }
                let seq = data.get_u64();
                let timestamp_us = data.get_u64();
                Ok(Self::new(seq, timestamp_us, data))
            }
        }
    }
}

/// One websocket (or loopback) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
}

// ======================== Settings ========================

// 音频格式参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

// Hello Message，用于初始化连接，告知服务端上下行音频格式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub version: u8,
    pub session_id: String,
    pub audio: AudioSettings,
}

fn encoding_name(codec: CodecKind) -> &'static str {
    match codec {
        CodecKind::Pcm => "linear16",
        CodecKind::Opus => "opus",
    }
}

impl HelloMessage {
    pub fn new(session_id: impl Into<String>, wire: &WireConfig) -> Self {
        let container = match wire.framing {
            Framing::Raw => "none",
            Framing::Framed => "seq_ts_header",
        };
        Self {
            msg_type: "SettingsConfiguration".to_string(),
            version: 1,
            session_id: session_id.into(),
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: encoding_name(wire.codec).to_string(),
                    sample_rate: wire.uplink_sample_rate,
                    channels: wire.channels,
                    container: Some(container.to_string()),
                },
                output: AudioFormat {
                    encoding: encoding_name(wire.codec).to_string(),
                    sample_rate: wire.downlink_sample_rate,
                    channels: wire.channels,
                    container: Some(container.to_string()),
                },
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ======================== Server messages ========================

#[derive(Deserialize, Debug, Clone)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub session_id: Option<String>,
    pub role: Option<String>,
    pub content: Option<String>,
    pub description: Option<String>,
}

/// Server messages the client acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Welcome { session_id: Option<String> },
    /// Barge-in: the user talks over the agent, queued playback is stale.
    UserStartedSpeaking,
    CloseConnection,
    ConversationText { role: String, content: String },
    Error(String),
    Other(String),
}

impl ControlEvent {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let msg: ServerMessage =
            serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(match msg.msg_type.as_str() {
            "Welcome" => Self::Welcome {
                session_id: msg.session_id,
            },
            "UserStartedSpeaking" => Self::UserStartedSpeaking,
            "CloseConnection" => Self::CloseConnection,
            "ConversationText" => Self::ConversationText {
                role: msg.role.unwrap_or_default(),
                content: msg.content.unwrap_or_default(),
            },
            "Error" => Self::Error(msg.description.unwrap_or_default()),
            _ => Self::Other(msg.msg_type),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    #[test]
    fn framed_header_is_big_endian() {
        let frame = EncodedFrame::new(1, 2, vec![0xAA]);
        let wire = frame.to_wire(Framing::Framed);
        assert_eq!(wire.len(), HEADER_LEN + 1);
        assert_eq!(&wire[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&wire[8..16], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(
            EncodedFrame::from_wire(wire, Framing::Framed).unwrap(),
            frame
        );
    }

    #[test]
    fn short_framed_message_is_malformed() {
        let err = EncodedFrame::from_wire(Bytes::from_static(&[1, 2, 3]), Framing::Framed);
        assert!(matches!(err, Err(TransportError::Malformed(_))));
    }

    #[test]
    fn raw_passes_payload_through() {
        let frame = EncodedFrame::new(9, 9, vec![1, 2, 3]);
        let wire = frame.to_wire(Framing::Raw);
        assert_eq!(&wire[..], &[1, 2, 3]);
        let back = EncodedFrame::from_wire(wire, Framing::Raw).unwrap();
        assert_eq!(back.seq, 0);
    }

    #[test]
    fn hello_describes_both_directions() {
        let mut wire = SessionConfig::default().wire;
        wire.framing = Framing::Raw;
        wire.downlink_sample_rate = 16_000;
        let json = HelloMessage::new("abc", &wire).to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "SettingsConfiguration");
        assert_eq!(v["session_id"], "abc");
        assert_eq!(v["audio"]["input"]["encoding"], "linear16");
        assert_eq!(v["audio"]["input"]["sample_rate"], 48_000);
        assert_eq!(v["audio"]["output"]["sample_rate"], 16_000);
        assert_eq!(v["audio"]["output"]["container"], "none");
    }

    #[test]
    fn parses_control_messages() {
        assert_eq!(
            ControlEvent::parse(r#"{"type":"Welcome","session_id":"s-1"}"#).unwrap(),
            ControlEvent::Welcome {
                session_id: Some("s-1".to_string())
            }
        );
        assert_eq!(
            ControlEvent::parse(r#"{"type":"UserStartedSpeaking"}"#).unwrap(),
            ControlEvent::UserStartedSpeaking
        );
        assert_eq!(
            ControlEvent::parse(r#"{"type":"AgentAudioDone"}"#).unwrap(),
            ControlEvent::Other("AgentAudioDone".to_string())
        );
        assert!(ControlEvent::parse("not json").is_err());
    }
}
