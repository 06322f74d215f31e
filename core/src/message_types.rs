/// Shared types for the message stream: domain model, backend wire shapes, live events
use crate::error::{Result, StreamError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the conversation sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Media attached to a message. Opaque to the window logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// photo, video, document, voice, sticker, gif, ...
    pub kind: Option<String>,
    /// Path relative to the backend media directory, when downloaded
    pub reference: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
    pub duration: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mime_type: Option<String>,
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within a conversation, assigned by the origin server
    pub id: i64,
    pub conversation_id: i64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// Empty when the message only carries an attachment
    pub body: String,
    pub attachment: Option<Attachment>,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub sender_avatar_ref: Option<String>,
    pub reply_to_id: Option<i64>,
    pub forward_from_id: Option<i64>,
}

impl Message {
    /// Ordering key inside a window
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.timestamp, self.id)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }
}

// ─── Backend wire shapes ─────────────────────────────────────────────────────

/// Media metadata as reported by the backend
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireMediaMetadata {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mime_type: Option<String>,
}

/// Message as returned by `/api/chats/{id}/messages` and inside `new_message` frames
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    pub id: i64,
    pub chat_id: i64,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_photo: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Absent on some live frames; such frames cannot be placed in a window
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_to_msg_id: Option<i64>,
    #[serde(default)]
    pub forward_from_id: Option<i64>,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub media_metadata: Option<WireMediaMetadata>,
    #[serde(default)]
    pub is_outgoing: bool,
}

impl TryFrom<WireMessage> for Message {
    type Error = StreamError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        let timestamp = wire
            .date
            .ok_or_else(|| StreamError::Protocol(format!("message {} has no date", wire.id)))?;

        let attachment = if wire.has_media {
            let meta = wire.media_metadata.unwrap_or_default();
            Some(Attachment {
                kind: wire.media_type,
                reference: wire.media_path,
                file_name: meta.file_name,
                size: meta.file_size,
                duration: meta.duration,
                width: meta.width,
                height: meta.height,
                mime_type: meta.mime_type,
            })
        } else {
            None
        };

        Ok(Message {
            id: wire.id,
            conversation_id: wire.chat_id,
            timestamp,
            direction: if wire.is_outgoing {
                Direction::Outgoing
            } else {
                Direction::Incoming
            },
            body: wire.text.unwrap_or_default(),
            attachment,
            sender_id: wire.sender_id,
            sender_name: wire.sender_name,
            sender_avatar_ref: wire.sender_photo,
            reply_to_id: wire.reply_to_msg_id,
            forward_from_id: wire.forward_from_id,
        })
    }
}

// ─── Live channel ────────────────────────────────────────────────────────────

/// Raw frame pushed by the server over the live channel
#[derive(Debug, Deserialize)]
struct RawLiveFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Inbound push notification
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// A message was sent or received in some conversation
    NewMessage {
        conversation_id: i64,
        message: Message,
    },
    /// Server acknowledged the subscription handshake
    Subscribed,
    /// Server-side keepalive
    Heartbeat,
    /// Reply to our `ping`
    Pong,
    /// Server reported a failure; the channel stays open
    ServerError(String),
    /// Any other frame type
    Unknown(String),
}

impl LiveEvent {
    /// Parse one text frame. Errors mean the payload is malformed.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed == "pong" {
            return Ok(LiveEvent::Pong);
        }

        let frame: RawLiveFrame = serde_json::from_str(trimmed)?;
        match frame.kind.as_str() {
            "new_message" => {
                let data = frame.data.ok_or_else(|| {
                    StreamError::Protocol("new_message frame without data".to_string())
                })?;
                let wire: WireMessage = serde_json::from_value(data)?;
                let message = Message::try_from(wire)?;
                Ok(LiveEvent::NewMessage {
                    conversation_id: message.conversation_id,
                    message,
                })
            }
            "subscribed" => Ok(LiveEvent::Subscribed),
            "heartbeat" => Ok(LiveEvent::Heartbeat),
            "error" => Ok(LiveEvent::ServerError(frame.message.unwrap_or_default())),
            other => Ok(LiveEvent::Unknown(other.to_string())),
        }
    }
}

/// Text sent once after the channel opens
pub const SUBSCRIBE_FRAME: &str = "subscribe";

/// Text sent on every keepalive tick
pub const PING_FRAME: &str = "ping";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_new_message_frame() {
        let raw = r#"{"type":"new_message","data":{"id":7,"chat_id":42,"sender_id":5,
            "sender_name":"Ann","text":"hi","date":"2024-03-01T10:00:00+00:00",
            "has_media":false,"media_type":null,"is_outgoing":true}}"#;

        match LiveEvent::parse(raw).unwrap() {
            LiveEvent::NewMessage {
                conversation_id,
                message,
            } => {
                assert_eq!(conversation_id, 42);
                assert_eq!(message.id, 7);
                assert_eq!(message.body, "hi");
                assert_eq!(message.direction, Direction::Outgoing);
                assert_eq!(message.sender_name.as_deref(), Some("Ann"));
                assert!(message.attachment.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(LiveEvent::parse("pong").unwrap(), LiveEvent::Pong);
        assert_eq!(
            LiveEvent::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            LiveEvent::Heartbeat
        );
        assert_eq!(
            LiveEvent::parse(r#"{"type":"subscribed","message":"ok"}"#).unwrap(),
            LiveEvent::Subscribed
        );
        assert_eq!(
            LiveEvent::parse(r#"{"type":"error","message":"no session"}"#).unwrap(),
            LiveEvent::ServerError("no session".to_string())
        );
        assert_eq!(
            LiveEvent::parse(r#"{"type":"typing"}"#).unwrap(),
            LiveEvent::Unknown("typing".to_string())
        );
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(LiveEvent::parse("not json").is_err());
        assert!(LiveEvent::parse(r#"{"type":"new_message"}"#).is_err());
        assert!(LiveEvent::parse(r#"{"type":"new_message","data":{"id":"x"}}"#).is_err());
        // no date: cannot be ordered
        assert!(LiveEvent::parse(r#"{"type":"new_message","data":{"id":1,"chat_id":2}}"#).is_err());
    }

    #[test]
    fn test_wire_media_becomes_attachment() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"id":3,"chat_id":9,"text":null,"date":"2024-03-01T10:00:00Z","has_media":true,
                "media_type":"video","media_path":"messages/9/3_thumb.jpg",
                "media_metadata":{"file_name":"clip.mp4","file_size":2048,"duration":12},
                "is_outgoing":false}"#,
        )
        .unwrap();
        let message = Message::try_from(wire).unwrap();
        let attachment = message.attachment.unwrap();

        assert_eq!(message.body, "");
        assert_eq!(attachment.kind.as_deref(), Some("video"));
        assert_eq!(attachment.size, Some(2048));
        assert_eq!(attachment.duration, Some(12));
        assert_eq!(attachment.reference.as_deref(), Some("messages/9/3_thumb.jpg"));
    }
}
