use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChannelId, MessageKind, MessageStatus, UserId},
    error::SyncError,
};

pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Present only while a locally sent message waits for confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.client_id.is_some()
    }
}

/// Envelope returned by a paginated collection endpoint.
///
/// `data` and `options` are accepted as aliases of `items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResponse<T> {
    #[serde(alias = "data", alias = "options")]
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

/// Message history page, newest first on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Message {
        channel_id: ChannelId,
        client_id: String,
        content: String,
        message_type: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    #[serde(rename_all = "camelCase")]
    Read {
        channel_id: ChannelId,
        message_id: String,
    },
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded server frame. Tags other than `message` and `status` are kept as
/// raw JSON so the caller can interpret them.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(Message),
    Status {
        message_id: String,
        status: MessageStatus,
    },
    Typing(Value),
    Unknown(Value),
}

#[derive(Deserialize)]
struct MessageFrame {
    message: Message,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusFrame {
    message_id: String,
    status: MessageStatus,
}

impl InboundFrame {
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)?;
        let Some(tag) = value.get("type").and_then(Value::as_str) else {
            return Err(SyncError::Decode("frame has no string `type` tag".into()));
        };

        match tag {
            "message" => {
                let frame: MessageFrame = serde_json::from_value(value)?;
                Ok(Self::Message(frame.message))
            }
            "status" => {
                let frame: StatusFrame = serde_json::from_value(value)?;
                Ok(Self::Status {
                    message_id: frame.message_id,
                    status: frame.status,
                })
            }
            "typing" => Ok(Self::Typing(value)),
            _ => Ok(Self::Unknown(value)),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::Status { .. } => "status",
            Self::Typing(_) => "typing",
            Self::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }
}
