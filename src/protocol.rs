//! JSON envelopes exchanged over the room socket.
//!
//! Both directions are internally tagged by `type`. Frames that do not
//! decode into a [`ClientEnvelope`] are dropped by the reader.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::{Message, MessageId, RoomId, UserId};

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEnvelope {
    Join {
        #[serde(default)]
        room: String,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        client_message_id: Option<String>,
    },
}

/// A frame sent by the server. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEnvelope {
    #[serde(rename_all = "camelCase")]
    Message {
        room: RoomId,
        text: String,
        from: UserId,
        message_id: MessageId,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        client_message_id: String,
        message_id: MessageId,
        #[serde(with = "time::serde::rfc3339")]
        ts: OffsetDateTime,
    },
    Error {
        error: String,
    },
}

impl ServerEnvelope {
    /// The broadcast form of a persisted message; id and time come from the store.
    pub fn message(message: &Message) -> Self {
        Self::Message {
            room: message.room_id.clone(),
            text: message.body.clone(),
            from: message.sender_id.clone(),
            message_id: message.id,
            ts: message.created_at,
        }
    }

    pub fn ack(client_message_id: String, message: &Message) -> Self {
        Self::Ack {
            client_message_id,
            message_id: message.id,
            ts: message.created_at,
        }
    }

    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }
}
