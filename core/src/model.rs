/// Entities exchanged with the document store: chat messages and
/// conversation summaries, plus the record/document envelopes around them.
use crate::error::{ParseError, SyncError};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Field names shared by both collections
pub mod fields {
    pub const SENDER_ID: &str = "senderId";
    pub const RECEIVER_ID: &str = "receiverId";
    pub const MESSAGE: &str = "message";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SENDER_NAME: &str = "senderName";
    pub const SENDER_IMAGE: &str = "senderImage";
    pub const RECEIVER_NAME: &str = "receiverName";
    pub const RECEIVER_IMAGE: &str = "receiverImage";
    pub const LAST_MESSAGE: &str = "lastMessage";
}

/// Opaque identifier assigned by the store at write time
pub type RecordId = String;

/// Raw field map of a stored document
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A stored document as the store hands it out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: RecordId,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<RecordId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Decode the document into a typed record.
    ///
    /// Missing or mistyped fields are a `ParseError`; nothing is defaulted.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Record<T>, ParseError> {
        let value = serde_json::from_value(serde_json::Value::Object(self.fields.clone()))
            .map_err(|e| ParseError {
                record_id: self.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Record {
            id: self.id.clone(),
            value,
        })
    }
}

/// A decoded entity together with its store identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: RecordId,
    pub value: T,
}

/// Encode an entity into the field map written to the store
pub fn encode<T: Serialize>(value: &T) -> crate::error::Result<Fields> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(SyncError::Serialization(serde::ser::Error::custom(format!(
            "expected a JSON object, got {}",
            other
        )))),
    }
}

/// One chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "receiverId")]
    pub receiver_id: String,
    #[serde(rename = "message")]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            body: body.into(),
            timestamp,
        }
    }

    /// Which side of the conversation this message renders on
    pub fn direction(&self, local_user_id: &str) -> MessageDirection {
        if self.sender_id == local_user_id {
            MessageDirection::Sent
        } else {
            MessageDirection::Received
        }
    }

    /// Display form of the timestamp in the local time zone
    pub fn readable_date_time(&self) -> String {
        readable_date_time(&self.timestamp.with_timezone(&chrono::Local))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Sent,
    Received,
}

/// Format a timestamp as e.g. "March 07, 2024 - 10:00 AM"
pub fn readable_date_time<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format("%B %d, %Y - %I:%M %p").to_string()
}

/// One side of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub image_ref: String,
}

impl Participant {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        image_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            image_ref: image_ref.into(),
        }
    }
}

/// Denormalized "most recent message" record for a participant pair.
///
/// Sender/receiver fields are fixed by whoever created the record; later
/// updates only touch `last_message_body` and `last_message_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "senderName")]
    pub sender_display_name: String,
    #[serde(rename = "senderImage")]
    pub sender_image_ref: String,
    #[serde(rename = "receiverId")]
    pub receiver_id: String,
    #[serde(rename = "receiverName")]
    pub receiver_display_name: String,
    #[serde(rename = "receiverImage")]
    pub receiver_image_ref: String,
    #[serde(rename = "lastMessage")]
    pub last_message_body: String,
    #[serde(rename = "timestamp")]
    pub last_message_timestamp: DateTime<Utc>,
}

impl ConversationSummary {
    /// Summary for a first message from `sender` to `receiver`
    pub fn first_message(sender: &Participant, receiver: &Participant, message: &Message) -> Self {
        Self {
            sender_id: sender.id.clone(),
            sender_display_name: sender.display_name.clone(),
            sender_image_ref: sender.image_ref.clone(),
            receiver_id: receiver.id.clone(),
            receiver_display_name: receiver.display_name.clone(),
            receiver_image_ref: receiver.image_ref.clone(),
            last_message_body: message.body.clone(),
            last_message_timestamp: message.timestamp,
        }
    }

    pub fn sender(&self) -> Participant {
        Participant::new(
            &self.sender_id,
            &self.sender_display_name,
            &self.sender_image_ref,
        )
    }

    pub fn receiver(&self) -> Participant {
        Participant::new(
            &self.receiver_id,
            &self.receiver_display_name,
            &self.receiver_image_ref,
        )
    }

    /// The participant that is not `local_user_id`
    pub fn counterpart(&self, local_user_id: &str) -> Participant {
        if self.sender_id == local_user_id {
            self.receiver()
        } else {
            self.sender()
        }
    }
}

/// The two summary fields an update is allowed to touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl LastMessage {
    pub fn of(message: &Message) -> Self {
        Self {
            body: message.body.clone(),
            timestamp: message.timestamp,
        }
    }

    pub fn to_fields(&self) -> Fields {
        let mut map = Fields::new();
        map.insert(
            fields::LAST_MESSAGE.to_string(),
            serde_json::Value::String(self.body.clone()),
        );
        map.insert(
            fields::TIMESTAMP.to_string(),
            serde_json::Value::String(
                self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
        );
        map
    }
}
