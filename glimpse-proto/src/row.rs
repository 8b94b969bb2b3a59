//! Raw backend rows as they arrive in change notifications.
//!
//! Rows are deliberately loose: every column is optional because partial
//! payloads are normal (an update's `old` image often carries only the
//! primary key). Conversion into a [`Message`] is where validation happens.

use serde::{Deserialize, Deserializer, Serialize};

use crate::message::{
    MediaKind, MediaRef, Message, MessageFlags, MessageId, Timestamp, UserId, ValidationError,
};

/// One `messages` row, possibly partial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRow {
    /// Server primary key. Accepts JSON strings or numbers.
    #[serde(deserialize_with = "string_or_number")]
    pub id: Option<String>,
    /// Temporary id echoed back by the backend for optimistic sends.
    pub client_temp_id: Option<String>,
    /// Sender account id.
    pub sender_id: Option<String>,
    /// Receiver account id.
    pub receiver_id: Option<String>,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: Option<u64>,
    /// Remote media location.
    pub media_url: Option<String>,
    /// Remote thumbnail location.
    pub thumbnail_url: Option<String>,
    /// Media type column (`image`, `video`, or a mime type).
    pub media_type: Option<String>,
    /// Caption text.
    pub caption: Option<String>,
    /// View-once flag.
    pub view_once: Option<bool>,
    /// Sensitive-content flag.
    pub is_nsfw: Option<bool>,
    /// Read flag.
    #[serde(alias = "is_seen")]
    pub seen: Option<bool>,
}

/// A column whose value differs between two row images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowField {
    /// The read flag.
    Seen,
    /// The caption.
    Caption,
    /// Media url, thumbnail, or type.
    Media,
    /// View-once or NSFW flags.
    Ephemeral,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl MessageRow {
    /// Decodes a row from a JSON payload.
    ///
    /// Returns `Ok(None)` for `null` or an empty object, which backends use
    /// for "no row image".
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the payload is not an
    /// object or a column has the wrong type.
    pub fn from_value(value: &serde_json::Value) -> Result<Option<Self>, ValidationError> {
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Object(map) if map.is_empty() => Ok(None),
            serde_json::Value::Object(_) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ValidationError::Malformed(e.to_string())),
            other => Err(ValidationError::Malformed(format!(
                "expected object, got {other}"
            ))),
        }
    }

    /// Encodes the row as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// The identities this row can be matched by.
    pub fn identities(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.id
            .iter()
            .chain(self.client_temp_id.iter())
            .filter(|s| !s.trim().is_empty())
            .map(MessageId::new)
    }

    /// Columns whose value changed from `old` to `new`.
    ///
    /// Columns absent from `old` are treated as unknown rather than changed,
    /// except `seen`, where an absent old value counts as `false`.
    #[must_use]
    pub fn changed_fields(old: &Self, new: &Self) -> Vec<RowField> {
        let mut changed = Vec::new();
        if new.seen.is_some() && old.seen.unwrap_or(false) != new.seen.unwrap_or(false) {
            changed.push(RowField::Seen);
        }
        if old.caption.is_some() && old.caption != new.caption {
            changed.push(RowField::Caption);
        }
        if (old.media_url.is_some() && old.media_url != new.media_url)
            || (old.thumbnail_url.is_some() && old.thumbnail_url != new.thumbnail_url)
            || (old.media_type.is_some() && old.media_type != new.media_type)
        {
            changed.push(RowField::Media);
        }
        if (old.view_once.is_some() && old.view_once != new.view_once)
            || (old.is_nsfw.is_some() && old.is_nsfw != new.is_nsfw)
        {
            changed.push(RowField::Ephemeral);
        }
        changed
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = ValidationError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let id = row.id.filter(|s| !s.trim().is_empty()).map(MessageId::new);
        let temp_id = row
            .client_temp_id
            .filter(|s| !s.trim().is_empty())
            .map(MessageId::new);
        if id.is_none() && temp_id.is_none() {
            return Err(ValidationError::MissingIdentity);
        }
        let sender_id = row
            .sender_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(ValidationError::MissingParticipant("sender_id"))?;
        let receiver_id = row
            .receiver_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(ValidationError::MissingParticipant("receiver_id"))?;
        let created_at = row
            .created_at
            .ok_or_else(|| ValidationError::Malformed("missing created_at".into()))?;

        let media = match (row.media_url, row.media_type.as_deref().and_then(MediaKind::parse)) {
            (Some(url), Some(kind)) => Some(MediaRef {
                url,
                thumbnail_url: row.thumbnail_url,
                kind,
            }),
            (Some(url), None) => Some(MediaRef {
                url,
                thumbnail_url: row.thumbnail_url,
                kind: MediaKind::Image,
            }),
            (None, _) => None,
        };

        let sending = id.is_none();
        Ok(Self {
            id,
            temp_id,
            sender_id: UserId::new(sender_id),
            receiver_id: UserId::new(receiver_id),
            created_at: Timestamp::from_millis(created_at),
            media,
            caption: row.caption,
            flags: MessageFlags {
                view_once: row.view_once.unwrap_or(false),
                is_nsfw: row.is_nsfw.unwrap_or(false),
                seen: row.seen.unwrap_or(false),
                sending,
                failed: false,
            },
        })
    }
}

impl From<&Message> for MessageRow {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.as_ref().map(|id| id.as_str().to_string()),
            client_temp_id: msg.temp_id.as_ref().map(|id| id.as_str().to_string()),
            sender_id: Some(msg.sender_id.as_str().to_string()),
            receiver_id: Some(msg.receiver_id.as_str().to_string()),
            created_at: Some(msg.created_at.as_millis()),
            media_url: msg.media.as_ref().map(|m| m.url.clone()),
            thumbnail_url: msg.media.as_ref().and_then(|m| m.thumbnail_url.clone()),
            media_type: msg.media.as_ref().map(|m| {
                match m.kind {
                    MediaKind::Image => "image",
                    MediaKind::Video => "video",
                }
                .to_string()
            }),
            caption: msg.caption.clone(),
            view_once: Some(msg.flags.view_once),
            is_nsfw: Some(msg.flags.is_nsfw),
            seen: Some(msg.flags.seen),
        }
    }
}
