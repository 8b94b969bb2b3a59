//! Change notifications delivered by the backend's realtime subscription.
//!
//! The payload shape is `{eventType, new, old}` where `new` and `old` are
//! JSON row images. Either image may be missing or empty depending on the
//! change kind and the backend's replica settings.

use serde::{Deserialize, Serialize};

use crate::message::{Message, ValidationError};
use crate::row::MessageRow;

/// Kind of change a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A row was inserted.
    #[serde(alias = "insert")]
    Insert,
    /// A row was updated.
    #[serde(alias = "update")]
    Update,
    /// A row was deleted.
    #[serde(alias = "delete")]
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One realtime change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// What happened to the row.
    #[serde(rename = "eventType")]
    pub event_type: ChangeKind,
    /// Row image after the change.
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    /// Row image before the change.
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

impl RealtimeEvent {
    /// Notification for a newly inserted message.
    #[must_use]
    pub fn insert(msg: &Message) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            new: Some(MessageRow::from(msg).to_value()),
            old: None,
        }
    }

    /// Notification for an updated message.
    #[must_use]
    pub fn update(old: &Message, new: &Message) -> Self {
        Self {
            event_type: ChangeKind::Update,
            new: Some(MessageRow::from(new).to_value()),
            old: Some(MessageRow::from(old).to_value()),
        }
    }

    /// Notification for a deleted message.
    #[must_use]
    pub fn delete(old: &Message) -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: Some(MessageRow::from(old).to_value()),
        }
    }

    /// Notification for a delete that carries no identifiable row.
    #[must_use]
    pub const fn bulk_delete() -> Self {
        Self {
            event_type: ChangeKind::Delete,
            new: None,
            old: None,
        }
    }

    /// Decodes the `new` row image.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the image is present but
    /// cannot be decoded.
    pub fn new_row(&self) -> Result<Option<MessageRow>, ValidationError> {
        self.new
            .as_ref()
            .map_or(Ok(None), MessageRow::from_value)
    }

    /// Decodes the `old` row image.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Malformed`] if the image is present but
    /// cannot be decoded.
    pub fn old_row(&self) -> Result<Option<MessageRow>, ValidationError> {
        self.old
            .as_ref()
            .map_or(Ok(None), MessageRow::from_value)
    }
}
