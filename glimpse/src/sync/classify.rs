//! Turning raw change notifications into typed changes.

use glimpse_proto::event::{ChangeKind, RealtimeEvent};
use glimpse_proto::message::{Message, MessageId, UserId, ValidationError};
use glimpse_proto::row::{MessageRow, RowField};

/// A classified change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A new message.
    Insert(Message),
    /// An existing message changed.
    Update {
        /// The row after the change.
        message: Message,
        /// Columns that differ from the old image.
        changed: Vec<RowField>,
    },
    /// A message was removed.
    Delete {
        /// Every identity the removed row carried.
        ids: Vec<MessageId>,
        /// Participants, when the old image carried them.
        participants: Option<(UserId, UserId)>,
    },
    /// A delete without an identifiable row: the account's data is gone.
    BulkDelete,
}

impl Change {
    /// The notification kind this change came from.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } | Self::BulkDelete => ChangeKind::Delete,
        }
    }
}

/// Classify one notification.
///
/// # Errors
///
/// Returns [`ValidationError`] if an insert or update carries no usable
/// `new` image or a row image cannot be decoded.
pub fn classify(event: &RealtimeEvent) -> Result<Change, ValidationError> {
    match event.event_type {
        ChangeKind::Insert => {
            let row = event
                .new_row()?
                .ok_or_else(|| ValidationError::Malformed("insert without new row".into()))?;
            Ok(Change::Insert(Message::try_from(row)?))
        }
        ChangeKind::Update => {
            let new = event
                .new_row()?
                .ok_or_else(|| ValidationError::Malformed("update without new row".into()))?;
            let old = event.old_row()?.unwrap_or_default();
            let changed = MessageRow::changed_fields(&old, &new);
            Ok(Change::Update {
                message: Message::try_from(new)?,
                changed,
            })
        }
        ChangeKind::Delete => {
            let Some(old) = event.old_row()? else {
                return Ok(Change::BulkDelete);
            };
            let ids: Vec<MessageId> = old.identities().collect();
            if ids.is_empty() {
                return Ok(Change::BulkDelete);
            }
            let participants = match (old.sender_id, old.receiver_id) {
                (Some(s), Some(r)) if !s.trim().is_empty() && !r.trim().is_empty() => {
                    Some((UserId::new(s), UserId::new(r)))
                }
                _ => None,
            };
            Ok(Change::Delete { ids, participants })
        }
    }
}
