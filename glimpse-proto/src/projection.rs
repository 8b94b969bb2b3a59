//! Per-user conversation list entries.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, Timestamp, UserId};

/// Most inbound ids an entry remembers as already counted.
pub const COUNTED_LIMIT: usize = 64;

/// Summary of one conversation from its owner's point of view.
///
/// `seen` and `has_new_message` are directional: `seen` is only meaningful
/// when the owner sent the last message, `has_new_message` only when the
/// owner received it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationProjection {
    /// The user whose conversation list this entry belongs to.
    pub owner_id: UserId,
    /// The other participant.
    pub peer_id: UserId,
    /// Most recent message exchanged.
    pub last_message: Option<Message>,
    /// Creation time of `last_message`.
    pub last_message_time: Option<Timestamp>,
    /// The peer has read the owner's last message.
    pub seen: bool,
    /// The owner has an unread message from the peer.
    pub has_new_message: bool,
    /// Number of unread messages from the peer.
    pub unread_count: u32,
    /// Inbound messages already included in `unread_count`, oldest first.
    #[serde(default)]
    pub counted: Vec<MessageId>,
}

impl ConversationProjection {
    /// Creates an empty entry for `(owner, peer)`.
    #[must_use]
    pub fn new(owner: &UserId, peer: &UserId) -> Self {
        Self {
            owner_id: owner.clone(),
            peer_id: peer.clone(),
            last_message: None,
            last_message_time: None,
            seen: false,
            has_new_message: false,
            unread_count: 0,
            counted: Vec::new(),
        }
    }

    /// Whether `msg` was already included in `unread_count`.
    #[must_use]
    pub fn has_counted(&self, msg: &Message) -> bool {
        [&msg.id, &msg.temp_id]
            .into_iter()
            .flatten()
            .any(|id| self.counted.contains(id))
    }

    /// Remember `id` as counted, forgetting the oldest past [`COUNTED_LIMIT`].
    pub fn remember_counted(&mut self, id: &MessageId) {
        if self.counted.contains(id) {
            return;
        }
        self.counted.push(id.clone());
        let excess = self.counted.len().saturating_sub(COUNTED_LIMIT);
        self.counted.drain(..excess);
    }

    /// Whether the owner sent the last message.
    #[must_use]
    pub fn owner_sent_last(&self) -> bool {
        self.last_message
            .as_ref()
            .is_some_and(|m| m.sender_id == self.owner_id)
    }

    /// Whether `msg` is at least as recent as the current last message.
    #[must_use]
    pub fn is_newer(&self, msg: &Message) -> bool {
        self.last_message_time
            .is_none_or(|current| msg.created_at >= current)
    }
}
