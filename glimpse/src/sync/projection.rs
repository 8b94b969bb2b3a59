//! Directional updates of cached conversation lists.
//!
//! Every function here edits one owner's list in place and reports whether
//! the targeted entry was found, so the caller can fall back to a scoped
//! refresh instead of guessing.

use glimpse_proto::message::{Message, MessageId, UserId};
use glimpse_proto::projection::ConversationProjection;

/// Outcome of a projection edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    /// The entry was changed.
    Applied,
    /// The entry exists but nothing needed to change.
    Unchanged,
    /// No entry for the peer is cached.
    Missing,
}

impl Edit {
    /// Whether the list changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Applied)
    }
}

fn sort_recent_first(list: &mut [ConversationProjection]) {
    list.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
}

fn same_message(a: &Message, b: &Message) -> bool {
    [&b.id, &b.temp_id]
        .into_iter()
        .flatten()
        .any(|id| a.has_identity(id))
}

/// Record a newly inserted message in `owner`'s list, creating the entry on
/// first exchange.
///
/// A repeated insert of any message already counted does not count twice,
/// and the owner's `seen` flag for it never regresses.
pub fn apply_insert(list: &mut Vec<ConversationProjection>, owner: &UserId, msg: &Message) -> Edit {
    let Some(peer) = msg.peer_of(owner) else {
        return Edit::Unchanged;
    };
    let pos = match list.iter().position(|p| p.peer_id == *peer) {
        Some(pos) => pos,
        None => {
            list.push(ConversationProjection::new(owner, peer));
            list.len() - 1
        }
    };
    let entry = &mut list[pos];
    let owner_is_sender = msg.sender_id == *owner;
    let repeat = entry
        .last_message
        .as_ref()
        .is_some_and(|last| same_message(last, msg));

    if !owner_is_sender && !msg.flags.seen && !repeat && !entry.has_counted(msg) {
        entry.unread_count += 1;
        if let Some(id) = msg.identity() {
            entry.remember_counted(id);
        }
    }
    if repeat {
        let was_seen = entry.seen;
        let mut merged = msg.clone();
        merged.flags.seen |= entry.last_message.as_ref().is_some_and(|m| m.flags.seen);
        entry.last_message = Some(merged);
        entry.seen = owner_is_sender && (was_seen || msg.flags.seen);
    } else if entry.is_newer(msg) {
        entry.last_message = Some(msg.clone());
        entry.last_message_time = Some(msg.created_at);
        entry.seen = owner_is_sender && msg.flags.seen;
    }
    entry.has_new_message = !entry.owner_sent_last() && entry.unread_count > 0;
    sort_recent_first(list);
    Edit::Applied
}

/// Apply a read-status change of `msg` to `owner`'s list.
///
/// The sender's entry shows `seen` when the read message is its last one;
/// the receiver's entry drops its unread marker and count.
pub fn apply_read(list: &mut [ConversationProjection], owner: &UserId, msg: &Message) -> Edit {
    let Some(peer) = msg.peer_of(owner) else {
        return Edit::Unchanged;
    };
    let Some(entry) = list.iter_mut().find(|p| p.peer_id == *peer) else {
        return Edit::Missing;
    };
    let is_last = entry
        .last_message
        .as_ref()
        .is_some_and(|last| same_message(last, msg));
    let before = entry.clone();

    if is_last && let Some(last) = entry.last_message.as_mut() {
        last.flags.seen = msg.flags.seen;
    }
    if msg.sender_id == *owner {
        if is_last {
            entry.seen = msg.flags.seen;
        }
    } else if msg.flags.seen {
        entry.has_new_message = false;
        entry.unread_count = 0;
    }

    if *entry == before {
        Edit::Unchanged
    } else {
        Edit::Applied
    }
}

/// Replace the last message of `owner`'s entry for `peer` after `removed`
/// left the conversation, using the remaining `window`.
///
/// Returns [`Edit::Missing`] when the entry pointed at `removed` but no
/// window is available to recompute it from.
pub fn replace_removed(
    list: &mut [ConversationProjection],
    peer: &UserId,
    removed: &MessageId,
    window: Option<&[Message]>,
) -> Edit {
    let Some(entry) = list.iter_mut().find(|p| p.peer_id == *peer) else {
        return Edit::Unchanged;
    };
    if !entry
        .last_message
        .as_ref()
        .is_some_and(|last| last.has_identity(removed))
    {
        return Edit::Unchanged;
    }
    let Some(window) = window else {
        return Edit::Missing;
    };
    let last = window.iter().rfind(|m| !m.has_identity(removed)).cloned();
    entry.last_message_time = last.as_ref().map(|m| m.created_at);
    entry.seen = last
        .as_ref()
        .is_some_and(|m| m.sender_id == entry.owner_id && m.flags.seen);
    entry.last_message = last;
    entry.has_new_message = !entry.owner_sent_last() && entry.unread_count > 0;
    sort_recent_first(list);
    Edit::Applied
}

/// Repoint entries whose last message is `consumed` at the newest message
/// of the peer's cached window that is not, or clear them when there is
/// none. Returns how many entries changed.
pub fn drop_consumed_last(
    list: &mut [ConversationProjection],
    consumed: impl Fn(&Message) -> bool,
    window_of: impl Fn(&UserId) -> Option<Vec<Message>>,
) -> usize {
    let mut changed = 0;
    for entry in list.iter_mut() {
        if !entry.last_message.as_ref().is_some_and(&consumed) {
            continue;
        }
        let last = window_of(&entry.peer_id)
            .and_then(|window| window.into_iter().rev().find(|m| !consumed(m)));
        entry.last_message_time = last.as_ref().map(|m| m.created_at);
        entry.seen = last
            .as_ref()
            .is_some_and(|m| m.sender_id == entry.owner_id && m.flags.seen);
        entry.last_message = last;
        entry.has_new_message = !entry.owner_sent_last() && entry.unread_count > 0;
        changed += 1;
    }
    if changed > 0 {
        sort_recent_first(list);
    }
    changed
}

/// Peers in `list` whose last message carries `id`.
#[must_use]
pub fn peers_with_last(list: &[ConversationProjection], id: &MessageId) -> Vec<UserId> {
    list.iter()
        .filter(|p| p.last_message.as_ref().is_some_and(|m| m.has_identity(id)))
        .map(|p| p.peer_id.clone())
        .collect()
}
