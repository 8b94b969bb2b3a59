//! Cache values, entries, and key scheme.

use std::borrow::Cow;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use glimpse_proto::message::{Message, Timestamp, UserId};
use glimpse_proto::projection::ConversationProjection;

/// Prefix of per-conversation message window keys.
pub const MESSAGES_PREFIX: &str = "messages:";

/// Prefix of per-user conversation list keys.
pub const CONVERSATIONS_PREFIX: &str = "conversations:";

/// `id` as a key segment, with `%` and `:` percent-encoded so that no
/// segment contains the separator.
fn segment(id: &UserId) -> Cow<'_, str> {
    let raw = id.as_str();
    if !raw.contains(['%', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(segment: &str) -> String {
    segment.replace("%3A", ":").replace("%25", "%")
}

/// Key of the message window `owner` sees for `peer`.
///
/// Keys are directional: `owner`'s copy and `peer`'s copy are separate
/// entries because read state and ephemeral filtering differ per viewer.
#[must_use]
pub fn messages_key(owner: &UserId, peer: &UserId) -> String {
    format!("{MESSAGES_PREFIX}{}:{}", segment(owner), segment(peer))
}

/// Prefix matching every message window owned by `owner`.
#[must_use]
pub fn owner_messages_prefix(owner: &UserId) -> String {
    format!("{MESSAGES_PREFIX}{}:", segment(owner))
}

/// Key of `owner`'s conversation list.
#[must_use]
pub fn conversations_key(owner: &UserId) -> String {
    format!("{CONVERSATIONS_PREFIX}{}", segment(owner))
}

/// Owner of a conversation list key.
#[must_use]
pub fn conversations_owner(key: &str) -> Option<UserId> {
    key.strip_prefix(CONVERSATIONS_PREFIX)
        .map(|owner| UserId::new(unescape(owner)))
}

/// Selects entries to invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePattern {
    /// One key.
    Exact(String),
    /// Every key starting with the prefix.
    Prefix(String),
}

impl CachePattern {
    /// Whether `key` is selected.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(k) => k == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

impl std::fmt::Display for CachePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(k) => f.write_str(k),
            Self::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

/// A cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheValue {
    /// A conversation's message window, ascending.
    Messages(Vec<Message>),
    /// A user's conversation list.
    Conversations(Vec<ConversationProjection>),
}

/// Fixed per-record overhead used by the size estimate.
const RECORD_OVERHEAD: usize = 96;

fn message_size(msg: &Message) -> usize {
    let media = msg.media.as_ref().map_or(0, |m| {
        m.url.len() + m.thumbnail_url.as_ref().map_or(0, String::len)
    });
    RECORD_OVERHEAD
        + msg.sender_id.as_str().len()
        + msg.receiver_id.as_str().len()
        + msg.id.as_ref().map_or(0, |id| id.as_str().len())
        + msg.temp_id.as_ref().map_or(0, |id| id.as_str().len())
        + msg.caption.as_ref().map_or(0, String::len)
        + media
}

impl CacheValue {
    /// Rough in-memory footprint, used for the eviction budget.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Messages(list) => list.iter().map(message_size).sum::<usize>() + RECORD_OVERHEAD,
            Self::Conversations(list) => {
                list.iter()
                    .map(|p| {
                        RECORD_OVERHEAD
                            + p.owner_id.as_str().len()
                            + p.peer_id.as_str().len()
                            + p.last_message.as_ref().map_or(0, message_size)
                    })
                    .sum::<usize>()
                    + RECORD_OVERHEAD
            }
        }
    }

    /// The message window, if this is one.
    #[must_use]
    pub fn as_messages(&self) -> Option<&[Message]> {
        match self {
            Self::Messages(list) => Some(list),
            Self::Conversations(_) => None,
        }
    }

    /// The conversation list, if this is one.
    #[must_use]
    pub fn as_conversations(&self) -> Option<&[ConversationProjection]> {
        match self {
            Self::Conversations(list) => Some(list),
            Self::Messages(_) => None,
        }
    }

    /// Consume into the message window, if this is one.
    #[must_use]
    pub fn into_messages(self) -> Option<Vec<Message>> {
        match self {
            Self::Messages(list) => Some(list),
            Self::Conversations(_) => None,
        }
    }

    /// Consume into the conversation list, if this is one.
    #[must_use]
    pub fn into_conversations(self) -> Option<Vec<ConversationProjection>> {
        match self {
            Self::Conversations(list) => Some(list),
            Self::Messages(_) => None,
        }
    }
}

/// A stored value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cached data.
    pub value: CacheValue,
    /// When the value was last set from a fetch or explicit write.
    pub stored_at: Timestamp,
    /// How long after `stored_at` the value counts as fresh.
    pub ttl: Duration,
    /// Estimated footprint.
    pub size_bytes: usize,
}

impl CacheEntry {
    /// Wrap `value` stored at `now`.
    #[must_use]
    pub fn new(value: CacheValue, now: Timestamp, ttl: Duration) -> Self {
        let size_bytes = value.estimated_size();
        Self {
            value,
            stored_at: now,
            ttl,
            size_bytes,
        }
    }

    /// Time since the value was stored.
    #[must_use]
    pub const fn age(&self, now: Timestamp) -> Duration {
        self.stored_at.elapsed_until(now)
    }

    /// Whether the entry is younger than `ttl` (or its own TTL).
    #[must_use]
    pub fn is_fresh(&self, now: Timestamp, ttl: Option<Duration>) -> bool {
        self.age(now) <= ttl.unwrap_or(self.ttl)
    }
}
