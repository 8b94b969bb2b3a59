//! Message records exchanged between the client core and the backend.
//!
//! A [`Message`] is either *optimistic* (synthesized locally, identified by
//! a temporary id) or *authoritative* (confirmed by the server and carrying
//! a durable id). The same logical message may exist in both forms at once
//! while a send is in flight; collapsing those is the job of the merge
//! engine in the `glimpse` crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum caption length in characters.
pub const MAX_CAPTION_CHARS: usize = 2_000;

/// Number of caption characters used for the content fingerprint.
pub const FINGERPRINT_CHARS: usize = 32;

/// Prefix that marks a locally generated temporary id.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Identifier of a message.
///
/// Server ids are opaque strings assigned by the backend. Temporary ids are
/// generated locally with [`MessageId::temp`] and always start with
/// [`TEMP_ID_PREFIX`]. Both share one type so that lineage checks can
/// compare an id against a temp id directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered temporary id (UUID v7).
    #[must_use]
    pub fn temp() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id was generated locally.
    #[must_use]
    pub fn is_temp(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never valid as an identity).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a user account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps an account id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp. Used as the logical ordering clock.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Time elapsed between `self` and a later `now`, zero if `now` is earlier.
    #[must_use]
    pub const fn elapsed_until(&self, now: Self) -> Duration {
        Duration::from_millis(now.0.saturating_sub(self.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Video or other motion media with a playback duration.
    Video,
}

impl MediaKind {
    /// Whether the media plays over time (and therefore has its own duration).
    #[must_use]
    pub const fn is_motion(self) -> bool {
        matches!(self, Self::Video)
    }

    /// Short marker used when a message has no caption to fingerprint.
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Image => "[image]",
            Self::Video => "[video]",
        }
    }

    /// Parses the backend's `media_type` column (`"image"`, `"video"`, mime types).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        if lower == "image" || lower == "photo" || lower.starts_with("image/") {
            Some(Self::Image)
        } else if lower == "video" || lower.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

/// Remote media reference returned by the upload pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRef {
    /// Location of the full media object.
    pub url: String,
    /// Location of a preview image, if one was produced.
    pub thumbnail_url: Option<String>,
    /// What kind of media this is.
    pub kind: MediaKind,
}

/// Boolean state carried by every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags {
    /// Content may only be viewed once.
    pub view_once: bool,
    /// Content is marked sensitive; treated as ephemeral.
    pub is_nsfw: bool,
    /// The receiver has read the message.
    pub seen: bool,
    /// The message is an optimistic placeholder still being sent.
    pub sending: bool,
    /// Sending failed permanently.
    pub failed: bool,
}

/// A chat message record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    /// Durable server id, present once the message is confirmed.
    pub id: Option<MessageId>,
    /// Local temporary id, kept after confirmation for lineage.
    pub temp_id: Option<MessageId>,
    /// Who sent the message.
    pub sender_id: UserId,
    /// Who the message is addressed to.
    pub receiver_id: UserId,
    /// Logical creation time.
    pub created_at: Timestamp,
    /// Attached media, if any.
    pub media: Option<MediaRef>,
    /// Free-text caption.
    pub caption: Option<String>,
    /// Lifecycle flags.
    pub flags: MessageFlags,
}

/// Error returned when a message record fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither a server id nor a temporary id is present.
    #[error("message has no identity")]
    MissingIdentity,
    /// A participant id is missing or blank.
    #[error("missing participant: {0}")]
    MissingParticipant(&'static str),
    /// The message carries neither media nor a caption.
    #[error("message has no content")]
    EmptyContent,
    /// The caption exceeds [`MAX_CAPTION_CHARS`].
    #[error("caption too long ({len} chars, max {max})")]
    CaptionTooLong {
        /// Actual caption length in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
    /// A raw row could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl Message {
    /// Builds an authoritative (server-confirmed) text message.
    pub fn authoritative(
        id: impl Into<String>,
        sender: &UserId,
        receiver: &UserId,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: Some(MessageId::new(id)),
            temp_id: None,
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            created_at,
            media: None,
            caption: None,
            flags: MessageFlags::default(),
        }
    }

    /// Builds an optimistic placeholder identified only by `temp_id`.
    #[must_use]
    pub fn optimistic(
        temp_id: MessageId,
        sender: &UserId,
        receiver: &UserId,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: None,
            temp_id: Some(temp_id),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            created_at,
            media: None,
            caption: None,
            flags: MessageFlags {
                sending: true,
                ..MessageFlags::default()
            },
        }
    }

    /// Sets the caption.
    #[must_use]
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Attaches media.
    #[must_use]
    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    /// Marks the message as view-once.
    #[must_use]
    pub const fn view_once(mut self) -> Self {
        self.flags.view_once = true;
        self
    }

    /// Marks the message as NSFW.
    #[must_use]
    pub const fn nsfw(mut self) -> Self {
        self.flags.is_nsfw = true;
        self
    }

    /// Marks the message as read by the receiver.
    #[must_use]
    pub const fn seen(mut self) -> Self {
        self.flags.seen = true;
        self
    }

    /// Primary identity: the server id if present, else the temp id.
    #[must_use]
    pub fn identity(&self) -> Option<&MessageId> {
        self.id.as_ref().or(self.temp_id.as_ref())
    }

    /// Whether `candidate` is this message's server id or temp id.
    #[must_use]
    pub fn has_identity(&self, candidate: &MessageId) -> bool {
        self.id.as_ref() == Some(candidate) || self.temp_id.as_ref() == Some(candidate)
    }

    /// Whether this is a local placeholder that the server has not confirmed.
    #[must_use]
    pub const fn is_optimistic(&self) -> bool {
        self.id.is_none() || self.flags.sending
    }

    /// Whether the message disappears after a single viewing.
    #[must_use]
    pub const fn is_ephemeral(&self) -> bool {
        self.flags.view_once || self.flags.is_nsfw
    }

    /// Whether the message has the minimum fields needed to be displayed.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.identity().is_some_and(|id| !id.is_empty())
            && !self.sender_id.is_empty()
            && !self.receiver_id.is_empty()
    }

    /// Whether the message was exchanged between `a` and `b` in either direction.
    #[must_use]
    pub fn involves(&self, a: &UserId, b: &UserId) -> bool {
        (self.sender_id == *a && self.receiver_id == *b)
            || (self.sender_id == *b && self.receiver_id == *a)
    }

    /// The other participant from `owner`'s perspective.
    #[must_use]
    pub fn peer_of(&self, owner: &UserId) -> Option<&UserId> {
        if self.sender_id == *owner {
            Some(&self.receiver_id)
        } else if self.receiver_id == *owner {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Content fingerprint used to match unidentified optimistic records.
    ///
    /// The first [`FINGERPRINT_CHARS`] characters of the trimmed caption, or
    /// a media-kind marker when there is no caption.
    #[must_use]
    pub fn content_fingerprint(&self) -> String {
        match self.caption.as_deref().map(str::trim) {
            Some(caption) if !caption.is_empty() => {
                caption.chars().take(FINGERPRINT_CHARS).collect()
            }
            _ => self
                .media
                .as_ref()
                .map_or("[empty]", |m| m.kind.marker())
                .to_string(),
        }
    }

    /// Validates a record before it is handed to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if identity or participants are missing,
    /// the message has no content, or the caption is too long.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.identity().is_none_or(MessageId::is_empty) {
            return Err(ValidationError::MissingIdentity);
        }
        if self.sender_id.is_empty() {
            return Err(ValidationError::MissingParticipant("sender_id"));
        }
        if self.receiver_id.is_empty() {
            return Err(ValidationError::MissingParticipant("receiver_id"));
        }
        let caption_len = self.caption.as_deref().map_or(0, |c| c.chars().count());
        if self.media.is_none() && caption_len == 0 {
            return Err(ValidationError::EmptyContent);
        }
        if caption_len > MAX_CAPTION_CHARS {
            return Err(ValidationError::CaptionTooLong {
                len: caption_len,
                max: MAX_CAPTION_CHARS,
            });
        }
        Ok(())
    }
}
