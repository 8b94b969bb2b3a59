//! External collaborator interfaces consumed by the sync core.
//!
//! Defines the [`MessageBackend`] and [`MediaPipeline`] traits. The core
//! never talks to the network directly; hosts plug in a real client, and
//! tests use [`loopback::LoopbackBackend`](crate::loopback::LoopbackBackend).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use glimpse_proto::event::RealtimeEvent;
use glimpse_proto::message::{MediaKind, MediaRef, Message, MessageId, Timestamp, UserId};
use glimpse_proto::projection::ConversationProjection;

/// Errors reported by the backend or the media pipeline.
///
/// `Clone` so that a single-flight fetch can hand the same failure to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// No connectivity.
    #[error("backend offline")]
    Offline,

    /// The request did not complete in time.
    #[error("backend request timed out")]
    Timeout,

    /// The backend refused the request (validation, permissions).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The service reported an internal failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Offline | Self::Timeout | Self::Unavailable(_))
    }
}

/// Result ordering for [`ListQuery`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    /// Oldest first.
    Ascending,
    /// Newest first.
    #[default]
    Descending,
}

/// Cursor-paginated message query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListQuery {
    /// Only messages created strictly before this time.
    pub before: Option<Timestamp>,
    /// Only messages created strictly after this time.
    pub after: Option<Timestamp>,
    /// Maximum number of rows.
    pub limit: usize,
    /// Row order.
    pub order: Order,
}

impl ListQuery {
    /// Newest `limit` messages.
    #[must_use]
    pub const fn latest(limit: usize) -> Self {
        Self {
            before: None,
            after: None,
            limit,
            order: Order::Descending,
        }
    }

    /// The `limit` messages immediately older than `cursor`.
    #[must_use]
    pub const fn older_than(cursor: Timestamp, limit: usize) -> Self {
        Self {
            before: Some(cursor),
            after: None,
            limit,
            order: Order::Descending,
        }
    }
}

/// A local media object waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMedia {
    /// Host-specific reference to the local file (path or URI).
    pub uri: String,
    /// Kind of media.
    pub kind: MediaKind,
}

/// Authoritative message store and realtime feed.
pub trait MessageBackend: Send + Sync + 'static {
    /// Messages exchanged between `a` and `b` in either direction.
    fn list_messages(
        &self,
        a: &UserId,
        b: &UserId,
        query: ListQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, BackendError>> + Send;

    /// Persist a new message.
    ///
    /// `draft` carries the client temp id. Backends should echo it on the
    /// created record and in the realtime insert notification; the send
    /// queue reattaches it to the returned record when they do not.
    fn create_message(
        &self,
        draft: &Message,
    ) -> impl std::future::Future<Output = Result<Message, BackendError>> + Send;

    /// Mark `id` as read by `reader` (who must be its receiver).
    fn mark_read(
        &self,
        id: &MessageId,
        reader: &UserId,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Authoritative conversation list of `owner`.
    fn list_conversations(
        &self,
        owner: &UserId,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationProjection>, BackendError>>
    + Send;

    /// Open a realtime change feed.
    ///
    /// The feed ends (receiver yields `None`) when the backend shuts down.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RealtimeEvent>;
}

/// Media upload and encoding pipeline.
pub trait MediaPipeline: Send + Sync + 'static {
    /// Upload a local media object, returning its remote reference.
    fn upload(
        &self,
        media: &LocalMedia,
    ) -> impl std::future::Future<Output = Result<MediaRef, BackendError>> + Send;
}
