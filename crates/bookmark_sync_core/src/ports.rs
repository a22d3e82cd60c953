//! crates/bookmark_sync_core/src/ports.rs
//!
//! Defines the service contracts (traits) the sync logic depends on.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete backend (database, push transport, identity provider).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use uuid::Uuid;

use crate::domain::{Bookmark, FeedEvent, NewBookmark, Snapshot, User, UserCredentials};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Rejected by the store: {0}")]
    Rejected(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Change feed types
//=========================================================================================

/// The live event stream of one subscription. The stream ending means the feed dropped.
pub type ChangeStream = Pin<Box<dyn Stream<Item = FeedEvent> + Send>>;

/// Opaque handle used to close a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An open subscription on the change feed.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: ChangeStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Query/mutate access to the `bookmarks` relation. Every call is scoped to `owner`.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// All bookmarks of `owner`, newest first, together with the change watermark.
    async fn list_bookmarks(&self, owner: Uuid) -> PortResult<Snapshot>;

    /// Inserts a bookmark; the store assigns `id` and `created_at`.
    async fn insert_bookmark(&self, new: NewBookmark) -> PortResult<Bookmark>;

    /// Deletes a bookmark owned by `owner`. Deleting a missing row is not an error.
    async fn delete_bookmark(&self, owner: Uuid, id: Uuid) -> PortResult<()>;
}

/// Push-based notifications for the `bookmarks` relation.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a subscription delivering changes to `owner`'s bookmarks, in write-log order.
    async fn subscribe(&self, owner: Uuid) -> PortResult<Subscription>;

    /// Closes a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolves a browser auth session to its user, `None` if missing or expired.
    async fn current_user(&self, auth_session_id: &str) -> PortResult<Option<User>>;

    async fn create_user_with_email(&self, email: &str, hashed_password: &str) -> PortResult<User>;

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials>;

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()>;

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()>;
}
