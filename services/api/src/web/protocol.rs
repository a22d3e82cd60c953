//! services/api/src/web/protocol.rs
//!
//! Defines the JSON wire types shared by the REST endpoints and the live
//! bookmark WebSocket.

use bookmark_sync_core::{Bookmark, Favicon};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Shared payloads
//=========================================================================================

/// A bookmark as rendered by the client.
#[derive(Serialize, Debug, Clone, PartialEq, ToSchema)]
pub struct BookmarkPayload {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Remote favicon URL, when the bookmark URL has a host.
    pub favicon_url: Option<String>,
    /// Letter to show when there is no favicon.
    pub initial: Option<String>,
}

impl From<&Bookmark> for BookmarkPayload {
    fn from(b: &Bookmark) -> Self {
        let (favicon_url, initial) = match b.favicon() {
            Favicon::Remote(url) => (Some(url), None),
            Favicon::Initial(c) => (None, Some(c.to_string())),
        };
        Self {
            id: b.id,
            url: b.url.clone(),
            title: b.title.clone(),
            created_at: b.created_at,
            favicon_url,
            initial,
        }
    }
}

/// Body of `POST /bookmarks` and of the `add_bookmark` socket message.
#[derive(Deserialize, Debug, Clone, ToSchema)]
pub struct CreateBookmarkRequest {
    pub url: String,
    pub title: String,
}

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submits the add-bookmark form.
    AddBookmark { url: String, title: String },

    /// Deletes a bookmark. The server removes it from the list immediately.
    DeleteBookmark { id: Uuid },
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The full, ordered list. Sent after the initial load and after every change.
    /// While `ready` is false the client should show a loading state.
    Bookmarks {
        ready: bool,
        bookmarks: Vec<BookmarkPayload>,
    },

    /// A bookmark was created by this client's request.
    BookmarkAdded { bookmark: BookmarkPayload },

    /// The add form was rejected before reaching the store; show inline.
    ValidationFailed { message: String },

    /// A store request failed; show as a transient notification.
    Error { message: String },

    /// The auth session was signed out. No further messages follow.
    SignedOut,
}

impl ServerMessage {
    pub fn bookmarks(ready: bool, items: &[Bookmark]) -> Self {
        Self::Bookmarks {
            ready,
            bookmarks: items.iter().map(BookmarkPayload::from).collect(),
        }
    }
}
