//! crates/bookmark_sync_core/src/domain.rs
//!
//! Defines the pure, core data structures for the bookmark manager.
//! These structs are independent of any database or serialization format.

use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

/// Maximum number of characters allowed in a bookmark title.
pub const MAX_TITLE_CHARS: usize = 200;

//=========================================================================================
// Bookmarks
//=========================================================================================

/// A saved URL. `id` and `created_at` are assigned by the store, never by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub owner: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    /// Picks the icon to render next to this bookmark.
    pub fn favicon(&self) -> Favicon {
        let host = Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned));
        match host {
            Some(host) => Favicon::Remote(format!(
                "https://www.google.com/s2/favicons?domain={}&sz=64",
                host
            )),
            None => Favicon::Initial(
                self.title
                    .chars()
                    .next()
                    .and_then(|c| c.to_uppercase().next())
                    .unwrap_or('?'),
            ),
        }
    }
}

/// Icon shown for a bookmark: a remote favicon, or the title's first letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Favicon {
    Remote(String),
    Initial(char),
}

/// Reasons a bookmark creation request is refused before reaching the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("URL is required")]
    EmptyUrl,
    #[error("URL must be absolute: {0}")]
    InvalidUrl(String),
    #[error("Title is required")]
    EmptyTitle,
    #[error("Title must be at most {max} characters (got {len})")]
    TitleTooLong { len: usize, max: usize },
}

/// A validated request to create a bookmark. Only obtainable through [`NewBookmark::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBookmark {
    url: String,
    title: String,
    owner: Uuid,
}

impl NewBookmark {
    /// Validates user input. Both fields are trimmed before checking.
    pub fn new(url: &str, title: &str, owner: Uuid) -> Result<Self, ValidationError> {
        let url = url.trim();
        let title = title.trim();

        if url.is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        // Relative references fail to parse.
        Url::parse(url).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

        if title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let len = title.chars().count();
        if len > MAX_TITLE_CHARS {
            return Err(ValidationError::TitleTooLong {
                len,
                max: MAX_TITLE_CHARS,
            });
        }

        Ok(Self {
            url: url.to_string(),
            title: title.to_string(),
            owner,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }
}

//=========================================================================================
// Change feed
//=========================================================================================

/// A row-level change on the `bookmarks` relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Insert(Bookmark),
    Update(Bookmark),
    Delete { id: Uuid },
}

impl Change {
    /// The id of the bookmark this change touches.
    pub fn id(&self) -> Uuid {
        match self {
            Change::Insert(b) | Change::Update(b) => b.id,
            Change::Delete { id } => *id,
        }
    }
}

/// A change as delivered by the feed. `seq` is the change's position in the
/// relation's write log and increases strictly with every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub seq: u64,
    pub change: Change,
}

/// The result of the initial bulk load.
///
/// `watermark` is the highest change `seq` whose effect is already contained
/// in `bookmarks`; `0` means no change has been recorded yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub bookmarks: Vec<Bookmark>,
    pub watermark: u64,
}

//=========================================================================================
// Users and auth
//=========================================================================================

// Represents a user - used throughout app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: Uuid,
    pub email: Option<String>,
}

// Only used internally for login/signup - contains sensitive data
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user_id: Uuid,
    pub email: String,
    pub hashed_password: String,
}

// Represents a browser login session (auth cookie)
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub id: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}
