pub mod domain;
pub mod ports;
pub mod sync;

pub use domain::{
    AuthSession, Bookmark, Change, FeedEvent, Favicon, NewBookmark, Snapshot, User,
    UserCredentials, ValidationError, MAX_TITLE_CHARS,
};
pub use ports::{
    AuthService, BookmarkStore, ChangeFeed, ChangeStream, PortError, PortResult, Subscription,
    SubscriptionId,
};
pub use sync::{BookmarkSyncView, RollbackStrategy, SyncError};
