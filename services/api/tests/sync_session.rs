//! End-to-end tests of the live bookmark session loop, driven through
//! in-memory channels instead of a real WebSocket.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use api_lib::adapters::feed::{OwnedChange, PgChangeFeed};
use api_lib::config::Config;
use api_lib::web::protocol::{ClientMessage, ServerMessage};
use api_lib::web::state::{AppState, SignOutRegistry};
use api_lib::web::sync_task::sync_process;
use assert_matches::assert_matches;
use async_trait::async_trait;
use bookmark_sync_core::{
    AuthService, Bookmark, BookmarkStore, Change, FeedEvent, NewBookmark, PortError, PortResult,
    Snapshot, User, UserCredentials,
};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

//=========================================================================================
// Fakes
//=========================================================================================

/// A store that publishes every write to the feed hub, like the database trigger does.
struct MemoryStore {
    rows: Mutex<Vec<Bookmark>>,
    seq: AtomicU64,
    feed: Arc<PgChangeFeed>,
    fail_delete: AtomicBool,
    reject_inserts: AtomicBool,
    inserts: AtomicUsize,
}

impl MemoryStore {
    fn new(feed: Arc<PgChangeFeed>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            feed,
            fail_delete: AtomicBool::new(false),
            reject_inserts: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
        })
    }

    fn record(&self, owner: Uuid, change: Change) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.feed.publish(OwnedChange {
            owner,
            event: FeedEvent { seq, change },
        });
    }

    /// A write made by another session of the same user.
    fn insert_elsewhere(&self, owner: Uuid, title: &str) -> Bookmark {
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            url: "https://example.com".to_string(),
            title: title.to_string(),
            owner,
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(bookmark.clone());
        self.record(owner, Change::Insert(bookmark.clone()));
        bookmark
    }
}

#[async_trait]
impl BookmarkStore for MemoryStore {
    async fn list_bookmarks(&self, owner: Uuid) -> PortResult<Snapshot> {
        let bookmarks = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.owner == owner)
            .cloned()
            .collect();
        Ok(Snapshot {
            bookmarks,
            watermark: self.seq.load(Ordering::SeqCst),
        })
    }

    async fn insert_bookmark(&self, new: NewBookmark) -> PortResult<Bookmark> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(PortError::Rejected("URL is longer than 2048 characters".to_string()));
        }
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            url: new.url().to_string(),
            title: new.title().to_string(),
            owner: new.owner(),
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(bookmark.clone());
        self.record(bookmark.owner, Change::Insert(bookmark.clone()));
        Ok(bookmark)
    }

    async fn delete_bookmark(&self, owner: Uuid, id: Uuid) -> PortResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("connection reset".to_string()));
        }
        self.rows.lock().unwrap().retain(|b| !(b.id == id && b.owner == owner));
        self.record(owner, Change::Delete { id });
        Ok(())
    }
}

struct NoAuth;

#[async_trait]
impl AuthService for NoAuth {
    async fn current_user(&self, _auth_session_id: &str) -> PortResult<Option<User>> {
        Ok(None)
    }
    async fn create_user_with_email(&self, _email: &str, _hashed_password: &str) -> PortResult<User> {
        Err(PortError::Unauthorized)
    }
    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        Err(PortError::NotFound(email.to_string()))
    }
    async fn create_auth_session(&self, _: &str, _: Uuid, _: DateTime<Utc>) -> PortResult<()> {
        Err(PortError::Unauthorized)
    }
    async fn delete_auth_session(&self, _: &str) -> PortResult<()> {
        Ok(())
    }
}

//=========================================================================================
// Harness
//=========================================================================================

struct Session {
    owner: Uuid,
    store: Arc<MemoryStore>,
    feed: Arc<PgChangeFeed>,
    sign_outs: Arc<SignOutRegistry>,
    to_server: Option<mpsc::Sender<ClientMessage>>,
    from_server: mpsc::Receiver<ServerMessage>,
    task: JoinHandle<()>,
}

const AUTH_SESSION: &str = "cookie-session";

fn config() -> Arc<Config> {
    Arc::new(
        Config::from_lookup(|key| (key == "DATABASE_URL").then(|| "postgres://unused".to_string()))
            .unwrap(),
    )
}

async fn start(seed: &[&str]) -> Session {
    let owner = Uuid::new_v4();
    let feed = Arc::new(PgChangeFeed::new(64));
    let store = MemoryStore::new(feed.clone());
    for title in seed {
        store.insert_elsewhere(owner, title);
    }

    let sign_outs = Arc::new(SignOutRegistry::default());
    let app_state = Arc::new(AppState {
        store: store.clone(),
        feed: feed.clone(),
        auth: Arc::new(NoAuth),
        config: config(),
        sign_outs: sign_outs.clone(),
    });
    let signed_out: CancellationToken = sign_outs.acquire(AUTH_SESSION);

    let (to_server, inbound) = mpsc::channel(8);
    let (outbound, from_server) = mpsc::channel(64);
    let task = tokio::spawn(sync_process(
        app_state,
        owner,
        ReceiverStream::new(inbound),
        outbound,
        signed_out,
    ));

    Session {
        owner,
        store,
        feed,
        sign_outs,
        to_server: Some(to_server),
        from_server,
        task,
    }
}

impl Session {
    async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), self.from_server.recv())
            .await
            .expect("timed out waiting for the server")
            .expect("session ended")
    }

    /// Waits for the next full-list message and returns its titles.
    async fn next_list(&mut self) -> (bool, Vec<String>) {
        match self.next().await {
            ServerMessage::Bookmarks { ready, bookmarks } => {
                (ready, bookmarks.into_iter().map(|b| b.title).collect())
            }
            other => panic!("expected a bookmark list, got {:?}", other),
        }
    }

    async fn send(&self, message: ClientMessage) {
        self.to_server
            .as_ref()
            .expect("client still connected")
            .send(message)
            .await
            .unwrap();
    }

    /// Messages that arrive within a short quiet period.
    async fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(150), self.from_server.recv()).await
        {
            out.push(message);
        }
        out
    }

    async fn disconnect(mut self) -> Arc<PgChangeFeed> {
        self.to_server.take();
        self.task.await.unwrap();
        self.feed
    }
}

//=========================================================================================
// Tests
//=========================================================================================

#[tokio::test]
async fn loads_then_follows_other_sessions() {
    let mut session = start(&["first", "second"]).await;

    assert_eq!(session.next_list().await, (false, vec![]));
    let (ready, titles) = session.next_list().await;
    assert!(ready);
    assert_eq!(titles.len(), 2);

    session.store.insert_elsewhere(session.owner, "from laptop");
    let (_, titles) = session.next_list().await;
    assert_eq!(titles[0], "from laptop");
    assert_eq!(titles.len(), 3);

    let feed = session.disconnect().await;
    assert_eq!(feed.subscription_count(), 0);
}

#[tokio::test]
async fn other_users_changes_are_not_delivered() {
    let mut session = start(&[]).await;
    session.next_list().await;
    session.next_list().await;

    session.store.insert_elsewhere(Uuid::new_v4(), "not mine");
    assert!(session.drain().await.is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn add_creates_exactly_one_entry() {
    let mut session = start(&["existing"]).await;
    session.next_list().await;
    session.next_list().await;

    session
        .send(ClientMessage::AddBookmark {
            url: "https://www.rust-lang.org".to_string(),
            title: "Rust".to_string(),
        })
        .await;

    let messages = session.drain().await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServerMessage::BookmarkAdded { bookmark } if bookmark.title == "Rust")));

    let last_list = messages
        .iter()
        .rev()
        .find_map(|m| match m {
            ServerMessage::Bookmarks { bookmarks, .. } => Some(bookmarks.clone()),
            _ => None,
        })
        .expect("an updated list");
    let titles: Vec<_> = last_list.iter().map(|b| b.title.as_str()).collect();
    assert_eq!(titles, vec!["Rust", "existing"]);

    session.disconnect().await;
}

#[tokio::test]
async fn invalid_add_is_rejected_before_the_store() {
    let mut session = start(&[]).await;
    session.next_list().await;
    session.next_list().await;

    session
        .send(ClientMessage::AddBookmark {
            url: String::new(),
            title: "No url".to_string(),
        })
        .await;

    assert_matches!(session.next().await, ServerMessage::ValidationFailed { message } => {
        assert_eq!(message, "URL is required");
    });
    assert_eq!(session.store.inserts.load(Ordering::SeqCst), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn failed_delete_is_rolled_back() {
    let mut session = start(&["keep me"]).await;
    session.next_list().await;
    session.next_list().await;

    let id = session.store.rows.lock().unwrap()[0].id;
    session.store.fail_delete.store(true, Ordering::SeqCst);
    session.send(ClientMessage::DeleteBookmark { id }).await;

    assert_eq!(session.next_list().await, (true, vec![]));
    assert_eq!(session.next_list().await, (true, vec!["keep me".to_string()]));
    assert_matches!(session.next().await, ServerMessage::Error { message } => {
        assert_eq!(message, "Failed to delete bookmark");
    });

    session.disconnect().await;
}

#[tokio::test]
async fn delete_removes_and_echo_is_silent() {
    let mut session = start(&["a", "b"]).await;
    session.next_list().await;
    session.next_list().await;

    let id = session.store.rows.lock().unwrap()[0].id;
    session.send(ClientMessage::DeleteBookmark { id }).await;

    assert_eq!(session.next_list().await, (true, vec!["b".to_string()]));
    // The feed's delete for the same row changes nothing, so nothing more is sent.
    assert!(session.drain().await.is_empty());

    session.disconnect().await;
}

#[tokio::test]
async fn feed_shutdown_keeps_the_session_alive() {
    let mut session = start(&["a"]).await;
    session.next_list().await;
    session.next_list().await;

    session.feed.shutdown();
    session
        .send(ClientMessage::AddBookmark {
            url: "https://docs.rs".to_string(),
            title: "docs".to_string(),
        })
        .await;

    let messages = session.drain().await;
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServerMessage::BookmarkAdded { .. })));

    session.disconnect().await;
}

#[tokio::test]
async fn refused_add_reports_the_store_reason() {
    let mut session = start(&[]).await;
    session.next_list().await;
    session.next_list().await;

    session.store.reject_inserts.store(true, Ordering::SeqCst);
    session
        .send(ClientMessage::AddBookmark {
            url: "https://example.com/long".to_string(),
            title: "Long".to_string(),
        })
        .await;

    assert_matches!(session.next().await, ServerMessage::Error { message } => {
        assert_eq!(message, "URL is longer than 2048 characters");
    });

    session.disconnect().await;
}

#[tokio::test]
async fn sign_out_ends_the_live_session() {
    let mut session = start(&["a"]).await;
    session.next_list().await;
    session.next_list().await;
    assert_eq!(session.feed.subscription_count(), 1);

    session.sign_outs.sign_out(AUTH_SESSION);
    assert_matches!(session.next().await, ServerMessage::SignedOut);

    // The loop has exited: the outbound channel closes and nothing more is pushed.
    session.store.insert_elsewhere(session.owner, "after sign-out");
    let closed = tokio::time::timeout(Duration::from_secs(2), session.from_server.recv())
        .await
        .expect("session did not stop");
    assert!(closed.is_none());

    let feed = session.disconnect().await;
    assert_eq!(feed.subscription_count(), 0);
}
