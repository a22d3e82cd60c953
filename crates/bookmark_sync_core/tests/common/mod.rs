//! In-memory stand-ins for the store and the change feed.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bookmark_sync_core::{
    Bookmark, BookmarkStore, BookmarkSyncView, Change, ChangeFeed, FeedEvent, NewBookmark,
    PortError, PortResult, Snapshot, Subscription, SubscriptionId,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use uuid::Uuid;

pub const OWNER: Uuid = Uuid::from_u128(0xA11CE);

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub fn bookmark(n: u128, secs: i64) -> Bookmark {
    Bookmark {
        id: id(n),
        url: format!("https://example.com/{}", n),
        title: format!("Bookmark {}", n),
        owner: OWNER,
        created_at: at(secs),
    }
}

pub fn insert(seq: u64, b: Bookmark) -> FeedEvent {
    FeedEvent { seq, change: Change::Insert(b) }
}

pub fn update(seq: u64, b: Bookmark) -> FeedEvent {
    FeedEvent { seq, change: Change::Update(b) }
}

pub fn delete(seq: u64, n: u128) -> FeedEvent {
    FeedEvent { seq, change: Change::Delete { id: id(n) } }
}

/// Ids of the view's items, in list order.
pub fn ids(view: &BookmarkSyncView) -> Vec<Uuid> {
    view.items().iter().map(|b| b.id).collect()
}

//=========================================================================================
// Store
//=========================================================================================

#[derive(Default)]
pub struct FakeStore {
    pub rows: Mutex<Vec<Bookmark>>,
    pub watermark: Mutex<u64>,
    pub fail_list: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_delete: AtomicBool,
    pub calls: Mutex<Vec<&'static str>>,
    clock: AtomicI64,
}

impl FakeStore {
    pub fn with_rows(rows: Vec<Bookmark>, watermark: u64) -> Arc<Self> {
        let store = Self::default();
        let newest = rows
            .iter()
            .map(|b| b.created_at.timestamp() - at(0).timestamp())
            .max()
            .unwrap_or(0);
        store.clock.store(newest, Ordering::SeqCst);
        *store.rows.lock().unwrap() = rows;
        *store.watermark.lock().unwrap() = watermark;
        Arc::new(store)
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BookmarkStore for FakeStore {
    async fn list_bookmarks(&self, owner: Uuid) -> PortResult<Snapshot> {
        self.record("list");
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("connection refused".to_string()));
        }
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
            watermark: *self.watermark.lock().unwrap(),
        })
    }

    async fn insert_bookmark(&self, new: NewBookmark) -> PortResult<Bookmark> {
        self.record("insert");
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(PortError::Rejected("insert violates row-level security".to_string()));
        }
        let secs = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            url: new.url().to_string(),
            title: new.title().to_string(),
            owner: new.owner(),
            created_at: at(secs),
        };
        self.rows.lock().unwrap().push(bookmark.clone());
        Ok(bookmark)
    }

    async fn delete_bookmark(&self, owner: Uuid, id: Uuid) -> PortResult<()> {
        self.record("delete");
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("timeout".to_string()));
        }
        self.rows
            .lock()
            .unwrap()
            .retain(|b| !(b.id == id && b.owner == owner));
        Ok(())
    }
}

//=========================================================================================
// Change feed
//=========================================================================================

#[derive(Default)]
pub struct FakeFeed {
    senders: Mutex<HashMap<SubscriptionId, UnboundedSender<FeedEvent>>>,
    pub unsubscribed: Mutex<Vec<SubscriptionId>>,
    pub fail_subscribe: AtomicBool,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `event` to every open subscription.
    pub fn push(&self, event: FeedEvent) {
        for sender in self.senders.lock().unwrap().values() {
            let _ = sender.unbounded_send(event.clone());
        }
    }

    pub fn open_subscriptions(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, _owner: Uuid) -> PortResult<Subscription> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("realtime unavailable".to_string()));
        }
        let (tx, rx) = unbounded();
        let id = SubscriptionId::new();
        self.senders.lock().unwrap().insert(id, tx);
        Ok(Subscription {
            id,
            events: Box::pin(rx),
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.senders.lock().unwrap().remove(&id);
        self.unsubscribed.lock().unwrap().push(id);
    }
}

pub fn view(store: &Arc<FakeStore>, feed: &Arc<FakeFeed>) -> BookmarkSyncView {
    BookmarkSyncView::new(store.clone(), feed.clone())
}
