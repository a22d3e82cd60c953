//! crates/bookmark_sync_core/src/sync.rs
//!
//! `BookmarkSyncView` keeps one user's bookmark list correct while three sources
//! mutate it: the initial bulk load, the live change feed, and the user's own
//! create/delete actions.
//!
//! The view is a single-consumer state machine. Every mutating method takes
//! `&mut self`, so a host event loop applies the load result, feed events and
//! store completions one at a time in the order it receives them. Store calls
//! are split into `begin`/`prepare` and `complete` halves so the host can keep
//! feeding events into the view while a request is in flight.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{Bookmark, Change, FeedEvent, NewBookmark, Snapshot, ValidationError};
use crate::ports::{BookmarkStore, ChangeFeed, ChangeStream, PortError, PortResult, SubscriptionId};

//=========================================================================================
// Errors and settings
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Invalid bookmark: {0}")]
    Validation(#[from] ValidationError),
    #[error("Store error: {0}")]
    Store(#[from] PortError),
    #[error("The bookmark view has not been initialized for a user")]
    NotInitialized,
}

/// How a failed optimistic delete is undone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RollbackStrategy {
    /// Put back only the removed record, at its `created_at` position.
    /// Feed events applied while the delete was in flight are kept.
    #[default]
    Reinsert,
    /// Restore the whole list as it was before the optimistic removal.
    /// Feed events applied while the delete was in flight are lost.
    Snapshot,
}

impl FromStr for RollbackStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reinsert" => Ok(Self::Reinsert),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(format!(
                "'{}' is not a rollback strategy (expected 'reinsert' or 'snapshot')",
                other
            )),
        }
    }
}

/// An optimistic delete awaiting the store's answer.
#[derive(Debug)]
struct PendingDelete {
    /// The removed record, kept current by feed updates. `None` once the feed reported it deleted.
    record: Option<Bookmark>,
    /// The list as it was right before the removal.
    prior: Vec<Bookmark>,
}

//=========================================================================================
// The view
//=========================================================================================

pub struct BookmarkSyncView {
    store: Arc<dyn BookmarkStore>,
    feed: Arc<dyn ChangeFeed>,
    rollback: RollbackStrategy,

    owner: Option<Uuid>,
    subscription: Option<SubscriptionId>,

    items: Vec<Bookmark>,
    ready: bool,
    /// Feed events received before the snapshot was applied.
    buffered: Vec<FeedEvent>,
    /// Highest feed `seq` reflected in `items`.
    applied_through: u64,
    pending_deletes: HashMap<Uuid, PendingDelete>,
    /// Ids the feed reported deleted; ids are never reused by the store.
    /// Grows by one per feed delete and is cleared on every snapshot and on teardown.
    tombstones: HashSet<Uuid>,
}

impl BookmarkSyncView {
    pub fn new(store: Arc<dyn BookmarkStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            store,
            feed,
            rollback: RollbackStrategy::default(),
            owner: None,
            subscription: None,
            items: Vec::new(),
            ready: false,
            buffered: Vec::new(),
            applied_through: 0,
            pending_deletes: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    pub fn with_rollback(mut self, rollback: RollbackStrategy) -> Self {
        self.rollback = rollback;
        self
    }

    /// The current list, newest first.
    pub fn items(&self) -> &[Bookmark] {
        &self.items
    }

    /// `false` until the initial load has been applied (successfully or not).
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn owner(&self) -> Option<Uuid> {
        self.owner
    }

    pub fn has_pending_delete(&self, id: Uuid) -> bool {
        self.pending_deletes.contains_key(&id)
    }

    //-------------------------------------------------------------------------------------
    // Initial load
    //-------------------------------------------------------------------------------------

    /// Subscribes to the feed for `owner`, then loads the owner's bookmarks.
    ///
    /// The subscription is opened before the query so no write that lands during the
    /// load is missed; events already covered by the snapshot are dropped by `seq`.
    /// Returns the live event stream, or `None` if the feed could not be opened (the
    /// list is still loaded, it just won't update live).
    pub async fn initialize(&mut self, owner: Uuid) -> Option<ChangeStream> {
        if self.owner.is_some() || self.subscription.is_some() {
            self.teardown().await;
        }
        self.owner = Some(owner);

        let stream = match self.feed.subscribe(owner).await {
            Ok(subscription) => {
                info!("Opened change feed subscription {} for user {}", subscription.id, owner);
                self.subscription = Some(subscription.id);
                Some(subscription.events)
            }
            Err(e) => {
                warn!("Failed to subscribe to bookmark changes for user {}: {:?}", owner, e);
                None
            }
        };

        let result = self.store.list_bookmarks(owner).await;
        self.apply_snapshot(result);
        stream
    }

    /// Replaces the list with the load result and replays buffered feed events.
    ///
    /// A failed load leaves an empty, ready list.
    pub fn apply_snapshot(&mut self, result: PortResult<Snapshot>) {
        self.pending_deletes.clear();
        self.tombstones.clear();

        match result {
            Ok(snapshot) => {
                debug!(
                    "Loaded {} bookmarks at watermark {}",
                    snapshot.bookmarks.len(),
                    snapshot.watermark
                );
                self.items = newest_first_unique(snapshot.bookmarks);
                self.applied_through = snapshot.watermark;
            }
            Err(e) => {
                error!("Error fetching bookmarks: {:?}", e);
                self.items.clear();
                self.applied_through = 0;
            }
        }
        self.ready = true;

        let buffered = std::mem::take(&mut self.buffered);
        for event in buffered {
            self.on_change_event(event);
        }
    }

    //-------------------------------------------------------------------------------------
    // Change feed
    //-------------------------------------------------------------------------------------

    /// Applies one feed event. Returns `true` if `items` changed.
    pub fn on_change_event(&mut self, event: FeedEvent) -> bool {
        if !self.ready {
            self.buffered.push(event);
            return false;
        }
        if event.seq <= self.applied_through {
            debug!("Skipping change {} (already applied through {})", event.seq, self.applied_through);
            return false;
        }
        self.applied_through = event.seq;
        self.apply_change(event.change)
    }

    fn apply_change(&mut self, change: Change) -> bool {
        let id = change.id();
        if self.tombstones.contains(&id) {
            return false;
        }

        if let Some(pending) = self.pending_deletes.get_mut(&id) {
            match change {
                Change::Insert(b) | Change::Update(b) => {
                    if pending.record.is_some() {
                        pending.record = Some(b);
                    }
                }
                Change::Delete { .. } => {
                    pending.record = None;
                    self.tombstones.insert(id);
                }
            }
            return false;
        }

        match change {
            Change::Insert(bookmark) => match self.position(id) {
                Some(i) => replace_if_changed(&mut self.items[i], bookmark),
                None => {
                    self.items.insert(0, bookmark);
                    true
                }
            },
            Change::Update(bookmark) => match self.position(id) {
                Some(i) => replace_if_changed(&mut self.items[i], bookmark),
                None => false,
            },
            Change::Delete { id } => {
                self.tombstones.insert(id);
                match self.position(id) {
                    Some(i) => {
                        self.items.remove(i);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    //-------------------------------------------------------------------------------------
    // Create
    //-------------------------------------------------------------------------------------

    /// Validates a creation request for the current owner. Nothing is sent to the store.
    pub fn prepare_add(&self, url: &str, title: &str) -> Result<NewBookmark, SyncError> {
        let owner = self.owner.ok_or(SyncError::NotInitialized)?;
        Ok(NewBookmark::new(url, title, owner)?)
    }

    /// Applies the store's answer to an insert. On failure `items` is left untouched.
    ///
    /// The record is only added if the feed has not already reported it. A feed copy
    /// is never older than the store's answer, so it is never overwritten from here.
    pub fn complete_add(&mut self, result: PortResult<Bookmark>) -> Result<Bookmark, SyncError> {
        match result {
            Ok(bookmark) => {
                let id = bookmark.id;
                let known = self.tombstones.contains(&id)
                    || self.pending_deletes.contains_key(&id)
                    || self.position(id).is_some();
                if known {
                    debug!("Bookmark {} already delivered by the feed", id);
                } else {
                    self.insert_sorted(bookmark.clone());
                }
                Ok(bookmark)
            }
            Err(e) => {
                warn!("Error adding bookmark: {:?}", e);
                Err(SyncError::Store(e))
            }
        }
    }

    /// Validates, inserts through the store, and applies the returned record.
    pub async fn add_bookmark(&mut self, url: &str, title: &str) -> Result<Bookmark, SyncError> {
        let new = self.prepare_add(url, title)?;
        let result = self.store.insert_bookmark(new).await;
        self.complete_add(result)
    }

    //-------------------------------------------------------------------------------------
    // Delete
    //-------------------------------------------------------------------------------------

    /// Optimistically removes `id`. Returns `false` (and does nothing) if it is not in
    /// the list or a delete for it is already in flight; no store call should follow.
    pub fn begin_delete(&mut self, id: Uuid) -> bool {
        if self.pending_deletes.contains_key(&id) {
            return false;
        }
        let Some(index) = self.position(id) else {
            return false;
        };

        let prior = self.items.clone();
        let record = self.items.remove(index);
        self.pending_deletes.insert(
            id,
            PendingDelete {
                record: Some(record),
                prior,
            },
        );
        true
    }

    /// Finalizes an optimistic delete, rolling it back if the store refused it.
    pub fn complete_delete(&mut self, id: Uuid, result: PortResult<()>) -> Result<(), SyncError> {
        let pending = self.pending_deletes.remove(&id);
        let Err(e) = result else {
            return Ok(());
        };

        error!("Error deleting bookmark {}: {:?}", id, e);
        if let Some(pending) = pending {
            match self.rollback {
                RollbackStrategy::Snapshot => self.items = pending.prior,
                RollbackStrategy::Reinsert => {
                    if let Some(record) = pending.record {
                        if self.position(id).is_none() {
                            self.insert_sorted(record);
                        }
                    }
                }
            }
        }
        Err(SyncError::Store(e))
    }

    /// Removes `id` optimistically, deletes it in the store, and rolls back on failure.
    /// Deleting an id that is not in the list is a no-op.
    pub async fn delete_bookmark(&mut self, id: Uuid) -> Result<(), SyncError> {
        if !self.begin_delete(id) {
            return Ok(());
        }
        let owner = self.owner.ok_or(SyncError::NotInitialized)?;
        let result = self.store.delete_bookmark(owner, id).await;
        self.complete_delete(id, result)
    }

    //-------------------------------------------------------------------------------------
    // Teardown
    //-------------------------------------------------------------------------------------

    /// Closes the feed subscription and forgets the current user's data.
    pub async fn teardown(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.feed.unsubscribe(id).await;
            info!("Closed change feed subscription {}", id);
        }
        self.owner = None;
        self.items.clear();
        self.ready = false;
        self.buffered.clear();
        self.applied_through = 0;
        self.pending_deletes.clear();
        self.tombstones.clear();
    }

    //-------------------------------------------------------------------------------------
    // Helpers
    //-------------------------------------------------------------------------------------

    fn position(&self, id: Uuid) -> Option<usize> {
        self.items.iter().position(|b| b.id == id)
    }

    fn insert_sorted(&mut self, bookmark: Bookmark) {
        let index = self
            .items
            .iter()
            .position(|b| newest_first(&bookmark, b) == Ordering::Less)
            .unwrap_or(self.items.len());
        self.items.insert(index, bookmark);
    }
}

impl Drop for BookmarkSyncView {
    fn drop(&mut self) {
        if let Some(id) = self.subscription {
            warn!("BookmarkSyncView dropped without teardown; subscription {} left open", id);
        }
    }
}

/// Sort order of the list: `created_at` descending, ties broken by id descending.
fn newest_first(a: &Bookmark, b: &Bookmark) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

fn newest_first_unique(mut bookmarks: Vec<Bookmark>) -> Vec<Bookmark> {
    bookmarks.sort_by(newest_first);
    let mut seen = HashSet::with_capacity(bookmarks.len());
    bookmarks.retain(|b| seen.insert(b.id));
    bookmarks
}

fn replace_if_changed(slot: &mut Bookmark, incoming: Bookmark) -> bool {
    if *slot == incoming {
        false
    } else {
        *slot = incoming;
        true
    }
}
