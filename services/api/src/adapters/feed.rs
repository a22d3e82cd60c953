//! services/api/src/adapters/feed.rs
//!
//! The change feed adapter, implementing the `ChangeFeed` port on top of
//! Postgres LISTEN/NOTIFY.
//!
//! A single pump task per process listens on the channel the `bookmarks`
//! trigger notifies on, decodes each payload and fans it out over a
//! `tokio::sync::broadcast` hub. Every subscription is a filtered view of that
//! hub for one owner, closed through its own `CancellationToken`.

use async_trait::async_trait;
use bookmark_sync_core::domain::{Bookmark, Change, FeedEvent};
use bookmark_sync_core::ports::{ChangeFeed, PortResult, Subscription, SubscriptionId};
use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// NOTIFY channel written by the `record_bookmark_change` trigger.
pub const CHANNEL: &str = "bookmark_changes";

/// A decoded notification, still carrying the owner used for scoping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedChange {
    pub owner: Uuid,
    pub event: FeedEvent,
}

//=========================================================================================
// Notification payload
//=========================================================================================

#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Deserialize)]
struct BookmarkRow {
    id: Uuid,
    owner: Uuid,
    url: String,
    title: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct NotificationPayload {
    seq: u64,
    kind: ChangeKind,
    owner: Uuid,
    record: BookmarkRow,
}

/// Decodes the JSON payload emitted by the trigger.
pub fn decode_notification(payload: &str) -> Result<OwnedChange, serde_json::Error> {
    let payload: NotificationPayload = serde_json::from_str(payload)?;
    let row = payload.record;
    let change = match payload.kind {
        ChangeKind::Delete => Change::Delete { id: row.id },
        kind => {
            let bookmark = Bookmark {
                id: row.id,
                url: row.url,
                title: row.title,
                owner: row.owner,
                created_at: row.created_at,
            };
            match kind {
                ChangeKind::Insert => Change::Insert(bookmark),
                _ => Change::Update(bookmark),
            }
        }
    };
    Ok(OwnedChange {
        owner: payload.owner,
        event: FeedEvent {
            seq: payload.seq,
            change,
        },
    })
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

pub struct PgChangeFeed {
    hub: broadcast::Sender<OwnedChange>,
    subscriptions: Mutex<HashMap<SubscriptionId, CancellationToken>>,
    /// Parent of every subscription token; cancelled when the pump stops.
    shutdown: CancellationToken,
}

impl PgChangeFeed {
    /// Creates a feed with no producer attached. Changes are fed in through [`publish`](Self::publish).
    pub fn new(capacity: usize) -> Self {
        let (hub, _) = broadcast::channel(capacity);
        Self {
            hub,
            subscriptions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts listening on [`CHANNEL`] and spawns the pump task.
    pub async fn start(pool: &PgPool, capacity: usize) -> Result<Arc<Self>, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(CHANNEL).await?;
        info!("Listening for bookmark changes on channel '{}'", CHANNEL);

        let feed = Arc::new(Self::new(capacity));
        let pump_feed = feed.clone();
        tokio::spawn(async move { pump(listener, pump_feed).await });
        Ok(feed)
    }

    /// Fans a change out to every subscription. Dropped if nobody is subscribed.
    pub fn publish(&self, change: OwnedChange) {
        let _ = self.hub.send(change);
    }

    /// Stops the feed; every open subscription stream ends.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .map(|subs| subs.len())
            .unwrap_or_default()
    }
}

async fn pump(mut listener: PgListener, feed: Arc<PgChangeFeed>) {
    loop {
        tokio::select! {
            _ = feed.shutdown.cancelled() => {
                info!("Change feed pump stopped.");
                return;
            }
            notification = listener.recv() => match notification {
                Ok(notification) => match decode_notification(notification.payload()) {
                    Ok(change) => {
                        debug!("Change {} for user {}", change.event.seq, change.owner);
                        feed.publish(change);
                    }
                    Err(e) => warn!("Discarding malformed change notification: {}", e),
                },
                Err(e) => {
                    error!("Change feed listener failed: {:?}", e);
                    feed.shutdown();
                    return;
                }
            }
        }
    }
}

//=========================================================================================
// `ChangeFeed` Trait Implementation
//=========================================================================================

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self, owner: Uuid) -> PortResult<Subscription> {
        // Subscribe to the hub right away so nothing published from here on is missed.
        let receiver = self.hub.subscribe();
        let id = SubscriptionId::new();
        let token = self.shutdown.child_token();

        let events = BroadcastStream::new(receiver)
            .take_while(move |item| {
                if let Err(e) = item {
                    warn!("Subscription {} fell behind the change feed ({}); closing it", id, e);
                }
                future::ready(item.is_ok())
            })
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(change) if change.owner == owner => Some(change.event),
                    _ => None,
                })
            })
            .take_until(token.clone().cancelled_owned());

        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(id, token);
        }
        debug!("Subscription {} opened for user {}", id, owner);

        Ok(Subscription {
            id,
            events: Box::pin(events),
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let token = self
            .subscriptions
            .lock()
            .ok()
            .and_then(|mut subs| subs.remove(&id));
        if let Some(token) = token {
            token.cancel();
            debug!("Subscription {} closed", id);
        }
    }
}
