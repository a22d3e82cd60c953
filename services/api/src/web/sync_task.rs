//! services/api/src/web/sync_task.rs
//!
//! This module contains the asynchronous "worker" that keeps one client's
//! bookmark list live.
//!
//! It owns a `BookmarkSyncView` and is its only consumer: client commands,
//! change feed events and store completions are all funnelled through one
//! `tokio::select!` loop and applied to the view one at a time. Store requests
//! run in spawned tasks and report back over a channel, so feed events keep
//! flowing while a request is in flight.

use crate::web::{
    protocol::{BookmarkPayload, ClientMessage, ServerMessage},
    state::AppState,
};
use bookmark_sync_core::{
    Bookmark, BookmarkSyncView, ChangeStream, FeedEvent, PortError, PortResult, SyncError,
};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The answer to a store request issued by the loop.
#[derive(Debug)]
enum Completion {
    Added(PortResult<Bookmark>),
    Deleted { id: Uuid, result: PortResult<()> },
}

/// The outbound side closed; the client is gone.
#[derive(Debug)]
struct Disconnected;

/// Runs the live bookmark session for `user_id` until `inbound` ends, `outbound`
/// is closed or `signed_out` is cancelled. The change feed subscription is always
/// closed on exit.
pub async fn sync_process<I>(
    app_state: Arc<AppState>,
    user_id: Uuid,
    mut inbound: I,
    outbound: mpsc::Sender<ServerMessage>,
    signed_out: CancellationToken,
) where
    I: Stream<Item = ClientMessage> + Unpin + Send,
{
    info!("Bookmark sync started for user {}", user_id);
    let mut view = app_state.new_sync_view();

    if emit(&outbound, ServerMessage::bookmarks(false, &[])).await.is_ok() {
        let feed = view.initialize(user_id).await;
        let session = run(&app_state, &mut view, feed, &mut inbound, &outbound, &signed_out);
        if let Err(Disconnected) = session.await {
            debug!("Client for user {} went away", user_id);
        }
    }

    view.teardown().await;
    info!("Bookmark sync ended for user {}", user_id);
}

async fn run<I>(
    app_state: &Arc<AppState>,
    view: &mut BookmarkSyncView,
    mut feed: Option<ChangeStream>,
    inbound: &mut I,
    outbound: &mpsc::Sender<ServerMessage>,
    signed_out: &CancellationToken,
) -> Result<(), Disconnected>
where
    I: Stream<Item = ClientMessage> + Unpin + Send,
{
    emit_list(outbound, view).await?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

    loop {
        tokio::select! {
            _ = signed_out.cancelled() => {
                info!("User {:?} signed out; closing live session", view.owner());
                return emit(outbound, ServerMessage::SignedOut).await;
            }
            message = inbound.next() => match message {
                Some(message) => handle_client_message(app_state, view, message, &done_tx, outbound).await?,
                None => return Ok(()),
            },
            event = next_event(&mut feed) => match event {
                Some(event) => {
                    if view.on_change_event(event) {
                        emit_list(outbound, view).await?;
                    }
                }
                None => {
                    warn!("Change feed closed; live updates stopped for this session");
                    feed = None;
                }
            },
            Some(done) = done_rx.recv() => handle_completion(view, done, outbound).await?,
        }
    }
}

async fn handle_client_message(
    app_state: &Arc<AppState>,
    view: &mut BookmarkSyncView,
    message: ClientMessage,
    done_tx: &mpsc::UnboundedSender<Completion>,
    outbound: &mpsc::Sender<ServerMessage>,
) -> Result<(), Disconnected> {
    match message {
        ClientMessage::AddBookmark { url, title } => match view.prepare_add(&url, &title) {
            Ok(new) => {
                let store = app_state.store.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = store.insert_bookmark(new).await;
                    let _ = done_tx.send(Completion::Added(result));
                });
            }
            Err(SyncError::Validation(e)) => {
                emit(outbound, ServerMessage::ValidationFailed { message: e.to_string() }).await?;
            }
            Err(e) => {
                emit(outbound, ServerMessage::Error { message: e.to_string() }).await?;
            }
        },
        ClientMessage::DeleteBookmark { id } => {
            let Some(owner) = view.owner() else {
                return Ok(());
            };
            if view.begin_delete(id) {
                emit_list(outbound, view).await?;
                let store = app_state.store.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = store.delete_bookmark(owner, id).await;
                    let _ = done_tx.send(Completion::Deleted { id, result });
                });
            }
        }
    }
    Ok(())
}

async fn handle_completion(
    view: &mut BookmarkSyncView,
    done: Completion,
    outbound: &mpsc::Sender<ServerMessage>,
) -> Result<(), Disconnected> {
    match done {
        Completion::Added(result) => match view.complete_add(result) {
            Ok(bookmark) => {
                emit(
                    outbound,
                    ServerMessage::BookmarkAdded {
                        bookmark: BookmarkPayload::from(&bookmark),
                    },
                )
                .await?;
                emit_list(outbound, view).await?;
            }
            Err(e) => {
                emit(outbound, ServerMessage::Error { message: failure_message("add bookmark", e) }).await?;
            }
        },
        Completion::Deleted { id, result } => {
            if let Err(e) = view.complete_delete(id, result) {
                emit_list(outbound, view).await?;
                emit(outbound, ServerMessage::Error { message: failure_message("delete bookmark", e) }).await?;
            }
        }
    }
    Ok(())
}

/// The store's reason for a refused request, or a generic message for anything else.
fn failure_message(action: &str, e: SyncError) -> String {
    match e {
        SyncError::Store(PortError::Rejected(reason)) => reason,
        _ => format!("Failed to {}", action),
    }
}

/// Next feed event; never resolves once the feed is gone.
async fn next_event(feed: &mut Option<ChangeStream>) -> Option<FeedEvent> {
    match feed {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn emit(outbound: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> Result<(), Disconnected> {
    outbound.send(message).await.map_err(|_| Disconnected)
}

async fn emit_list(outbound: &mpsc::Sender<ServerMessage>, view: &BookmarkSyncView) -> Result<(), Disconnected> {
    emit(outbound, ServerMessage::bookmarks(view.is_ready(), view.items())).await
}
