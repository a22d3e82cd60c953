//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use bookmark_sync_core::ports::{AuthService, BookmarkStore, ChangeFeed};
use bookmark_sync_core::BookmarkSyncView;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BookmarkStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub auth: Arc<dyn AuthService>,
    pub config: Arc<Config>,
    /// Sign-out signals for the live sessions of each auth session.
    pub sign_outs: Arc<SignOutRegistry>,
}

impl AppState {
    /// A fresh, uninitialized view wired to the shared store and feed.
    pub fn new_sync_view(&self) -> BookmarkSyncView {
        BookmarkSyncView::new(self.store.clone(), self.feed.clone())
            .with_rollback(self.config.delete_rollback)
    }
}

//=========================================================================================
// Sign-out Registry
//=========================================================================================

/// The session id carried by the auth cookie of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSessionId(pub String);

/// One `CancellationToken` per auth session with open live connections.
///
/// Every socket opened with the same cookie shares the token, so signing out
/// cancels all of them at once.
#[derive(Debug, Default)]
pub struct SignOutRegistry {
    tokens: Mutex<HashMap<String, (CancellationToken, usize)>>,
}

impl SignOutRegistry {
    /// Registers a live connection for `auth_session_id` and returns its sign-out token.
    pub fn acquire(&self, auth_session_id: &str) -> CancellationToken {
        match self.tokens.lock() {
            Ok(mut tokens) => {
                let (token, users) = tokens
                    .entry(auth_session_id.to_string())
                    .or_insert_with(|| (CancellationToken::new(), 0));
                *users += 1;
                token.clone()
            }
            Err(_) => CancellationToken::new(),
        }
    }

    /// Unregisters a connection holding `token`. The entry is dropped with its last
    /// connection. Tokens already cancelled by a sign-out no longer have an entry.
    pub fn release(&self, auth_session_id: &str, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        if let Ok(mut tokens) = self.tokens.lock() {
            if let Some((_, users)) = tokens.get_mut(auth_session_id) {
                *users -= 1;
                if *users == 0 {
                    tokens.remove(auth_session_id);
                }
            }
        }
    }

    /// Ends every live connection of `auth_session_id`.
    pub fn sign_out(&self, auth_session_id: &str) {
        let entry = self
            .tokens
            .lock()
            .ok()
            .and_then(|mut tokens| tokens.remove(auth_session_id));
        if let Some((token, _)) = entry {
            token.cancel();
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_out_cancels_every_connection_of_the_session() {
        let registry = SignOutRegistry::default();
        let first = registry.acquire("abc");
        let second = registry.acquire("abc");
        let other = registry.acquire("xyz");

        registry.sign_out("abc");
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(!other.is_cancelled());
        assert_eq!(registry.live_sessions(), 1);
    }

    #[test]
    fn entry_is_dropped_with_its_last_connection() {
        let registry = SignOutRegistry::default();
        let first = registry.acquire("abc");
        let second = registry.acquire("abc");

        registry.release("abc", &first);
        assert_eq!(registry.live_sessions(), 1);
        registry.release("abc", &second);
        assert_eq!(registry.live_sessions(), 0);
    }

    #[test]
    fn release_after_sign_out_leaves_newer_connections_alone() {
        let registry = SignOutRegistry::default();
        let old = registry.acquire("abc");
        registry.sign_out("abc");

        let new = registry.acquire("abc");
        registry.release("abc", &old);
        assert_eq!(registry.live_sessions(), 1);

        registry.sign_out("abc");
        assert!(new.is_cancelled());
    }
}
