pub mod auth;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod sync_task;
pub mod ws_handler;

// Re-export the handlers the binary needs to build the web server router.
pub use middleware::require_auth;
pub use rest::{create_bookmark_handler, delete_bookmark_handler, list_bookmarks_handler};
pub use ws_handler::ws_handler;
