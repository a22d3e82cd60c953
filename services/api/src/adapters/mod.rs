pub mod db;
pub mod feed;

pub use db::PgStore;
pub use feed::PgChangeFeed;
