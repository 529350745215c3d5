//! In-memory data store and change feed for tests and offline demos

pub mod backend;
pub mod feed;

pub use backend::MockBackend;
pub use feed::MockChangeFeed;
