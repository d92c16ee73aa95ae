//! Notification staging shared between the app and its notification handler.
//!
//! The notification handler runs in its own process and may deliver pushes while
//! the app is not running. It stages what it decoded here; the app drains the
//! staged rows into its own database on the next foreground.

mod records;
mod store;

pub use records::*;
pub use store::{SharedStore, StagedList, SHARED_DB_FILE};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid staged json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
