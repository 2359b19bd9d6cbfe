//! Durable persistence layers for Bulwark runtime state.
//!
//! Two stores live here: the append-only write-ahead log that makes
//! critical events durable before they are acknowledged, and the SQLite
//! order store holding every order record together with its append-only
//! audit trail.

use thiserror::Error;

mod store;
mod wal;

pub use store::OrderStore;
pub use wal::{WalReader, WalRecord, WalWriter, WalWriterConfig};

/// Result alias for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors surfaced by the persistence layers.
///
/// `Corrupt` is reserved for damage beyond a truncatable WAL tail; callers
/// treat it as fatal.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corruption detected: {0}")]
    Corrupt(String),
}
