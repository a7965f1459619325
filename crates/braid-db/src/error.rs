//! Error types for the storage engine.

use braid_event::EventError;

/// Errors that can occur while staging, committing or reading events.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No pooled connection was available.
    #[error("storage pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A SQLite operation failed.
    #[error("storage database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored event could not be decoded or encoded.
    #[error("storage event error: {0}")]
    Event(#[from] EventError),

    /// Staging would exceed the batch's maximum size.
    #[error("write batch of {bytes} bytes exceeds maximum of {max_bytes}")]
    Overflow { bytes: usize, max_bytes: usize },

    /// The event lacks a field the log requires.
    #[error("cannot stage event without {0}")]
    Incomplete(&'static str),

    /// The write options did not carry a sequence number.
    #[error("cannot stage event {0} without an event index")]
    NoIndex(String),
}
