//! Storage engine for the Braid homeserver.
//!
//! Provides SQLite connection pooling (via `r2d2`), embedded SQL migrations,
//! the append-only event log with its room indexes, and the write batch the
//! admission engine stages into before committing.
//!
//! # Design decisions
//!
//! - **Staging is in memory**: a [`Txn`] is a plain list of row operations.
//!   Nothing touches SQLite until [`EventStore::commit`], which applies the
//!   whole batch inside one SQLite transaction. A batch that is dropped
//!   without commit leaves no trace.
//! - **The event index is the admission sequence number**: `events.idx` is
//!   assigned by the sequencer, so log order is admission order.
//! - **Blocking API**: every method takes a pooled connection and blocks.
//!   Async callers run them on the blocking pool.

mod error;
mod migrations;
mod pool;
mod store;
mod txn;

pub use error::StoreError;
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use store::{EventStore, HeadEntry, RoomInfo, StateEntry};
pub use txn::{Delta, Txn, WriteOpts};
