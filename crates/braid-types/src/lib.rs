//! Shared types for the Braid homeserver.
//!
//! This crate holds the small vocabulary every other Braid crate agrees on:
//! the closed set of admission fault codes and bit-sets of them, the
//! admission phase names, and the identifier grammar for rooms, users,
//! events and server names.
//!
//! It deliberately depends on nothing but `serde` and `thiserror`, so the
//! storage layer, the event model and the admission engine can all share it
//! without cycles.

mod fault;
pub mod id;
mod phase;

pub use fault::{Fault, FaultSet, ParseFaultError};
pub use id::{IdError, IdKind};
pub use phase::Phase;

/// Type of the event that creates a room.
pub const ROOM_CREATE: &str = "m.room.create";

/// Type of a membership state event.
pub const ROOM_MEMBER: &str = "m.room.member";

/// Type of the no-op event used to merge forward extremities.
///
/// These never update the room head.
pub const DUMMY_EVENT: &str = "org.matrix.dummy_event";

/// Largest serialized event accepted by conformance checks, in bytes.
pub const EVENT_MAX_SIZE: usize = 65_535;

/// Largest number of `prev_events` references on a single event.
pub const PREV_EVENTS_MAX: usize = 20;
