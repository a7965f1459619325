//! Event model for the Braid homeserver.
//!
//! An [`Event`] is an immutable record addressed by the hash of its canonical
//! JSON form. Events carrying an `event_id` are persistent (PDUs) and are
//! sequenced into a room's log; events without one are ephemeral (EDUs).
//!
//! # Canonical form
//!
//! The canonical serialization is compact JSON with object keys in
//! lexicographic order, excluding `event_id`, `signatures` and `unsigned`.
//! The same bytes are hashed to derive the event id and signed by the
//! origin server, so an id can be computed before the event is signed.
//!
//! # Modules
//!
//! - [`conform`]: hostile-input structural checks run before admission.
//! - [`signing`]: Ed25519 signing and the keyring used for verification.

pub mod conform;
mod error;
mod event;
pub mod signing;

pub use conform::ConformError;
pub use error::EventError;
pub use event::{Event, EventDraft};
pub use signing::{Keyring, Verification};
