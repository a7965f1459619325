//! Event admission engine for the Braid homeserver.
//!
//! Decides, under concurrency, whether and in what total order events enter
//! the room log. An admission is driven by an [`Eval`] through a fixed
//! pipeline of phases:
//!
//! ```text
//! issue → conform → access → verify → fetch → auth.static
//!   [sequence gate] auth.relative
//!   [commit gate]   auth.present → eval
//!   write.prepare → write.append → post
//!   [write.commit → retire gate]  (batch owner only)
//!   notify → effect
//! ```
//!
//! The [`Sequencer`] orders concurrent admissions through its three gates;
//! the write phases stage each event into a batch shared down the stack of
//! nested admissions and committed once by its owner; [`handle_error`]
//! turns faults into an [`Outcome`] or an error per the eval's options.
//!
//! Ephemeral events (no `event_id`) skip sequencing and writing and run only
//! `eval`, `post`, `notify` and `effect`.
//!
//! # Extension
//!
//! Each phase is a hook site. Handlers implement [`Hook`] and are registered
//! on [`Vm::hooks`]. Authorization, dependency fetch and signature checks go
//! through the [`AuthEngine`], [`Fetcher`] and [`KeyService`] traits.

mod collab;
mod config;
mod error;
mod eval;
mod hook;
mod inject;
mod opts;
mod policy;
mod sequence;
mod vm;
mod write;

pub use collab::{
    AuthEngine, AuthError, FetchError, FetchKind, Fetcher, KeyService, MembershipAuth, NoFetcher,
};
pub use config::VmConfig;
pub use error::{Outcome, VmError};
pub use eval::{Eval, SharedTxn};
pub use hook::{site_name, Hook, Hooks};
pub use opts::{Interrupt, Opts};
pub use policy::handle_error;
pub use sequence::{EvalId, SequenceSnapshot, Sequencer};
pub use vm::{BoxFuture, Vm, STACK_MAX};
pub use write::reserve_for;
