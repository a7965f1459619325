//! In-memory write batch.
//!
//! A [`Txn`] accumulates row operations ([`Delta`]s) for one or more events.
//! It is applied atomically by [`EventStore::commit`](crate::EventStore::commit)
//! and discarded, without side effects, if dropped instead.

use braid_event::Event;
use braid_types::{DUMMY_EVENT, ROOM_CREATE, ROOM_MEMBER};

use crate::error::StoreError;

/// Which indexes an event contributes to when staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOpts {
    /// Log position of the event. Must be non-zero.
    pub event_idx: u64,
    /// Replace the present-state entry for the event's `(type, state_key)`.
    pub room_state: bool,
    /// Record the event in the state history.
    pub room_state_space: bool,
    /// Update the membership table from an `m.room.member` event.
    pub room_joined: bool,
    /// Add the event to the room head.
    pub room_head: bool,
    /// Remove the event's `prev_events` from the room head.
    pub room_head_resolve: bool,
    /// Mark a room created by this event as server-internal.
    pub room_internal: bool,
}

/// One row operation in a write batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Event {
        idx: u64,
        event_id: String,
        room_id: String,
        kind: String,
        sender: String,
        state_key: Option<String>,
        depth: i64,
        json: String,
    },
    Room {
        room_id: String,
        version: String,
        creator: String,
        internal: bool,
        idx: u64,
    },
    State {
        room_id: String,
        kind: String,
        state_key: String,
        event_id: String,
        idx: u64,
        depth: i64,
    },
    StateSpace {
        room_id: String,
        kind: String,
        state_key: String,
        depth: i64,
        idx: u64,
    },
    HeadAdd {
        room_id: String,
        event_id: String,
        idx: u64,
        depth: i64,
    },
    HeadRemove {
        room_id: String,
        event_id: String,
    },
    Joined {
        room_id: String,
        user_id: String,
        membership: String,
        idx: u64,
    },
}

impl Delta {
    fn weight(&self) -> usize {
        match self {
            Self::Event { json, .. } => json.len(),
            Self::Room { room_id, .. }
            | Self::State { room_id, .. }
            | Self::StateSpace { room_id, .. }
            | Self::HeadAdd { room_id, .. }
            | Self::HeadRemove { room_id, .. }
            | Self::Joined { room_id, .. } => room_id.len() + 64,
        }
    }
}

/// An accumulating, not-yet-durable write batch.
#[derive(Debug)]
pub struct Txn {
    reserve_bytes: usize,
    max_bytes: usize,
    bytes: usize,
    deltas: Vec<Delta>,
    events: Vec<String>,
}

impl Txn {
    /// Opens an empty batch. `max_bytes` of zero means unbounded.
    pub(crate) fn new(reserve_bytes: usize, max_bytes: usize) -> Self {
        Self {
            reserve_bytes,
            max_bytes,
            bytes: 0,
            deltas: Vec::with_capacity(reserve_bytes / 256 + 4),
            events: Vec::new(),
        }
    }

    pub fn reserve_bytes(&self) -> usize {
        self.reserve_bytes
    }

    /// Estimated size of the staged rows.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of staged row operations.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Ids of the events staged so far, in staging order.
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Returns `true` if the event is staged in this batch.
    pub fn contains_event(&self, event_id: &str) -> bool {
        self.events.iter().any(|id| id == event_id)
    }

    /// Returns a position that [`Txn::rollback_to`] can truncate back to.
    pub fn mark(&self) -> (usize, usize) {
        (self.deltas.len(), self.events.len())
    }

    /// Discards everything staged after `mark`.
    pub fn rollback_to(&mut self, mark: (usize, usize)) {
        self.deltas.truncate(mark.0);
        self.events.truncate(mark.1);
        self.bytes = self.deltas.iter().map(Delta::weight).sum();
    }

    /// Stages an event and its index contributions.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Incomplete` for an event without id, room or
    /// sender, `StoreError::NoIndex` when `opts.event_idx` is zero, and
    /// `StoreError::Overflow` if the batch would exceed its maximum size.
    pub fn stage(&mut self, event: &Event, opts: &WriteOpts) -> Result<(), StoreError> {
        let event_id = event.event_id().ok_or(StoreError::Incomplete("event_id"))?;
        let room_id = event.room_id().ok_or(StoreError::Incomplete("room_id"))?;
        let sender = event.sender().ok_or(StoreError::Incomplete("sender"))?;
        if opts.event_idx == 0 {
            return Err(StoreError::NoIndex(event_id.to_string()));
        }

        let idx = opts.event_idx;
        let mut staged = vec![Delta::Event {
            idx,
            event_id: event_id.to_string(),
            room_id: room_id.to_string(),
            kind: event.kind().to_string(),
            sender: sender.to_string(),
            state_key: event.state_key().map(str::to_string),
            depth: event.depth(),
            json: event.to_json()?,
        }];

        if let Some(state_key) = event.state_key() {
            if opts.room_state_space {
                staged.push(Delta::StateSpace {
                    room_id: room_id.to_string(),
                    kind: event.kind().to_string(),
                    state_key: state_key.to_string(),
                    depth: event.depth(),
                    idx,
                });
            }

            if opts.room_state {
                staged.push(Delta::State {
                    room_id: room_id.to_string(),
                    kind: event.kind().to_string(),
                    state_key: state_key.to_string(),
                    event_id: event_id.to_string(),
                    idx,
                    depth: event.depth(),
                });

                if event.kind() == ROOM_CREATE && state_key.is_empty() {
                    let version = event
                        .content()
                        .get("room_version")
                        .and_then(|v| v.as_str())
                        .unwrap_or("1");
                    staged.push(Delta::Room {
                        room_id: room_id.to_string(),
                        version: version.to_string(),
                        creator: sender.to_string(),
                        internal: opts.room_internal,
                        idx,
                    });
                }
            }

            if opts.room_joined && event.kind() == ROOM_MEMBER {
                if let Some(membership) = event.content().get("membership").and_then(|v| v.as_str())
                {
                    staged.push(Delta::Joined {
                        room_id: room_id.to_string(),
                        user_id: state_key.to_string(),
                        membership: membership.to_string(),
                        idx,
                    });
                }
            }
        }

        if opts.room_head && event.kind() != DUMMY_EVENT {
            staged.push(Delta::HeadAdd {
                room_id: room_id.to_string(),
                event_id: event_id.to_string(),
                idx,
                depth: event.depth(),
            });
        }

        if opts.room_head_resolve {
            for prev in event.prev_events() {
                staged.push(Delta::HeadRemove {
                    room_id: room_id.to_string(),
                    event_id: prev.clone(),
                });
            }
        }

        let added: usize = staged.iter().map(Delta::weight).sum();
        if self.max_bytes > 0 && self.bytes + added > self.max_bytes {
            return Err(StoreError::Overflow {
                bytes: self.bytes + added,
                max_bytes: self.max_bytes,
            });
        }

        self.bytes += added;
        self.deltas.extend(staged);
        self.events.push(event_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_event::EventDraft;
    use serde_json::json;

    fn member(user: &str, depth: i64) -> Event {
        EventDraft::new("!r:braid.example", ROOM_MEMBER, user)
            .state_key(user)
            .depth(depth)
            .prev_events(["$parent"])
            .content(json!({ "membership": "join" }))
            .into_pdu()
            .unwrap()
    }

    fn all_indexes(idx: u64) -> WriteOpts {
        WriteOpts {
            event_idx: idx,
            room_state: true,
            room_state_space: true,
            room_joined: true,
            room_head: true,
            room_head_resolve: true,
            room_internal: false,
        }
    }

    #[test]
    fn stages_every_index_for_member_event() {
        let mut txn = Txn::new(1024, 0);
        txn.stage(&member("@a:braid.example", 2), &all_indexes(7)).unwrap();

        let kinds: Vec<&str> = txn
            .deltas()
            .iter()
            .map(|d| match d {
                Delta::Event { .. } => "event",
                Delta::Room { .. } => "room",
                Delta::State { .. } => "state",
                Delta::StateSpace { .. } => "space",
                Delta::HeadAdd { .. } => "head+",
                Delta::HeadRemove { .. } => "head-",
                Delta::Joined { .. } => "joined",
            })
            .collect();
        assert_eq!(kinds, ["event", "space", "state", "joined", "head+", "head-"]);
        assert!(txn.contains_event(member("@a:braid.example", 2).event_id().unwrap()));
    }

    #[test]
    fn inert_staging_only_writes_the_log() {
        let mut txn = Txn::new(1024, 0);
        let opts = WriteOpts {
            event_idx: 1,
            ..WriteOpts::default()
        };
        txn.stage(&member("@a:braid.example", 2), &opts).unwrap();
        assert_eq!(txn.len(), 1);
        assert!(matches!(txn.deltas()[0], Delta::Event { idx: 1, .. }));
    }

    #[test]
    fn dummy_events_never_join_the_head() {
        let dummy = EventDraft::new("!r:braid.example", DUMMY_EVENT, "@a:braid.example")
            .depth(3)
            .into_pdu()
            .unwrap();
        let mut txn = Txn::new(0, 0);
        txn.stage(&dummy, &all_indexes(3)).unwrap();
        assert!(!txn
            .deltas()
            .iter()
            .any(|d| matches!(d, Delta::HeadAdd { .. })));
    }

    #[test]
    fn rollback_discards_later_staging() {
        let mut txn = Txn::new(0, 0);
        txn.stage(&member("@a:braid.example", 2), &all_indexes(1)).unwrap();
        let mark = txn.mark();
        let bytes = txn.bytes();

        txn.stage(&member("@b:braid.example", 3), &all_indexes(2)).unwrap();
        txn.rollback_to(mark);

        assert_eq!(txn.events().len(), 1);
        assert_eq!(txn.bytes(), bytes);
        assert!(!txn.contains_event(member("@b:braid.example", 3).event_id().unwrap()));
    }

    #[test]
    fn overflow_is_rejected_without_partial_staging() {
        let mut txn = Txn::new(0, 32);
        let err = txn
            .stage(&member("@a:braid.example", 2), &all_indexes(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Overflow { max_bytes: 32, .. }));
        assert!(txn.is_empty());
    }

    #[test]
    fn zero_index_is_rejected() {
        let mut txn = Txn::new(0, 0);
        let err = txn
            .stage(&member("@a:braid.example", 2), &WriteOpts::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NoIndex(_)));
    }
}
