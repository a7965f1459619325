//! The sequencer: counters and rendezvous that total-order admissions.
//!
//! Every persistent admission holds a slot here from registration until it
//! finishes. Slots carry the admission's sequence number once assigned, and
//! three gates order them:
//!
//! - **sequence**: no other slot sits between `uncommitted` and this one;
//!   passing it advances `uncommitted`.
//! - **commit**: no other slot sits between `committed` and this one;
//!   passing it advances `committed`.
//! - **retire**: no lower, unretired slot that owns its write batch remains,
//!   ancestors of the waiting slot aside; passing it marks the slot retired.
//!
//! `retired` itself is settled whenever a slot retires or leaves: it moves up
//! to `committed`, stopping short of the lowest owner slot not yet retired.
//! A slot that failed after its commit gate is therefore covered once it
//! leaves.
//!
//! All state lives under one mutex. Every change is broadcast on a
//! [`Notify`] and waiters re-check their predicate after each wake, so a
//! spurious wake costs one predicate evaluation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::Notify;

use crate::error::VmError;
use crate::opts::Interrupt;

/// Process-unique id of a registered admission.
pub type EvalId = u64;

/// Point-in-time view of the sequencer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceSnapshot {
    /// Admissions currently registered, ephemeral ones included.
    pub pending: u64,
    /// Registered admissions holding a sequence number.
    pub executing: u64,
    pub uncommitted: u64,
    pub committed: u64,
    pub retired: u64,
}

#[derive(Debug, Default)]
struct Slot {
    event_id: Option<String>,
    sequence: u64,
    // Rides on an ancestor's batch; retires with it.
    borrowed: bool,
    retired: bool,
}

impl Slot {
    // Sequenced, owns its batch, and not yet retired.
    fn holds_back(&self) -> bool {
        self.sequence != 0 && !self.borrowed && !self.retired
    }
}

#[derive(Debug, Default)]
pub(crate) struct SequenceState {
    uncommitted: u64,
    committed: u64,
    retired: u64,
    next_id: EvalId,
    slots: BTreeMap<EvalId, Slot>,
}

impl SequenceState {
    fn admitting(&self, event_id: &str) -> bool {
        self.slots
            .values()
            .any(|slot| slot.event_id.as_deref() == Some(event_id))
    }

    fn highest_sequence(&self) -> u64 {
        self.slots
            .values()
            .map(|slot| slot.sequence)
            .max()
            .unwrap_or(0)
    }

    fn sequence_of(&self, id: EvalId) -> u64 {
        self.slots.get(&id).map_or(0, |slot| slot.sequence)
    }

    /// `true` if no other sequenced slot lies strictly between `floor` and
    /// the slot `id`.
    fn next_after(&self, floor: u64, id: EvalId) -> bool {
        let me = self.sequence_of(id);
        !self
            .slots
            .iter()
            .any(|(other, slot)| *other != id && slot.sequence > floor && slot.sequence < me)
    }

    fn retire_ready(&self, id: EvalId, ancestors: &[EvalId]) -> bool {
        let me = self.sequence_of(id);
        !self.slots.iter().any(|(other, slot)| {
            *other != id
                && !ancestors.contains(other)
                && slot.holds_back()
                && slot.sequence < me
        })
    }

    fn settle(&mut self) {
        let held = self
            .slots
            .values()
            .filter(|slot| slot.holds_back())
            .map(|slot| slot.sequence - 1)
            .min()
            .unwrap_or(u64::MAX);
        self.retired = self.retired.max(self.committed.min(held));
    }

    pub(crate) fn retired(&self) -> u64 {
        self.retired
    }
}

/// Total-orders concurrent admissions of one room log.
#[derive(Debug, Default)]
pub struct Sequencer {
    state: Mutex<SequenceState>,
    changed: Notify,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sequencer resuming a log whose highest written position is `last`.
    pub fn starting_at(last: u64) -> Self {
        Self {
            state: Mutex::new(SequenceState {
                uncommitted: last,
                committed: last,
                retired: last,
                ..SequenceState::default()
            }),
            changed: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> SequenceSnapshot {
        let state = self.lock();
        SequenceSnapshot {
            pending: state.slots.len() as u64,
            executing: state.slots.values().filter(|s| s.sequence != 0).count() as u64,
            uncommitted: state.uncommitted,
            committed: state.committed,
            retired: state.retired,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SequenceState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("sequencer state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Reads the state under the lock.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&SequenceState) -> T) -> T {
        f(&self.lock())
    }

    /// Mutates the state under the lock and wakes every waiter.
    fn update<T>(&self, f: impl FnOnce(&mut SequenceState) -> T) -> T {
        let out = f(&mut self.lock());
        self.changed.notify_waiters();
        out
    }

    /// Waits until `pred` holds, then runs `then` under the same lock.
    async fn wait_then<T>(
        &self,
        interrupt: &Interrupt,
        pred: impl Fn(&SequenceState) -> bool,
        then: impl FnOnce(&mut SequenceState) -> T,
    ) -> Result<T, VmError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if pred(&state) {
                    let out = then(&mut state);
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(out);
                }
            }

            interrupt.check()?;
            tokio::select! {
                _ = &mut notified => {}
                _ = interrupt.raised() => return Err(VmError::Interrupted),
            }
        }
    }

    /// Registers an admission and returns the guard that holds its slot.
    ///
    /// With `unique`, an admission of an event id that another slot already
    /// holds either waits for that slot to leave (`wait`) or fails with
    /// `EXISTS` at once.
    pub(crate) async fn register(
        self: &Arc<Self>,
        event_id: Option<&str>,
        unique: bool,
        wait: bool,
        interrupt: &Interrupt,
    ) -> Result<SlotGuard, VmError> {
        let insert = |state: &mut SequenceState| {
            state.next_id += 1;
            let id = state.next_id;
            state.slots.insert(
                id,
                Slot {
                    event_id: event_id.map(str::to_string),
                    ..Slot::default()
                },
            );
            id
        };

        let id = match event_id {
            Some(event_id) if unique && wait => {
                self.wait_then(interrupt, |s| !s.admitting(event_id), insert)
                    .await?
            }
            Some(event_id) if unique => self.update(|state| {
                if state.admitting(event_id) {
                    Err(VmError::exists(format!("{event_id} is being admitted")))
                } else {
                    Ok(insert(state))
                }
            })?,
            _ => self.update(insert),
        };

        Ok(SlotGuard {
            sequencer: Arc::clone(self),
            id,
        })
    }

    /// Assigns the next sequence number to a slot.
    pub(crate) fn assign(&self, id: EvalId) -> u64 {
        self.update(|state| {
            let sequence = state.highest_sequence().max(state.committed) + 1;
            if let Some(slot) = state.slots.get_mut(&id) {
                slot.sequence = sequence;
            }
            sequence
        })
    }

    pub(crate) async fn sequence_gate(&self, id: EvalId, interrupt: &Interrupt) -> Result<(), VmError> {
        self.wait_then(interrupt, |s| s.next_after(s.uncommitted, id), |_| ())
            .await
    }

    pub(crate) fn pass_sequence(&self, sequence: u64) {
        self.update(|state| state.uncommitted = state.uncommitted.max(sequence));
    }

    pub(crate) async fn commit_gate(&self, id: EvalId, interrupt: &Interrupt) -> Result<(), VmError> {
        self.wait_then(interrupt, |s| s.next_after(s.committed, id), |_| ())
            .await
    }

    pub(crate) fn pass_commit(&self, sequence: u64) {
        self.update(|state| state.committed = state.committed.max(sequence));
    }

    /// Marks a slot as riding on an ancestor's write batch.
    pub(crate) fn borrow(&self, id: EvalId) {
        self.update(|state| {
            if let Some(slot) = state.slots.get_mut(&id) {
                slot.borrowed = true;
            }
        });
    }

    /// Waits for the retire gate, then retires the slot. `ancestors` are the
    /// slots of the admissions this one runs inside; they cannot finish
    /// before it does, so the gate does not wait on them.
    ///
    /// Returns the previous and new value of `retired`.
    pub(crate) async fn retire(
        &self,
        id: EvalId,
        ancestors: &[EvalId],
        interrupt: &Interrupt,
    ) -> Result<(u64, u64), VmError> {
        self.wait_then(
            interrupt,
            |s| s.retire_ready(id, ancestors),
            |state| {
                let before = state.retired;
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.retired = true;
                }
                state.settle();
                (before, state.retired)
            },
        )
        .await
    }

    fn leave(&self, id: EvalId) {
        self.update(|state| {
            state.slots.remove(&id);
            state.settle();
        });
    }
}

/// Holds an admission's slot. Dropping it leaves the sequencer and wakes
/// every waiter, whether the admission finished, failed or was cancelled.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    sequencer: Arc<Sequencer>,
    id: EvalId,
}

impl SlotGuard {
    pub(crate) fn id(&self) -> EvalId {
        self.id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.sequencer.leave(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sequencer() -> Arc<Sequencer> {
        Arc::new(Sequencer::new())
    }

    #[tokio::test]
    async fn assignment_follows_highest_outstanding() {
        let seq = sequencer();
        let none = Interrupt::new();
        let a = seq.register(Some("$a"), true, true, &none).await.unwrap();
        let b = seq.register(Some("$b"), true, true, &none).await.unwrap();

        assert_eq!(seq.assign(a.id()), 1);
        assert_eq!(seq.assign(b.id()), 2);
        assert_eq!(seq.snapshot().executing, 2);
    }

    #[tokio::test]
    async fn resumed_sequencer_continues_after_last_position() {
        let seq = Arc::new(Sequencer::starting_at(41));
        let none = Interrupt::new();
        let a = seq.register(Some("$a"), true, true, &none).await.unwrap();
        assert_eq!(seq.assign(a.id()), 42);
        assert_eq!(seq.snapshot().retired, 41);
    }

    #[tokio::test]
    async fn commit_gate_waits_for_lower_sequence() {
        let seq = sequencer();
        let none = Interrupt::new();
        let a = seq.register(Some("$a"), true, true, &none).await.unwrap();
        let b = seq.register(Some("$b"), true, true, &none).await.unwrap();
        let sa = seq.assign(a.id());
        seq.assign(b.id());

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), seq.commit_gate(b.id(), &none)).await;
        assert!(blocked.is_err(), "b must wait for a");

        seq.commit_gate(a.id(), &none).await.unwrap();
        seq.pass_commit(sa);
        seq.commit_gate(b.id(), &none).await.unwrap();
    }

    #[tokio::test]
    async fn failed_slot_unblocks_successor() {
        let seq = sequencer();
        let none = Interrupt::new();
        let a = seq.register(Some("$a"), true, true, &none).await.unwrap();
        let b = seq.register(Some("$b"), true, true, &none).await.unwrap();
        seq.assign(a.id());
        seq.assign(b.id());

        let waiter = {
            let seq = Arc::clone(&seq);
            let id = b.id();
            tokio::spawn(async move { seq.sequence_gate(id, &Interrupt::new()).await })
        };
        tokio::task::yield_now().await;
        drop(a);

        waiter.await.unwrap().unwrap();
        assert_eq!(seq.snapshot().uncommitted, 0);
    }

    #[tokio::test]
    async fn duplicate_registration_without_wait_is_exists() {
        let seq = sequencer();
        let none = Interrupt::new();
        let _first = seq.register(Some("$dup"), true, true, &none).await.unwrap();
        let err = seq
            .register(Some("$dup"), true, false, &none)
            .await
            .unwrap_err();
        assert_eq!(err.classify(), Some(braid_types::Fault::Exists));
    }

    #[tokio::test]
    async fn duplicate_registration_waits_for_first_to_leave() {
        let seq = sequencer();
        let none = Interrupt::new();
        let first = seq.register(Some("$dup"), true, true, &none).await.unwrap();

        let second = {
            let seq = Arc::clone(&seq);
            tokio::spawn(async move {
                seq.register(Some("$dup"), true, true, &Interrupt::new())
                    .await
                    .map(|guard| guard.id())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seq.snapshot().pending, 1);

        drop(first);
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn interrupt_aborts_a_gate_wait() {
        let seq = sequencer();
        let none = Interrupt::new();
        let a = seq.register(Some("$a"), true, true, &none).await.unwrap();
        let b = seq.register(Some("$b"), true, true, &none).await.unwrap();
        seq.assign(a.id());
        seq.assign(b.id());

        let interrupt = Interrupt::new();
        let waiter = {
            let seq = Arc::clone(&seq);
            let interrupt = interrupt.clone();
            let id = b.id();
            tokio::spawn(async move { seq.commit_gate(id, &interrupt).await })
        };
        tokio::task::yield_now().await;
        interrupt.raise();

        assert!(matches!(waiter.await.unwrap(), Err(VmError::Interrupted)));
        assert_eq!(seq.snapshot().committed, 0);
    }

    /// Registers, sequences and commits a slot.
    async fn committed(seq: &Arc<Sequencer>, event_id: &str) -> SlotGuard {
        let none = Interrupt::new();
        let slot = seq.register(Some(event_id), true, true, &none).await.unwrap();
        let sequence = seq.assign(slot.id());
        seq.sequence_gate(slot.id(), &none).await.unwrap();
        seq.pass_sequence(sequence);
        seq.commit_gate(slot.id(), &none).await.unwrap();
        seq.pass_commit(sequence);
        slot
    }

    #[tokio::test]
    async fn retire_covers_shared_sequences() {
        let seq = sequencer();
        let none = Interrupt::new();
        let root = committed(&seq, "$root").await;
        let child = committed(&seq, "$child").await;
        seq.borrow(child.id());
        drop(child);
        assert_eq!(seq.snapshot().retired, 0);

        let (before, after) = seq.retire(root.id(), &[], &none).await.unwrap();
        assert_eq!((before, after), (0, 2));
        assert_eq!(seq.snapshot().committed, 2);
    }

    #[tokio::test]
    async fn borrowed_slot_does_not_hold_back_retirement() {
        let seq = sequencer();
        let none = Interrupt::new();
        let child = seq.register(Some("$c"), true, true, &none).await.unwrap();
        let root = seq.register(Some("$r"), true, true, &none).await.unwrap();
        seq.assign(child.id());
        seq.assign(root.id());
        seq.borrow(child.id());

        let done =
            tokio::time::timeout(Duration::from_millis(50), seq.retire(root.id(), &[], &none))
                .await;
        assert!(done.is_ok());
    }

    #[tokio::test]
    async fn retired_never_passes_an_unretired_owner() {
        let seq = sequencer();
        let none = Interrupt::new();
        let slow = committed(&seq, "$slow").await;
        let fast = committed(&seq, "$fast").await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), seq.retire(fast.id(), &[], &none))
                .await;
        assert!(blocked.is_err(), "fast must wait for slow");

        let (_, after) = seq.retire(slow.id(), &[], &none).await.unwrap();
        assert_eq!(after, 1);
        let (_, after) = seq.retire(fast.id(), &[], &none).await.unwrap();
        assert_eq!(after, 2);
    }

    #[tokio::test]
    async fn failed_slot_past_commit_is_retired_on_leave() {
        let seq = sequencer();
        let failed = committed(&seq, "$failed").await;
        assert_eq!(seq.snapshot().retired, 0);

        drop(failed);
        let snapshot = seq.snapshot();
        assert_eq!((snapshot.committed, snapshot.retired), (1, 1));
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn failed_slot_does_not_retire_past_lower_owner() {
        let seq = sequencer();
        let lower = committed(&seq, "$lower").await;
        let failed = committed(&seq, "$failed").await;

        drop(failed);
        assert_eq!(seq.snapshot().retired, 0);
        drop(lower);
        assert_eq!(seq.snapshot().retired, 2);
    }

    #[tokio::test]
    async fn nested_owner_does_not_wait_on_its_ancestor() {
        let seq = sequencer();
        let none = Interrupt::new();
        let parent = committed(&seq, "$parent").await;
        let child = committed(&seq, "$child").await;

        let (_, after) = tokio::time::timeout(
            Duration::from_millis(50),
            seq.retire(child.id(), &[parent.id()], &none),
        )
        .await
        .expect("ancestor must not hold the retire gate")
        .unwrap();
        assert_eq!(after, 0, "the ancestor is still unretired");

        let (_, after) = seq.retire(parent.id(), &[], &none).await.unwrap();
        assert_eq!(after, 2);
    }
}
