//! One admission attempt and its stack of ancestors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use braid_db::Txn;
use braid_event::Event;
use braid_types::Phase;

use crate::opts::Opts;
use crate::sequence::EvalId;

/// A write batch shared between an admission and its descendants.
pub type SharedTxn = Arc<Mutex<Txn>>;

pub(crate) fn lock_txn(txn: &SharedTxn) -> MutexGuard<'_, Txn> {
    txn.lock().unwrap_or_else(|poisoned| {
        tracing::error!("write batch lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// The part of an admission its descendants can see.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub(crate) id: AtomicU64,
    pub(crate) sequence: AtomicU64,
    // Highest sequence staged into this frame's batch by a descendant.
    pub(crate) shared_hi: AtomicU64,
    pub(crate) txn: Mutex<Option<SharedTxn>>,
    deferred: Mutex<Vec<Deferred>>,
}

/// Late phases of a descendant that staged into this frame's batch. They
/// run once the batch is durable, or never if it is discarded.
#[derive(Debug)]
pub(crate) struct Deferred {
    pub(crate) eval: Eval,
    pub(crate) event: Event,
}

impl Frame {
    pub(crate) fn txn(&self) -> Option<SharedTxn> {
        self.txn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_txn(&self, txn: Option<SharedTxn>) {
        *self.txn.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = txn;
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<Deferred>> {
        self.deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn defer(&self, eval: Eval, event: Event) {
        self.deferred().push(Deferred { eval, event });
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred().len()
    }

    /// Drops work deferred after `len` entries, for a descendant whose rows
    /// were rolled back.
    pub(crate) fn truncate_deferred(&self, len: usize) {
        self.deferred().truncate(len);
    }

    pub(crate) fn take_deferred(&self) -> Vec<Deferred> {
        std::mem::take(&mut *self.deferred())
    }
}

/// State of one admission attempt.
///
/// Created by the caller with [`Eval::new`], or by code running inside
/// another admission with [`Eval::child`], which records the parent on the
/// child's stack so the child can ride on the parent's write batch.
#[derive(Debug)]
pub struct Eval {
    pub opts: Opts,
    pub(crate) frame: Arc<Frame>,
    pub(crate) stack: Vec<Arc<Frame>>,
    pub(crate) phase: Option<Phase>,
    pub(crate) event_id: Option<String>,
    pub(crate) room_id: Option<String>,
    pub(crate) room_version: Option<String>,
    pub(crate) room_internal: bool,
    pub(crate) sequence_shared: [u64; 2],
    pub(crate) txn: Option<SharedTxn>,
    pub(crate) txn_mark: Option<(usize, usize)>,
    // Frame whose batch this admission borrowed, and its deferred count
    // when this admission staged.
    pub(crate) lender: Option<(Arc<Frame>, usize)>,
    pub(crate) present_denied: Option<String>,
}

impl Eval {
    pub fn new(opts: Opts) -> Self {
        Self {
            opts,
            frame: Arc::new(Frame::default()),
            stack: Vec::new(),
            phase: None,
            event_id: None,
            room_id: None,
            room_version: None,
            room_internal: false,
            sequence_shared: [0, 0],
            txn: None,
            txn_mark: None,
            lender: None,
            present_denied: None,
        }
    }

    /// Starts a nested admission on this admission's stack.
    pub fn child(&self, opts: Opts) -> Self {
        let mut stack = self.stack.clone();
        stack.push(Arc::clone(&self.frame));
        Self {
            stack,
            ..Self::new(opts)
        }
    }

    /// A stackless copy of a finished admission, for running its notify
    /// and effect phases after its lender's commit.
    pub(crate) fn detached(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
            event_id: self.event_id.clone(),
            room_id: self.room_id.clone(),
            room_version: self.room_version.clone(),
            room_internal: self.room_internal,
            sequence_shared: self.sequence_shared,
            present_denied: self.present_denied.clone(),
            ..Self::new(self.opts.clone())
        }
    }

    /// Sequencer id, or 0 before registration.
    pub fn id(&self) -> EvalId {
        self.frame.id.load(Ordering::SeqCst)
    }

    /// Sequence number, or 0 until assigned.
    pub fn sequence(&self) -> u64 {
        self.frame.sequence.load(Ordering::SeqCst)
    }

    /// `[lender, watermark]`: the sequence of the ancestor whose batch this
    /// admission rides on, and the highest sequence that rode on this one.
    pub fn sequence_shared(&self) -> [u64; 2] {
        [
            self.sequence_shared[0],
            self.sequence_shared[1].max(self.frame.shared_hi.load(Ordering::SeqCst)),
        ]
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn room_version(&self) -> Option<&str> {
        self.room_version.as_deref()
    }

    pub fn room_internal(&self) -> bool {
        self.room_internal
    }

    /// Number of ancestors.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_root(&self) -> bool {
        self.stack.is_empty()
    }

    /// Why authorization against present state failed, if it did. Such an
    /// event is written to the log without touching room state.
    pub fn present_denied(&self) -> Option<&str> {
        self.present_denied.as_deref()
    }

    /// Whether this admission writes into an ancestor's batch.
    pub fn is_borrowing(&self) -> bool {
        self.sequence_shared[0] != 0
    }

    /// Returns `true` if an ancestor already holds a sequence number, so
    /// this admission must not wait on the sequencer for a duplicate.
    pub(crate) fn ancestor_sequenced(&self) -> bool {
        self.stack
            .iter()
            .any(|frame| frame.sequence.load(Ordering::SeqCst) != 0)
    }

    pub(crate) fn ancestor_ids(&self) -> Vec<EvalId> {
        self.stack
            .iter()
            .map(|frame| frame.id.load(Ordering::SeqCst))
            .filter(|id| *id != 0)
            .collect()
    }

    /// Clears per-admission state so the eval can drive another event.
    pub(crate) fn reset(&mut self) {
        self.frame = Arc::new(Frame::default());
        self.phase = None;
        self.event_id = None;
        self.room_id = None;
        self.room_version = None;
        self.room_internal = false;
        self.sequence_shared = [0, 0];
        self.txn = None;
        self.txn_mark = None;
        self.lender = None;
        self.present_denied = None;
    }

    /// Returns `true` if any ancestor's live batch has staged `event_id`.
    pub(crate) fn staged_by_ancestor(&self, event_id: &str) -> bool {
        self.stack
            .iter()
            .filter_map(|frame| frame.txn())
            .any(|txn| lock_txn(&txn).contains_event(event_id))
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.frame.sequence.store(sequence, Ordering::SeqCst);
    }

    /// Log prefix identifying this admission.
    pub fn loghead(&self) -> String {
        format!(
            "vm:{} seq:{} {} {}",
            self.id(),
            self.sequence(),
            self.event_id.as_deref().unwrap_or("<edu>"),
            self.room_id.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_stack_ends_with_parent() {
        let root = Eval::new(Opts::default());
        root.set_sequence(7);
        let child = root.child(root.opts.nested());
        let grandchild = child.child(child.opts.nested());

        assert!(root.is_root());
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.stack[0].sequence.load(Ordering::SeqCst), 7);
        assert!(Arc::ptr_eq(&grandchild.stack[1], &child.frame));
    }

    #[test]
    fn fresh_eval_has_no_sequence() {
        let eval = Eval::new(Opts::default());
        assert_eq!(eval.sequence(), 0);
        assert_eq!(eval.sequence_shared(), [0, 0]);
        assert!(!eval.is_borrowing());
        assert_eq!(eval.loghead(), "vm:0 seq:0 <edu> -");
    }

    #[test]
    fn detached_copy_keeps_identity_without_stack() {
        let root = Eval::new(Opts::default());
        let mut child = root.child(root.opts.nested());
        child.set_sequence(4);
        child.event_id = Some("$join".to_string());
        child.sequence_shared = [3, 0];

        let late = child.detached();
        assert!(late.is_root());
        assert!(late.is_borrowing());
        assert_eq!(late.sequence(), 4);
        assert_eq!(late.event_id(), Some("$join"));
        assert!(late.txn.is_none());
    }

    #[test]
    fn deferred_work_truncates_to_a_mark() {
        let frame = Frame::default();
        let event = braid_event::EventDraft::ephemeral("m.typing").into_event();
        frame.defer(Eval::new(Opts::default()), event.clone());
        let mark = frame.deferred_len();
        frame.defer(Eval::new(Opts::default()), event);

        frame.truncate_deferred(mark);
        assert_eq!(frame.take_deferred().len(), 1);
        assert_eq!(frame.deferred_len(), 0);
    }
}
