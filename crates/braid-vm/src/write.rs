//! Write phases: choosing, filling and committing the write batch.
//!
//! An admission rides on the batch of the bottom-most ancestor that still
//! holds a live one, so events admitted from inside another admission land
//! in the same atomic commit. Otherwise it opens its own batch, commits it
//! after `post`, and passes the retire gate.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use braid_db::WriteOpts;
use braid_event::Event;

use crate::error::VmError;
use crate::eval::{lock_txn, Eval};
use crate::vm::Vm;

/// Reservation for a batch holding an event of `size` serialized bytes.
pub fn reserve_for(size: usize, reserve_index: usize) -> usize {
    size * 166 / 100 + reserve_index
}

impl Vm {
    pub(crate) fn write_prepare(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        let retired = self.sequencer.with(|state| state.retired());

        for frame in &eval.stack {
            let Some(txn) = frame.txn() else {
                continue;
            };
            let lender = frame.sequence.load(Ordering::SeqCst);
            if lender <= retired {
                continue;
            }

            frame.shared_hi.fetch_max(eval.sequence(), Ordering::SeqCst);
            eval.sequence_shared[0] = lender;
            eval.txn = Some(txn);
            eval.lender = Some((Arc::clone(frame), frame.deferred_len()));
            self.sequencer.borrow(eval.id());
            tracing::debug!(eval = %eval.loghead(), lender, "sharing write batch");
            return Ok(());
        }

        let reserve = match eval.opts.reserve_bytes {
            Some(bytes) => bytes,
            None => reserve_for(event.serialized_size()?, eval.opts.reserve_index),
        };
        let batch = self.store.begin_transaction(reserve, 0);
        tracing::trace!(eval = %eval.loghead(), reserve = batch.reserve_bytes(), "write batch opened");
        let txn = Arc::new(Mutex::new(batch));
        eval.frame.set_txn(Some(Arc::clone(&txn)));
        eval.txn = Some(txn);
        Ok(())
    }

    pub(crate) async fn write_append(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        let Some(txn) = eval.txn.clone() else {
            return Err(VmError::general("write.append without a write batch"));
        };

        let permitted = eval.present_denied.is_none();
        let fresher = if permitted && eval.opts.present && event.is_state() {
            self.is_fresher(event).await?
        } else {
            false
        };

        let opts = WriteOpts {
            event_idx: eval.sequence(),
            room_state: eval.opts.present && fresher,
            room_state_space: eval.opts.history && permitted,
            room_joined: fresher,
            room_head: eval.opts.room_head && permitted,
            room_head_resolve: eval.opts.room_head_resolve && permitted,
            room_internal: eval.room_internal,
        };

        let mut batch = lock_txn(&txn);
        let mark = batch.mark();
        batch.stage(event, &opts)?;
        eval.txn_mark = Some(mark);
        tracing::trace!(
            eval = %eval.loghead(),
            bytes = batch.bytes(),
            rows = batch.len(),
            inert = !permitted,
            "event staged"
        );
        Ok(())
    }

    /// Commits an owned batch. Borrowed batches are left to their owner.
    pub(crate) async fn write_commit(&self, eval: &mut Eval) -> Result<(), VmError> {
        if eval.is_borrowing() {
            return Ok(());
        }
        let Some(txn) = eval.txn.take() else {
            return Ok(());
        };
        eval.frame.set_txn(None);

        let batch = {
            let mut guard = lock_txn(&txn);
            std::mem::replace(&mut *guard, self.store.begin_transaction(0, 0))
        };
        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.commit(batch)).await??;
        tracing::trace!(eval = %eval.loghead(), written, "write batch durable");
        Ok(())
    }

    /// Drops what a failed admission staged: its whole batch if it owned
    /// one, otherwise everything after its mark in the borrowed batch.
    /// Notifications deferred on the dropped rows go with them.
    pub(crate) fn discard_writes(&self, eval: &mut Eval) {
        if !eval.is_borrowing() {
            let dropped = eval.frame.take_deferred().len();
            if dropped > 0 {
                tracing::debug!(eval = %eval.loghead(), dropped, "discarded deferred notifications");
            }
        }
        let Some(txn) = eval.txn.take() else {
            return;
        };
        if eval.is_borrowing() {
            if let Some(mark) = eval.txn_mark.take() {
                lock_txn(&txn).rollback_to(mark);
                tracing::debug!(eval = %eval.loghead(), "rolled back staged writes");
            }
            if let Some((lender, deferred)) = eval.lender.take() {
                lender.truncate_deferred(deferred);
            }
        } else {
            eval.frame.set_txn(None);
        }
    }

    async fn is_fresher(&self, event: &Event) -> Result<bool, VmError> {
        let (Some(room_id), Some(state_key)) = (event.room_id(), event.state_key()) else {
            return Ok(false);
        };
        let (room_id, kind, state_key) = (
            room_id.to_string(),
            event.kind().to_string(),
            state_key.to_string(),
        );
        let current = self
            .blocking(move |store| store.state_get(&room_id, &kind, &state_key))
            .await?;
        Ok(current.map_or(true, |entry| event.depth() > entry.depth))
    }
}
