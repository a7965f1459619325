//! Admission of locally authored events.

use braid_event::{signing, Event, EventDraft};
use braid_types::{PREV_EVENTS_MAX, ROOM_CREATE};

use crate::error::{Outcome, VmError};
use crate::eval::Eval;
use crate::vm::Vm;

impl Vm {
    /// Completes a locally authored draft and admits it.
    ///
    /// Fills `origin` and `origin_server_ts`, and unless the draft already
    /// names them, `prev_events` (the room head) and `depth` (one past the
    /// deepest head event). The event is then hashed, signed with the server
    /// key if one is configured, and executed with the `issue` phase on.
    ///
    /// Returns the event as admitted together with the outcome.
    pub async fn inject(
        &self,
        eval: &mut Eval,
        mut draft: EventDraft,
    ) -> Result<(Event, Outcome), VmError> {
        draft.origin = Some(self.config.server_name.clone());
        if draft.origin_server_ts == 0 {
            draft.origin_server_ts = chrono::Utc::now().timestamp_millis();
        }

        if let Some(room_id) = draft.room_id.clone() {
            if draft.prev_events.is_empty() && draft.kind != ROOM_CREATE {
                let head = self.blocking(move |store| store.room_head(&room_id)).await?;
                if draft.depth == 0 {
                    draft.depth = head.iter().map(|entry| entry.depth).max().unwrap_or(0) + 1;
                }
                draft.prev_events = head
                    .into_iter()
                    .take(PREV_EVENTS_MAX)
                    .map(|entry| entry.event_id)
                    .collect();
            }
        }
        if draft.depth == 0 {
            draft.depth = 1;
        }

        let mut event = draft.into_pdu()?;
        if let Some(signer) = &self.signer {
            event = signing::sign(&event, &self.config.server_name, &signer.key_id, &signer.key)?;
        }

        eval.opts.issue = true;
        let outcome = self.execute(eval, &event).await?;
        Ok((event, outcome))
    }
}
