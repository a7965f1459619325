//! Static conformance checks for persistent events.
//!
//! These checks depend only on the event itself. They run before any
//! collaborator is consulted, so a malformed event from a remote peer is
//! rejected without touching storage or the network.

use braid_types::id::{self, IdError, IdKind};
use braid_types::{EVENT_MAX_SIZE, PREV_EVENTS_MAX};
use thiserror::Error;

use crate::error::EventError;
use crate::event::Event;

/// Reasons an event fails conformance.
#[derive(Debug, Error)]
pub enum ConformError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("event_id {claimed} does not match content hash {computed}")]
    HashMismatch { claimed: String, computed: String },

    #[error("depth {0} is negative")]
    NegativeDepth(i64),

    #[error("event references itself in prev_events")]
    SelfReference,

    #[error("prev_events lists {0} more than once")]
    DuplicatePrev(String),

    #[error("{0} prev_events exceeds the limit of {PREV_EVENTS_MAX}")]
    TooManyPrev(usize),

    #[error("event of {0} bytes exceeds the limit of {EVENT_MAX_SIZE}")]
    TooLarge(usize),

    #[error("content must be a JSON object")]
    ContentNotObject,

    #[error(transparent)]
    Encoding(#[from] EventError),
}

/// Runs every conformance check against a persistent event.
pub fn check(event: &Event) -> Result<(), ConformError> {
    let event_id = event
        .event_id()
        .ok_or(ConformError::MissingField("event_id"))?;
    id::validate(IdKind::Event, event_id)?;

    let room_id = event.room_id().ok_or(ConformError::MissingField("room_id"))?;
    id::validate(IdKind::Room, room_id)?;

    let sender = event.sender().ok_or(ConformError::MissingField("sender"))?;
    id::validate(IdKind::User, sender)?;

    if event.kind().is_empty() {
        return Err(ConformError::MissingField("type"));
    }

    if !event.content().is_object() {
        return Err(ConformError::ContentNotObject);
    }

    if event.depth() < 0 {
        return Err(ConformError::NegativeDepth(event.depth()));
    }

    let prev = event.prev_events();
    if prev.len() > PREV_EVENTS_MAX {
        return Err(ConformError::TooManyPrev(prev.len()));
    }
    for (i, prev_id) in prev.iter().enumerate() {
        id::validate(IdKind::Event, prev_id)?;
        if prev_id == event_id {
            return Err(ConformError::SelfReference);
        }
        if prev[..i].contains(prev_id) {
            return Err(ConformError::DuplicatePrev(prev_id.clone()));
        }
    }

    let size = event.serialized_size()?;
    if size > EVENT_MAX_SIZE {
        return Err(ConformError::TooLarge(size));
    }

    let computed = event.compute_id()?;
    if computed != event_id {
        return Err(ConformError::HashMismatch {
            claimed: event_id.to_string(),
            computed,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventDraft;
    use serde_json::json;

    fn draft() -> EventDraft {
        EventDraft::new("!lobby:braid.example", "m.room.message", "@alice:braid.example")
            .depth(1)
            .content(json!({ "body": "hi" }))
    }

    #[test]
    fn well_formed_event_passes() {
        check(&draft().into_pdu().unwrap()).unwrap();
    }

    #[test]
    fn tampered_event_fails_hash_check() {
        let pdu = draft().into_pdu().unwrap();
        let mut value = serde_json::to_value(&pdu).unwrap();
        value["content"]["body"] = json!("tampered");
        let tampered = Event::from_value(value).unwrap();

        assert!(matches!(
            check(&tampered).unwrap_err(),
            ConformError::HashMismatch { .. }
        ));
    }

    #[test]
    fn missing_sender_is_rejected() {
        let mut d = draft();
        d.sender = None;
        assert!(matches!(
            check(&d.into_pdu().unwrap()).unwrap_err(),
            ConformError::MissingField("sender")
        ));
    }

    #[test]
    fn ephemeral_event_is_rejected() {
        assert!(matches!(
            check(&draft().into_event()).unwrap_err(),
            ConformError::MissingField("event_id")
        ));
    }

    #[test]
    fn duplicate_prev_is_rejected() {
        let prev = "$aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let pdu = draft().prev_events([prev, prev]).into_pdu().unwrap();
        assert!(matches!(
            check(&pdu).unwrap_err(),
            ConformError::DuplicatePrev(id) if id == prev
        ));
    }

    #[test]
    fn too_many_prev_is_rejected() {
        let prev: Vec<String> = (0..=PREV_EVENTS_MAX).map(|i| format!("$prev{i}")).collect();
        let pdu = draft().prev_events(prev).into_pdu().unwrap();
        assert!(matches!(
            check(&pdu).unwrap_err(),
            ConformError::TooManyPrev(n) if n == PREV_EVENTS_MAX + 1
        ));
    }

    #[test]
    fn negative_depth_is_rejected() {
        let pdu = draft().depth(-1).into_pdu().unwrap();
        assert!(matches!(
            check(&pdu).unwrap_err(),
            ConformError::NegativeDepth(-1)
        ));
    }

    #[test]
    fn oversized_event_is_rejected() {
        let body = "x".repeat(EVENT_MAX_SIZE);
        let pdu = draft().content(json!({ "body": body })).into_pdu().unwrap();
        assert!(matches!(check(&pdu).unwrap_err(), ConformError::TooLarge(_)));
    }
}
