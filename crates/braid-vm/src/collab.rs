//! Collaborators the pipeline consults: authorization, dependency fetch and
//! signature verification.

use async_trait::async_trait;
use braid_db::{EventStore, StoreError};
use braid_event::{Event, Keyring, Verification};
use braid_types::id::{self, IdKind};
use braid_types::{ROOM_CREATE, ROOM_MEMBER};

use crate::error::VmError;

/// Errors from an [`AuthEngine`].
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The rules reject the event.
    #[error("{0}")]
    Denied(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The engine could not reach a decision.
    #[error("authorization unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthError> for VmError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Denied(reason) => VmError::invalid(reason),
            AuthError::Store(e) => VmError::Store(e),
            AuthError::Unavailable(reason) => VmError::general(reason),
        }
    }
}

/// Room authorization rules.
#[async_trait]
pub trait AuthEngine: Send + Sync {
    /// Checks that depend on the event alone.
    async fn check_static(&self, event: &Event) -> Result<(), AuthError>;

    /// Checks against the event's own references.
    async fn check_relative(&self, event: &Event, store: &EventStore) -> Result<(), AuthError>;

    /// Checks against the room's present state.
    async fn check_present(&self, event: &Event, store: &EventStore) -> Result<(), AuthError>;
}

/// What a fetch is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// A missing `prev_events` entry.
    Event,
    /// History preceding the event. The pipeline never asks for it; callers
    /// paging a room backwards do.
    Backfill,
    /// A missing `auth_events` entry.
    Auth,
}

#[derive(Debug, thiserror::Error)]
#[error("fetch failed: {0}")]
pub struct FetchError(pub String);

/// Retrieves events this server does not have from other servers.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        room_id: &str,
        event_id: &str,
        kind: FetchKind,
    ) -> Result<Vec<Event>, FetchError>;
}

/// A fetcher for servers without federation. Every fetch fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFetcher;

#[async_trait]
impl Fetcher for NoFetcher {
    async fn fetch(&self, _: &str, event_id: &str, _: FetchKind) -> Result<Vec<Event>, FetchError> {
        Err(FetchError(format!("cannot fetch {event_id}: no remote access")))
    }
}

/// Signature verification.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Returns `false` only for an event proven unsigned or badly signed.
    /// An event whose origin keys are unknown passes.
    async fn verify(&self, event: &Event) -> bool;
}

#[async_trait]
impl KeyService for Keyring {
    async fn verify(&self, event: &Event) -> bool {
        match Keyring::verify(self, event) {
            Ok(Verification::Valid) => true,
            Ok(Verification::Unverifiable) => {
                tracing::trace!(origin = ?event.origin_server(), "no keys for origin, skipping");
                true
            }
            Ok(Verification::Invalid(reason)) => {
                tracing::debug!(event_id = ?event.event_id(), "signature rejected: {}", reason);
                false
            }
            Err(e) => {
                tracing::debug!(event_id = ?event.event_id(), "signature check failed: {}", e);
                false
            }
        }
    }
}

const MEMBERSHIPS: [&str; 5] = ["join", "leave", "invite", "ban", "knock"];

/// Membership-based rules: the baseline authorization for rooms without a
/// richer engine.
///
/// - the create event references nothing;
/// - member events name a user and a known membership;
/// - prev events must belong to the event's own room;
/// - senders must be joined, except for the create event and a user's own
///   join.
#[derive(Debug, Default, Clone, Copy)]
pub struct MembershipAuth;

#[async_trait]
impl AuthEngine for MembershipAuth {
    async fn check_static(&self, event: &Event) -> Result<(), AuthError> {
        if event.kind() == ROOM_CREATE {
            if !event.prev_events().is_empty() {
                return Err(AuthError::Denied(
                    "create event must not have prev_events".to_string(),
                ));
            }
            if event.state_key() != Some("") {
                return Err(AuthError::Denied(
                    "create event needs an empty state_key".to_string(),
                ));
            }
        }

        if event.kind() == ROOM_MEMBER {
            let target = event
                .state_key()
                .ok_or_else(|| AuthError::Denied("member event without state_key".to_string()))?;
            id::validate(IdKind::User, target)
                .map_err(|e| AuthError::Denied(format!("member state_key: {e}")))?;

            let membership = event.content().get("membership").and_then(|v| v.as_str());
            if !membership.is_some_and(|m| MEMBERSHIPS.contains(&m)) {
                return Err(AuthError::Denied(format!(
                    "unknown membership {membership:?}"
                )));
            }
        }

        Ok(())
    }

    async fn check_relative(&self, event: &Event, store: &EventStore) -> Result<(), AuthError> {
        let Some(room_id) = event.room_id().map(str::to_string) else {
            return Ok(());
        };
        let prev = event.prev_events().to_vec();
        let store = store.clone();

        let foreign = blocking(move || {
            for prev_id in prev {
                if let Some(prev_event) = store.get_event(&prev_id)? {
                    if prev_event.room_id() != Some(room_id.as_str()) {
                        return Ok(Some(prev_id));
                    }
                }
            }
            Ok(None)
        })
        .await?;

        match foreign {
            Some(prev_id) => Err(AuthError::Denied(format!(
                "prev_event {prev_id} belongs to another room"
            ))),
            None => Ok(()),
        }
    }

    async fn check_present(&self, event: &Event, store: &EventStore) -> Result<(), AuthError> {
        if event.kind() == ROOM_CREATE {
            return Ok(());
        }
        let (Some(room_id), Some(sender)) = (event.room_id(), event.sender()) else {
            return Err(AuthError::Denied("event without room or sender".to_string()));
        };

        let own_join = event.kind() == ROOM_MEMBER
            && event.state_key() == Some(sender)
            && event.content().get("membership").and_then(|v| v.as_str()) == Some("join");
        if own_join {
            return Ok(());
        }

        let membership = {
            let store = store.clone();
            let (room_id, sender) = (room_id.to_string(), sender.to_string());
            blocking(move || Ok(store.membership(&room_id, &sender)?)).await?
        };

        match membership.as_deref() {
            Some("join") => Ok(()),
            _ => Err(AuthError::Denied(format!(
                "sender {sender} is not joined to {room_id}"
            ))),
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AuthError>
where
    F: FnOnce() -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Unavailable(e.to_string()))?
}
