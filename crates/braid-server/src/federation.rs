//! Outbound federation queue.
//!
//! A `notify` hook queues every locally originated PDU onto a bounded
//! channel. The sender worker drains it and resolves the remote servers
//! joined to each room. Delivery itself is not implemented yet: the worker
//! logs each destination it would send to.

use std::collections::BTreeSet;

use async_trait::async_trait;
use braid_db::{EventStore, StoreError};
use braid_event::Event;
use braid_vm::{Eval, Hook, Vm, VmError};
use tokio::sync::mpsc;

/// An admitted event waiting to be sent to other servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub room_id: String,
    pub event_id: String,
    pub sequence: u64,
}

/// Queues locally originated events for federation.
#[derive(Debug, Clone)]
pub struct FederationNotify {
    server_name: String,
    tx: mpsc::Sender<Outbound>,
}

impl FederationNotify {
    /// Creates the hook together with the receiving end of its queue.
    pub fn channel(server_name: &str, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                server_name: server_name.to_string(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Hook for FederationNotify {
    fn name(&self) -> &str {
        "federation.notify"
    }

    fn matches(&self, event: &Event) -> bool {
        event.is_pdu() && event.origin_server() == Some(self.server_name.as_str())
    }

    async fn call(&self, _vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        if !eval.opts.notify_servers {
            return Ok(());
        }
        let (Some(room_id), Some(event_id)) = (event.room_id(), event.event_id()) else {
            return Ok(());
        };

        let outbound = Outbound {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            sequence: eval.sequence(),
        };
        match self.tx.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(
                    event_id = %dropped.event_id,
                    "federation queue full, event will not be sent"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VmError::general("federation sender is not running"))
            }
        }
    }
}

/// Remote servers with a joined member in `room_id`, sorted.
pub fn destinations(
    store: &EventStore,
    room_id: &str,
    own_server: &str,
) -> Result<Vec<String>, StoreError> {
    let servers: BTreeSet<String> = store
        .joined_members(room_id)?
        .iter()
        .filter_map(|user| braid_types::id::server_name(user))
        .filter(|server| *server != own_server)
        .map(str::to_string)
        .collect();
    Ok(servers.into_iter().collect())
}

/// Drains the federation queue until every sender is dropped.
///
/// Returns the number of events processed.
pub async fn run_sender(
    store: EventStore,
    server_name: String,
    mut rx: mpsc::Receiver<Outbound>,
) -> usize {
    tracing::info!(server_name = %server_name, "federation sender started");
    let mut processed = 0;

    while let Some(outbound) = rx.recv().await {
        processed += 1;
        let resolved = {
            let store = store.clone();
            let room_id = outbound.room_id.clone();
            let server_name = server_name.clone();
            tokio::task::spawn_blocking(move || destinations(&store, &room_id, &server_name)).await
        };

        match resolved {
            Ok(Ok(servers)) if servers.is_empty() => {
                tracing::trace!(event_id = %outbound.event_id, "no remote servers in room");
            }
            Ok(Ok(servers)) => {
                for server in &servers {
                    tracing::info!(
                        event_id = %outbound.event_id,
                        room_id = %outbound.room_id,
                        sequence = outbound.sequence,
                        destination = %server,
                        "event ready for delivery"
                    );
                }
            }
            Ok(Err(e)) => {
                tracing::error!(event_id = %outbound.event_id, "failed to resolve destinations: {}", e);
            }
            Err(e) => {
                tracing::error!("federation sender join error: {}", e);
            }
        }
    }

    tracing::info!(processed, "federation sender stopped");
    processed
}
