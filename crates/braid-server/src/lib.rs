//! Braid server library logic.

pub mod config;
pub mod federation;
pub mod keys;

use std::sync::Arc;

use axum::{extract::Extension, routing::get, Json, Router};
use braid_db::EventStore;
use braid_event::Keyring;
use braid_types::Phase;
use braid_vm::{SequenceSnapshot, Vm, VmError};
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::federation::{FederationNotify, Outbound};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The admission engine.
    pub vm: Arc<Vm>,
}

/// An admission engine wired for this server, with the receiving end of its
/// federation queue.
pub struct Engine {
    pub vm: Arc<Vm>,
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Builds the admission engine over `store`.
///
/// The engine signs locally authored events with `key`, trusts that key for
/// its own server name, and queues locally originated events for federation.
///
/// # Errors
///
/// Returns `VmError::Store` if the existing log cannot be read.
pub fn build_engine(config: &Config, store: EventStore, key: SigningKey) -> Result<Engine, VmError> {
    let server_name = config.vm.server_name.clone();

    let mut keyring = Keyring::new();
    keyring.insert(&server_name, keys::KEY_ID, key.verifying_key());

    let vm = Vm::new(config.vm.clone(), store)?
        .with_keys(Arc::new(keyring))
        .with_signing_key(keys::KEY_ID, key);

    let (notify, outbound) = FederationNotify::channel(&server_name, config.server.federation_queue);
    vm.hooks().register(Phase::Notify, Arc::new(notify));

    Ok(Engine {
        vm: Arc::new(vm),
        outbound,
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Handler for `GET /_braid/vm/sequence`.
async fn sequence_handler(Extension(state): Extension<Arc<AppState>>) -> Json<SequenceSnapshot> {
    Json(state.vm.sequencer().snapshot())
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/_braid/vm/sequence", get(sequence_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
