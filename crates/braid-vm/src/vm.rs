//! The admission engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use braid_db::{EventStore, StoreError};
use braid_event::{conform, Event, Keyring};
use braid_types::{Phase, ROOM_CREATE};
use ed25519_dalek::SigningKey;

use crate::collab::{AuthEngine, AuthError, FetchKind, Fetcher, KeyService, MembershipAuth, NoFetcher};
use crate::config::VmConfig;
use crate::error::{Outcome, VmError};
use crate::eval::{Deferred, Eval};
use crate::hook::Hooks;
use crate::opts::Opts;
use crate::policy::handle_error;
use crate::sequence::{EvalId, Sequencer};

/// Boxed future returned by [`Vm::execute`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Deepest stack of nested admissions before the innermost is refused.
pub const STACK_MAX: usize = 32;

pub(crate) struct ServerKey {
    pub(crate) key_id: String,
    pub(crate) key: SigningKey,
}

/// Admits events into the log.
///
/// One `Vm` owns one [`Sequencer`]; every admission through it is totally
/// ordered against every other. Collaborators default to
/// [`MembershipAuth`], [`NoFetcher`] and an empty [`Keyring`].
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) store: EventStore,
    pub(crate) sequencer: Arc<Sequencer>,
    hooks: Hooks,
    auth: Arc<dyn AuthEngine>,
    fetcher: Arc<dyn Fetcher>,
    keys: Arc<dyn KeyService>,
    pub(crate) signer: Option<ServerKey>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("server_name", &self.config.server_name)
            .field("sequencer", &self.sequencer.snapshot())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Creates an engine over `store`, resuming the sequence after the
    /// highest position already in the log.
    ///
    /// # Errors
    ///
    /// Returns `VmError::Store` if the log cannot be read.
    pub fn new(config: VmConfig, store: EventStore) -> Result<Self, VmError> {
        let last = store.max_event_idx()?;
        tracing::info!(
            server_name = %config.server_name,
            last_idx = last,
            "admission engine ready"
        );

        Ok(Self {
            config,
            store,
            sequencer: Arc::new(Sequencer::starting_at(last)),
            hooks: Hooks::default(),
            auth: Arc::new(MembershipAuth),
            fetcher: Arc::new(NoFetcher),
            keys: Arc::new(Keyring::new()),
            signer: None,
        })
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthEngine>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyService>) -> Self {
        self.keys = keys;
        self
    }

    /// Sets the key locally authored events are signed with.
    pub fn with_signing_key(mut self, key_id: &str, key: SigningKey) -> Self {
        self.signer = Some(ServerKey {
            key_id: key_id.to_string(),
            key,
        });
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Default options under this engine's configuration.
    pub fn opts(&self) -> Opts {
        Opts::from_config(&self.config)
    }

    /// A fresh root eval with default options.
    pub fn eval(&self) -> Eval {
        Eval::new(self.opts())
    }

    /// Admits one event.
    ///
    /// Faults in `eval.opts.nothrows` come back as an [`Outcome`]; every
    /// other fault, and any interruption, comes back as an error.
    pub fn execute<'a>(
        &'a self,
        eval: &'a mut Eval,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<Outcome, VmError>> {
        Box::pin(self.execute_inner(eval, event))
    }

    async fn execute_inner(&self, eval: &mut Eval, event: &Event) -> Result<Outcome, VmError> {
        if let Some(current) = eval.phase {
            let err = VmError::general(format!("eval re-entered during {current}"));
            return handle_error(&eval.opts, &eval.loghead(), err);
        }

        eval.reset();
        eval.event_id = event.event_id().map(str::to_string);
        eval.room_id = event.room_id().map(str::to_string);

        let result = if eval.depth() > STACK_MAX {
            Err(VmError::general(format!(
                "admission stack deeper than {STACK_MAX}"
            )))
        } else if event.is_pdu() && !eval.opts.edu {
            self.execute_pdu(eval, event).await
        } else {
            self.execute_edu(eval, event).await
        };
        eval.phase = None;

        match result {
            Ok(outcome) => {
                self.log_accept(eval, event);
                Ok(outcome)
            }
            Err(e) => handle_error(&eval.opts, &eval.loghead(), e),
        }
    }

    async fn execute_edu(&self, eval: &mut Eval, event: &Event) -> Result<Outcome, VmError> {
        let interrupt = eval.opts.interrupt.clone();
        let slot = self.sequencer.register(None, false, false, &interrupt).await?;
        eval.frame.id.store(slot.id(), Ordering::SeqCst);

        self.phase(eval, event, Phase::Eval).await?;
        self.phase(eval, event, Phase::Post).await?;
        self.phase(eval, event, Phase::Notify).await?;
        self.phase(eval, event, Phase::Effect).await?;
        Ok(Outcome::Accept { sequence: 0 })
    }

    async fn execute_pdu(&self, eval: &mut Eval, event: &Event) -> Result<Outcome, VmError> {
        let Some(event_id) = event.event_id() else {
            return Err(VmError::general("persistent event without event_id"));
        };
        let interrupt = eval.opts.interrupt.clone();
        let wait = !eval.ancestor_sequenced();
        let slot = self
            .sequencer
            .register(Some(event_id), eval.opts.unique, wait, &interrupt)
            .await?;
        eval.frame.id.store(slot.id(), Ordering::SeqCst);
        tracing::trace!(eval = %eval.loghead(), "eval registered");

        let result = self.pipeline(eval, event, slot.id()).await;
        if result.is_err() {
            self.discard_writes(eval);
        }
        eval.frame.set_txn(None);
        drop(slot);
        result
    }

    async fn pipeline(
        &self,
        eval: &mut Eval,
        event: &Event,
        id: EvalId,
    ) -> Result<Outcome, VmError> {
        let interrupt = eval.opts.interrupt.clone();
        if !eval.opts.replays {
            self.check_exists(event).await?;
        }
        self.load_room(eval, event).await?;

        self.phase(eval, event, Phase::Issue).await?;
        self.phase(eval, event, Phase::Conform).await?;
        self.phase(eval, event, Phase::Access).await?;
        self.phase(eval, event, Phase::Verify).await?;
        self.phase(eval, event, Phase::Fetch).await?;
        self.phase(eval, event, Phase::AuthStatic).await?;

        // Fetch may have run long enough for another admission to land it.
        if !eval.opts.replays {
            self.check_exists(event).await?;
        }

        let sequence = self.sequencer.assign(id);
        eval.set_sequence(sequence);
        self.sequencer.sequence_gate(id, &interrupt).await?;
        tracing::debug!(
            eval = %eval.loghead(),
            version = eval.room_version().unwrap_or("-"),
            "event sequenced"
        );
        self.phase(eval, event, Phase::AuthRelative).await?;
        self.sequencer.pass_sequence(sequence);

        self.sequencer.commit_gate(id, &interrupt).await?;
        tracing::debug!(eval = %eval.loghead(), "event committing");
        self.phase(eval, event, Phase::AuthPresent).await?;
        self.phase(eval, event, Phase::Eval).await?;
        self.sequencer.pass_commit(sequence);

        self.phase(eval, event, Phase::WritePrepare).await?;
        self.phase(eval, event, Phase::WriteAppend).await?;
        self.phase(eval, event, Phase::Post).await?;

        if eval.is_borrowing() {
            // Durability comes with the lender's commit; so do notify and
            // effect.
            if let Some((lender, _)) = &eval.lender {
                lender.defer(eval.detached(), event.clone());
                tracing::trace!(eval = %eval.loghead(), "notify deferred to lender");
            }
            return Ok(Outcome::Accept { sequence });
        }

        self.phase(eval, event, Phase::WriteCommit).await?;
        let ancestors = eval.ancestor_ids();
        let (before, after) = self.sequencer.retire(id, &ancestors, &interrupt).await?;
        tracing::debug!(
            eval = %eval.loghead(),
            shared = eval.sequence_shared()[1],
            "event committed, retire {}:{}",
            before,
            after
        );

        self.phase(eval, event, Phase::Notify).await?;
        self.phase(eval, event, Phase::Effect).await?;
        self.run_deferred(eval).await;
        Ok(Outcome::Accept { sequence })
    }

    /// Runs notify and effect for the descendants that rode on this
    /// admission's batch, now durable.
    async fn run_deferred(&self, eval: &Eval) {
        for Deferred { eval: mut late, event } in eval.frame.take_deferred() {
            for phase in [Phase::Notify, Phase::Effect] {
                if let Err(e) = self.phase(&mut late, &event, phase).await {
                    tracing::warn!(eval = %late.loghead(), phase = %phase, "deferred phase skipped: {}", e);
                }
            }
        }
    }

    /// Runs one phase: built-in behaviour, then the hook site.
    async fn phase(&self, eval: &mut Eval, event: &Event, phase: Phase) -> Result<(), VmError> {
        if !eval.opts.enabled(phase) {
            return Ok(());
        }
        eval.opts.interrupt.check()?;
        if let Some(current) = eval.phase {
            return Err(VmError::general(format!(
                "phase {phase} entered during {current}"
            )));
        }

        eval.phase = Some(phase);
        let result = match self.builtin(eval, event, phase).await {
            Ok(()) => self.hooks.call(self, phase, eval, event).await,
            Err(e) => Err(e),
        };
        eval.phase = None;

        match result {
            Err(e) if phase.is_infallible() => {
                tracing::warn!(phase = %phase, eval = %eval.loghead(), "ignoring failure: {}", e);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(phase = %phase, eval = %eval.loghead(), "phase failed: {}", e);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    async fn builtin(&self, eval: &mut Eval, event: &Event, phase: Phase) -> Result<(), VmError> {
        match phase {
            Phase::Issue => self.issue(event),
            Phase::Conform => Ok(conform::check(event)?),
            Phase::Access => self.access(eval, event),
            Phase::Verify => self.verify(event).await,
            Phase::Fetch => self.fetch(eval, event).await,
            Phase::AuthStatic if !eval.room_internal => Ok(self.auth.check_static(event).await?),
            Phase::AuthRelative if !eval.room_internal => {
                Ok(self.auth.check_relative(event, &self.store).await?)
            }
            Phase::AuthPresent if !eval.room_internal => self.auth_present(eval, event).await,
            Phase::Eval => self.check_dependencies(eval, event).await,
            Phase::WritePrepare => self.write_prepare(eval, event),
            Phase::WriteAppend => self.write_append(eval, event).await,
            Phase::WriteCommit => self.write_commit(eval).await,
            _ => Ok(()),
        }
    }

    fn issue(&self, event: &Event) -> Result<(), VmError> {
        if event.origin_server() != Some(self.config.server_name.as_str()) {
            return Err(VmError::invalid(format!(
                "issued event must originate from {}",
                self.config.server_name
            )));
        }
        Ok(())
    }

    /// Caches room version and internal status on the eval.
    async fn load_room(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        let Some(room_id) = event.room_id().map(str::to_string) else {
            return Ok(());
        };
        let info = self.blocking(move |store| store.room_info(&room_id)).await?;

        let created_here = event.kind() == ROOM_CREATE
            && event.sender() == Some(self.config.service_user().as_str());
        let create_version = (event.kind() == ROOM_CREATE)
            .then(|| event.content().get("room_version").and_then(|v| v.as_str()))
            .flatten()
            .map(str::to_string);

        eval.room_internal = info.as_ref().is_some_and(|i| i.internal) || created_here;
        eval.room_version = eval
            .opts
            .room_version
            .clone()
            .or_else(|| info.map(|i| i.version))
            .or(create_version);
        Ok(())
    }

    fn access(&self, eval: &Eval, event: &Event) -> Result<(), VmError> {
        if eval.room_internal && event.origin_server() != Some(self.config.server_name.as_str()) {
            return Err(VmError::general(
                "internal room event denied from external source",
            ));
        }
        Ok(())
    }

    async fn verify(&self, event: &Event) -> Result<(), VmError> {
        if !self.keys.verify(event).await {
            return Err(VmError::invalid(format!(
                "signature verification failed for {}",
                event.origin_server().unwrap_or("unknown origin")
            )));
        }
        Ok(())
    }

    /// Admits missing `auth_events`, then missing `prev_events`, obtained
    /// from the fetch unit as nested admissions. Failures are left for the
    /// authorization and dependency checks to report.
    async fn fetch(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        let Some(room_id) = event.room_id() else {
            return Ok(());
        };
        let auth = self.missing(eval, event.auth_events()).await?;
        self.fetch_each(eval, room_id, auth, FetchKind::Auth).await?;
        let prev = self.missing(eval, event.prev_events()).await?;
        self.fetch_each(eval, room_id, prev, FetchKind::Event).await
    }

    async fn fetch_each(
        &self,
        eval: &mut Eval,
        room_id: &str,
        missing: Vec<String>,
        kind: FetchKind,
    ) -> Result<(), VmError> {
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);

        for wanted in missing {
            let fetched = self.fetcher.fetch(room_id, &wanted, kind);
            let events = match tokio::time::timeout(timeout, fetched).await {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    tracing::debug!(eval = %eval.loghead(), ?kind, wanted = %wanted, "{}", e);
                    continue;
                }
                Err(_) => {
                    tracing::debug!(eval = %eval.loghead(), ?kind, wanted = %wanted, "fetch timed out");
                    continue;
                }
            };

            for fetched_event in events {
                if fetched_event.event_id() != Some(wanted.as_str()) {
                    tracing::warn!(
                        eval = %eval.loghead(),
                        requested = %wanted,
                        received = ?fetched_event.event_id(),
                        "fetch returned a different event"
                    );
                    continue;
                }
                let mut child = eval.child(eval.opts.nested());
                let outcome = self.execute(&mut child, &fetched_event).await?;
                tracing::debug!(eval = %eval.loghead(), ?kind, wanted = %wanted, ?outcome, "fetched dependency");
            }
        }
        Ok(())
    }

    async fn auth_present(&self, eval: &mut Eval, event: &Event) -> Result<(), VmError> {
        match self.auth.check_present(event, &self.store).await {
            Ok(()) => Ok(()),
            Err(AuthError::Denied(reason)) => {
                tracing::debug!(
                    eval = %eval.loghead(),
                    "present state denies event, writing without state: {}",
                    reason
                );
                eval.present_denied = Some(reason);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every `prev_events` entry must be durable or staged by an ancestor.
    async fn check_dependencies(&self, eval: &Eval, event: &Event) -> Result<(), VmError> {
        if !event.is_pdu() || eval.opts.edu {
            return Ok(());
        }
        match self.missing(eval, event.prev_events()).await?.first() {
            Some(missing) => Err(VmError::general(format!("missing prev_event {missing}"))),
            None => Ok(()),
        }
    }

    /// The entries of `ids` neither durable nor staged by an ancestor.
    async fn missing(&self, eval: &Eval, ids: &[String]) -> Result<Vec<String>, VmError> {
        let candidates: Vec<String> = ids
            .iter()
            .filter(|id| !eval.staged_by_ancestor(id))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        self.blocking(move |store| {
            let mut missing = Vec::new();
            for id in candidates {
                if !store.event_exists(&id)? {
                    missing.push(id);
                }
            }
            Ok(missing)
        })
        .await
    }

    async fn check_exists(&self, event: &Event) -> Result<(), VmError> {
        let Some(event_id) = event.event_id().map(str::to_string) else {
            return Ok(());
        };
        let exists = {
            let event_id = event_id.clone();
            self.blocking(move |store| store.event_exists(&event_id)).await?
        };
        if exists {
            return Err(VmError::exists(format!("{event_id} already exists")));
        }
        Ok(())
    }

    fn log_accept(&self, eval: &Eval, event: &Event) {
        let info = eval
            .opts
            .infolog_accept
            .unwrap_or(self.config.log_accept_info);
        let debug = eval
            .opts
            .debuglog_accept
            .unwrap_or(self.config.log_accept_debug);

        if info {
            tracing::info!(eval = %eval.loghead(), "accepted {}", event.summary());
        } else if debug {
            tracing::debug!(eval = %eval.loghead(), "accepted {}", event.summary());
        }
    }

    /// Runs a store call on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, VmError>
    where
        F: FnOnce(&EventStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }
}
