//! Per-admission options and the cooperative interrupt handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use braid_types::{Fault, FaultSet, Phase};
use tokio::sync::Notify;

use crate::config::VmConfig;
use crate::error::VmError;

/// Options for one admission.
///
/// Phase switches disable a pipeline phase entirely, built-in behaviour and
/// registered hooks alike.
#[derive(Debug, Clone)]
pub struct Opts {
    pub issue: bool,
    pub conform: bool,
    pub access: bool,
    pub verify: bool,
    pub fetch: bool,
    pub auth: bool,
    pub eval: bool,
    pub write: bool,
    pub post: bool,
    pub notify: bool,
    pub effects: bool,

    /// Refuse a second concurrent admission of the same event id.
    pub unique: bool,
    /// Re-admit an event that is already durable.
    pub replays: bool,
    /// Treat the event as ephemeral even if it carries an id.
    pub edu: bool,

    /// Update the present room state.
    pub present: bool,
    /// Record the state history.
    pub history: bool,
    pub room_head: bool,
    /// Remove the event's `prev_events` from the room head.
    pub room_head_resolve: bool,
    /// Fixed write batch reservation. `None` estimates from event size.
    pub reserve_bytes: Option<usize>,
    pub reserve_index: usize,
    /// Room version to assume instead of the one on record.
    pub room_version: Option<String>,
    /// Queue the event for delivery to other servers after admission.
    pub notify_servers: bool,

    pub errorlog: FaultSet,
    pub warnlog: FaultSet,
    pub nothrows: FaultSet,

    /// Overrides for accept logging. `None` follows [`VmConfig`].
    pub debuglog_accept: Option<bool>,
    pub infolog_accept: Option<bool>,

    pub interrupt: Interrupt,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            issue: false,
            conform: true,
            access: true,
            verify: true,
            fetch: true,
            auth: true,
            eval: true,
            write: true,
            post: true,
            notify: true,
            effects: true,
            unique: true,
            replays: false,
            edu: false,
            present: true,
            history: true,
            room_head: true,
            room_head_resolve: true,
            reserve_bytes: None,
            reserve_index: 1024,
            room_version: None,
            notify_servers: true,
            errorlog: FaultSet::of(&[Fault::General]),
            warnlog: FaultSet::of(&[Fault::Invalid]),
            nothrows: FaultSet::of(&[Fault::Exists]),
            debuglog_accept: None,
            infolog_accept: None,
            interrupt: Interrupt::default(),
        }
    }
}

impl Opts {
    /// Whether `phase` runs under these options.
    pub fn enabled(&self, phase: Phase) -> bool {
        match phase {
            Phase::Issue => self.issue,
            Phase::Conform => self.conform,
            Phase::Access => self.access,
            Phase::Verify => self.verify,
            Phase::Fetch => self.fetch,
            Phase::AuthStatic | Phase::AuthRelative | Phase::AuthPresent => self.auth,
            Phase::Eval => self.eval,
            Phase::WritePrepare | Phase::WriteAppend | Phase::WriteCommit => self.write,
            Phase::Post => self.post,
            Phase::Notify => self.notify,
            Phase::Effect => self.effects,
        }
    }

    /// Defaults with the fault policy and reservation taken from `config`.
    pub fn from_config(config: &VmConfig) -> Self {
        Self {
            reserve_index: config.reserve_index,
            errorlog: config.errorlog,
            warnlog: config.warnlog,
            nothrows: config.nothrows,
            ..Self::default()
        }
    }

    /// Options for an event admitted on behalf of another admission.
    ///
    /// Every fault is reported as a value and the interrupt is shared with
    /// the parent.
    pub fn nested(&self) -> Self {
        Self {
            issue: false,
            notify_servers: false,
            errorlog: FaultSet::empty(),
            warnlog: FaultSet::empty(),
            nothrows: FaultSet::all(),
            interrupt: self.interrupt.clone(),
            reserve_index: self.reserve_index,
            ..Self::default()
        }
    }
}

/// Cooperative interrupt for one admission and its nested admissions.
///
/// Raising it fails the next phase boundary or gate wait with
/// [`VmError::Interrupted`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Debug, Default)]
struct InterruptInner {
    raised: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), VmError> {
        if self.is_raised() {
            return Err(VmError::Interrupted);
        }
        Ok(())
    }

    /// Completes once the interrupt is raised.
    pub async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_reports_every_fault() {
        let parent = Opts::default();
        let child = parent.nested();
        assert_eq!(child.nothrows, FaultSet::all());
        assert!(!child.notify_servers);
        assert!(child.unique);
    }

    #[tokio::test]
    async fn nested_shares_the_interrupt() {
        let parent = Opts::default();
        let child = parent.nested();
        let waiter = tokio::spawn(async move { child.interrupt.raised().await });

        parent.interrupt.raise();
        waiter.await.unwrap();
        assert!(matches!(parent.interrupt.check(), Err(VmError::Interrupted)));
    }

    #[test]
    fn auth_switch_covers_every_auth_phase() {
        let opts = Opts {
            auth: false,
            ..Opts::default()
        };
        assert!(!opts.enabled(Phase::AuthStatic));
        assert!(!opts.enabled(Phase::AuthPresent));
        assert!(opts.enabled(Phase::Eval));
        assert!(!opts.enabled(Phase::Issue));
    }

    #[test]
    fn config_policy_carries_over() {
        let config = VmConfig {
            nothrows: FaultSet::all(),
            reserve_index: 0,
            ..VmConfig::default()
        };
        let opts = Opts::from_config(&config);
        assert_eq!(opts.nothrows, FaultSet::all());
        assert_eq!(opts.reserve_index, 0);
        assert!(opts.write);
    }
}
