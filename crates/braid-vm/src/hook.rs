//! Extension points of the admission pipeline.
//!
//! Each [`Phase`] is a hook site named `vm.<phase>` (`vm.auth.present`,
//! `vm.post`, ...). Handlers registered at a site run in registration order
//! after the phase's built-in behaviour. A handler may return an error to
//! abort the admission, except at `notify` and `effect`, where errors are
//! logged and dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use braid_event::Event;
use braid_types::Phase;

use crate::error::VmError;
use crate::eval::Eval;
use crate::vm::Vm;

/// A handler registered at a hook site.
///
/// Handlers receive the [`Vm`] so they can admit further events. Nested
/// admissions should use [`Eval::child`] so they share the caller's write
/// batch.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Filters the events this handler sees. Defaults to all.
    fn matches(&self, _event: &Event) -> bool {
        true
    }

    async fn call(&self, vm: &Vm, eval: &mut Eval, event: &Event) -> Result<(), VmError>;
}

/// Returns the site name of a phase, e.g. `vm.auth.static`.
pub fn site_name(phase: Phase) -> String {
    format!("vm.{phase}")
}

/// Registered handlers by site.
#[derive(Default)]
pub struct Hooks {
    sites: RwLock<BTreeMap<Phase, Vec<Arc<dyn Hook>>>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sites = self.sites.read().unwrap_or_else(|p| p.into_inner());
        let mut map = f.debug_map();
        for (phase, hooks) in sites.iter() {
            map.entry(&site_name(*phase), &hooks.len());
        }
        map.finish()
    }
}

impl Hooks {
    pub fn register(&self, phase: Phase, hook: Arc<dyn Hook>) {
        tracing::debug!(site = %site_name(phase), hook = hook.name(), "hook registered");
        self.sites
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(phase)
            .or_default()
            .push(hook);
    }

    /// Names of the handlers at a site, in call order.
    pub fn names(&self, phase: Phase) -> Vec<String> {
        self.site(phase)
            .iter()
            .map(|hook| hook.name().to_string())
            .collect()
    }

    fn site(&self, phase: Phase) -> Vec<Arc<dyn Hook>> {
        self.sites
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }

    /// Calls every matching handler at a site, stopping at the first error.
    pub(crate) async fn call(
        &self,
        vm: &Vm,
        phase: Phase,
        eval: &mut Eval,
        event: &Event,
    ) -> Result<(), VmError> {
        for hook in self.site(phase) {
            if !hook.matches(event) {
                continue;
            }
            if let Err(e) = hook.call(vm, eval, event).await {
                tracing::debug!(
                    site = %site_name(phase),
                    hook = hook.name(),
                    eval = %eval.loghead(),
                    "hook failed: {}",
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }
}
