//! Engine-wide settings.

use braid_types::{Fault, FaultSet};
use serde::Deserialize;

/// Settings shared by every admission on one [`Vm`](crate::Vm).
///
/// Deserialised from the `[vm]` table of the server configuration. Per-eval
/// overrides live in [`Opts`](crate::Opts).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmConfig {
    /// Name of this server. Locally authored events carry it as `origin`.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Log accepted events at debug level.
    #[serde(default = "default_true")]
    pub log_accept_debug: bool,

    /// Log accepted events at info level.
    #[serde(default)]
    pub log_accept_info: bool,

    /// Bytes added to every write batch reservation.
    #[serde(default = "default_reserve_index")]
    pub reserve_index: usize,

    /// Upper bound for one dependency fetch, in milliseconds.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Faults logged at error level.
    #[serde(default = "default_errorlog")]
    pub errorlog: FaultSet,

    /// Faults logged at warn level.
    #[serde(default = "default_warnlog")]
    pub warnlog: FaultSet,

    /// Faults returned as an outcome instead of raised as an error.
    #[serde(default = "default_nothrows")]
    pub nothrows: FaultSet,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reserve_index() -> usize {
    1024
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_errorlog() -> FaultSet {
    FaultSet::of(&[Fault::General])
}

fn default_warnlog() -> FaultSet {
    FaultSet::of(&[Fault::Invalid])
}

fn default_nothrows() -> FaultSet {
    FaultSet::of(&[Fault::Exists])
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            log_accept_debug: default_true(),
            log_accept_info: false,
            reserve_index: default_reserve_index(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            errorlog: default_errorlog(),
            warnlog: default_warnlog(),
            nothrows: default_nothrows(),
        }
    }
}

impl VmConfig {
    /// Returns the id of this server's service user, `@braid:<server_name>`.
    ///
    /// Rooms created by this user are internal to the server.
    pub fn service_user(&self) -> String {
        format!("@braid:{}", self.server_name)
    }
}
