//! Admission pipeline phase identifiers.

use serde::{Deserialize, Serialize};

/// One stage of the admission pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Issue,
    Conform,
    Access,
    Verify,
    Fetch,
    AuthStatic,
    AuthRelative,
    AuthPresent,
    Eval,
    WritePrepare,
    WriteAppend,
    Post,
    WriteCommit,
    Notify,
    Effect,
}

impl Phase {
    /// Every phase in pipeline order.
    pub const ALL: [Phase; 15] = [
        Self::Issue,
        Self::Conform,
        Self::Access,
        Self::Verify,
        Self::Fetch,
        Self::AuthStatic,
        Self::AuthRelative,
        Self::AuthPresent,
        Self::Eval,
        Self::WritePrepare,
        Self::WriteAppend,
        Self::Post,
        Self::WriteCommit,
        Self::Notify,
        Self::Effect,
    ];

    /// Short name used in log fields and hook site names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Conform => "conform",
            Self::Access => "access",
            Self::Verify => "verify",
            Self::Fetch => "fetch",
            Self::AuthStatic => "auth.static",
            Self::AuthRelative => "auth.relative",
            Self::AuthPresent => "auth.present",
            Self::Eval => "eval",
            Self::WritePrepare => "write.prepare",
            Self::WriteAppend => "write.append",
            Self::Post => "post",
            Self::WriteCommit => "write.commit",
            Self::Notify => "notify",
            Self::Effect => "effect",
        }
    }

    /// Phases whose failures are logged and swallowed.
    pub fn is_infallible(self) -> bool {
        matches!(self, Self::Notify | Self::Effect)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
