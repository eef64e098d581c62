//! Single choke point for unrecoverable lock failures.

use serde::{Deserialize, Serialize};

/// What to do when a backend reports a state the lock cannot recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Log and abort the process without unwinding.
    #[default]
    Abort,
    /// Log and panic; used by tests that exercise failure paths.
    Panic,
}

impl FatalPolicy {
    /// Report an unrecoverable failure on `lock`. Never returns.
    #[track_caller]
    pub fn raise(self, lock: &str, detail: &dyn std::fmt::Display) -> ! {
        let location = std::panic::Location::caller();
        tracing::error!(
            lock,
            detail = %detail,
            file = location.file(),
            line = location.line(),
            "unrecoverable lock failure"
        );
        match self {
            Self::Abort => std::process::abort(),
            Self::Panic => panic!("unrecoverable lock failure on `{lock}`: {detail}"),
        }
    }
}
