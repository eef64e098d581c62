//! Stack trace capture for diagnostic messages.

use std::backtrace::Backtrace;

/// Capture the current stack as text, regardless of `RUST_BACKTRACE`.
pub fn capture_stacktrace() -> String {
    Backtrace::force_capture().to_string()
}
