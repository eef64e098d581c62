//! Shared utilities.

pub mod clock;
pub mod stacktrace;
pub mod telemetry;
pub mod thread;

pub use clock::*;
pub use stacktrace::*;
pub use telemetry::*;
pub use thread::*;
