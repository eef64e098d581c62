//! Configuration models for locks, lock sets and the diagnostics service.

pub mod lock;

pub use lock::{BackendKind, DiagnosticsConfig, LockConfig, LockSetConfig};
