//! Builders to construct locks and lock sets from configuration.

pub mod lock_builder;

pub use lock_builder::{build_lock_set, LockSet, RwLockBuilder};
