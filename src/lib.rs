//! # Prometheus RwLock
//!
//! An instrumented, diagnosable reader-writer lock for services that nest
//! many locks across many threads.
//!
//! Plain mutual exclusion is only half the job here. Hundreds of call sites
//! nest these locks, and the bugs that hurt are the ones that are nearly
//! impossible to reproduce: a thread re-entering a lock it must not recurse
//! into, or two threads taking the same locks in different orders. The lock
//! helps find both while adding next to nothing when its diagnostics are off.
//!
//! ## Key Features
//!
//! - **Two backends**: a reader/writer lock with configurable reader
//!   preference, and a writer-preferring shared/exclusive mutex. Selected
//!   per lock or through `PROMETHEUS_RWLOCK_BACKEND`.
//! - **Non-blocking writers**: by default a writer retries a timed attempt
//!   (5 s) and pauses (500 ms) between attempts instead of parking forever.
//! - **Deadlock checking**: per-lock holder bookkeeping reports double write
//!   locks, read re-entry while a writer is pending, and extra unlocks.
//! - **Order checking**: named rules declare the only permitted acquisition
//!   order for a set of locks; violations are logged and recorded.
//! - **Latency statistics**: sampled wait times with min/avg/max per lock and
//!   process-wide, with timestamp-cost compensation.
//! - **Scoped guards**: RAII read/write guards with hold-time warnings and a
//!   per-thread lock-state table.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_rwlock::config::DiagnosticsConfig;
//! use prometheus_rwlock::core::{Diagnostics, RwLock};
//!
//! let diag = Diagnostics::shared(&DiagnosticsConfig::default());
//! let tree = RwLock::builder().name("tree").diagnostics(Arc::clone(&diag)).build()?;
//! let cache = RwLock::builder().name("cache").diagnostics(Arc::clone(&diag)).build()?;
//!
//! diag.add_order_rule("tree-before-cache", &[&tree, &cache])?;
//! diag.set_order_check(true);
//!
//! {
//!     let _t = tree.write()?;
//!     let _c = cache.read()?;
//! }
//! assert_eq!(diag.order_violation_count(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Lock core: backends, diagnostics hooks, the lock and its guards.
pub mod core;
/// Configuration models for locks and diagnostics.
pub mod config;
/// Builders to construct locks and lock sets from configuration.
pub mod builders;
/// Serializable snapshots for operational debugging.
pub mod admin;
/// Shared utilities.
pub mod util;

pub use crate::core::{
    AccessMode, Diagnostics, LockError, ReadGuard, RuleError, RwLock, WriteGuard,
};
