//! Lock core: backends, diagnostics hooks, the lock itself and its guards.

pub mod backend;
pub mod calibration;
pub mod deadlock;
pub mod diagnostics;
pub mod error;
pub mod fatal;
pub mod guard;
pub mod lock_table;
pub mod order;
pub mod rwlock;
pub mod timing;

pub use backend::LockBackend;
pub use calibration::CalibrationReport;
pub use deadlock::{AccessMode, DeadlockTracker};
pub use diagnostics::Diagnostics;
pub use error::{AppResult, BackendError, LockError, RuleError};
pub use fatal::FatalPolicy;
pub use guard::{CallSite, ReadGuard, WriteGuard};
pub use lock_table::{LockOp, LockState, ThreadLockState};
pub use order::{OrderViolation, RuleInfo, MAX_ORDER_RULES, MAX_RULE_LEN};
pub use rwlock::{LockId, RwLock};
pub use timing::{LatencyRecorder, TimingStats, WaitStats};
