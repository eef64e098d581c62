//! Error types for lock operations and rule registration.

use thiserror::Error;

/// Usage errors surfaced at the call site that made the mistake.
///
/// These never leave the lock in an inconsistent state: the offending
/// acquisition or release is refused before the backend is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// A thread asked for the write lock it already holds (or is waiting on).
    #[error("double write lock on `{lock}` by thread {thread}")]
    DoubleWriteLock {
        /// Diagnostic name of the lock.
        lock: String,
        /// Offending thread.
        thread: String,
    },
    /// A thread re-entered a read lock while a writer is pending on a
    /// writer-preferring lock.
    #[error("double read lock on `{lock}` by thread {thread} while a write lock is pending")]
    DoubleReadDuringWrite {
        /// Diagnostic name of the lock.
        lock: String,
        /// Offending thread.
        thread: String,
    },
    /// A thread holding the write lock asked for a read lock on the same instance.
    #[error("read lock on `{lock}` by thread {thread} which holds the write lock")]
    ReadWhileWriting {
        /// Diagnostic name of the lock.
        lock: String,
        /// Offending thread.
        thread: String,
    },
    /// A thread holding a read lock asked for the write lock on the same instance.
    #[error("write lock on `{lock}` by thread {thread} which holds a read lock")]
    WriteWhileReading {
        /// Diagnostic name of the lock.
        lock: String,
        /// Offending thread.
        thread: String,
    },
    /// Read unlock by a thread that holds no read lock.
    #[error("extra read unlock on `{lock}` by thread {thread}")]
    ExtraReadUnlock {
        /// Diagnostic name of the lock.
        lock: String,
        /// Offending thread.
        thread: String,
    },
    /// Write unlock by a thread that does not hold the write lock.
    #[error("extra write unlock on `{lock}` by thread {thread}")]
    ExtraWriteUnlock {
        /// Diagnostic name of the lock.
        lock: String,
        /// Offending thread.
        thread: String,
    },
    /// A scoped guard was asked to acquire while it already holds a lock.
    #[error("guard already holding lock `{held}`")]
    GuardAlreadyArmed {
        /// Name of the lock the guard currently holds.
        held: String,
    },
    /// Lock configuration failed validation.
    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),
}

/// Reasons an ordering rule registration is refused.
///
/// A refused registration leaves the registry untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// Every rule slot is in use.
    #[error("rule registry full: at most {max} rules")]
    TooManyRules {
        /// Registry capacity.
        max: usize,
    },
    /// The rule lists more locks than fit in the thread-local mask.
    #[error("rule `{rule}` has {len} locks, at most {max} allowed")]
    RuleTooLong {
        /// Rule name.
        rule: String,
        /// Requested length.
        len: usize,
        /// Maximum length.
        max: usize,
    },
    /// The rule lists no locks.
    #[error("rule `{rule}` is empty")]
    EmptyRule {
        /// Rule name.
        rule: String,
    },
    /// The same lock appears twice in one rule.
    #[error("rule `{rule}` lists lock `{lock}` more than once")]
    DuplicateLock {
        /// Rule name.
        rule: String,
        /// Name of the repeated lock.
        lock: String,
    },
    /// A lock bound to another diagnostics service was passed in.
    #[error("rule `{rule}` references lock `{lock}` checked by a different verifier")]
    ForeignLock {
        /// Rule name.
        rule: String,
        /// Name of the foreign lock.
        lock: String,
    },
}

/// Errors reported by a lock backend.
///
/// The lock core treats every one of these as unrecoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Read unlock on a backend with no readers.
    #[error("read unlock on a lock that is not read-locked")]
    NotReadLocked,
    /// Write unlock on a backend with no writer.
    #[error("write unlock on a lock that is not write-locked")]
    NotWriteLocked,
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
