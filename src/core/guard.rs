//! Scoped read and write guards.
//!
//! A guard borrows one [`RwLock`], acquires it on construction and releases
//! it on drop or on an explicit [`release`](ReadGuard::release). The hold
//! time is measured from the moment the lock is actually held. Guards are
//! tied to the thread that created them.

use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::time::{Instant, SystemTime};

use tracing::warn;

use crate::core::deadlock::AccessMode;
use crate::core::error::LockError;
use crate::core::lock_table::LockOp;
use crate::core::rwlock::RwLock;

/// Where a guard was taken, for hold-time warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Free-form label, usually a function or module path.
    pub label: &'static str,
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
}

impl CallSite {
    /// Call site with an explicit label.
    pub const fn new(label: &'static str, file: &'static str, line: u32) -> Self {
        Self { label, file, line }
    }

    /// Location of the caller, without a label.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new("", location.file(), location.line())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}:{}", self.file, self.line)
        } else {
            write!(f, "{} ({}:{})", self.label, self.file, self.line)
        }
    }
}

/// [`CallSite`] of the invocation, labelled with the module path.
#[macro_export]
macro_rules! call_site {
    () => {
        $crate::core::CallSite::new(module_path!(), file!(), line!())
    };
}

fn record(lock: &RwLock, op: LockOp) {
    if lock.is_named() {
        lock.diagnostics().record_lock_op(lock.id(), lock.name(), op);
    }
}

fn record_release(lock: &RwLock) {
    if lock.is_named() {
        lock.diagnostics().record_lock_release(lock.id());
    }
}

/// Read access to one [`RwLock`] for the guard's lifetime.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: Option<&'a RwLock>,
    site: CallSite,
    acquired: Instant,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    /// Acquire `lock` for reading.
    #[track_caller]
    pub fn new(lock: &'a RwLock) -> Result<Self, LockError> {
        Self::with_call_site(lock, CallSite::caller())
    }

    /// Acquire `lock` for reading, reporting `site` in diagnostics.
    pub fn with_call_site(lock: &'a RwLock, site: CallSite) -> Result<Self, LockError> {
        let mut guard = Self::unarmed();
        guard.grab_at(lock, site)?;
        Ok(guard)
    }

    /// A guard holding nothing, to be armed later with [`grab`](Self::grab).
    pub fn unarmed() -> Self {
        Self {
            lock: None,
            site: CallSite::new("", "", 0),
            acquired: Instant::now(),
            _not_send: PhantomData,
        }
    }

    /// Acquire `lock` through an unarmed guard.
    #[track_caller]
    pub fn grab(&mut self, lock: &'a RwLock) -> Result<(), LockError> {
        self.grab_at(lock, CallSite::caller())
    }

    /// Acquire `lock` through an unarmed guard, reporting `site`.
    pub fn grab_at(&mut self, lock: &'a RwLock, site: CallSite) -> Result<(), LockError> {
        if let Some(held) = self.lock {
            return Err(LockError::GuardAlreadyArmed {
                held: held.name().to_owned(),
            });
        }
        record(lock, LockOp::WantLockRead);
        if let Err(err) = lock.lock_read() {
            record(lock, LockOp::None);
            return Err(err);
        }
        record(lock, LockOp::LockRead);
        self.acquired = Instant::now();
        self.site = site;
        self.lock = Some(lock);
        Ok(())
    }

    /// Release the lock now. Releasing an unarmed guard does nothing.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        record(lock, LockOp::WantUnlockRead);
        let result = lock.release_held(AccessMode::Read);
        record_release(lock);
        lock.check_hold(AccessMode::Read, &self.site, self.acquired.elapsed());
        result
    }

    /// Whether the guard holds a lock.
    pub const fn is_armed(&self) -> bool {
        self.lock.is_some()
    }

    /// The held lock.
    pub const fn lock(&self) -> Option<&'a RwLock> {
        self.lock
    }

    /// Where the lock was taken.
    pub const fn call_site(&self) -> CallSite {
        self.site
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, call_site = %self.site, "read guard release failed");
        }
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("lock", &self.lock.map(RwLock::name))
            .field("site", &self.site)
            .finish()
    }
}

/// Write access to one [`RwLock`] for the guard's lifetime.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: Option<&'a RwLock>,
    site: CallSite,
    acquired: Instant,
    acquired_wall: SystemTime,
    _not_send: PhantomData<*const ()>,
}

impl<'a> WriteGuard<'a> {
    /// Acquire `lock` for writing.
    #[track_caller]
    pub fn new(lock: &'a RwLock) -> Result<Self, LockError> {
        Self::with_call_site(lock, CallSite::caller())
    }

    /// Acquire `lock` for writing, reporting `site` in diagnostics.
    pub fn with_call_site(lock: &'a RwLock, site: CallSite) -> Result<Self, LockError> {
        let mut guard = Self::unarmed();
        guard.grab_at(lock, site)?;
        Ok(guard)
    }

    /// A guard holding nothing.
    pub fn unarmed() -> Self {
        Self {
            lock: None,
            site: CallSite::new("", "", 0),
            acquired: Instant::now(),
            acquired_wall: SystemTime::now(),
            _not_send: PhantomData,
        }
    }

    /// Acquire `lock` through an unarmed guard.
    #[track_caller]
    pub fn grab(&mut self, lock: &'a RwLock) -> Result<(), LockError> {
        self.grab_at(lock, CallSite::caller())
    }

    /// Acquire `lock` through an unarmed guard, reporting `site`.
    pub fn grab_at(&mut self, lock: &'a RwLock, site: CallSite) -> Result<(), LockError> {
        if let Some(held) = self.lock {
            return Err(LockError::GuardAlreadyArmed {
                held: held.name().to_owned(),
            });
        }
        record(lock, LockOp::WantLockWrite);
        if let Err(err) = lock.lock_write() {
            record(lock, LockOp::None);
            return Err(err);
        }
        record(lock, LockOp::LockWrite);
        self.acquired = Instant::now();
        self.acquired_wall = SystemTime::now();
        self.site = site;
        self.lock = Some(lock);
        Ok(())
    }

    /// Release the lock now. Releasing an unarmed guard does nothing.
    pub fn release(&mut self) -> Result<(), LockError> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        record(lock, LockOp::WantUnlockWrite);
        let result = lock.release_held(AccessMode::Write);
        record_release(lock);
        lock.note_write_hold(self.acquired_wall, SystemTime::now());
        lock.check_hold(AccessMode::Write, &self.site, self.acquired.elapsed());
        result
    }

    /// Whether the guard holds a lock.
    pub const fn is_armed(&self) -> bool {
        self.lock.is_some()
    }

    /// The held lock.
    pub const fn lock(&self) -> Option<&'a RwLock> {
        self.lock
    }

    /// Where the lock was taken.
    pub const fn call_site(&self) -> CallSite {
        self.site
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, call_site = %self.site, "write guard release failed");
        }
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("lock", &self.lock.map(RwLock::name))
            .field("site", &self.site)
            .finish()
    }
}
