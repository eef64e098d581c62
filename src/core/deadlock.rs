//! Per-lock bookkeeping of which threads hold read or write access.
//!
//! The tracker lives behind its own `parking_lot` mutex, never the lock it
//! describes, and is consulted before the backend is touched so that illegal
//! recursion is reported instead of deadlocking.
//!
//! Holds taken while checking is off are only counted, per mode. A release
//! the tracker cannot attribute to the calling thread consumes one of those
//! counts before it is reported as an extra unlock, so switching checking on
//! or off while locks are held never refuses a legitimate release.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::core::error::LockError;
use crate::util::thread_label;

/// Access mode of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Shared access.
    Read,
    /// Exclusive access.
    Write,
}

#[derive(Debug, Default)]
struct Holders {
    readers: HashMap<ThreadId, usize>,
    writers: HashSet<ThreadId>,
}

/// Holders of one lock, keyed by thread.
#[derive(Debug, Default)]
pub struct DeadlockTracker {
    holders: Mutex<Holders>,
    active: AtomicBool,
    untracked_reads: AtomicU64,
    untracked_writes: AtomicU64,
}

fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl DeadlockTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the calling thread is about to acquire `mode`.
    ///
    /// On error nothing is recorded.
    pub fn enter(&self, lock: &str, mode: AccessMode, prefer_read: bool) -> Result<(), LockError> {
        self.active.store(true, Ordering::Relaxed);
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        match mode {
            AccessMode::Read => {
                if holders.writers.contains(&me) {
                    return Err(LockError::ReadWhileWriting {
                        lock: lock.to_owned(),
                        thread: thread_label(),
                    });
                }
                if holders.readers.contains_key(&me) && !prefer_read && !holders.writers.is_empty() {
                    return Err(LockError::DoubleReadDuringWrite {
                        lock: lock.to_owned(),
                        thread: thread_label(),
                    });
                }
                *holders.readers.entry(me).or_insert(0) += 1;
            }
            AccessMode::Write => {
                if holders.writers.contains(&me) {
                    return Err(LockError::DoubleWriteLock {
                        lock: lock.to_owned(),
                        thread: thread_label(),
                    });
                }
                if holders.readers.contains_key(&me) {
                    return Err(LockError::WriteWhileReading {
                        lock: lock.to_owned(),
                        thread: thread_label(),
                    });
                }
                holders.writers.insert(me);
            }
        }
        Ok(())
    }

    fn untracked(&self, mode: AccessMode) -> &AtomicU64 {
        match mode {
            AccessMode::Read => &self.untracked_reads,
            AccessMode::Write => &self.untracked_writes,
        }
    }

    /// Count a hold acquired without bookkeeping.
    pub fn enter_untracked(&self, mode: AccessMode) {
        self.untracked(mode).fetch_add(1, Ordering::AcqRel);
    }

    /// Release a hold without consulting the holder sets.
    pub fn exit_untracked(&self, mode: AccessMode) {
        take_one(self.untracked(mode));
    }

    /// Undo an [`enter`](Self::enter) or
    /// [`enter_untracked`](Self::enter_untracked) whose acquisition did not happen.
    pub fn abandon(&self, mode: AccessMode) {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        if !Self::remove_holder(&mut holders, me, mode) {
            take_one(self.untracked(mode));
        }
    }

    /// Record that the calling thread is releasing `mode`.
    ///
    /// Fails only when the thread holds nothing recorded and no untracked
    /// hold is outstanding.
    pub fn exit(&self, lock: &str, mode: AccessMode) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut holders = self.holders.lock();
        if Self::remove_holder(&mut holders, me, mode) || take_one(self.untracked(mode)) {
            return Ok(());
        }
        let (lock, thread) = (lock.to_owned(), thread_label());
        Err(match mode {
            AccessMode::Read => LockError::ExtraReadUnlock { lock, thread },
            AccessMode::Write => LockError::ExtraWriteUnlock { lock, thread },
        })
    }

    fn remove_holder(holders: &mut Holders, me: ThreadId, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => {
                if !holders.readers.contains_key(&me) {
                    return false;
                }
                Self::drop_read(holders, me);
                true
            }
            AccessMode::Write => holders.writers.remove(&me),
        }
    }

    fn drop_read(holders: &mut Holders, me: ThreadId) {
        if let Some(count) = holders.readers.get_mut(&me) {
            *count -= 1;
            if *count == 0 {
                holders.readers.remove(&me);
            }
        }
    }

    /// Whether the tracker has been used since the last [`clear`](Self::clear).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Forget which threads hold the lock. Their holds stay counted as untracked.
    pub fn clear(&self) {
        let mut holders = self.holders.lock();
        let reads: usize = holders.readers.values().sum();
        self.untracked_reads.fetch_add(reads as u64, Ordering::AcqRel);
        self.untracked_writes
            .fetch_add(holders.writers.len() as u64, Ordering::AcqRel);
        holders.readers.clear();
        holders.writers.clear();
        self.active.store(false, Ordering::Relaxed);
    }

    /// Holds currently counted without bookkeeping, as `(reads, writes)`.
    pub fn untracked_holds(&self) -> (u64, u64) {
        (
            self.untracked_reads.load(Ordering::Acquire),
            self.untracked_writes.load(Ordering::Acquire),
        )
    }

    /// Number of threads currently recorded as readers.
    pub fn reader_threads(&self) -> usize {
        self.holders.lock().readers.len()
    }

    /// Number of threads currently recorded as writers.
    pub fn writer_threads(&self) -> usize {
        self.holders.lock().writers.len()
    }
}
