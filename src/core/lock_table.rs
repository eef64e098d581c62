//! Per-thread table of which named locks each thread is waiting on or holding.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::rwlock::LockId;
use crate::util::thread_label;

/// State of one lock as seen by one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    /// Not involved.
    #[serde(rename = "N")]
    None,
    /// Waiting for a read lock.
    #[serde(rename = "wLR")]
    WantLockRead,
    /// Releasing a read lock.
    #[serde(rename = "wULR")]
    WantUnlockRead,
    /// Holding a read lock.
    #[serde(rename = "LR")]
    LockRead,
    /// Waiting for the write lock.
    #[serde(rename = "wLW")]
    WantLockWrite,
    /// Releasing the write lock.
    #[serde(rename = "wULW")]
    WantUnlockWrite,
    /// Holding the write lock.
    #[serde(rename = "LW")]
    LockWrite,
}

impl LockOp {
    /// Short code used in reports.
    pub const fn code(self) -> &'static str {
        match self {
            Self::None => "N",
            Self::WantLockRead => "wLR",
            Self::WantUnlockRead => "wULR",
            Self::LockRead => "LR",
            Self::WantLockWrite => "wLW",
            Self::WantUnlockWrite => "wULW",
            Self::LockWrite => "LW",
        }
    }
}

impl fmt::Display for LockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One lock entry of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Lock name.
    pub lock: String,
    /// Current operation.
    pub op: LockOp,
}

/// All entries of one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadLockState {
    /// Thread label.
    pub thread: String,
    /// Locks the thread is involved with, sorted by name.
    pub locks: Vec<LockState>,
}

#[derive(Debug)]
struct Entry {
    state: LockState,
    held: LockOp,
    holds: usize,
}

#[derive(Debug, Default)]
struct ThreadEntry {
    label: String,
    locks: HashMap<LockId, Entry>,
}

/// Lock-state table shared by all threads.
#[derive(Debug, Default)]
pub struct LockTable {
    threads: Mutex<HashMap<ThreadId, ThreadEntry>>,
}

impl LockTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `op` on `lock` for the calling thread.
    ///
    /// Holds nest: [`LockOp::LockRead`] and [`LockOp::LockWrite`] add one,
    /// [`release`](Self::release) drops one. [`LockOp::None`] ends a pending
    /// operation, falling back to the held state or removing the entry when
    /// nothing is held.
    pub fn record(&self, id: LockId, lock: &str, op: LockOp) {
        let me = thread::current().id();
        let mut threads = self.threads.lock();
        if op == LockOp::None {
            if let Some(entry) = threads.get_mut(&me) {
                match entry.locks.get_mut(&id) {
                    Some(state) if state.holds > 0 => state.state.op = state.held,
                    _ => {
                        entry.locks.remove(&id);
                    }
                }
                if entry.locks.is_empty() {
                    threads.remove(&me);
                }
            }
            return;
        }
        let entry = threads.entry(me).or_insert_with(|| ThreadEntry {
            label: thread_label(),
            locks: HashMap::new(),
        });
        let state = entry.locks.entry(id).or_insert_with(|| Entry {
            state: LockState {
                lock: lock.to_owned(),
                op,
            },
            held: LockOp::None,
            holds: 0,
        });
        state.state.op = op;
        if matches!(op, LockOp::LockRead | LockOp::LockWrite) {
            state.held = op;
            state.holds += 1;
        }
    }

    /// Drop one hold of `lock` for the calling thread.
    pub fn release(&self, id: LockId) {
        let me = thread::current().id();
        let mut threads = self.threads.lock();
        let Some(entry) = threads.get_mut(&me) else {
            return;
        };
        if let Some(state) = entry.locks.get_mut(&id) {
            state.holds = state.holds.saturating_sub(1);
            if state.holds == 0 {
                entry.locks.remove(&id);
            } else {
                state.state.op = state.held;
            }
        }
        if entry.locks.is_empty() {
            threads.remove(&me);
        }
    }

    /// Entries of every thread, sorted by thread label then lock name.
    pub fn snapshot(&self) -> Vec<ThreadLockState> {
        let threads = self.threads.lock();
        let sorted: BTreeMap<&str, &ThreadEntry> =
            threads.values().map(|e| (e.label.as_str(), e)).collect();
        sorted
            .into_values()
            .map(|entry| {
                let mut locks: Vec<LockState> =
                    entry.locks.values().map(|e| e.state.clone()).collect();
                locks.sort_by(|a, b| a.lock.cmp(&b.lock));
                ThreadLockState {
                    thread: entry.label.clone(),
                    locks,
                }
            })
            .collect()
    }

    /// Text report, one line per thread.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for thread in self.snapshot() {
            let _ = write!(out, "thread {}:", thread.thread);
            for state in &thread.locks {
                let _ = write!(out, " {}={}", state.lock, state.op);
            }
            out.push('\n');
        }
        out
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.threads.lock().clear();
    }
}
