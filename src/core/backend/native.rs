//! Reader/writer lock with a configurable reader-preference policy.
//!
//! Mirrors the semantics of a pthread rwlock: with `prefer_read` readers are
//! admitted whenever no writer holds the lock (and may therefore re-enter);
//! without it a waiting writer closes the door to new readers.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::error::BackendError;

#[derive(Debug, Default)]
struct State {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

impl State {
    const fn can_read(&self, prefer_read: bool) -> bool {
        !self.writer && (prefer_read || self.waiting_writers == 0)
    }

    const fn can_write(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

pub(super) struct NativeBackend {
    state: Mutex<State>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    prefer_read: bool,
}

impl NativeBackend {
    pub(super) fn new(prefer_read: bool) -> Self {
        Self {
            state: Mutex::new(State::default()),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            prefer_read,
        }
    }

    pub(super) const fn prefer_read(&self) -> bool {
        self.prefer_read
    }

    pub(super) fn lock_read(&self) {
        let mut state = self.state.lock();
        while !state.can_read(self.prefer_read) {
            self.readers_cv.wait(&mut state);
        }
        state.readers += 1;
    }

    pub(super) fn try_lock_read_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.can_read(self.prefer_read) {
            if self.readers_cv.wait_until(&mut state, deadline).timed_out() {
                if !state.can_read(self.prefer_read) {
                    return false;
                }
                break;
            }
        }
        state.readers += 1;
        true
    }

    pub(super) fn unlock_read(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.readers == 0 {
            return Err(BackendError::NotReadLocked);
        }
        state.readers -= 1;
        if state.readers == 0 && state.waiting_writers > 0 {
            self.writers_cv.notify_one();
        }
        Ok(())
    }

    pub(super) fn lock_write(&self) {
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while !state.can_write() {
            self.writers_cv.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = true;
    }

    pub(super) fn try_lock_write_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while !state.can_write() {
            if self.writers_cv.wait_until(&mut state, deadline).timed_out() && !state.can_write() {
                state.waiting_writers -= 1;
                if state.waiting_writers == 0 {
                    self.readers_cv.notify_all();
                } else if state.can_write() {
                    self.writers_cv.notify_one();
                }
                return false;
            }
        }
        state.waiting_writers -= 1;
        state.writer = true;
        true
    }

    pub(super) fn unlock_write(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.writer {
            return Err(BackendError::NotWriteLocked);
        }
        state.writer = false;
        if state.waiting_writers > 0 && !self.prefer_read {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
            if state.waiting_writers > 0 {
                self.writers_cv.notify_one();
            }
        }
        Ok(())
    }
}
