//! Shared/exclusive timed mutex.
//!
//! Two-gate design: a writer first claims the outer gate (blocking new
//! readers), then waits on the inner gate until the readers drain. Writers
//! always win over new readers; there is no reader-preference knob.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::error::BackendError;

#[derive(Debug, Default)]
struct State {
    write_entered: bool,
    writer_active: bool,
    readers: usize,
}

pub(super) struct SharedBackend {
    state: Mutex<State>,
    gate1: Condvar,
    gate2: Condvar,
}

impl SharedBackend {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            gate1: Condvar::new(),
            gate2: Condvar::new(),
        }
    }

    pub(super) fn lock_read(&self) {
        let mut state = self.state.lock();
        while state.write_entered {
            self.gate1.wait(&mut state);
        }
        state.readers += 1;
    }

    pub(super) fn try_lock_read_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.write_entered {
            if self.gate1.wait_until(&mut state, deadline).timed_out() && state.write_entered {
                return false;
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
        if state.write_entered {
            if state.readers == 0 {
                self.gate2.notify_one();
            }
        } else {
            self.gate1.notify_one();
        }
        Ok(())
    }

    pub(super) fn lock_write(&self) {
        let mut state = self.state.lock();
        while state.write_entered {
            self.gate1.wait(&mut state);
        }
        state.write_entered = true;
        while state.readers > 0 {
            self.gate2.wait(&mut state);
        }
        state.writer_active = true;
    }

    pub(super) fn try_lock_write_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.write_entered {
            if self.gate1.wait_until(&mut state, deadline).timed_out() && state.write_entered {
                return false;
            }
        }
        state.write_entered = true;
        while state.readers > 0 {
            if self.gate2.wait_until(&mut state, deadline).timed_out() && state.readers > 0 {
                state.write_entered = false;
                self.gate1.notify_all();
                return false;
            }
        }
        state.writer_active = true;
        true
    }

    pub(super) fn unlock_write(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.writer_active {
            return Err(BackendError::NotWriteLocked);
        }
        state.writer_active = false;
        state.write_entered = false;
        self.gate1.notify_all();
        Ok(())
    }
}
