//! Lock backends: the bare reader/writer primitive behind every [`RwLock`].
//!
//! The backend kind is chosen once at construction and never changes. Both
//! implementations are built on `parking_lot` mutex + condvar pairs so that
//! timed acquisition is honored on every platform.
//!
//! [`RwLock`]: crate::core::RwLock

mod native;
mod shared;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::BackendKind;
use crate::core::error::BackendError;

use native::NativeBackend;
use shared::SharedBackend;

enum BackendImpl {
    Native(NativeBackend),
    Shared(SharedBackend),
}

/// Reader/writer primitive with read and write acquisition counters.
pub struct LockBackend {
    imp: BackendImpl,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl LockBackend {
    /// Create a backend of the given kind.
    ///
    /// `prefer_read` only applies to [`BackendKind::Native`]; the shared
    /// backend is always writer-preferring.
    pub fn new(kind: BackendKind, prefer_read: bool) -> Self {
        let imp = match kind {
            BackendKind::Native => BackendImpl::Native(NativeBackend::new(prefer_read)),
            BackendKind::Shared => BackendImpl::Shared(SharedBackend::new()),
        };
        Self {
            imp,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Backend kind.
    pub const fn kind(&self) -> BackendKind {
        match self.imp {
            BackendImpl::Native(_) => BackendKind::Native,
            BackendImpl::Shared(_) => BackendKind::Shared,
        }
    }

    /// Whether readers may overtake a waiting writer.
    pub const fn prefer_read(&self) -> bool {
        match &self.imp {
            BackendImpl::Native(b) => b.prefer_read(),
            BackendImpl::Shared(_) => false,
        }
    }

    /// Block until read access is granted.
    pub fn lock_read(&self) {
        match &self.imp {
            BackendImpl::Native(b) => b.lock_read(),
            BackendImpl::Shared(b) => b.lock_read(),
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Try to get read access within `timeout`.
    pub fn try_lock_read_for(&self, timeout: Duration) -> bool {
        let acquired = match &self.imp {
            BackendImpl::Native(b) => b.try_lock_read_for(timeout),
            BackendImpl::Shared(b) => b.try_lock_read_for(timeout),
        };
        if acquired {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Release read access.
    pub fn unlock_read(&self) -> Result<(), BackendError> {
        match &self.imp {
            BackendImpl::Native(b) => b.unlock_read(),
            BackendImpl::Shared(b) => b.unlock_read(),
        }
    }

    /// Block until write access is granted.
    pub fn lock_write(&self) {
        match &self.imp {
            BackendImpl::Native(b) => b.lock_write(),
            BackendImpl::Shared(b) => b.lock_write(),
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Try to get write access within `timeout`.
    pub fn try_lock_write_for(&self, timeout: Duration) -> bool {
        let acquired = match &self.imp {
            BackendImpl::Native(b) => b.try_lock_write_for(timeout),
            BackendImpl::Shared(b) => b.try_lock_write_for(timeout),
        };
        if acquired {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Release write access.
    pub fn unlock_write(&self) -> Result<(), BackendError> {
        match &self.imp {
            BackendImpl::Native(b) => b.unlock_write(),
            BackendImpl::Shared(b) => b.unlock_write(),
        }
    }

    /// Number of read acquisitions so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of write acquisitions so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockBackend")
            .field("kind", &self.kind())
            .field("prefer_read", &self.prefer_read())
            .field("reads", &self.read_count())
            .field("writes", &self.write_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn both() -> [LockBackend; 2] {
        [
            LockBackend::new(BackendKind::Native, false),
            LockBackend::new(BackendKind::Shared, false),
        ]
    }

    #[test]
    fn test_counters_track_acquisitions() {
        for backend in both() {
            backend.lock_read();
            backend.lock_read();
            backend.unlock_read().unwrap();
            backend.unlock_read().unwrap();
            backend.lock_write();
            backend.unlock_write().unwrap();
            assert_eq!(backend.read_count(), 2);
            assert_eq!(backend.write_count(), 1);
        }
    }

    #[test]
    fn test_unlock_without_lock_is_reported() {
        for backend in both() {
            assert_eq!(backend.unlock_read(), Err(BackendError::NotReadLocked));
            assert_eq!(backend.unlock_write(), Err(BackendError::NotWriteLocked));
        }
    }

    #[test]
    fn test_timed_write_fails_while_read_held() {
        for backend in both() {
            backend.lock_read();
            let start = Instant::now();
            assert!(!backend.try_lock_write_for(Duration::from_millis(30)));
            assert!(start.elapsed() >= Duration::from_millis(30));
            backend.unlock_read().unwrap();
            assert!(backend.try_lock_write_for(Duration::from_millis(30)));
            assert!(!backend.try_lock_read_for(Duration::from_millis(10)));
            backend.unlock_write().unwrap();
        }
    }

    #[test]
    fn test_writer_wakes_after_reader_release() {
        for backend in both() {
            let backend = Arc::new(backend);
            backend.lock_read();
            let writer = {
                let backend = Arc::clone(&backend);
                thread::spawn(move || {
                    backend.lock_write();
                    backend.unlock_write().unwrap();
                })
            };
            thread::sleep(Duration::from_millis(20));
            backend.unlock_read().unwrap();
            writer.join().unwrap();
            assert_eq!(backend.write_count(), 1);
        }
    }

    #[test]
    fn test_prefer_read_only_applies_to_native() {
        assert!(LockBackend::new(BackendKind::Native, true).prefer_read());
        assert!(!LockBackend::new(BackendKind::Shared, true).prefer_read());
    }
}
