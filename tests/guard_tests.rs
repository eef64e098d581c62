//! Integration tests for scoped guards and the lock-state table.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prometheus_rwlock::call_site;
use prometheus_rwlock::config::DiagnosticsConfig;
use prometheus_rwlock::core::{Diagnostics, LockOp, ReadGuard, RwLock, WriteGuard};

fn diag() -> Arc<Diagnostics> {
    Diagnostics::shared(&DiagnosticsConfig {
        quiesce_ms: 0,
        lock_table: true,
        ..DiagnosticsConfig::default()
    })
}

fn named(diag: &Arc<Diagnostics>, name: &str) -> RwLock {
    RwLock::builder()
        .name(name)
        .diagnostics(Arc::clone(diag))
        .build()
        .unwrap()
}

#[test]
fn test_explicit_release_then_drop_releases_once() {
    let diag = diag();
    let lock = named(&diag, "g");
    let mut guard = WriteGuard::with_call_site(&lock, call_site!()).unwrap();
    guard.release().unwrap();
    assert!(!guard.is_armed());
    drop(guard);
    assert!(lock.try_lock_write(Duration::ZERO).unwrap());
    lock.unlock_write().unwrap();
}

#[test]
fn test_unarmed_guard_grabs_later() {
    let diag = diag();
    let lock = named(&diag, "g");
    let mut guard = ReadGuard::unarmed();
    assert!(guard.lock().is_none());
    guard.grab(&lock).unwrap();
    assert_eq!(guard.lock().map(RwLock::name), Some("g"));
}

#[test]
fn test_hold_warning_threshold() {
    let diag = diag();
    let lock = named(&diag, "slow");
    lock.set_hold_warning(Duration::from_millis(10));
    lock.set_hold_stack_tracing(true);
    {
        let _guard = lock.write().unwrap();
        thread::sleep(Duration::from_millis(30));
    }
    {
        let _guard = lock.read().unwrap();
    }
    assert_eq!(lock.long_holds(), 1);
}

#[test]
fn test_lock_table_reports_waiters_and_holders() {
    let diag = diag();
    let lock = Arc::new(named(&diag, "table"));
    let held = lock.write().unwrap();

    let waiter = {
        let lock = Arc::clone(&lock);
        thread::Builder::new()
            .name("waiter".into())
            .spawn(move || {
                let _guard = lock.read().unwrap();
            })
            .unwrap()
    };
    thread::sleep(Duration::from_millis(50));

    let table = diag.lock_table();
    let ops: Vec<LockOp> = table.iter().map(|t| t.locks[0].op).collect();
    assert_eq!(table.len(), 2);
    assert!(ops.contains(&LockOp::LockWrite));
    assert!(ops.contains(&LockOp::WantLockRead));
    let report = diag.lock_table_report();
    assert!(report.contains("table=LW"));
    assert!(report.contains("waiter"));

    drop(held);
    waiter.join().unwrap();
    assert!(diag.lock_table().is_empty());
}

#[test]
fn test_unnamed_locks_stay_out_of_table() {
    let diag = diag();
    let lock = RwLock::builder().diagnostics(Arc::clone(&diag)).build().unwrap();
    let _guard = lock.read().unwrap();
    assert!(diag.lock_table().is_empty());
}

#[test]
fn test_nested_read_guards_keep_table_entry() {
    let diag = diag();
    let lock = named(&diag, "nested");
    let outer = lock.read().unwrap();
    {
        let _inner = lock.read().unwrap();
    }
    let table = diag.lock_table();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].locks[0].op, LockOp::LockRead);
    drop(outer);
    assert!(diag.lock_table().is_empty());
}
