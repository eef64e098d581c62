//! Tests for error types

use prometheus_rwlock::core::{BackendError, LockError, RuleError};

#[test]
fn test_double_write_lock_error() {
    let err = LockError::DoubleWriteLock {
        lock: "cache".to_string(),
        thread: "main".to_string(),
    };
    assert_eq!(format!("{}", err), "double write lock on `cache` by thread main");
}

#[test]
fn test_extra_read_unlock_error() {
    let err = LockError::ExtraReadUnlock {
        lock: "cache".to_string(),
        thread: "main".to_string(),
    };
    assert_eq!(format!("{}", err), "extra read unlock on `cache` by thread main");
}

#[test]
fn test_invalid_config_error() {
    let err = LockError::InvalidConfig("bad".to_string());
    assert_eq!(format!("{}", err), "invalid lock configuration: bad");
}

#[test]
fn test_rule_registry_full_error() {
    let err = RuleError::TooManyRules { max: 4 };
    assert_eq!(format!("{}", err), "rule registry full: at most 4 rules");
}

#[test]
fn test_backend_error() {
    assert_eq!(
        format!("{}", BackendError::NotWriteLocked),
        "write unlock on a lock that is not write-locked"
    );
}
