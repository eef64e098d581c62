//! Tests for lock builders

use std::sync::Arc;
use std::time::Duration;

use prometheus_rwlock::builders::{build_lock_set, RwLockBuilder};
use prometheus_rwlock::config::{DiagnosticsConfig, LockConfig, LockSetConfig};
use prometheus_rwlock::core::Diagnostics;

fn diag() -> Arc<Diagnostics> {
    Diagnostics::shared(&DiagnosticsConfig {
        quiesce_ms: 0,
        ..DiagnosticsConfig::default()
    })
}

#[test]
fn test_builder_from_config_keeps_values() {
    let cfg = LockConfig {
        hold_warning_ms: 42,
        deadlock_check: true,
        ..LockConfig::default()
    };
    let lock = RwLockBuilder::from_config(cfg)
        .write_retry_pause(Duration::from_millis(7))
        .diagnostics(diag())
        .build()
        .unwrap();
    assert_eq!(lock.hold_warning(), Duration::from_millis(42));
    assert_eq!(lock.write_retry_pause(), Duration::from_millis(7));
    assert!(lock.deadlock_check());
}

#[test]
fn test_build_lock_set_registers_rules() {
    let diag = diag();
    let cfg = LockSetConfig::from_json_str(
        r#"{
            "locks": {"accounts": {}, "ledger": {"backend": "native"}},
            "rules": {"transfer": ["accounts", "ledger"]}
        }"#,
    )
    .unwrap();
    let set = build_lock_set(&cfg, &diag).unwrap();
    assert_eq!(set.len(), 2);
    assert_eq!(set.names(), vec!["accounts", "ledger"]);
    assert_eq!(set.get("ledger").unwrap().rule_ranks(), vec![(0, 1)]);
    assert_eq!(diag.order_rule("transfer").unwrap().locks, vec!["accounts", "ledger"]);
}

#[test]
fn test_build_lock_set_reports_invalid_config() {
    let cfg = LockSetConfig::default();
    let err = build_lock_set(&cfg, &diag()).unwrap_err();
    assert!(err.to_string().contains("lock set config invalid"));
}
