//! Tests for operational snapshots

use std::sync::Arc;

use prometheus_rwlock::admin::{diagnostics_snapshot, lock_snapshot, snapshot_json};
use prometheus_rwlock::config::DiagnosticsConfig;
use prometheus_rwlock::core::{Diagnostics, RwLock};

#[test]
fn test_lock_snapshot_reflects_activity() {
    let diag = Diagnostics::shared(&DiagnosticsConfig {
        quiesce_ms: 0,
        ..DiagnosticsConfig::default()
    });
    let lock = RwLock::builder()
        .name("snap")
        .timing(true)
        .diagnostics(Arc::clone(&diag))
        .build()
        .unwrap();
    {
        let _guard = lock.read().unwrap();
    }
    let snapshot = lock_snapshot(&lock);
    assert_eq!(snapshot.name, "snap");
    assert_eq!(snapshot.read_count, 1);
    assert_eq!(snapshot.stats.read.samples, 1);

    let json = snapshot_json(&snapshot).unwrap();
    assert!(json.contains("\"name\": \"snap\""));
}

#[test]
fn test_diagnostics_snapshot_lists_rules() {
    let diag = Diagnostics::shared(&DiagnosticsConfig {
        quiesce_ms: 0,
        order_check: true,
        ..DiagnosticsConfig::default()
    });
    let a = RwLock::builder().name("a").diagnostics(Arc::clone(&diag)).build().unwrap();
    diag.add_order_rule("only", &[&a]).unwrap();
    let snapshot = diagnostics_snapshot(&diag);
    assert!(snapshot.order_check);
    assert_eq!(snapshot.rules.len(), 1);
    assert_eq!(snapshot.violation_count, 0);
    assert!(snapshot_json(&snapshot).unwrap().contains("\"only\""));
}
