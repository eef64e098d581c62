//! Integration tests for lock-order rules.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prometheus_rwlock::config::DiagnosticsConfig;
use prometheus_rwlock::core::{Diagnostics, RuleError, RwLock, MAX_ORDER_RULES};

fn diag() -> Arc<Diagnostics> {
    let diag = Diagnostics::shared(&DiagnosticsConfig {
        quiesce_ms: 0,
        ..DiagnosticsConfig::default()
    });
    diag.set_order_check(true);
    diag
}

fn lock(diag: &Arc<Diagnostics>, name: &str) -> RwLock {
    RwLock::builder()
        .name(name)
        .diagnostics(Arc::clone(diag))
        .build()
        .unwrap()
}

#[test]
fn test_rule_order_respected_reports_nothing() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();

    let _ga = a.write().unwrap();
    let _gb = b.read().unwrap();
    assert_eq!(diag.order_violation_count(), 0);
}

#[test]
fn test_reversed_order_reported_exactly_once() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();

    {
        let _gb = b.write().unwrap();
        let _ga = a.write().unwrap();
    }

    assert_eq!(diag.order_violation_count(), 1);
    let violations = diag.order_violations();
    assert_eq!(violations[0].rule, "ab");
    assert_eq!(violations[0].lock, "a");
    assert_eq!(violations[0].expected_order, vec!["a", "b"]);
    assert_eq!(violations[0].held, vec![false, true]);

    {
        let _ga = a.write().unwrap();
        let _gb = b.write().unwrap();
    }
    assert_eq!(diag.order_violation_count(), 1);
}

#[test]
fn test_violation_does_not_block_acquisition() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();
    b.lock_read().unwrap();
    a.lock_read().unwrap();
    assert_eq!(a.read_count(), 1);
    a.unlock_read().unwrap();
    b.unlock_read().unwrap();
}

#[test]
fn test_masks_are_per_thread() {
    let diag = diag();
    let (a, b) = (Arc::new(lock(&diag, "a")), Arc::new(lock(&diag, "b")));
    diag.add_order_rule("ab", &[&*a, &*b]).unwrap();

    b.lock_read().unwrap();
    {
        let a = Arc::clone(&a);
        thread::spawn(move || {
            a.lock_read().unwrap();
            a.unlock_read().unwrap();
        })
        .join()
        .unwrap();
    }
    b.unlock_read().unwrap();
    assert_eq!(diag.order_violation_count(), 0);
}

#[test]
fn test_disabled_checking_reports_nothing() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();
    diag.set_order_check(false);
    {
        let _gb = b.write().unwrap();
        let _ga = a.write().unwrap();
    }
    diag.set_order_check(true);
    {
        let _ga = a.write().unwrap();
        let _gb = b.write().unwrap();
    }
    assert_eq!(diag.order_violation_count(), 0);
}

#[test]
fn test_instance_switch_excludes_lock() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();
    a.set_order_check(false);
    {
        let _gb = b.write().unwrap();
        let _ga = a.write().unwrap();
    }
    assert_eq!(diag.order_violation_count(), 0);
}

#[test]
fn test_dropping_sole_member_removes_rule() {
    let diag = diag();
    {
        let only = lock(&diag, "only");
        diag.add_order_rule("solo", &[&only]).unwrap();
        assert!(diag.order_rule("solo").is_some());
    }
    assert!(diag.order_rule("solo").is_none());
}

#[test]
fn test_dropping_one_member_reranks_the_rest() {
    let diag = diag();
    let a = lock(&diag, "a");
    let c = lock(&diag, "c");
    {
        let b = lock(&diag, "b");
        diag.add_order_rule("abc", &[&a, &b, &c]).unwrap();
        assert_eq!(c.rule_ranks(), vec![(0, 2)]);
    }
    let rule = diag.order_rule("abc").unwrap();
    assert_eq!(rule.locks, vec!["a", "c"]);
    assert_eq!(c.rule_ranks(), vec![(0, 1)]);

    {
        let _gc = c.write().unwrap();
        let _ga = a.write().unwrap();
    }
    assert_eq!(diag.order_violation_count(), 1);
}

#[test]
fn test_registry_capacity_is_an_error_not_a_crash() {
    let diag = diag();
    let a = lock(&diag, "a");
    for i in 0..MAX_ORDER_RULES {
        diag.add_order_rule(&format!("r{i}"), &[&a]).unwrap();
    }
    assert_eq!(
        diag.add_order_rule("extra", &[&a]),
        Err(RuleError::TooManyRules { max: MAX_ORDER_RULES })
    );
    assert_eq!(a.rule_ranks().len(), MAX_ORDER_RULES);
    assert!(diag.remove_order_rule("r0"));
    diag.add_order_rule("extra", &[&a]).unwrap();
}

#[test]
fn test_reset_clears_every_rule() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();
    diag.add_order_rule("ba", &[&b, &a]).unwrap();
    diag.reset_order_rules();
    assert!(diag.order_rules().is_empty());
    assert!(a.rule_ranks().is_empty());
    assert!(diag.order_check_enabled());
}

#[test]
fn test_instance_switch_toggled_while_guard_held() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();

    {
        let _gb = b.write().unwrap();
        b.set_order_check(false);
    }
    b.set_order_check(true);
    assert!(b.try_lock_write(Duration::ZERO).unwrap());
    b.unlock_write().unwrap();

    {
        let _ga = a.write().unwrap();
        let _gb = b.write().unwrap();
    }
    assert_eq!(diag.order_violation_count(), 0);
}

#[test]
fn test_process_wide_switch_toggled_while_guard_held() {
    let diag = diag();
    let (a, b) = (lock(&diag, "a"), lock(&diag, "b"));
    diag.add_order_rule("ab", &[&a, &b]).unwrap();

    {
        let _gb = b.read().unwrap();
        diag.set_order_check(false);
    }
    diag.set_order_check(true);
    assert!(b.try_lock_write(Duration::ZERO).unwrap());
    b.unlock_write().unwrap();

    diag.set_order_check(false);
    {
        let _gb = b.write().unwrap();
        diag.set_order_check(true);
    }
    assert!(b.try_lock_write(Duration::ZERO).unwrap());
    b.unlock_write().unwrap();

    {
        let _ga = a.write().unwrap();
        let _gb = b.write().unwrap();
    }
    assert_eq!(diag.order_violation_count(), 0);
}
