//! Lock-order verification.
//!
//! A rule is a named, ordered list of locks. Every lock in a rule gets a rank
//! (its position), published to the lock through a shared [`Participation`]
//! word so the hot path never touches the registry. Each thread keeps one
//! 64-bit mask per rule slot; acquiring a lock whose rank is at or below a bit
//! already set in that mask is a violation.
//!
//! Violations are reported and recorded, never enforced.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::RuleError;
use crate::core::rwlock::LockId;
use crate::util::{capture_stacktrace, now_ms, thread_label};

/// Maximum number of concurrently registered rules.
pub const MAX_ORDER_RULES: usize = 4;
/// Maximum number of locks in one rule; bit 63 of the mask stays unused.
pub const MAX_RULE_LEN: usize = 63;

const PRESENT: u32 = 0x80;
const RANK_MASK: u32 = 0x7f;

/// Rule slots and ranks of one lock, packed one byte per slot.
#[derive(Debug, Default)]
pub struct Participation(AtomicU32);

impl Participation {
    /// Participation in no rule.
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    fn publish(&self, word: u32) {
        self.0.store(word, Ordering::Release);
    }

    /// Whether the lock belongs to no rule.
    pub fn is_empty(&self) -> bool {
        self.load() == 0
    }

    /// `(slot, rank)` pairs, in slot order.
    pub fn entries(&self) -> Vec<(usize, u32)> {
        entries(self.load()).collect()
    }
}

fn entries(word: u32) -> impl Iterator<Item = (usize, u32)> {
    (0..MAX_ORDER_RULES).filter_map(move |slot| {
        let byte = (word >> (slot * 8)) & 0xff;
        (byte & PRESENT != 0).then_some((slot, byte & RANK_MASK))
    })
}

/// A lock as passed to [`OrderVerifier::add_rule`].
#[derive(Debug, Clone, Copy)]
pub struct RuleMember<'a> {
    /// Lock identity.
    pub id: LockId,
    /// Lock name for diagnostics.
    pub name: &'a str,
    /// The lock's participation word.
    pub participation: &'a Arc<Participation>,
}

/// A registered rule, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    /// Rule name.
    pub name: String,
    /// Slot in the thread-local mask array.
    pub slot: usize,
    /// Lock names in their required order.
    pub locks: Vec<String>,
}

/// One detected order violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderViolation {
    /// Rule that was violated.
    pub rule: String,
    /// Lock being acquired.
    pub lock: String,
    /// Required acquisition order.
    pub expected_order: Vec<String>,
    /// For each lock in `expected_order`, whether the thread held it before this acquisition.
    pub held: Vec<bool>,
    /// Raw thread mask before this acquisition.
    pub mask: u64,
    /// Offending thread.
    pub thread: String,
    /// Wall-clock time of detection, ms since the Unix epoch.
    pub at_ms: u128,
    /// Stack of the offending acquisition.
    pub backtrace: String,
}

#[derive(Debug)]
struct Rule {
    name: String,
    order: Vec<LockId>,
}

#[derive(Debug)]
struct Member {
    name: String,
    participation: Arc<Participation>,
}

#[derive(Debug, Default)]
struct Registry {
    rules: [Option<Rule>; MAX_ORDER_RULES],
    members: HashMap<LockId, Member>,
}

impl Registry {
    fn slot_of(&self, name: &str) -> Option<usize> {
        self.rules
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.name == name))
    }

    /// Recompute every member's participation word and drop members no rule references.
    fn republish(&mut self) {
        let mut words: HashMap<LockId, u32> = HashMap::new();
        for (slot, rule) in self.rules.iter().enumerate() {
            let Some(rule) = rule else { continue };
            for (rank, id) in rule.order.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let byte = PRESENT | (rank as u32 & RANK_MASK);
                *words.entry(*id).or_insert(0) |= byte << (slot * 8);
            }
        }
        self.members.retain(|id, member| {
            let word = words.get(id).copied().unwrap_or(0);
            member.participation.publish(word);
            word != 0
        });
    }

    fn info(&self, slot: usize) -> Option<RuleInfo> {
        let rule = self.rules.get(slot)?.as_ref()?;
        Some(RuleInfo {
            name: rule.name.clone(),
            slot,
            locks: rule
                .order
                .iter()
                .map(|id| self.members.get(id).map_or_else(|| id.to_string(), |m| m.name.clone()))
                .collect(),
        })
    }
}

struct ThreadMasks {
    verifier: u64,
    alive: Weak<()>,
    reset: Arc<AtomicBool>,
    masks: [u64; MAX_ORDER_RULES],
}

thread_local! {
    static THREAD_MASKS: RefCell<Vec<ThreadMasks>> = const { RefCell::new(Vec::new()) };
}

static NEXT_VERIFIER_ID: AtomicU64 = AtomicU64::new(1);

/// Registry of ordering rules plus the per-thread masks checked against them.
pub struct OrderVerifier {
    id: u64,
    alive: Arc<()>,
    enabled: AtomicBool,
    registry: RwLock<Registry>,
    mutation: Mutex<()>,
    reset_flags: Mutex<Vec<Weak<AtomicBool>>>,
    quiesce: Duration,
    violations: Mutex<VecDeque<OrderViolation>>,
    max_violations: usize,
    violation_count: AtomicU64,
}

impl OrderVerifier {
    /// Create a verifier.
    ///
    /// `quiesce` is how long registry mutations wait for in-flight checks
    /// after switching checking off; at most `max_violations` records are kept.
    pub fn new(enabled: bool, quiesce: Duration, max_violations: usize) -> Self {
        Self {
            id: NEXT_VERIFIER_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            enabled: AtomicBool::new(enabled),
            registry: RwLock::new(Registry::default()),
            mutation: Mutex::new(()),
            reset_flags: Mutex::new(Vec::new()),
            quiesce,
            violations: Mutex::new(VecDeque::with_capacity(max_violations.min(64))),
            max_violations: max_violations.max(1),
            violation_count: AtomicU64::new(0),
        }
    }

    /// Whether order checking is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Switch order checking on or off.
    ///
    /// Switching on makes every thread drop its cached masks, since unlocks
    /// are not tracked while checking is off.
    pub fn set_enabled(&self, on: bool) {
        let _serial = self.mutation.lock();
        let was = self.enabled.swap(on, Ordering::AcqRel);
        if on && !was {
            self.mark_threads_for_reset();
        }
    }

    /// Register `name` with `locks` in their only permitted order.
    ///
    /// A rule with the same name is replaced in place.
    pub fn add_rule(&self, name: &str, locks: &[RuleMember<'_>]) -> Result<(), RuleError> {
        if locks.is_empty() {
            return Err(RuleError::EmptyRule { rule: name.to_owned() });
        }
        if locks.len() > MAX_RULE_LEN {
            return Err(RuleError::RuleTooLong {
                rule: name.to_owned(),
                len: locks.len(),
                max: MAX_RULE_LEN,
            });
        }
        for (i, member) in locks.iter().enumerate() {
            if locks[..i].iter().any(|m| m.id == member.id) {
                return Err(RuleError::DuplicateLock {
                    rule: name.to_owned(),
                    lock: member.name.to_owned(),
                });
            }
        }

        self.mutate(|registry| {
            let slot = match registry.slot_of(name) {
                Some(slot) => slot,
                None => registry
                    .rules
                    .iter()
                    .position(Option::is_none)
                    .ok_or(RuleError::TooManyRules { max: MAX_ORDER_RULES })?,
            };
            for member in locks {
                registry.members.entry(member.id).or_insert_with(|| Member {
                    name: member.name.to_owned(),
                    participation: Arc::clone(member.participation),
                });
            }
            registry.rules[slot] = Some(Rule {
                name: name.to_owned(),
                order: locks.iter().map(|m| m.id).collect(),
            });
            debug!(rule = name, slot, locks = locks.len(), "order rule registered");
            Ok(())
        })
    }

    /// Remove the rule called `name`. Returns whether it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        if self.registry.read().slot_of(name).is_none() {
            return false;
        }
        self.mutate(|registry| {
            let Some(slot) = registry.slot_of(name) else {
                return false;
            };
            registry.rules[slot] = None;
            debug!(rule = name, "order rule removed");
            true
        })
    }

    /// Remove every rule.
    pub fn reset(&self) {
        self.mutate(|registry| {
            registry.rules = Default::default();
            debug!("order rules reset");
        });
    }

    /// Take `id` out of every rule; rules left empty are removed.
    pub fn forget_lock(&self, id: LockId) {
        if !self.registry.read().members.contains_key(&id) {
            return;
        }
        self.mutate(|registry| {
            for rule in &mut registry.rules {
                let emptied = rule.as_mut().is_some_and(|r| {
                    r.order.retain(|member| *member != id);
                    r.order.is_empty()
                });
                if emptied {
                    if let Some(r) = rule.take() {
                        debug!(rule = %r.name, "order rule removed with its last lock");
                    }
                }
            }
        });
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut Registry) -> R) -> R {
        let _serial = self.mutation.lock();
        let was_enabled = self.enabled.swap(false, Ordering::AcqRel);
        if was_enabled && !self.quiesce.is_zero() {
            thread::sleep(self.quiesce);
        }
        let out = {
            let mut registry = self.registry.write();
            let out = apply(&mut registry);
            registry.republish();
            out
        };
        self.mark_threads_for_reset();
        self.enabled.store(was_enabled, Ordering::Release);
        out
    }

    fn mark_threads_for_reset(&self) {
        self.reset_flags.lock().retain(|flag| {
            flag.upgrade().is_some_and(|flag| {
                flag.store(true, Ordering::Release);
                true
            })
        });
    }

    /// The rule called `name`, if registered.
    pub fn rule(&self, name: &str) -> Option<RuleInfo> {
        let registry = self.registry.read();
        registry.slot_of(name).and_then(|slot| registry.info(slot))
    }

    /// All registered rules, in slot order.
    pub fn rules(&self) -> Vec<RuleInfo> {
        let registry = self.registry.read();
        (0..MAX_ORDER_RULES).filter_map(|slot| registry.info(slot)).collect()
    }

    fn with_masks<R>(&self, f: impl FnOnce(&mut [u64; MAX_ORDER_RULES]) -> R) -> Option<R> {
        THREAD_MASKS
            .try_with(|cell| {
                let mut all = cell.borrow_mut();
                let index = match all.iter().position(|m| m.verifier == self.id) {
                    Some(index) => index,
                    None => {
                        all.retain(|m| m.alive.strong_count() > 0);
                        let reset = Arc::new(AtomicBool::new(false));
                        self.reset_flags.lock().push(Arc::downgrade(&reset));
                        all.push(ThreadMasks {
                            verifier: self.id,
                            alive: Arc::downgrade(&self.alive),
                            reset,
                            masks: [0; MAX_ORDER_RULES],
                        });
                        all.len() - 1
                    }
                };
                let entry = &mut all[index];
                if entry.reset.swap(false, Ordering::AcqRel) {
                    entry.masks = [0; MAX_ORDER_RULES];
                }
                f(&mut entry.masks)
            })
            .ok()
    }

    /// Check an acquisition of `lock` against every rule it belongs to, then
    /// mark it held. Returns the number of violations found.
    pub fn check_lock(&self, lock: &str, participation: &Participation) -> usize {
        let word = participation.load();
        if word == 0 {
            return 0;
        }
        let found = self
            .with_masks(|masks| {
                let mut found: Vec<(usize, u64)> = Vec::new();
                for (slot, rank) in entries(word) {
                    if masks[slot] >> rank != 0 {
                        found.push((slot, masks[slot]));
                    }
                    masks[slot] |= 1 << rank;
                }
                found
            })
            .unwrap_or_default();
        for &(slot, mask) in &found {
            self.report(lock, slot, mask);
        }
        found.len()
    }

    /// Clear the held bit of `lock` in every rule it belongs to.
    pub fn check_unlock(&self, participation: &Participation) {
        let word = participation.load();
        if word == 0 {
            return;
        }
        self.with_masks(|masks| {
            for (slot, rank) in entries(word) {
                masks[slot] &= !(1 << rank);
            }
        });
    }

    fn report(&self, lock: &str, slot: usize, mask: u64) {
        let Some(rule) = self.registry.read().info(slot) else {
            return;
        };
        let held: Vec<bool> = (0..rule.locks.len()).map(|k| mask & (1 << k) != 0).collect();
        let violation = OrderViolation {
            rule: rule.name,
            lock: lock.to_owned(),
            expected_order: rule.locks,
            held,
            mask,
            thread: thread_label(),
            at_ms: now_ms(),
            backtrace: capture_stacktrace(),
        };
        warn!(
            rule = %violation.rule,
            lock = %violation.lock,
            thread = %violation.thread,
            expected_order = ?violation.expected_order,
            held = ?violation.held,
            "lock order violation\n{}",
            violation.backtrace
        );
        self.violation_count.fetch_add(1, Ordering::Relaxed);
        let mut records = self.violations.lock();
        if records.len() >= self.max_violations {
            records.pop_front();
        }
        records.push_back(violation);
    }

    /// Total violations detected so far.
    pub fn violation_count(&self) -> u64 {
        self.violation_count.load(Ordering::Relaxed)
    }

    /// Most recent violations, oldest first.
    pub fn violations(&self) -> Vec<OrderViolation> {
        self.violations.lock().iter().cloned().collect()
    }

    /// Drop stored violation records; the counter is kept.
    pub fn clear_violations(&self) {
        self.violations.lock().clear();
    }
}

impl std::fmt::Debug for OrderVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderVerifier")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("rules", &self.rules())
            .field("violation_count", &self.violation_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        id: LockId,
        name: String,
        participation: Arc<Participation>,
    }

    impl Fake {
        fn new(name: &str) -> Self {
            Self {
                id: LockId::next(),
                name: name.to_owned(),
                participation: Arc::new(Participation::new()),
            }
        }

        fn member(&self) -> RuleMember<'_> {
            RuleMember {
                id: self.id,
                name: &self.name,
                participation: &self.participation,
            }
        }
    }

    fn verifier() -> OrderVerifier {
        OrderVerifier::new(true, Duration::ZERO, 8)
    }

    #[test]
    fn test_ranks_published_to_members() {
        let v = verifier();
        let (a, b) = (Fake::new("a"), Fake::new("b"));
        v.add_rule("r", &[a.member(), b.member()]).unwrap();
        assert_eq!(a.participation.entries(), vec![(0, 0)]);
        assert_eq!(b.participation.entries(), vec![(0, 1)]);
        assert_eq!(v.rule("r").unwrap().locks, vec!["a", "b"]);
    }

    #[test]
    fn test_wrong_order_reported_once() {
        let v = verifier();
        let (a, b) = (Fake::new("a"), Fake::new("b"));
        v.add_rule("r", &[a.member(), b.member()]).unwrap();

        assert_eq!(v.check_lock("a", &a.participation), 0);
        assert_eq!(v.check_lock("b", &b.participation), 0);
        v.check_unlock(&b.participation);
        v.check_unlock(&a.participation);
        assert_eq!(v.violation_count(), 0);

        assert_eq!(v.check_lock("b", &b.participation), 0);
        assert_eq!(v.check_lock("a", &a.participation), 1);
        v.check_unlock(&a.participation);
        v.check_unlock(&b.participation);

        let records = v.violations();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rule, "r");
        assert_eq!(records[0].lock, "a");
        assert_eq!(records[0].held, vec![false, true]);
    }

    #[test]
    fn test_capacity_limits() {
        let v = verifier();
        let locks: Vec<Fake> = (0..64).map(|i| Fake::new(&format!("l{i}"))).collect();
        let members: Vec<RuleMember<'_>> = locks.iter().map(Fake::member).collect();
        assert!(matches!(
            v.add_rule("long", &members),
            Err(RuleError::RuleTooLong { len: 64, .. })
        ));
        v.add_rule("max", &members[..63]).unwrap();
        for i in 0..3 {
            v.add_rule(&format!("r{i}"), &members[..1]).unwrap();
        }
        assert_eq!(
            v.add_rule("overflow", &members[..1]),
            Err(RuleError::TooManyRules { max: MAX_ORDER_RULES })
        );
        assert_eq!(v.rules().len(), MAX_ORDER_RULES);
        assert_eq!(locks[62].participation.entries(), vec![(0, 62)]);
    }

    #[test]
    fn test_duplicate_and_empty_rules_rejected() {
        let v = verifier();
        let a = Fake::new("a");
        assert!(matches!(v.add_rule("e", &[]), Err(RuleError::EmptyRule { .. })));
        assert!(matches!(
            v.add_rule("d", &[a.member(), a.member()]),
            Err(RuleError::DuplicateLock { .. })
        ));
        assert!(v.rules().is_empty());
        assert!(a.participation.is_empty());
    }

    #[test]
    fn test_same_name_replaces_rule() {
        let v = verifier();
        let (a, b) = (Fake::new("a"), Fake::new("b"));
        v.add_rule("r", &[a.member(), b.member()]).unwrap();
        v.add_rule("r", &[b.member(), a.member()]).unwrap();
        assert_eq!(v.rules().len(), 1);
        assert_eq!(b.participation.entries(), vec![(0, 0)]);
    }

    #[test]
    fn test_forget_lock_reranks_and_drops_empty_rules() {
        let v = verifier();
        let (a, b, c) = (Fake::new("a"), Fake::new("b"), Fake::new("c"));
        v.add_rule("abc", &[a.member(), b.member(), c.member()]).unwrap();
        v.add_rule("solo", &[b.member()]).unwrap();

        v.forget_lock(b.id);
        assert!(v.rule("solo").is_none());
        assert_eq!(v.rule("abc").unwrap().locks, vec!["a", "c"]);
        assert_eq!(c.participation.entries(), vec![(0, 1)]);
        assert!(b.participation.is_empty());
    }

    #[test]
    fn test_remove_and_reset_clear_participation() {
        let v = verifier();
        let (a, b) = (Fake::new("a"), Fake::new("b"));
        v.add_rule("r1", &[a.member()]).unwrap();
        v.add_rule("r2", &[a.member(), b.member()]).unwrap();
        assert!(v.remove_rule("r1"));
        assert!(!v.remove_rule("r1"));
        assert_eq!(a.participation.entries(), vec![(1, 0)]);
        v.reset();
        assert!(a.participation.is_empty());
        assert!(b.participation.is_empty());
    }

    #[test]
    fn test_mutation_resets_thread_masks() {
        let v = verifier();
        let (a, b) = (Fake::new("a"), Fake::new("b"));
        v.add_rule("r", &[a.member(), b.member()]).unwrap();
        v.check_lock("b", &b.participation);
        v.add_rule("other", &[a.member()]).unwrap();
        assert_eq!(v.check_lock("a", &a.participation), 0);
    }

    #[test]
    fn test_violation_records_bounded() {
        let v = OrderVerifier::new(true, Duration::ZERO, 2);
        let (a, b) = (Fake::new("a"), Fake::new("b"));
        v.add_rule("r", &[a.member(), b.member()]).unwrap();
        for _ in 0..3 {
            v.check_lock("b", &b.participation);
            v.check_lock("a", &a.participation);
            v.check_unlock(&a.participation);
            v.check_unlock(&b.participation);
        }
        assert_eq!(v.violation_count(), 3);
        assert_eq!(v.violations().len(), 2);
    }
}
