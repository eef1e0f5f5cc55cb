//! Deduplicated rule storage with synchronous change events.
//!
//! Every mutation emits its event on the caller's stack before returning, so
//! subscribers (matcher indexes, role managers, the storage controller) are
//! consistent with the store by the time the mutating call completes.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::defs::Rule;

/// A change observed on a [`RuleStore`]. Rule payloads are borrowed views.
#[derive(Debug, Clone, Copy)]
pub enum RuleEvent<'a> {
    Added(&'a [String]),
    Removed(&'a [String]),
    Cleared,
}

/// A subscriber returns `false` to unsubscribe; the store prunes it on the
/// next emission.
pub type Subscriber = Box<dyn Fn(RuleEvent<'_>) -> bool + Send + Sync>;

#[derive(Default)]
pub struct RuleStore {
    rules: RwLock<HashMap<String, Rule>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable identity of a rule: hex digest of the length-prefixed columns.
    pub fn hash(rule: &[String]) -> String {
        let mut hasher = Sha256::new();
        for col in rule {
            hasher.update((col.len() as u64).to_le_bytes());
            hasher.update(col.as_bytes());
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Insert a rule. Returns `false` without emitting when an identical rule
    /// is already present.
    pub fn add_rule(&self, rule: Rule) -> bool {
        let key = Self::hash(&rule);
        {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            if rules.contains_key(&key) {
                return false;
            }
            rules.insert(key, rule.clone());
        }
        self.emit(RuleEvent::Added(&rule));
        true
    }

    /// Remove a rule. Returns `false` without emitting when absent.
    pub fn remove_rule(&self, rule: &[String]) -> bool {
        let key = Self::hash(rule);
        {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            if rules.remove(&key).is_none() {
                return false;
            }
        }
        self.emit(RuleEvent::Removed(rule));
        true
    }

    pub fn contains(&self, rule: &[String]) -> bool {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules.contains_key(&Self::hash(rule))
    }

    /// Iterate all rules in unspecified order; `f` returning `false` stops
    /// the iteration.
    pub fn range(&self, mut f: impl FnMut(&[String]) -> bool) {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        for rule in rules.values() {
            if !f(rule) {
                break;
            }
        }
    }

    pub fn clear(&self) {
        {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            rules.clear();
        }
        self.emit(RuleEvent::Cleared);
    }

    pub fn len(&self) -> usize {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.push(subscriber);
    }

    fn emit(&self, event: RuleEvent<'_>) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| s(event));
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("rules", &self.len())
            .finish()
    }
}
