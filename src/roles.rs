//! Role-inheritance graph with transitive reachability.
//!
//! Each `g` section owns one [`RoleManager`]: a directed multigraph over
//! (name, domain) nodes. `has_link(a, b)` asks whether `a` inherits `b`
//! through any directed path. The graph may contain cycles; traversal
//! carries a visited set. `has_link(a, a)` is true only when the graph
//! contains a cycle through `a` — the matcher-level `g(...)` function is the
//! place where name identity short-circuits (see [`role_link_function`]).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::errors::EngineError;
use crate::expr::{ExprFunction, Value};
use crate::store::{RuleEvent, RuleStore};

/// Binary predicate comparing a query name against a stored name.
/// String equality when unset; custom predicates opt in to the slow
/// edge-scan traversal.
pub type MatchingFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// name -> set of direct successors, per domain
type EdgeMap = HashMap<String, HashMap<String, HashSet<String>>>;

#[derive(Default)]
struct RoleGraph {
    forward: EdgeMap,
    backward: EdgeMap,
}

impl RoleGraph {
    fn insert(edges: &mut EdgeMap, domain: &str, from: &str, to: &str) -> bool {
        edges
            .entry(domain.to_string())
            .or_default()
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string())
    }

    fn remove(edges: &mut EdgeMap, domain: &str, from: &str, to: &str) -> bool {
        let Some(nodes) = edges.get_mut(domain) else {
            return false;
        };
        let Some(succs) = nodes.get_mut(from) else {
            return false;
        };
        let removed = succs.remove(to);
        if succs.is_empty() {
            nodes.remove(from);
        }
        if nodes.is_empty() {
            edges.remove(domain);
        }
        removed
    }
}

#[derive(Default)]
pub struct RoleManager {
    graph: RwLock<RoleGraph>,
    role_matcher: RwLock<Option<MatchingFn>>,
    domain_matcher: RwLock<Option<MatchingFn>>,
}

impl RoleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the inheritance edge `a -> b` within `domain`. Idempotent.
    pub fn add_link(&self, a: &str, b: &str, domain: &str) -> bool {
        let mut graph = self.graph.write().unwrap_or_else(|e| e.into_inner());
        let added = RoleGraph::insert(&mut graph.forward, domain, a, b);
        if added {
            RoleGraph::insert(&mut graph.backward, domain, b, a);
        }
        added
    }

    /// Remove the edge `a -> b` within `domain`. Returns `false` if absent.
    pub fn delete_link(&self, a: &str, b: &str, domain: &str) -> bool {
        let mut graph = self.graph.write().unwrap_or_else(|e| e.into_inner());
        let removed = RoleGraph::remove(&mut graph.forward, domain, a, b);
        if removed {
            RoleGraph::remove(&mut graph.backward, domain, b, a);
        }
        removed
    }

    /// True iff a directed path `a ->* b` exists within `domain`.
    pub fn has_link(&self, a: &str, b: &str, domain: &str) -> bool {
        let role_matcher = self
            .role_matcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let domain_matcher = self
            .domain_matcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let graph = self.graph.read().unwrap_or_else(|e| e.into_inner());

        let domains = Self::matching_domains(&graph.forward, domain, domain_matcher.as_ref());
        match role_matcher {
            None => domains
                .iter()
                .any(|d| Self::bfs_exact(&graph.forward, d, a, b)),
            Some(m) => domains
                .iter()
                .any(|d| Self::bfs_matched(&graph.forward, d, a, b, &m)),
        }
    }

    fn matching_domains<'a>(
        edges: &'a EdgeMap,
        domain: &'a str,
        matcher: Option<&MatchingFn>,
    ) -> Vec<&'a str> {
        match matcher {
            None => vec![domain],
            Some(m) => edges
                .keys()
                .filter(|stored| m(domain, stored))
                .map(|s| s.as_str())
                .collect(),
        }
    }

    /// Fast path: successor-set lookups, O(1) per edge.
    fn bfs_exact(edges: &EdgeMap, domain: &str, a: &str, b: &str) -> bool {
        let Some(nodes) = edges.get(domain) else {
            return false;
        };
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(a);
        queue.push_back(a);
        while let Some(current) = queue.pop_front() {
            let Some(succs) = nodes.get(current) else {
                continue;
            };
            for succ in succs {
                if succ == b {
                    return true;
                }
                if visited.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        false
    }

    /// Slow path: a custom matcher forces scanning every edge at each step.
    fn bfs_matched(edges: &EdgeMap, domain: &str, a: &str, b: &str, m: &MatchingFn) -> bool {
        let Some(nodes) = edges.get(domain) else {
            return false;
        };
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        visited.insert(a.to_string());
        queue.push_back(a.to_string());
        while let Some(current) = queue.pop_front() {
            for (from, succs) in nodes {
                if from != &current && !m(&current, from) {
                    continue;
                }
                for succ in succs {
                    if succ == b || m(b, succ) {
                        return true;
                    }
                    if visited.insert(succ.clone()) {
                        queue.push_back(succ.clone());
                    }
                }
            }
        }
        false
    }

    /// Direct successors of `a` within `domain` (not transitive).
    pub fn get_roles(&self, a: &str, domain: &str) -> Vec<String> {
        self.direct(a, domain, false)
    }

    /// Direct predecessors of `b` within `domain` (not transitive).
    pub fn get_users(&self, b: &str, domain: &str) -> Vec<String> {
        self.direct(b, domain, true)
    }

    fn direct(&self, name: &str, domain: &str, reverse: bool) -> Vec<String> {
        let role_matcher = self
            .role_matcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let domain_matcher = self
            .domain_matcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let graph = self.graph.read().unwrap_or_else(|e| e.into_inner());
        let edges = if reverse {
            &graph.backward
        } else {
            &graph.forward
        };

        let mut out: HashSet<String> = HashSet::new();
        for domain_key in Self::matching_domains(edges, domain, domain_matcher.as_ref()) {
            let Some(nodes) = edges.get(domain_key) else {
                continue;
            };
            match &role_matcher {
                None => {
                    if let Some(succs) = nodes.get(name) {
                        out.extend(succs.iter().cloned());
                    }
                }
                Some(m) => {
                    for (from, succs) in nodes {
                        if from == name || m(name, from) {
                            out.extend(succs.iter().cloned());
                        }
                    }
                }
            }
        }
        let mut out: Vec<String> = out.into_iter().collect();
        out.sort();
        out
    }

    pub fn set_matcher(&self, f: MatchingFn) {
        let mut m = self.role_matcher.write().unwrap_or_else(|e| e.into_inner());
        *m = Some(f);
    }

    pub fn set_domain_matcher(&self, f: MatchingFn) {
        let mut m = self
            .domain_matcher
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *m = Some(f);
    }

    /// Enumerate all edges as `(from, to, domain)`; `f` returning `false`
    /// stops the iteration.
    pub fn range(&self, mut f: impl FnMut(&str, &str, &str) -> bool) {
        let graph = self.graph.read().unwrap_or_else(|e| e.into_inner());
        for (domain, nodes) in &graph.forward {
            for (from, succs) in nodes {
                for to in succs {
                    if !f(from, to, domain) {
                        return;
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        let mut graph = self.graph.write().unwrap_or_else(|e| e.into_inner());
        graph.forward.clear();
        graph.backward.clear();
    }

    /// Mirror a `g`-section store into this graph. Registered once at
    /// section creation; the subscription dies with the manager.
    pub fn subscribe_to(self: &Arc<Self>, store: &RuleStore) {
        let weak = Arc::downgrade(self);
        store.subscribe(Box::new(move |event| {
            let Some(rm) = weak.upgrade() else {
                return false;
            };
            match event {
                RuleEvent::Added(rule) => rm.apply_rule(rule, true),
                RuleEvent::Removed(rule) => rm.apply_rule(rule, false),
                RuleEvent::Cleared => rm.clear(),
            }
            true
        }));
    }

    fn apply_rule(&self, rule: &[String], add: bool) {
        let (Some(a), Some(b)) = (rule.first(), rule.get(1)) else {
            return;
        };
        let domain = rule.get(2).map(|s| s.as_str()).unwrap_or("");
        if add {
            self.add_link(a, b, domain);
        } else {
            self.delete_link(a, b, domain);
        }
    }
}

impl std::fmt::Debug for RoleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut edges = 0;
        self.range(|_, _, _| {
            edges += 1;
            true
        });
        f.debug_struct("RoleManager").field("edges", &edges).finish()
    }
}

/// The `g(...)` matcher function for one role section: two arguments query
/// the default domain, three arguments the named one. Identical names link
/// without consulting the graph.
pub fn role_link_function(rm: Arc<RoleManager>) -> ExprFunction {
    Arc::new(move |args: &[Value]| {
        let as_name = |v: &Value| -> Result<String, EngineError> {
            match v {
                Value::Str(s) => Ok(s.clone()),
                other => Err(EngineError::ExprType(format!(
                    "g() expects string arguments, got {other:?}"
                ))),
            }
        };
        let linked = match args {
            [a, b] => {
                let (a, b) = (as_name(a)?, as_name(b)?);
                a == b || rm.has_link(&a, &b, "")
            }
            [a, b, d] => {
                let (a, b, d) = (as_name(a)?, as_name(b)?, as_name(d)?);
                a == b || rm.has_link(&a, &b, &d)
            }
            _ => {
                return Err(EngineError::ExprType(format!(
                    "g() expects 2 or 3 arguments, got {}",
                    args.len()
                )))
            }
        };
        Ok(Value::Bool(linked))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_link_idempotent() {
        let rm = RoleManager::new();
        assert!(rm.add_link("alice", "admin", ""));
        assert!(!rm.add_link("alice", "admin", ""));
        assert!(rm.delete_link("alice", "admin", ""));
        assert!(!rm.delete_link("alice", "admin", ""));
    }

    #[test]
    fn test_has_link_direct_and_transitive() {
        let rm = RoleManager::new();
        rm.add_link("alice", "admin", "");
        rm.add_link("admin", "data_admin", "");
        assert!(rm.has_link("alice", "admin", ""));
        assert!(rm.has_link("alice", "data_admin", ""));
        assert!(rm.has_link("admin", "data_admin", ""));
        assert!(!rm.has_link("data_admin", "alice", ""));
        assert!(!rm.has_link("bob", "admin", ""));
    }

    #[test]
    fn test_has_link_self_requires_cycle() {
        let rm = RoleManager::new();
        rm.add_link("alice", "admin", "");
        assert!(!rm.has_link("alice", "alice", ""));
        rm.add_link("admin", "alice", "");
        assert!(rm.has_link("alice", "alice", ""));
    }

    #[test]
    fn test_has_link_terminates_on_cycle() {
        let rm = RoleManager::new();
        rm.add_link("a", "b", "");
        rm.add_link("b", "c", "");
        rm.add_link("c", "a", "");
        assert!(rm.has_link("a", "c", ""));
        assert!(!rm.has_link("a", "zzz", ""));
    }

    #[test]
    fn test_domains_are_isolated() {
        let rm = RoleManager::new();
        rm.add_link("alice", "admin", "tenantA");
        assert!(rm.has_link("alice", "admin", "tenantA"));
        assert!(!rm.has_link("alice", "admin", "tenantB"));
        assert!(!rm.has_link("alice", "admin", ""));
    }

    #[test]
    fn test_get_roles_and_users_direct_only() {
        let rm = RoleManager::new();
        rm.add_link("alice", "admin", "");
        rm.add_link("admin", "data_admin", "");
        assert_eq!(rm.get_roles("alice", ""), vec!["admin"]);
        assert_eq!(rm.get_users("admin", ""), vec!["alice"]);
        assert!(rm.get_roles("data_admin", "").is_empty());
    }

    #[test]
    fn test_custom_role_matcher() {
        let rm = RoleManager::new();
        rm.add_link("book_*", "readers", "");
        rm.set_matcher(Arc::new(|query: &str, stored: &str| {
            stored.ends_with('*') && query.starts_with(&stored[..stored.len() - 1])
        }));
        assert!(rm.has_link("book_42", "readers", ""));
        assert!(!rm.has_link("pen_1", "readers", ""));
    }

    #[test]
    fn test_custom_domain_matcher() {
        let rm = RoleManager::new();
        rm.add_link("alice", "admin", "tenant_a");
        rm.set_domain_matcher(Arc::new(|query: &str, stored: &str| {
            query == "*" || query == stored
        }));
        assert!(rm.has_link("alice", "admin", "*"));
        assert!(rm.has_link("alice", "admin", "tenant_a"));
        assert!(!rm.has_link("alice", "admin", "tenant_b"));
    }

    #[test]
    fn test_store_subscription_mirrors_rules() {
        let rm = Arc::new(RoleManager::new());
        let store = RuleStore::new();
        rm.subscribe_to(&store);

        store.add_rule(vec!["alice".into(), "admin".into()]);
        assert!(rm.has_link("alice", "admin", ""));

        store.remove_rule(&["alice".to_string(), "admin".to_string()]);
        assert!(!rm.has_link("alice", "admin", ""));

        store.add_rule(vec!["bob".into(), "admin".into(), "tenantA".into()]);
        assert!(rm.has_link("bob", "admin", "tenantA"));
        store.clear();
        assert!(!rm.has_link("bob", "admin", "tenantA"));
    }

    #[test]
    fn test_range_enumerates_edges() {
        let rm = RoleManager::new();
        rm.add_link("alice", "admin", "");
        rm.add_link("bob", "admin", "tenantA");
        let mut edges = Vec::new();
        rm.range(|a, b, d| {
            edges.push((a.to_string(), b.to_string(), d.to_string()));
            true
        });
        edges.sort();
        assert_eq!(
            edges,
            vec![
                ("alice".to_string(), "admin".to_string(), String::new()),
                ("bob".to_string(), "admin".to_string(), "tenantA".to_string()),
            ]
        );
    }

    #[test]
    fn test_role_link_function() {
        let rm = Arc::new(RoleManager::new());
        rm.add_link("alice", "admin", "");
        let g = role_link_function(rm);

        let call = |args: &[Value]| match g(args) {
            Ok(Value::Bool(b)) => b,
            other => panic!("unexpected result {other:?}"),
        };
        assert!(call(&[Value::from("alice"), Value::from("admin")]));
        // identical names link even with an empty graph behind them
        assert!(call(&[Value::from("carol"), Value::from("carol")]));
        assert!(!call(&[Value::from("carol"), Value::from("admin")]));

        let err = g(&[Value::from("a")]).unwrap_err();
        assert!(matches!(err, EngineError::ExprType(_)));
        let err = g(&[Value::Int(1), Value::Int(2)]).unwrap_err();
        assert!(matches!(err, EngineError::ExprType(_)));
    }
}
