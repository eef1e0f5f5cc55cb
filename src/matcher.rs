//! A matcher binds one compiled expression to one policy section and streams
//! the candidate rules that satisfy it.
//!
//! When the expression constrains policy attributes through top-level
//! equality conjuncts (`p.obj == r.obj`, `p.act == "read"`), those columns
//! become an equality index: candidate rules are looked up by the request's
//! values instead of scanning the whole store. The index subscribes to the
//! store's events and stays consistent with it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::defs::{PolicyDef, RequestDef, Rule};
use crate::errors::EngineError;
use crate::expr::{self, BinOp, CompiledExpr, EvalContext, Expr, FunctionMap, Value};
use crate::store::{RuleEvent, RuleStore};

/// Where an indexed column's lookup value comes from at evaluation time.
#[derive(Debug, Clone)]
enum IndexSource {
    /// A request-side identifier, e.g. `r.obj`.
    Var(String),
    /// A string literal from the matcher expression.
    Literal(String),
}

struct MatcherIndex {
    columns: Vec<(usize, IndexSource)>,
    buckets: RwLock<HashMap<Vec<String>, HashMap<String, Rule>>>,
}

impl MatcherIndex {
    fn new(columns: Vec<(usize, IndexSource)>) -> Self {
        Self {
            columns,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn key_for_rule(&self, rule: &[String]) -> Option<Vec<String>> {
        self.columns
            .iter()
            .map(|(col, _)| rule.get(*col).cloned())
            .collect()
    }

    fn insert(&self, rule: &[String]) {
        let Some(key) = self.key_for_rule(rule) else {
            return;
        };
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(key)
            .or_default()
            .insert(RuleStore::hash(rule), rule.to_vec());
    }

    fn remove(&self, rule: &[String]) {
        let Some(key) = self.key_for_rule(rule) else {
            return;
        };
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get_mut(&key) {
            bucket.remove(&RuleStore::hash(rule));
            if bucket.is_empty() {
                buckets.remove(&key);
            }
        }
    }

    fn clear(&self) {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets.clear();
    }

    /// Candidate rules for one request, or `None` when the index cannot
    /// serve it (a lookup value is not a string).
    fn candidates(&self, env: &HashMap<String, Value>) -> Option<Vec<Rule>> {
        let mut key = Vec::with_capacity(self.columns.len());
        for (_, source) in &self.columns {
            match source {
                IndexSource::Literal(s) => key.push(s.clone()),
                IndexSource::Var(name) => match env.get(name) {
                    Some(Value::Str(s)) => key.push(s.clone()),
                    _ => return None,
                },
            }
        }
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        Some(
            buckets
                .get(&key)
                .map(|bucket| bucket.values().cloned().collect())
                .unwrap_or_default(),
        )
    }
}

pub struct Matcher {
    key: String,
    policy_key: String,
    policy_def: PolicyDef,
    store: Arc<RuleStore>,
    expr: CompiledExpr,
    index: Option<Arc<MatcherIndex>>,
}

impl Matcher {
    /// Compile `source` against the given policy section. With `with_index`
    /// the equality index is extracted, populated from the store, and
    /// subscribed to its events.
    pub fn build(
        key: &str,
        source: &str,
        policy_def: PolicyDef,
        store: Arc<RuleStore>,
        with_index: bool,
    ) -> Result<Self, EngineError> {
        let compiled = expr::compile(source)?;
        let policy_key = policy_def.key.clone();

        let index = if with_index {
            let columns = index_columns(compiled.root(), &policy_key, &policy_def);
            if columns.is_empty() {
                None
            } else {
                let index = Arc::new(MatcherIndex::new(columns));
                store.range(|rule| {
                    index.insert(rule);
                    true
                });
                let weak = Arc::downgrade(&index);
                store.subscribe(Box::new(move |event| {
                    let Some(index) = weak.upgrade() else {
                        return false;
                    };
                    match event {
                        RuleEvent::Added(rule) => index.insert(rule),
                        RuleEvent::Removed(rule) => index.remove(rule),
                        RuleEvent::Cleared => index.clear(),
                    }
                    true
                }));
                Some(index)
            }
        } else {
            None
        };

        Ok(Self {
            key: key.to_string(),
            policy_key,
            policy_def,
            store,
            expr: compiled,
            index,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The policy section this matcher is bound to.
    pub fn get_policy(&self) -> &str {
        &self.policy_key
    }

    pub fn policy_def(&self) -> &PolicyDef {
        &self.policy_def
    }

    pub fn free_vars(&self) -> &std::collections::BTreeSet<String> {
        self.expr.free_vars()
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Stream the rules matching `rvals`, index-filtered where possible.
    /// `f` returning `false` stops the iteration early.
    pub fn range_matches(
        &self,
        rdef: &RequestDef,
        rvals: &[Value],
        funcs: &FunctionMap,
        mut f: impl FnMut(&[String]) -> bool,
    ) -> Result<(), EngineError> {
        if rvals.len() != rdef.args.len() {
            return Err(EngineError::InvalidModel(format!(
                "request has {} values, definition `{}` declares {} attributes",
                rvals.len(),
                rdef.key,
                rdef.args.len()
            )));
        }

        let mut env: HashMap<String, Value> = HashMap::new();
        for (attr, val) in rdef.args.iter().zip(rvals) {
            env.insert(format!("{}.{}", rdef.key, attr), val.clone());
        }

        let candidates = self.index.as_ref().and_then(|index| index.candidates(&env));
        let mut result: Result<(), EngineError> = Ok(());
        match candidates {
            Some(rules) => {
                for rule in &rules {
                    if !self.visit(rule, &mut env, funcs, &mut f, &mut result) {
                        break;
                    }
                }
            }
            None => {
                self.store
                    .range(|rule| self.visit(rule, &mut env, funcs, &mut f, &mut result));
            }
        }
        result
    }

    fn visit(
        &self,
        rule: &[String],
        env: &mut HashMap<String, Value>,
        funcs: &FunctionMap,
        f: &mut impl FnMut(&[String]) -> bool,
        result: &mut Result<(), EngineError>,
    ) -> bool {
        for (i, attr) in self.policy_def.args.iter().enumerate() {
            let val = rule.get(i).cloned().unwrap_or_default();
            env.insert(format!("{}.{}", self.policy_key, attr), Value::Str(val));
        }
        match self.expr.eval_bool(&EvalContext::new(env, funcs)) {
            Ok(true) => f(rule),
            Ok(false) => true,
            Err(err) => {
                *result = Err(err);
                false
            }
        }
    }
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher")
            .field("key", &self.key)
            .field("policy", &self.policy_key)
            .field("indexed", &self.has_index())
            .finish()
    }
}

fn flatten_and<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    if let Expr::BinOp {
        op: BinOp::And,
        left,
        right,
    } = expr
    {
        flatten_and(left, out);
        flatten_and(right, out);
    } else {
        out.push(expr);
    }
}

/// Extract indexable policy columns: top-level conjuncts of the form
/// `p.<attr> == r.<attr>` or `p.<attr> == "literal"` (either operand order).
/// Each such conjunct is a necessary condition on any matching rule, so the
/// index is a sound pre-filter even when other conjuncts reference the same
/// attributes.
fn index_columns(root: &Expr, policy_key: &str, pdef: &PolicyDef) -> Vec<(usize, IndexSource)> {
    let mut atoms = Vec::new();
    flatten_and(root, &mut atoms);

    let mut columns: Vec<(usize, IndexSource)> = Vec::new();
    for atom in atoms {
        let Expr::BinOp {
            op: BinOp::Eq,
            left,
            right,
        } = atom
        else {
            continue;
        };
        for (policy_side, other_side) in [(left, right), (right, left)] {
            let Expr::Path(segments) = policy_side.as_ref() else {
                continue;
            };
            if segments.len() != 2 || segments[0] != policy_key {
                continue;
            }
            let Some(col) = pdef.args.iter().position(|a| *a == segments[1]) else {
                continue;
            };
            if columns.iter().any(|(c, _)| *c == col) {
                break;
            }
            match other_side.as_ref() {
                Expr::Literal(Value::Str(s)) => {
                    columns.push((col, IndexSource::Literal(s.clone())));
                }
                Expr::Path(other) if other.first().map(|s| s != policy_key).unwrap_or(false) => {
                    columns.push((col, IndexSource::Var(other.join("."))));
                }
                _ => {}
            }
            break;
        }
    }
    columns.sort_by_key(|(col, _)| *col);
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl_matcher(with_index: bool) -> (Matcher, Arc<RuleStore>) {
        let pdef = PolicyDef::parse("p", "sub, obj, act");
        let store = Arc::new(RuleStore::new());
        let matcher = Matcher::build(
            "m",
            "r.sub == p.sub && r.obj == p.obj && r.act == p.act",
            pdef,
            store.clone(),
            with_index,
        )
        .unwrap();
        (matcher, store)
    }

    fn add(store: &RuleStore, cols: &[&str]) {
        store.add_rule(cols.iter().map(|s| s.to_string()).collect());
    }

    fn request(vals: &[&str]) -> Vec<Value> {
        vals.iter().map(|v| Value::from(*v)).collect()
    }

    fn collect_matches(matcher: &Matcher, rvals: &[Value]) -> Vec<Rule> {
        let rdef = RequestDef::parse("r", "sub, obj, act");
        let funcs = FunctionMap::new();
        let mut out = Vec::new();
        matcher
            .range_matches(&rdef, rvals, &funcs, |rule| {
                out.push(rule.to_vec());
                true
            })
            .unwrap();
        out.sort();
        out
    }

    #[test]
    fn test_index_built_for_equality_conjunction() {
        let (matcher, _) = acl_matcher(true);
        assert!(matcher.has_index());
        assert_eq!(matcher.get_policy(), "p");
    }

    #[test]
    fn test_no_index_for_disjunction() {
        let pdef = PolicyDef::parse("p", "sub, obj, act");
        let store = Arc::new(RuleStore::new());
        let matcher = Matcher::build(
            "m",
            "r.sub == p.sub || r.obj == p.obj",
            pdef,
            store,
            true,
        )
        .unwrap();
        assert!(!matcher.has_index());
    }

    #[test]
    fn test_partial_index_from_mixed_conjunction() {
        // p.sub is buried in a function call; p.obj and p.act still index
        let pdef = PolicyDef::parse("p", "sub, obj, act");
        let store = Arc::new(RuleStore::new());
        let matcher = Matcher::build(
            "m",
            "g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act",
            pdef,
            store,
            true,
        )
        .unwrap();
        assert!(matcher.has_index());
    }

    #[test]
    fn test_range_matches_with_index() {
        let (matcher, store) = acl_matcher(true);
        add(&store, &["alice", "data1", "read"]);
        add(&store, &["alice", "data1", "write"]);
        add(&store, &["bob", "data2", "read"]);

        let matches = collect_matches(&matcher, &request(&["alice", "data1", "read"]));
        assert_eq!(matches, vec![vec!["alice", "data1", "read"]]);
        assert!(collect_matches(&matcher, &request(&["carol", "data1", "read"])).is_empty());
    }

    #[test]
    fn test_range_matches_without_index() {
        let (matcher, store) = acl_matcher(false);
        add(&store, &["alice", "data1", "read"]);
        add(&store, &["bob", "data2", "read"]);
        let matches = collect_matches(&matcher, &request(&["bob", "data2", "read"]));
        assert_eq!(matches, vec![vec!["bob", "data2", "read"]]);
    }

    #[test]
    fn test_index_tracks_store_mutations() {
        let (matcher, store) = acl_matcher(true);
        let rvals = request(&["alice", "data1", "read"]);
        assert!(collect_matches(&matcher, &rvals).is_empty());

        add(&store, &["alice", "data1", "read"]);
        assert_eq!(collect_matches(&matcher, &rvals).len(), 1);

        store.remove_rule(&[
            "alice".to_string(),
            "data1".to_string(),
            "read".to_string(),
        ]);
        assert!(collect_matches(&matcher, &rvals).is_empty());

        add(&store, &["alice", "data1", "read"]);
        store.clear();
        assert!(collect_matches(&matcher, &rvals).is_empty());
    }

    #[test]
    fn test_literal_index_source() {
        let pdef = PolicyDef::parse("p", "sub, obj, act");
        let store = Arc::new(RuleStore::new());
        let matcher = Matcher::build(
            "m",
            r#"r.sub == p.sub && p.act == "read""#,
            pdef,
            store.clone(),
            true,
        )
        .unwrap();
        assert!(matcher.has_index());
        add(&store, &["alice", "data1", "read"]);
        add(&store, &["alice", "data1", "write"]);

        let rdef = RequestDef::parse("r", "sub, obj, act");
        let funcs = FunctionMap::new();
        let mut out = Vec::new();
        matcher
            .range_matches(&rdef, &request(&["alice", "x", "y"]), &funcs, |rule| {
                out.push(rule.to_vec());
                true
            })
            .unwrap();
        assert_eq!(out, vec![vec!["alice", "data1", "read"]]);
    }

    #[test]
    fn test_early_stop() {
        let (matcher, store) = acl_matcher(false);
        add(&store, &["alice", "data1", "read"]);
        add(&store, &["alice", "data1", "read", "deny"]);

        let rdef = RequestDef::parse("r", "sub, obj, act");
        let funcs = FunctionMap::new();
        let mut seen = 0;
        matcher
            .range_matches(&rdef, &request(&["alice", "data1", "read"]), &funcs, |_| {
                seen += 1;
                false
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_request_arity_mismatch() {
        let (matcher, _) = acl_matcher(true);
        let rdef = RequestDef::parse("r", "sub, obj, act");
        let funcs = FunctionMap::new();
        let err = matcher
            .range_matches(&rdef, &request(&["alice"]), &funcs, |_| true)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidModel(_)));
    }

    #[test]
    fn test_eval_error_aborts_iteration() {
        let pdef = PolicyDef::parse("p", "sub, obj, act");
        let store = Arc::new(RuleStore::new());
        let matcher = Matcher::build("m", "r.missing == p.sub", pdef, store.clone(), false).unwrap();
        add(&store, &["alice", "data1", "read"]);

        let rdef = RequestDef::parse("r", "sub, obj, act");
        let funcs = FunctionMap::new();
        let err = matcher
            .range_matches(&rdef, &request(&["alice", "data1", "read"]), &funcs, |_| {
                true
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::ExprUnbound(_)));
    }
}
