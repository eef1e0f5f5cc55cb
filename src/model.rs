//! The policy model: definitions, rule stores, role managers, matchers and
//! effectors, keyed by section.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config;
use crate::defs::{MatcherDef, PolicyDef, RequestDef, RoleDef, Rule};
use crate::effector::Effector;
use crate::errors::EngineError;
use crate::expr::{FunctionMap, Value};
use crate::matcher::Matcher;
use crate::roles::{role_link_function, RoleManager};
use crate::store::RuleStore;

pub struct PolicySection {
    pub def: PolicyDef,
    pub store: Arc<RuleStore>,
}

pub struct RoleSection {
    pub def: RoleDef,
    pub store: Arc<RuleStore>,
    pub manager: Arc<RoleManager>,
}

/// Container of every section of a loaded model. Definition edits take
/// `&mut self`; rule mutations and decisions go through the stores' internal
/// locks and take `&self`.
#[derive(Default)]
pub struct Model {
    request_defs: HashMap<String, RequestDef>,
    policies: HashMap<String, PolicySection>,
    roles: HashMap<String, RoleSection>,
    effectors: HashMap<String, Effector>,
    matcher_defs: HashMap<String, MatcherDef>,
    matchers: HashMap<String, Matcher>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the INI-like model text and build all declared matchers.
    pub fn from_str(text: &str) -> Result<Self, EngineError> {
        let config = config::parse_model_text(text)?;
        let mut model = Model::new();
        for (key, value) in &config.request_defs {
            model.add_def('r', key, value)?;
        }
        for (key, value) in &config.policy_defs {
            model.add_def('p', key, value)?;
        }
        for (key, value) in &config.role_defs {
            model.add_def('g', key, value)?;
        }
        for (key, value) in &config.effects {
            model.add_def('e', key, value)?;
        }
        for (key, value) in &config.matchers {
            model.add_def('m', key, value)?;
        }
        model.build_matchers()?;
        tracing::info!(
            requests = model.request_defs.len(),
            policies = model.policies.len(),
            roles = model.roles.len(),
            matchers = model.matchers.len(),
            "loaded access-control model"
        );
        Ok(model)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::AdapterIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Register one definition. The key must carry the section letter
    /// (`p`, `p2`, `m9999`, ...). Matchers are compiled separately by
    /// [`Model::build_matcher`].
    pub fn add_def(&mut self, letter: char, key: &str, text: &str) -> Result<(), EngineError> {
        if !key.starts_with(letter) {
            return Err(EngineError::InvalidModel(format!(
                "definition key `{key}` does not start with section letter `{letter}`"
            )));
        }
        match letter {
            'r' => {
                self.request_defs
                    .insert(key.to_string(), RequestDef::parse(key, text));
            }
            'p' => {
                let def = PolicyDef::parse(key, text);
                self.policies.insert(
                    key.to_string(),
                    PolicySection {
                        def,
                        store: Arc::new(RuleStore::new()),
                    },
                );
            }
            'g' => {
                let def = RoleDef::parse(key, text)?;
                let store = Arc::new(RuleStore::new());
                let manager = Arc::new(RoleManager::new());
                manager.subscribe_to(&store);
                self.roles.insert(
                    key.to_string(),
                    RoleSection {
                        def,
                        store,
                        manager,
                    },
                );
            }
            'e' => {
                self.effectors
                    .insert(key.to_string(), Effector::from_expr(text)?);
            }
            'm' => {
                self.matchers.remove(key);
                self.matcher_defs
                    .insert(key.to_string(), MatcherDef::new(key, text));
            }
            other => {
                return Err(EngineError::InvalidModel(format!(
                    "unknown section letter `{other}`"
                )));
            }
        }
        Ok(())
    }

    /// Remove a definition. Removing a policy section drops the matchers
    /// bound to it; removing a matcher drops both its definition and its
    /// compiled form.
    pub fn remove_def(&mut self, letter: char, key: &str) -> bool {
        match letter {
            'r' => self.request_defs.remove(key).is_some(),
            'p' => {
                let removed = self.policies.remove(key).is_some();
                if removed {
                    self.matchers.retain(|_, m| m.get_policy() != key);
                }
                removed
            }
            'g' => self.roles.remove(key).is_some(),
            'e' => self.effectors.remove(key).is_some(),
            'm' => {
                let had_def = self.matcher_defs.remove(key).is_some();
                let had_built = self.matchers.remove(key).is_some();
                had_def || had_built
            }
            _ => false,
        }
    }

    /// Compile the named matcher definition and build its index.
    pub fn build_matcher(&mut self, key: &str) -> Result<(), EngineError> {
        let def = self
            .matcher_defs
            .get(key)
            .ok_or_else(|| EngineError::MatcherNotFound(key.to_string()))?
            .clone();
        let matcher = self.compile_matcher(key, &def.source, true)?;
        self.matchers.insert(key.to_string(), matcher);
        Ok(())
    }

    pub fn build_matchers(&mut self) -> Result<(), EngineError> {
        let keys: Vec<String> = self.matcher_defs.keys().cloned().collect();
        for key in keys {
            self.build_matcher(&key)?;
        }
        Ok(())
    }

    /// Compile a matcher expression without registering it, for one-off
    /// enforcement. No index is built.
    pub fn compile_adhoc_matcher(&self, source: &str) -> Result<Matcher, EngineError> {
        self.compile_matcher("m", source, false)
    }

    fn compile_matcher(
        &self,
        key: &str,
        source: &str,
        with_index: bool,
    ) -> Result<Matcher, EngineError> {
        let compiled = crate::expr::compile(source)?;
        let mut policy_keys: Vec<&str> = compiled
            .free_vars()
            .iter()
            .filter_map(|var| var.split('.').next())
            .filter(|section| self.policies.contains_key(*section))
            .collect();
        policy_keys.sort_unstable();
        policy_keys.dedup();

        let policy_key = match policy_keys.as_slice() {
            [] => "p",
            [single] => *single,
            many => {
                return Err(EngineError::InvalidModel(format!(
                    "matcher `{key}` references multiple policy sections: {many:?}"
                )));
            }
        };
        let section = self
            .policies
            .get(policy_key)
            .ok_or_else(|| EngineError::InvalidModel(format!(
                "matcher `{key}` binds to policy section `{policy_key}`, which is not defined"
            )))?;

        Matcher::build(
            key,
            source,
            section.def.clone(),
            section.store.clone(),
            with_index,
        )
    }

    pub fn get_request_def(&self, key: &str) -> Option<&RequestDef> {
        self.request_defs.get(key)
    }

    pub fn get_policy_section(&self, key: &str) -> Option<&PolicySection> {
        self.policies.get(key)
    }

    pub fn get_role_section(&self, key: &str) -> Option<&RoleSection> {
        self.roles.get(key)
    }

    pub fn get_role_manager(&self, key: &str) -> Option<&Arc<RoleManager>> {
        self.roles.get(key).map(|section| &section.manager)
    }

    pub fn get_effector(&self, key: &str) -> Option<Effector> {
        self.effectors.get(key).copied()
    }

    pub fn get_matcher(&self, key: &str) -> Option<&Matcher> {
        self.matchers.get(key)
    }

    /// Add a rule whose first column names its section (`p`, `g`, ...).
    /// Returns `false` when an identical rule is already present.
    pub fn add_rule(&self, rule: &[String]) -> Result<bool, EngineError> {
        let (section, tail) = Self::split_rule(rule)?;
        if let Some(policy) = self.policies.get(section) {
            policy.def.validate(tail)?;
            return Ok(policy.store.add_rule(tail.to_vec()));
        }
        if let Some(role) = self.roles.get(section) {
            role.def.validate(tail)?;
            return Ok(role.store.add_rule(tail.to_vec()));
        }
        Err(EngineError::PolicySyntax(format!(
            "rule names unknown section `{section}`"
        )))
    }

    /// Remove a rule; symmetric to [`Model::add_rule`].
    pub fn remove_rule(&self, rule: &[String]) -> Result<bool, EngineError> {
        let (section, tail) = Self::split_rule(rule)?;
        if let Some(policy) = self.policies.get(section) {
            return Ok(policy.store.remove_rule(tail));
        }
        if let Some(role) = self.roles.get(section) {
            return Ok(role.store.remove_rule(tail));
        }
        Err(EngineError::PolicySyntax(format!(
            "rule names unknown section `{section}`"
        )))
    }

    fn split_rule(rule: &[String]) -> Result<(&str, &[String]), EngineError> {
        match rule.split_first() {
            Some((section, tail)) if !tail.is_empty() => Ok((section.as_str(), tail)),
            _ => Err(EngineError::PolicySyntax(
                "a rule needs a section key and at least one value".into(),
            )),
        }
    }

    /// Drop every policy and role rule; definitions stay.
    pub fn clear_policy(&self) {
        for section in self.policies.values() {
            section.store.clear();
        }
        for section in self.roles.values() {
            section.store.clear();
        }
    }

    /// Snapshot of all rules with their section key prepended, grouped by
    /// section in sorted key order. Order within a section is unspecified.
    pub fn rules(&self) -> Vec<Rule> {
        let mut out = Vec::new();
        let mut keys: Vec<&String> = self.policies.keys().chain(self.roles.keys()).collect();
        keys.sort();
        for key in keys {
            let store = self
                .policies
                .get(key.as_str())
                .map(|s| &s.store)
                .or_else(|| self.roles.get(key.as_str()).map(|s| &s.store));
            if let Some(store) = store {
                store.range(|rule| {
                    let mut row = Vec::with_capacity(rule.len() + 1);
                    row.push(key.clone());
                    row.extend(rule.iter().cloned());
                    out.push(row);
                    true
                });
            }
        }
        out
    }

    pub fn rule_count(&self) -> usize {
        self.policies
            .values()
            .map(|s| s.store.len())
            .chain(self.roles.values().map(|s| s.store.len()))
            .sum()
    }

    pub(crate) fn for_each_store(&self, mut f: impl FnMut(&Arc<RuleStore>)) {
        for section in self.policies.values() {
            f(&section.store);
        }
        for section in self.roles.values() {
            f(&section.store);
        }
    }

    /// Functions available to matcher evaluation: one role-link predicate
    /// per `g` section, named by its key.
    pub fn functions(&self) -> FunctionMap {
        let mut funcs = FunctionMap::new();
        for (key, section) in &self.roles {
            funcs.insert(key, role_link_function(section.manager.clone()));
        }
        funcs
    }

    /// Stream candidate rules for one request through a matcher. Used by
    /// both enforce and filter.
    pub fn range_matches(
        &self,
        matcher: &Matcher,
        rdef: &RequestDef,
        rvals: &[Value],
        f: impl FnMut(&[String]) -> bool,
    ) -> Result<(), EngineError> {
        let funcs = self.functions();
        matcher.range_matches(rdef, rvals, &funcs, f)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("request_defs", &self.request_defs.len())
            .field("policies", &self.policies.len())
            .field("roles", &self.roles.len())
            .field("matchers", &self.matchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#;

    fn rule(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_str_builds_all_sections() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        assert!(model.get_request_def("r").is_some());
        assert!(model.get_policy_section("p").is_some());
        assert!(model.get_role_section("g").is_some());
        assert_eq!(model.get_effector("e"), Some(Effector::AllowOverride));
        assert!(model.get_matcher("m").is_some());
    }

    #[test]
    fn test_add_rule_dispatches_by_section() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        assert!(model.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap());
        assert!(!model.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap());
        assert!(model.add_rule(&rule(&["g", "alice", "admin"])).unwrap());

        assert_eq!(model.get_policy_section("p").unwrap().store.len(), 1);
        assert!(model
            .get_role_manager("g")
            .unwrap()
            .has_link("alice", "admin", ""));
    }

    #[test]
    fn test_add_rule_rejects_bad_arity() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        let err = model.add_rule(&rule(&["p", "alice", "data1"])).unwrap_err();
        assert!(matches!(err, EngineError::PolicySyntax(_)));
        let err = model
            .add_rule(&rule(&["g", "alice", "admin", "x"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicySyntax(_)));
    }

    #[test]
    fn test_add_rule_rejects_unknown_section() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        let err = model.add_rule(&rule(&["p9", "alice", "d", "r"])).unwrap_err();
        assert!(matches!(err, EngineError::PolicySyntax(_)));
    }

    #[test]
    fn test_remove_rule_updates_role_graph() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        model.add_rule(&rule(&["g", "alice", "admin"])).unwrap();
        assert!(model.remove_rule(&rule(&["g", "alice", "admin"])).unwrap());
        assert!(!model
            .get_role_manager("g")
            .unwrap()
            .has_link("alice", "admin", ""));
        assert!(!model.remove_rule(&rule(&["g", "alice", "admin"])).unwrap());
    }

    #[test]
    fn test_clear_policy_keeps_definitions() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        model.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        model.add_rule(&rule(&["g", "alice", "admin"])).unwrap();
        model.clear_policy();
        assert_eq!(model.rule_count(), 0);
        assert!(model.get_policy_section("p").is_some());
    }

    #[test]
    fn test_rules_snapshot_prepends_section_key() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        model.add_rule(&rule(&["p", "alice", "data1", "read"])).unwrap();
        model.add_rule(&rule(&["g", "alice", "admin"])).unwrap();
        let mut rules = model.rules();
        rules.sort();
        assert_eq!(
            rules,
            vec![
                rule(&["g", "alice", "admin"]),
                rule(&["p", "alice", "data1", "read"]),
            ]
        );
    }

    #[test]
    fn test_remove_policy_def_invalidates_matcher() {
        let mut model = Model::from_str(RBAC_MODEL).unwrap();
        assert!(model.remove_def('p', "p"));
        assert!(model.get_matcher("m").is_none());
    }

    #[test]
    fn test_adhoc_matcher_defaults_to_p() {
        let model = Model::from_str(RBAC_MODEL).unwrap();
        let matcher = model.compile_adhoc_matcher(r#"r.sub == "alice""#).unwrap();
        assert_eq!(matcher.get_policy(), "p");
        assert!(!matcher.has_index());
    }

    #[test]
    fn test_matcher_binding_multiple_policies_rejected() {
        let mut model = Model::from_str(RBAC_MODEL).unwrap();
        model.add_def('p', "p2", "sub, act").unwrap();
        model
            .add_def('m', "m2", "r.sub == p.sub && r.act == p2.act")
            .unwrap();
        let err = model.build_matcher("m2").unwrap_err();
        assert!(matches!(err, EngineError::InvalidModel(_)));
    }

    #[test]
    fn test_missing_model_file() {
        let err = Model::from_file("/nonexistent/model.conf").unwrap_err();
        assert!(matches!(err, EngineError::AdapterIo { .. }));
    }
}
