//! The enforcement façade: wires a model to a storage adapter and exposes
//! the decision entrypoints.

use crate::adapter::{Adapter, NoopAdapter};
use crate::defs::{Effect, Rule};
use crate::errors::EngineError;
use crate::expr::Value;
use crate::matcher::Matcher;
use crate::model::Model;
use crate::storage::StorageController;

pub struct Enforcer {
    model: Model,
    storage: StorageController,
}

impl Enforcer {
    /// Engine over a model file, no persistent policy storage.
    pub fn from_file(model_path: impl AsRef<std::path::Path>) -> Result<Self, EngineError> {
        Ok(Self::from_model(Model::from_file(model_path)?))
    }

    /// Engine over a model file with rules loaded from a CSV policy file.
    pub fn from_files(
        model_path: impl AsRef<std::path::Path>,
        policy_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, EngineError> {
        let model = Model::from_file(model_path)?;
        Self::with_adapter(model, crate::adapter::FileAdapter::new(policy_path.as_ref()))
    }

    /// Engine over an already-built model, no persistent policy storage.
    pub fn from_model(model: Model) -> Self {
        let mut storage = StorageController::new(Box::new(NoopAdapter), false);
        storage.disable();
        Self { model, storage }
    }

    /// Engine over an already-built model with a storage adapter; the
    /// adapter's rules are loaded immediately.
    pub fn with_adapter(
        model: Model,
        adapter: impl Adapter + 'static,
    ) -> Result<Self, EngineError> {
        let storage = StorageController::new(Box::new(adapter), false);
        storage.load(&model)?;
        storage.attach(&model);
        Ok(Self { model, storage })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// Swap the storage adapter, keeping the autosave setting.
    pub fn set_adapter(&mut self, adapter: impl Adapter + 'static) {
        let autosave = self.storage.autosave_enabled();
        self.storage = StorageController::new(Box::new(adapter), autosave);
        self.storage.attach(&self.model);
    }

    pub fn enable_autosave(&mut self) {
        self.storage.enable_autosave();
    }

    pub fn disable_autosave(&mut self) {
        self.storage.disable_autosave();
    }

    /// Drop all rules and reload them through the adapter.
    pub fn load_policy(&mut self) -> Result<(), EngineError> {
        self.model.clear_policy();
        self.storage.load(&self.model)
    }

    /// Persist all rules through the adapter.
    pub fn save_policy(&self) -> Result<(), EngineError> {
        self.storage.adapter().save_policy(&self.model)
    }

    /// Write out any unsaved mutations.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.storage.flush(&self.model)
    }

    /// Add one rule (first column = section key). Autosave flushes before
    /// this returns.
    pub fn add_rule<S: Into<String>>(
        &mut self,
        rule: impl IntoIterator<Item = S>,
    ) -> Result<bool, EngineError> {
        let rule: Rule = rule.into_iter().map(Into::into).collect();
        let added = self.model.add_rule(&rule)?;
        if added {
            self.storage.after_mutation(&self.model)?;
        }
        Ok(added)
    }

    pub fn remove_rule<S: Into<String>>(
        &mut self,
        rule: impl IntoIterator<Item = S>,
    ) -> Result<bool, EngineError> {
        let rule: Rule = rule.into_iter().map(Into::into).collect();
        let removed = self.model.remove_rule(&rule)?;
        if removed {
            self.storage.after_mutation(&self.model)?;
        }
        Ok(removed)
    }

    /// Add many rules with a single flush at the end.
    pub fn add_rules(&mut self, rules: &[Rule]) -> Result<(), EngineError> {
        self.batch(rules, true)
    }

    pub fn remove_rules(&mut self, rules: &[Rule]) -> Result<(), EngineError> {
        self.batch(rules, false)
    }

    fn batch(&mut self, rules: &[Rule], add: bool) -> Result<(), EngineError> {
        let autosave = self.storage.autosave_enabled();
        if autosave {
            self.storage.disable_autosave();
        }
        let result = rules.iter().try_for_each(|rule| {
            if add {
                self.model.add_rule(rule).map(|_| ())
            } else {
                self.model.remove_rule(rule).map(|_| ())
            }
        });
        if autosave {
            self.storage.enable_autosave();
            self.storage.flush(&self.model)?;
        }
        result
    }

    /// `enforce` with the conventional `m` / `r` / `e` keys.
    pub fn enforce<V: Into<Value>>(
        &self,
        rvals: impl IntoIterator<Item = V>,
    ) -> Result<bool, EngineError> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        self.enforce_values("m", "r", "e", &rvals)
    }

    pub fn enforce_with_keys<V: Into<Value>>(
        &self,
        m_key: &str,
        r_key: &str,
        e_key: &str,
        rvals: impl IntoIterator<Item = V>,
    ) -> Result<bool, EngineError> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        self.enforce_values(m_key, r_key, e_key, &rvals)
    }

    /// Enforce with a one-off matcher expression instead of a registered
    /// `[matchers]` entry.
    pub fn enforce_with_matcher<V: Into<Value>>(
        &self,
        matcher: &str,
        rvals: impl IntoIterator<Item = V>,
    ) -> Result<bool, EngineError> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        let matcher = self.model.compile_adhoc_matcher(matcher)?;
        let rdef = self
            .model
            .get_request_def("r")
            .ok_or_else(|| EngineError::RequestDefNotFound("r".into()))?;
        let effector = self
            .model
            .get_effector("e")
            .ok_or_else(|| EngineError::EffectorNotFound("e".into()))?;
        self.run_enforce(&matcher, rdef, effector, &rvals)
    }

    fn enforce_values(
        &self,
        m_key: &str,
        r_key: &str,
        e_key: &str,
        rvals: &[Value],
    ) -> Result<bool, EngineError> {
        let matcher = self
            .model
            .get_matcher(m_key)
            .ok_or_else(|| EngineError::MatcherNotFound(m_key.into()))?;
        let rdef = self
            .model
            .get_request_def(r_key)
            .ok_or_else(|| EngineError::RequestDefNotFound(r_key.into()))?;
        let effector = self
            .model
            .get_effector(e_key)
            .ok_or_else(|| EngineError::EffectorNotFound(e_key.into()))?;
        self.run_enforce(matcher, rdef, effector, rvals)
    }

    /// The enforce pipeline: stream matching rules, fold their effects, and
    /// stop as soon as the decision is fixed.
    fn run_enforce(
        &self,
        matcher: &Matcher,
        rdef: &crate::defs::RequestDef,
        effector: crate::effector::Effector,
        rvals: &[Value],
    ) -> Result<bool, EngineError> {
        let pdef = matcher.policy_def();
        let mut effects: Vec<Effect> = Vec::new();
        let mut decision = Effect::Indeterminate;

        self.model.range_matches(matcher, rdef, rvals, |rule| {
            effects.push(pdef.get_eft(rule));
            let (merged, _) = effector.merge_effects(&effects, false);
            decision = merged;
            decision == Effect::Indeterminate
        })?;

        if decision == Effect::Indeterminate {
            decision = effector.merge_effects(&effects, true).0;
        }
        tracing::debug!(?decision, "enforce");
        Ok(decision == Effect::Allow)
    }

    /// All rules matching the request, with the conventional keys.
    pub fn filter<V: Into<Value>>(
        &self,
        rvals: impl IntoIterator<Item = V>,
    ) -> Result<Vec<Rule>, EngineError> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        self.filter_values("m", "r", &rvals)
    }

    pub fn filter_with_keys<V: Into<Value>>(
        &self,
        m_key: &str,
        r_key: &str,
        rvals: impl IntoIterator<Item = V>,
    ) -> Result<Vec<Rule>, EngineError> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        self.filter_values(m_key, r_key, &rvals)
    }

    pub fn filter_with_matcher<V: Into<Value>>(
        &self,
        matcher: &str,
        rvals: impl IntoIterator<Item = V>,
    ) -> Result<Vec<Rule>, EngineError> {
        let rvals: Vec<Value> = rvals.into_iter().map(Into::into).collect();
        let matcher = self.model.compile_adhoc_matcher(matcher)?;
        let rdef = self
            .model
            .get_request_def("r")
            .ok_or_else(|| EngineError::RequestDefNotFound("r".into()))?;
        self.collect_matches(&matcher, rdef, &rvals)
    }

    fn filter_values(
        &self,
        m_key: &str,
        r_key: &str,
        rvals: &[Value],
    ) -> Result<Vec<Rule>, EngineError> {
        let matcher = self
            .model
            .get_matcher(m_key)
            .ok_or_else(|| EngineError::MatcherNotFound(m_key.into()))?;
        let rdef = self
            .model
            .get_request_def(r_key)
            .ok_or_else(|| EngineError::RequestDefNotFound(r_key.into()))?;
        self.collect_matches(matcher, rdef, rvals)
    }

    fn collect_matches(
        &self,
        matcher: &Matcher,
        rdef: &crate::defs::RequestDef,
        rvals: &[Value],
    ) -> Result<Vec<Rule>, EngineError> {
        let mut rules = Vec::new();
        self.model.range_matches(matcher, rdef, rvals, |rule| {
            rules.push(rule.to_vec());
            true
        })?;
        Ok(rules)
    }

    // ---------- role management conveniences for the default `g` section ----------

    pub fn add_role_for_user(
        &mut self,
        user: &str,
        role: &str,
        domain: Option<&str>,
    ) -> Result<bool, EngineError> {
        self.add_rule(Self::role_rule(user, role, domain))
    }

    pub fn delete_role_for_user(
        &mut self,
        user: &str,
        role: &str,
        domain: Option<&str>,
    ) -> Result<bool, EngineError> {
        self.remove_rule(Self::role_rule(user, role, domain))
    }

    pub fn get_roles_for_user(
        &self,
        user: &str,
        domain: Option<&str>,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self.default_role_manager()?.get_roles(user, domain.unwrap_or("")))
    }

    pub fn get_users_for_role(
        &self,
        role: &str,
        domain: Option<&str>,
    ) -> Result<Vec<String>, EngineError> {
        Ok(self.default_role_manager()?.get_users(role, domain.unwrap_or("")))
    }

    /// True iff `user` holds `role` directly (no transitivity).
    pub fn has_role_for_user(
        &self,
        user: &str,
        role: &str,
        domain: Option<&str>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .get_roles_for_user(user, domain)?
            .iter()
            .any(|r| r == role))
    }

    fn role_rule(user: &str, role: &str, domain: Option<&str>) -> Rule {
        let mut rule = vec!["g".to_string(), user.to_string(), role.to_string()];
        if let Some(domain) = domain {
            rule.push(domain.to_string());
        }
        rule
    }

    fn default_role_manager(&self) -> Result<&std::sync::Arc<crate::roles::RoleManager>, EngineError> {
        self.model
            .get_role_manager("g")
            .ok_or_else(|| EngineError::InvalidModel("model declares no `g` role section".into()))
    }
}
