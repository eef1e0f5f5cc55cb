use crate::errors::EngineError;

/// A policy or role rule: one string per attribute of its section.
pub type Rule = Vec<String>;

/// Rule-level or aggregate decision effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
    Indeterminate,
}

fn effect_from_str(s: &str) -> Effect {
    match s {
        "" | "allow" => Effect::Allow,
        "deny" => Effect::Deny,
        _ => Effect::Indeterminate,
    }
}

fn split_args(text: &str) -> Vec<String> {
    text.split(',').map(|s| s.trim().to_string()).collect()
}

/// Shape of a request section (`r`, `r2`, ...): an ordered list of attribute names.
#[derive(Debug, Clone)]
pub struct RequestDef {
    pub key: String,
    pub args: Vec<String>,
}

impl RequestDef {
    pub fn parse(key: &str, text: &str) -> Self {
        Self {
            key: key.to_string(),
            args: split_args(text),
        }
    }
}

/// Shape of a policy section (`p`, `p2`, ...): ordered attribute names, one of
/// which may be the `eft` effect column.
#[derive(Debug, Clone)]
pub struct PolicyDef {
    pub key: String,
    pub args: Vec<String>,
    eft_index: Option<usize>,
}

impl PolicyDef {
    pub fn parse(key: &str, text: &str) -> Self {
        let args = split_args(text);
        let eft_index = args.iter().position(|a| a == "eft");
        Self {
            key: key.to_string(),
            args,
            eft_index,
        }
    }

    /// Effect of a single rule. Rules without an effect column default to
    /// `Allow`; a trailing extra column is read as the effect when the
    /// definition does not declare `eft` itself.
    pub fn get_eft(&self, rule: &[String]) -> Effect {
        if let Some(i) = self.eft_index {
            rule.get(i)
                .map(|s| effect_from_str(s))
                .unwrap_or(Effect::Allow)
        } else if rule.len() == self.args.len() + 1 {
            effect_from_str(&rule[self.args.len()])
        } else {
            Effect::Allow
        }
    }

    /// A rule must carry exactly one value per declared attribute, plus at
    /// most one trailing effect column when `eft` is not declared.
    pub fn validate(&self, rule: &[String]) -> Result<(), EngineError> {
        let ok = rule.len() == self.args.len()
            || (self.eft_index.is_none() && rule.len() == self.args.len() + 1);
        if ok {
            Ok(())
        } else {
            Err(EngineError::PolicySyntax(format!(
                "rule for section `{}` has {} values, definition declares {} attributes",
                self.key,
                rule.len(),
                self.args.len()
            )))
        }
    }
}

/// Shape of a role section (`g`, `g2`, ...): arity 2 for plain links,
/// 3 for domain-scoped links.
#[derive(Debug, Clone)]
pub struct RoleDef {
    pub key: String,
    pub arity: usize,
}

impl RoleDef {
    pub fn parse(key: &str, text: &str) -> Result<Self, EngineError> {
        let tokens = split_args(text);
        if !tokens.iter().all(|t| t == "_") {
            return Err(EngineError::InvalidModel(format!(
                "role definition `{key}` must consist of `_` placeholders, got `{text}`"
            )));
        }
        let arity = tokens.len();
        if !(2..=3).contains(&arity) {
            return Err(EngineError::InvalidModel(format!(
                "role definition `{key}` must have arity 2 or 3, got {arity}"
            )));
        }
        Ok(Self {
            key: key.to_string(),
            arity,
        })
    }

    pub fn validate(&self, rule: &[String]) -> Result<(), EngineError> {
        if rule.len() == self.arity {
            Ok(())
        } else {
            Err(EngineError::PolicySyntax(format!(
                "rule for section `{}` has {} values, definition declares arity {}",
                self.key,
                rule.len(),
                self.arity
            )))
        }
    }
}

/// An uncompiled matcher: the raw expression text bound to a section key.
#[derive(Debug, Clone)]
pub struct MatcherDef {
    pub key: String,
    pub source: String,
}

impl MatcherDef {
    pub fn new(key: &str, source: &str) -> Self {
        Self {
            key: key.to_string(),
            source: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_def_parse() {
        let def = RequestDef::parse("r", "sub, obj, act");
        assert_eq!(def.key, "r");
        assert_eq!(def.args, vec!["sub", "obj", "act"]);
    }

    #[test]
    fn test_policy_eft_default_allow() {
        let def = PolicyDef::parse("p", "sub, obj, act");
        let rule = vec!["alice".into(), "data1".into(), "read".into()];
        assert_eq!(def.get_eft(&rule), Effect::Allow);
    }

    #[test]
    fn test_policy_eft_trailing_column() {
        let def = PolicyDef::parse("p", "sub, obj, act");
        let allow = vec![
            "alice".into(),
            "data1".into(),
            "read".into(),
            "allow".into(),
        ];
        let deny = vec![
            "alice".into(),
            "data1".into(),
            "read".into(),
            "deny".into(),
        ];
        assert_eq!(def.get_eft(&allow), Effect::Allow);
        assert_eq!(def.get_eft(&deny), Effect::Deny);
    }

    #[test]
    fn test_policy_eft_declared_column() {
        let def = PolicyDef::parse("p", "sub, obj, act, eft");
        let deny = vec![
            "alice".into(),
            "data1".into(),
            "read".into(),
            "deny".into(),
        ];
        assert_eq!(def.get_eft(&deny), Effect::Deny);
        // unknown effect strings are indeterminate
        let odd = vec![
            "alice".into(),
            "data1".into(),
            "read".into(),
            "maybe".into(),
        ];
        assert_eq!(def.get_eft(&odd), Effect::Indeterminate);
    }

    #[test]
    fn test_policy_validate_arity() {
        let def = PolicyDef::parse("p", "sub, obj, act");
        assert!(def
            .validate(&["alice".into(), "data1".into(), "read".into()])
            .is_ok());
        assert!(def
            .validate(&[
                "alice".into(),
                "data1".into(),
                "read".into(),
                "allow".into()
            ])
            .is_ok());
        let err = def.validate(&["alice".into(), "data1".into()]).unwrap_err();
        assert!(matches!(err, EngineError::PolicySyntax(_)));
    }

    #[test]
    fn test_policy_validate_no_double_trailing() {
        let def = PolicyDef::parse("p", "sub, obj, act, eft");
        let err = def
            .validate(&[
                "alice".into(),
                "data1".into(),
                "read".into(),
                "allow".into(),
                "extra".into(),
            ])
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicySyntax(_)));
    }

    #[test]
    fn test_role_def_arity() {
        assert_eq!(RoleDef::parse("g", "_, _").unwrap().arity, 2);
        assert_eq!(RoleDef::parse("g2", "_, _, _").unwrap().arity, 3);
        assert!(RoleDef::parse("g", "_").is_err());
        assert!(RoleDef::parse("g", "_, _, _, _").is_err());
        assert!(RoleDef::parse("g", "a, b").is_err());
    }
}
