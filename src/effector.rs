//! Effect combinators: fold a stream of per-rule effects into one decision.

use crate::defs::Effect;
use crate::errors::EngineError;

/// How per-rule effects merge into the final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effector {
    /// Allow iff any rule allows.
    AllowOverride,
    /// Deny iff any rule denies.
    DenyOverride,
    /// Deny if any rule denies, else allow if any rule allows, else deny.
    AllowAndDeny,
    /// The first rule carrying a determinate effect wins.
    Priority,
}

impl Effector {
    /// Map a `[policy_effect]` expression onto a combinator.
    pub fn from_expr(text: &str) -> Result<Self, EngineError> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "some(where (p.eft == allow))" => Ok(Effector::AllowOverride),
            "!some(where (p.eft == deny))" => Ok(Effector::DenyOverride),
            "some(where (p.eft == allow)) && !some(where (p.eft == deny))" => {
                Ok(Effector::AllowAndDeny)
            }
            "priority(p.eft) || deny" => Ok(Effector::Priority),
            other => Err(EngineError::InvalidModel(format!(
                "unsupported policy effect expression `{other}`"
            ))),
        }
    }

    /// Merge the effects seen so far. With `complete = false` the result is
    /// `Indeterminate` while later rules could still change the answer;
    /// `complete = true` collapses `Indeterminate` to the combinator's
    /// default. The second element is the index of the deciding effect.
    pub fn merge_effects(&self, effects: &[Effect], complete: bool) -> (Effect, Option<usize>) {
        let position_of = |target: Effect| effects.iter().position(|e| *e == target);
        match self {
            Effector::AllowOverride => {
                if let Some(i) = position_of(Effect::Allow) {
                    (Effect::Allow, Some(i))
                } else if complete {
                    (Effect::Deny, None)
                } else {
                    (Effect::Indeterminate, None)
                }
            }
            Effector::DenyOverride => {
                if let Some(i) = position_of(Effect::Deny) {
                    (Effect::Deny, Some(i))
                } else if complete {
                    (Effect::Allow, None)
                } else {
                    (Effect::Indeterminate, None)
                }
            }
            Effector::AllowAndDeny => {
                if let Some(i) = position_of(Effect::Deny) {
                    (Effect::Deny, Some(i))
                } else if complete {
                    match position_of(Effect::Allow) {
                        Some(i) => (Effect::Allow, Some(i)),
                        None => (Effect::Deny, None),
                    }
                } else {
                    (Effect::Indeterminate, None)
                }
            }
            Effector::Priority => {
                let decided = effects
                    .iter()
                    .enumerate()
                    .find(|(_, e)| **e != Effect::Indeterminate);
                match decided {
                    Some((i, e)) => (*e, Some(i)),
                    None if complete => (Effect::Deny, None),
                    None => (Effect::Indeterminate, None),
                }
            }
        }
    }
}
