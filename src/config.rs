//! Parser for the INI-like model text format.
//!
//! ```text
//! [request_definition]
//! r = sub, obj, act
//! [policy_definition]
//! p = sub, obj, act
//! [role_definition]
//! g = _, _
//! [policy_effect]
//! e = some(where (p.eft == allow))
//! [matchers]
//! m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
//! ```

use crate::errors::EngineError;

/// Raw `key = value` entries per section, in file order.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub request_defs: Vec<(String, String)>,
    pub policy_defs: Vec<(String, String)>,
    pub role_defs: Vec<(String, String)>,
    pub effects: Vec<(String, String)>,
    pub matchers: Vec<(String, String)>,
}

fn section_letter(name: &str) -> Option<char> {
    match name {
        "request_definition" => Some('r'),
        "policy_definition" => Some('p'),
        "role_definition" => Some('g'),
        "policy_effect" => Some('e'),
        "matchers" => Some('m'),
        _ => None,
    }
}

/// Keys are the section letter plus an optional numeric suffix: `p`, `p2`,
/// `m9999`.
fn valid_key(key: &str, letter: char) -> bool {
    let mut chars = key.chars();
    chars.next() == Some(letter) && chars.all(|c| c.is_ascii_digit())
}

pub fn parse_model_text(text: &str) -> Result<ModelConfig, EngineError> {
    let mut config = ModelConfig::default();
    let mut current: Option<char> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            let letter = section_letter(name.trim()).ok_or_else(|| EngineError::ConfigSyntax {
                line,
                message: format!("unknown section `[{}]`", name.trim()),
            })?;
            current = Some(letter);
            continue;
        }

        let Some(letter) = current else {
            return Err(EngineError::ConfigSyntax {
                line,
                message: format!("entry `{trimmed}` appears before any section header"),
            });
        };

        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(EngineError::ConfigSyntax {
                line,
                message: format!("expected `key = value`, got `{trimmed}`"),
            });
        };
        let key = key.trim();
        let value = value.trim();
        if !valid_key(key, letter) {
            return Err(EngineError::ConfigSyntax {
                line,
                message: format!("key `{key}` does not belong in a `[{letter}]`-keyed section"),
            });
        }
        if value.is_empty() {
            return Err(EngineError::ConfigSyntax {
                line,
                message: format!("empty value for key `{key}`"),
            });
        }

        let entries = match letter {
            'r' => &mut config.request_defs,
            'p' => &mut config.policy_defs,
            'g' => &mut config.role_defs,
            'e' => &mut config.effects,
            _ => &mut config.matchers,
        };
        if entries.iter().any(|(k, _)| k == key) {
            return Err(EngineError::ConfigSyntax {
                line,
                message: format!("duplicate key `{key}`"),
            });
        }
        entries.push((key.to_string(), value.to_string()));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
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

    #[test]
    fn test_parse_basic_model() {
        let config = parse_model_text(BASIC).unwrap();
        assert_eq!(config.request_defs, vec![("r".into(), "sub, obj, act".into())]);
        assert_eq!(config.policy_defs.len(), 1);
        assert_eq!(config.role_defs, vec![("g".into(), "_, _".into())]);
        assert_eq!(
            config.effects,
            vec![("e".into(), "some(where (p.eft == allow))".into())]
        );
        assert_eq!(
            config.matchers[0].1,
            "g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act"
        );
    }

    #[test]
    fn test_parse_comments_and_blanks() {
        let text = "# header comment\n\n[request_definition]\n# about r\nr = sub, act\n";
        let config = parse_model_text(text).unwrap();
        assert_eq!(config.request_defs, vec![("r".into(), "sub, act".into())]);
    }

    #[test]
    fn test_parse_multiple_keys_per_section() {
        let text = "[policy_definition]\np = sub, obj, act\np2 = sub, act\n";
        let config = parse_model_text(text).unwrap();
        assert_eq!(config.policy_defs.len(), 2);
        assert_eq!(config.policy_defs[1].0, "p2");
    }

    #[test]
    fn test_parse_rejects_unknown_section() {
        let err = parse_model_text("[nope]\nx = y\n").unwrap_err();
        assert!(matches!(err, EngineError::ConfigSyntax { line: 1, .. }));
    }

    #[test]
    fn test_parse_rejects_duplicate_key() {
        let text = "[request_definition]\nr = sub\nr = sub, obj\n";
        let err = parse_model_text(text).unwrap_err();
        assert!(matches!(err, EngineError::ConfigSyntax { line: 3, .. }));
    }

    #[test]
    fn test_parse_rejects_malformed_line() {
        let err = parse_model_text("[matchers]\njust words\n").unwrap_err();
        assert!(matches!(err, EngineError::ConfigSyntax { .. }));
    }

    #[test]
    fn test_parse_rejects_entry_before_section() {
        let err = parse_model_text("r = sub, obj\n").unwrap_err();
        assert!(matches!(err, EngineError::ConfigSyntax { line: 1, .. }));
    }

    #[test]
    fn test_parse_rejects_mismatched_key_letter() {
        let err = parse_model_text("[matchers]\nr = a == b\n").unwrap_err();
        assert!(matches!(err, EngineError::ConfigSyntax { .. }));
    }
}
