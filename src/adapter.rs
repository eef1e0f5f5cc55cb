//! Policy persistence boundary.
//!
//! Adapters move rules between a [`Model`] and some backing store. The crate
//! ships the CSV-backed [`FileAdapter`] and the in-memory [`NoopAdapter`];
//! databases and other backends implement [`Adapter`] externally.

use std::path::{Path, PathBuf};

use crate::defs::Rule;
use crate::errors::EngineError;
use crate::model::Model;

pub trait Adapter: Send + Sync {
    /// Stream all rules from the backing store into the model.
    fn load_policy(&self, model: &Model) -> Result<(), EngineError>;

    /// Persist all of the model's rules. Read-only adapters return
    /// [`EngineError::Unsupported`].
    fn save_policy(&self, model: &Model) -> Result<(), EngineError>;
}

/// Parse one line of policy text: comma-separated values, whitespace
/// trimmed, `#` comments and blank lines skipped.
pub fn parse_policy_line(line: &str) -> Option<Rule> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    Some(trimmed.split(',').map(|col| col.trim().to_string()).collect())
}

/// Policy rules in a CSV text file, one rule per line, first column the
/// section key.
pub struct FileAdapter {
    path: PathBuf,
}

impl FileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> EngineError {
        EngineError::AdapterIo {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl Adapter for FileAdapter {
    fn load_policy(&self, model: &Model) -> Result<(), EngineError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        let mut loaded = 0usize;
        for line in text.lines() {
            let Some(rule) = parse_policy_line(line) else {
                continue;
            };
            model.add_rule(&rule)?;
            loaded += 1;
        }
        tracing::info!(rules = loaded, path = %self.path.display(), "loaded policy rules");
        Ok(())
    }

    fn save_policy(&self, model: &Model) -> Result<(), EngineError> {
        // TODO: escape commas when a rule value contains one
        let mut out = String::new();
        for rule in model.rules() {
            out.push_str(&rule.join(", "));
            out.push('\n');
        }
        std::fs::write(&self.path, out).map_err(|e| self.io_err(e))
    }
}

/// Adapter for purely in-memory models: loading is a no-op and saving is
/// unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAdapter;

impl Adapter for NoopAdapter {
    fn load_policy(&self, _model: &Model) -> Result<(), EngineError> {
        Ok(())
    }

    fn save_policy(&self, _model: &Model) -> Result<(), EngineError> {
        Err(EngineError::Unsupported(
            "the no-op adapter cannot persist rules".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MODEL: &str = r#"
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
    fn test_parse_policy_line() {
        assert_eq!(
            parse_policy_line("p, alice, data1, read"),
            Some(vec![
                "p".to_string(),
                "alice".to_string(),
                "data1".to_string(),
                "read".to_string()
            ])
        );
        assert_eq!(parse_policy_line("  # comment"), None);
        assert_eq!(parse_policy_line(""), None);
        assert_eq!(parse_policy_line("   "), None);
    }

    #[test]
    fn test_file_adapter_load() {
        let model = Model::from_str(MODEL).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# seed rules").unwrap();
        writeln!(file, "p, alice, data1, read").unwrap();
        writeln!(file, "g, alice, admin").unwrap();
        writeln!(file).unwrap();

        let adapter = FileAdapter::new(file.path());
        adapter.load_policy(&model).unwrap();

        assert_eq!(model.rule_count(), 2);
        assert!(model
            .get_role_manager("g")
            .unwrap()
            .has_link("alice", "admin", ""));
    }

    #[test]
    fn test_file_adapter_save_round_trip() {
        let model = Model::from_str(MODEL).unwrap();
        model
            .add_rule(&vec![
                "p".to_string(),
                "alice".to_string(),
                "data1".to_string(),
                "read".to_string(),
            ])
            .unwrap();
        model
            .add_rule(&vec![
                "g".to_string(),
                "alice".to_string(),
                "admin".to_string(),
            ])
            .unwrap();

        let file = tempfile::NamedTempFile::new().unwrap();
        let adapter = FileAdapter::new(file.path());
        adapter.save_policy(&model).unwrap();

        let reloaded = Model::from_str(MODEL).unwrap();
        adapter.load_policy(&reloaded).unwrap();
        let mut expected = model.rules();
        let mut actual = reloaded.rules();
        expected.sort();
        actual.sort();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_file_adapter_missing_file() {
        let model = Model::from_str(MODEL).unwrap();
        let adapter = FileAdapter::new("/nonexistent/policy.csv");
        let err = adapter.load_policy(&model).unwrap_err();
        assert!(matches!(err, EngineError::AdapterIo { .. }));
    }

    #[test]
    fn test_noop_adapter() {
        let model = Model::from_str(MODEL).unwrap();
        let adapter = NoopAdapter;
        adapter.load_policy(&model).unwrap();
        assert!(matches!(
            adapter.save_policy(&model),
            Err(EngineError::Unsupported(_))
        ));
    }
}
