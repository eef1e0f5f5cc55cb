use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("model syntax error on line {line}: {message}")]
    #[diagnostic(
        code(palisade::config_syntax),
        help("Model text uses INI-like sections ([request_definition], [policy_definition], [role_definition], [policy_effect], [matchers]) with `key = value` entries")
    )]
    ConfigSyntax { line: usize, message: String },

    #[error("invalid policy rule: {0}")]
    #[diagnostic(
        code(palisade::policy_syntax),
        help("A rule's first column names its section (e.g. `p` or `g`); the remaining columns must match the section definition's arity")
    )]
    PolicySyntax(String),

    #[error("invalid model: {0}")]
    #[diagnostic(code(palisade::invalid_model))]
    InvalidModel(String),

    #[error("matcher `{0}` not found")]
    #[diagnostic(
        code(palisade::matcher_not_found),
        help("Define the matcher under [matchers] and build it before enforcing")
    )]
    MatcherNotFound(String),

    #[error("request definition `{0}` not found")]
    #[diagnostic(code(palisade::request_def_not_found))]
    RequestDefNotFound(String),

    #[error("effector `{0}` not found")]
    #[diagnostic(code(palisade::effector_not_found))]
    EffectorNotFound(String),

    #[error("expression syntax error: {0}")]
    #[diagnostic(
        code(palisade::expr_syntax),
        help("Supported: ==, !=, >, <, >=, <=, &&, ||, !, in, + - * / %, parentheses, `name.attr` identifiers, function calls")
    )]
    ExprSyntax(String),

    #[error("unbound identifier `{0}`")]
    #[diagnostic(
        code(palisade::expr_unbound),
        help("Every identifier a matcher reads must be bound by the request definition, the policy definition, or a registered function")
    )]
    ExprUnbound(String),

    #[error("type error: {0}")]
    #[diagnostic(code(palisade::expr_type))]
    ExprType(String),

    #[error("failed to access policy storage `{path}`")]
    #[diagnostic(code(palisade::adapter_io))]
    AdapterIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation not supported: {0}")]
    #[diagnostic(code(palisade::unsupported))]
    Unsupported(String),
}
