use rhai::AST;
use std::error::Error;
use std::fmt;

use super::rhai_engine::{SandboxEngine, SandboxLimits};
use super::{ENTRY_POINT, ENTRY_POINT_ARITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    SyntaxError(String),
    MissingFunction(String),
    InvalidSignature(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::SyntaxError(msg) => write!(f, "Syntax error: {msg}"),
            ValidationError::MissingFunction(func) => {
                write!(f, "Missing required function: {func}")
            }
            ValidationError::InvalidSignature(msg) => {
                write!(f, "Invalid function signature: {msg}")
            }
        }
    }
}

impl Error for ValidationError {}

/// Compiles scripts with the sandbox settings and checks for the entry point.
pub struct RhaiValidator {
    engine: SandboxEngine,
}

impl RhaiValidator {
    pub fn new(limits: &SandboxLimits) -> Self {
        Self {
            engine: SandboxEngine::new(limits),
        }
    }

    /// Validates a transformation script.
    ///
    /// Checks:
    /// 1. Script compiles under the sandbox settings
    /// 2. It defines `modify` taking exactly two parameters
    ///
    /// Runtime behavior is not checked; a script that fails while running is
    /// handled per transaction.
    pub fn validate(&self, script: &str) -> Result<AST, ValidationError> {
        let ast = self
            .engine
            .compile(script)
            .map_err(|e| ValidationError::SyntaxError(e.to_string()))?;

        let arities: Vec<usize> = ast
            .iter_functions()
            .filter(|f| f.name == ENTRY_POINT)
            .map(|f| f.params.len())
            .collect();

        if arities.is_empty() {
            return Err(ValidationError::MissingFunction(format!(
                "{ENTRY_POINT}(request, response)"
            )));
        }
        if !arities.contains(&ENTRY_POINT_ARITY) {
            return Err(ValidationError::InvalidSignature(format!(
                "{ENTRY_POINT} must take {ENTRY_POINT_ARITY} parameters (request, response), found {arities:?}"
            )));
        }

        Ok(ast)
    }
}

impl Default for RhaiValidator {
    fn default() -> Self {
        Self::new(&SandboxLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_script() {
        let validator = RhaiValidator::default();
        let script = r#"
            fn modify(request, response) {
                #{ headers: #{ "x-seen": request["Method"] } }
            }
        "#;

        assert!(validator.validate(script).is_ok());
    }

    #[test]
    fn test_syntax_error() {
        let validator = RhaiValidator::default();
        let script = r#"
            fn modify(request, response) {
                return #{ body: "x"  // Missing closing brace
            }
        "#;

        let result = validator.validate(script);
        assert!(matches!(result, Err(ValidationError::SyntaxError(_))));
    }

    #[test]
    fn test_missing_function() {
        let validator = RhaiValidator::default();
        let script = r#"
            fn transform(request, response) {
                ()
            }
        "#;

        let err = validator.validate(script).unwrap_err();
        assert!(matches!(err, ValidationError::MissingFunction(_)));
        assert!(err.to_string().contains("modify"));
    }

    #[test]
    fn test_name_in_comment_is_not_enough() {
        let validator = RhaiValidator::default();
        let script = "// fn modify(request, response)\nlet x = 1;";
        assert!(matches!(
            validator.validate(script),
            Err(ValidationError::MissingFunction(_))
        ));
    }

    #[test]
    fn test_wrong_arity() {
        let validator = RhaiValidator::default();
        let script = r#"
            fn modify(response) {
                ()
            }
        "#;

        assert!(matches!(
            validator.validate(script),
            Err(ValidationError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_overload_with_correct_arity_is_accepted() {
        let validator = RhaiValidator::default();
        let script = r#"
            fn modify(response) { () }
            fn modify(request, response) { modify(response) }
        "#;

        assert!(validator.validate(script).is_ok());
    }

    #[test]
    fn test_eval_rejected_at_validation() {
        let validator = RhaiValidator::default();
        let script = r#"fn modify(request, response) { eval("()") }"#;
        assert!(matches!(
            validator.validate(script),
            Err(ValidationError::SyntaxError(_))
        ));
    }
}
