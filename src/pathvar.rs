//! Path-variable handling for job argv.
//!
//! Clients tokenize their ffmpeg command line before submitting: every
//! argument that referenced a mounted path arrives as a `{variable, subpath}`
//! pair, everything else as a literal. The coordinator only ever sees the
//! variable names; it never joins a variable with a subpath into a path.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One argv token on the wire and in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArgvToken {
    Literal { value: String },
    Var { variable: String, subpath: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgvError {
    #[error("argv must not be empty")]
    Empty,
    #[error("invalid variable name: {0:?}")]
    InvalidVariable(String),
}

/// Variable names match `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate every token and collect the set of referenced variables.
/// Subpaths are opaque: they are neither validated nor normalized here.
pub fn required_variables(argv: &[ArgvToken]) -> Result<BTreeSet<String>, ArgvError> {
    if argv.is_empty() {
        return Err(ArgvError::Empty);
    }

    let mut vars = BTreeSet::new();
    for token in argv {
        if let ArgvToken::Var { variable, .. } = token {
            if !is_valid_variable_name(variable) {
                return Err(ArgvError::InvalidVariable(variable.clone()));
            }
            vars.insert(variable.clone());
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(value: &str) -> ArgvToken {
        ArgvToken::Literal {
            value: value.to_string(),
        }
    }

    fn var(variable: &str, subpath: &str) -> ArgvToken {
        ArgvToken::Var {
            variable: variable.to_string(),
            subpath: subpath.to_string(),
        }
    }

    #[test]
    fn variable_names() {
        assert!(is_valid_variable_name("M"));
        assert!(is_valid_variable_name("_tv"));
        assert!(is_valid_variable_name("media_2"));
        assert!(!is_valid_variable_name(""));
        assert!(!is_valid_variable_name("2fast"));
        assert!(!is_valid_variable_name("a-b"));
        assert!(!is_valid_variable_name("a/b"));
    }

    #[test]
    fn collects_required_variables() {
        let argv = vec![lit("-i"), var("M", "in/a.mkv"), var("TV", "b.mp4"), var("M", "c.mkv")];
        let vars = required_variables(&argv).unwrap();
        assert_eq!(
            vars.into_iter().collect::<Vec<_>>(),
            vec!["M".to_string(), "TV".to_string()]
        );
    }

    #[test]
    fn rejects_empty_argv() {
        assert_eq!(required_variables(&[]), Err(ArgvError::Empty));
    }

    #[test]
    fn rejects_bad_variable() {
        let argv = vec![var("not-ok", "x")];
        assert!(matches!(
            required_variables(&argv),
            Err(ArgvError::InvalidVariable(_))
        ));
    }

    #[test]
    fn wire_format_round_trip() {
        let argv = vec![lit("-i"), var("M", "a.mkv")];
        let json = serde_json::to_string(&argv).unwrap();
        assert!(json.contains(r#""kind":"literal""#));
        assert!(json.contains(r#""kind":"var""#));
        let back: Vec<ArgvToken> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, argv);
    }
}
