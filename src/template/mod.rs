//! String templating for command vectors and configuration fields.
//!
//! Two independent substitution passes run over a pattern:
//!
//! 1. `${NAME}` is replaced with the stringified context entry `NAME`;
//! 2. `$[NAME]` is replaced with the process environment variable `NAME`.
//!
//! Unknown names in either pass become the literal text `"None"`, the
//! absent-value sentinel. An optional third pass hands the fully
//! substituted string to the bounded constant-expression evaluator in
//! [`expr`].
//!
//! # Examples
//!
//! ```rust
//! use taskforge::template::{expand, TemplateContext};
//!
//! let mut context = TemplateContext::new();
//! context.insert("who".to_string(), "world".into());
//!
//! assert_eq!(expand("hello ${who}", &context), "hello world");
//! assert_eq!(expand("hello ${nobody}", &context), "hello None");
//! ```

pub mod expr;

use std::env;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::Result;

/// The literal substituted for unknown context or environment names.
pub const ABSENT: &str = "None";

/// Ordered name → value mapping used as the substitution context.
pub type TemplateContext = IndexMap<String, Value>;

/// How far to take a stored string when it is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Evaluate {
    /// Return the string verbatim.
    #[default]
    None,
    /// Run the `${}` and `$[]` substitution passes.
    Simple,
    /// Substitute, then evaluate as a constant expression.
    Full,
}

static CONTEXT_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid context placeholder regex"));

static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\[([A-Za-z0-9_]+)\]").expect("valid env placeholder regex"));

static CONTEXT_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_]+)=(.+)$").expect("valid context entry regex"));

/// Stringify a JSON value the way it should appear inside a command line.
///
/// Strings render without quotes, `null` renders as the absent-value
/// sentinel, everything else uses its JSON rendering.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => ABSENT.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Run the two substitution passes over `pattern`.
pub fn expand(pattern: &str, context: &TemplateContext) -> String {
    let pass1 = CONTEXT_VAR.replace_all(pattern, |caps: &Captures<'_>| {
        context
            .get(&caps[1])
            .map_or_else(|| ABSENT.to_string(), stringify)
    });
    ENV_VAR
        .replace_all(&pass1, |caps: &Captures<'_>| {
            env::var(&caps[1]).unwrap_or_else(|_| ABSENT.to_string())
        })
        .into_owned()
}

/// Retrieve `pattern` at the requested evaluation level.
///
/// `Evaluate::None` and `Evaluate::Simple` always yield a string value;
/// `Evaluate::Full` yields whatever the constant expression produces.
pub fn expand_value(pattern: &str, context: &TemplateContext, evaluate: Evaluate) -> Result<Value> {
    match evaluate {
        Evaluate::None => Ok(Value::String(pattern.to_string())),
        Evaluate::Simple => Ok(Value::String(expand(pattern, context))),
        Evaluate::Full => {
            let substituted = expand(pattern, context);
            Ok(expr::eval(&substituted)?.into_json())
        },
    }
}

/// Build a substitution context from command-line style tokens.
///
/// Tokens of the form `NAME=VALUE` become string entries; bare tokens
/// become boolean-true flags.
///
/// # Examples
///
/// ```rust
/// use taskforge::template::prepare_context;
///
/// let context = prepare_context(&["env=prod".to_string(), "verbose".to_string()]);
/// assert_eq!(context["env"], "prod");
/// assert_eq!(context["verbose"], true);
/// ```
pub fn prepare_context(args: &[String]) -> TemplateContext {
    let mut context = TemplateContext::new();
    for arg in args {
        if let Some(caps) = CONTEXT_ENTRY.captures(arg) {
            context.insert(caps[1].to_string(), Value::String(caps[2].to_string()));
        } else {
            context.insert(arg.clone(), Value::Bool(true));
        }
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_of(pairs: &[(&str, Value)]) -> TemplateContext {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_context_substitution() {
        let context = context_of(&[("a", Value::String("x".into()))]);
        assert_eq!(expand("${a}", &context), "x");
        assert_eq!(expand("pre ${a} post", &context), "pre x post");
    }

    #[test]
    fn test_unknown_names_become_sentinel() {
        let context = TemplateContext::new();
        assert_eq!(expand("${missing}", &context), "None");
        assert_eq!(expand("$[TASKFORGE_SURELY_UNSET_VAR]", &context), "None");
    }

    #[test]
    fn test_env_substitution() {
        env::set_var("TASKFORGE_TEST_HOME", "home");
        let context = context_of(&[("a", Value::String("x".into()))]);
        let parts: Vec<String> = ["${a}", "$[TASKFORGE_TEST_HOME]"]
            .iter()
            .map(|p| expand(p, &context))
            .collect();
        assert_eq!(parts, vec!["x".to_string(), "home".to_string()]);
    }

    #[test]
    fn test_non_string_values_stringify() {
        let context = context_of(&[
            ("n", Value::from(3)),
            ("flag", Value::Bool(true)),
            ("nothing", Value::Null),
        ]);
        assert_eq!(expand("${n} ${flag} ${nothing}", &context), "3 true None");
    }

    #[test]
    fn test_expand_value_levels() {
        let context = context_of(&[("n", Value::from(4))]);
        let raw = expand_value("${n} + 1", &context, Evaluate::None).unwrap();
        assert_eq!(raw, Value::String("${n} + 1".into()));

        let simple = expand_value("${n} + 1", &context, Evaluate::Simple).unwrap();
        assert_eq!(simple, Value::String("4 + 1".into()));

        let full = expand_value("${n} + 1", &context, Evaluate::Full).unwrap();
        assert_eq!(full, Value::from(5));
    }

    #[test]
    fn test_prepare_context_shapes() {
        let args: Vec<String> = ["k=v", "flag", "x=1=2", "BAD-NAME=v"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let context = prepare_context(&args);
        assert_eq!(context["k"], "v");
        assert_eq!(context["flag"], true);
        // Only the first '=' splits name from value.
        assert_eq!(context["x"], "1=2");
        // A token whose head is not a valid name is a bare flag.
        assert_eq!(context["BAD-NAME=v"], true);
    }
}
