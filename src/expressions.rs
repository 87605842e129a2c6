//! Placeholder expression resolution
//!
//! Declared arguments and option variables may contain `{{name}}`
//! placeholders which are substituted from the merged scope. Unknown
//! placeholders are left intact so callers can detect unresolved input.

use crate::scope::{value_str, Scope};
use regex::Regex;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").unwrap())
}

/// Check whether a string contains placeholder expression syntax.
pub fn has_expressions(input: &str) -> bool {
    input.contains("{{")
}

/// Substitute every known `{{name}}` placeholder from the scope.
/// Placeholders whose name is not in scope are returned unchanged.
pub fn evaluate(input: &str, scope: &Scope) -> String {
    placeholder_regex()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match scope.get(name) {
                Some(value) => value_str(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Check whether a string still carries placeholders after evaluation.
pub fn has_unresolved(input: &str, scope: &Scope) -> bool {
    let resolved = evaluate(input, scope);
    has_expressions(&resolved)
}

/// Evaluate a DSL predicate against a scope.
///
/// The predicate grammar is a closed set: `lhs == "rhs"`, `lhs != "rhs"`,
/// `contains(lhs, "rhs")` and bare variable truthiness. The left-hand side
/// names a variable in the scope; the right-hand side is a literal, quoted
/// or not. Anything unparsable evaluates to false.
pub fn evaluate_predicate(expr: &str, scope: &Scope) -> bool {
    let expr = expr.trim();

    if let Some((lhs, rhs)) = split_binary(expr, "==") {
        return lookup(scope, lhs).map_or(false, |v| v == rhs);
    }
    if let Some((lhs, rhs)) = split_binary(expr, "!=") {
        return lookup(scope, lhs).map_or(false, |v| v != rhs);
    }
    if let Some(inner) = expr
        .strip_prefix("contains(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        if let Some((lhs, rhs)) = inner.split_once(',') {
            let needle = unquote(rhs.trim());
            return lookup(scope, lhs.trim()).map_or(false, |v| v.contains(&needle));
        }
        return false;
    }

    // bare variable: truthy when present, non-empty and not "false"
    match scope.get(expr) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(value) => {
            let s = value_str(value);
            !s.is_empty() && s != "false"
        }
        None => false,
    }
}

fn split_binary<'a>(expr: &'a str, op: &str) -> Option<(&'a str, String)> {
    let (lhs, rhs) = expr.split_once(op)?;
    Some((lhs.trim(), unquote(rhs.trim())))
}

fn lookup(scope: &Scope, name: &str) -> Option<String> {
    scope.get(name).map(value_str)
}

fn unquote(literal: &str) -> String {
    literal
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| literal.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(literal)
        .to_string()
}
