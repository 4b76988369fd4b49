//! JSON value hygiene shared by the store and the compressor.
//!
//! Tool results frequently pass through several JSON encode/decode round
//! trips before they reach us (tool → MCP transport → model → directive
//! attribute), leaving string leaves full of `\\n` and `\\\"` sequences.
//! [`clean_value`] collapses those over-escaped sequences in every string
//! leaf. [`is_empty_value`] is the "nothing worth archiving" predicate.

use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::LazyLock;

/// Two or more backslashes followed by an escapable character: the
/// character was escaped more than once.
static OVER_ESCAPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\\{2,}([ntr"'])"#).expect("valid over-escape pattern"));

/// Runs of backslashes left after the control characters are resolved.
static BACKSLASH_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\{2,}").expect("valid backslash-run pattern"));

/// Collapse multiply-escaped control characters and backslashes in `s`.
///
/// A single `\n` (backslash, `n`) is left untouched; it may be meaningful.
pub fn clean_string(s: &str) -> String {
    if !s.contains("\\\\") {
        return s.to_string();
    }
    let resolved = OVER_ESCAPED.replace_all(s, |caps: &Captures<'_>| match &caps[1] {
        "n" => "\n".to_string(),
        "t" => "\t".to_string(),
        "r" => "\r".to_string(),
        other => other.to_string(),
    });
    BACKSLASH_RUN.replace_all(&resolved, "\\").into_owned()
}

/// Apply [`clean_string`] to every string leaf of `value`, in place.
pub fn clean_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("\\\\") {
                *s = clean_string(s);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clean_value),
        Value::Object(map) => map.values_mut().for_each(clean_value),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Whether `value` carries no information: `null`, a blank string, or a
/// collection whose every leaf is itself empty.
///
/// Numbers and booleans (including `0` and `false`) are never empty.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.iter().all(is_empty_value),
        Value::Object(map) => map.values().all(is_empty_value),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn double_escaped_newlines_are_resolved() {
        assert_eq!(clean_string(r"line one\\nline two"), "line one\nline two");
        assert_eq!(clean_string(r"tab\\\there"), "tab\there");
    }

    #[test]
    fn over_escaped_quotes_are_resolved() {
        assert_eq!(clean_string(r#"say \\"hi\\""#), r#"say "hi""#);
    }

    #[test]
    fn backslash_runs_collapse() {
        assert_eq!(clean_string(r"C:\\\\Users"), r"C:\Users");
    }

    #[test]
    fn single_escape_is_kept() {
        assert_eq!(clean_string(r"regex \d and \n"), r"regex \d and \n");
    }

    #[test]
    fn clean_value_walks_nested_leaves() {
        let mut v = json!({
            "title": r"a\\nb",
            "items": [r"x\\ty", 3, null],
            "nested": {"quote": r#"\\"q\\""#}
        });
        clean_value(&mut v);
        assert_eq!(v["title"], "a\nb");
        assert_eq!(v["items"][0], "x\ty");
        assert_eq!(v["items"][1], 3);
        assert_eq!(v["nested"]["quote"], "\"q\"");
    }

    #[test]
    fn emptiness_predicate() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!({})));
        assert!(is_empty_value(&json!({"data": null})));
        assert!(is_empty_value(&json!({"a": "  ", "b": [], "c": {"d": null}})));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!("")));

        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!({"data": {"rows": [1]}})));
        assert!(!is_empty_value(&json!("text")));
    }
}
