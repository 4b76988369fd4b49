//! Path-query sanitizing and evaluation.
//!
//! Models write JMESPath selectors in the `base` and `details` attributes of
//! artifact directives, and they get the quoting wrong in predictable ways:
//!
//! - `[?type=="doc"]` — in JMESPath a double-quoted string is an
//!   *identifier*, so this compares against a field named `doc`. Rewritten
//!   to the raw string literal `[?type=='doc']`.
//! - `[?title~contains(@, "rust")]` — a non-standard "fuzzy contains"
//!   operator. Rewritten to the built-in `[?contains(title, 'rust')]`.
//! - any other leftover `~` token is stripped.
//!
//! [`sanitize_selector`] is pure. [`SelectorCache`] memoizes it up to a
//! fixed capacity and then simply stops caching (no eviction).

use crate::error::ExtractionError;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use tracing::trace;

/// Default number of sanitized selectors kept by [`SelectorCache`].
pub const DEFAULT_SELECTOR_CACHE_CAPACITY: usize = 1000;

static FUZZY_CONTAINS_DOUBLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.]*)\s*~\s*contains\(\s*@\s*,\s*"([^"]*)"\s*\)"#)
        .expect("valid fuzzy-contains pattern")
});

static FUZZY_CONTAINS_SINGLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][\w.]*)\s*~\s*contains\(\s*@\s*,\s*'([^']*)'\s*\)")
        .expect("valid fuzzy-contains pattern")
});

static FUZZY_INFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.]*)\s*~\s*"([^"]*)""#)
        .expect("valid fuzzy-infix pattern")
});

static DOUBLE_QUOTED_COMPARISON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(==|!=)\s*"([^"]*)""#)
        .expect("valid comparison pattern")
});

static LEFTOVER_FUZZY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*~\s*").expect("valid fuzzy-token pattern")
});

/// Quote `value` as a JMESPath raw string literal.
fn raw_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "\\'"))
}

fn contains_call(caps: &Captures<'_>) -> String {
    format!("contains({}, {})", &caps[1], raw_literal(&caps[2]))
}

/// Normalize a model-written selector into valid JMESPath.
///
/// Never fails: a selector with nothing to fix is returned unchanged.
pub fn sanitize_selector(selector: &str) -> String {
    let mut out = FUZZY_CONTAINS_DOUBLE
        .replace_all(selector, contains_call)
        .into_owned();
    out = FUZZY_CONTAINS_SINGLE
        .replace_all(&out, contains_call)
        .into_owned();
    out = FUZZY_INFIX.replace_all(&out, contains_call).into_owned();
    out = DOUBLE_QUOTED_COMPARISON
        .replace_all(&out, |caps: &Captures<'_>| {
            format!("{}{}", &caps[1], raw_literal(&caps[2]))
        })
        .into_owned();
    if out.contains('~') {
        out = LEFTOVER_FUZZY.replace_all(&out, " ").trim().to_string();
    }
    out
}

/// Evaluate an already-sanitized JMESPath `selector` against `data`.
pub fn search(selector: &str, data: &Value) -> Result<Value, ExtractionError> {
    let expr = jmespath::compile(selector).map_err(|e| ExtractionError::Compile {
        selector: selector.to_string(),
        message: e.to_string(),
    })?;
    let found = expr.search(data).map_err(|e| ExtractionError::Evaluate {
        selector: selector.to_string(),
        message: e.to_string(),
    })?;
    serde_json::to_value(&*found).map_err(|e| ExtractionError::Evaluate {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Bounded memo of [`sanitize_selector`] results.
///
/// Once `capacity` distinct selectors are cached, new selectors are
/// sanitized on every call and never inserted. Owned by an
/// [`ArtifactStore`](super::store::ArtifactStore); there is no process-wide
/// cache.
#[derive(Debug)]
pub struct SelectorCache {
    entries: Mutex<HashMap<String, String>>,
    capacity: usize,
}

impl SelectorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Sanitize `selector`, serving from the cache when possible.
    pub fn sanitize(&self, selector: &str) -> String {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = entries.get(selector) {
            return hit.clone();
        }
        let sanitized = sanitize_selector(selector);
        if sanitized != selector {
            trace!(from = selector, to = %sanitized, "sanitized selector");
        }
        if entries.len() < self.capacity {
            entries.insert(selector.to_string(), sanitized.clone());
        }
        sanitized
    }

    /// Sanitize and evaluate `selector` against `data`.
    pub fn search(&self, selector: &str, data: &Value) -> Result<Value, ExtractionError> {
        search(&self.sanitize(selector), data)
    }

    /// Number of cached selectors.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SelectorCache {
    fn default() -> Self {
        Self::new(DEFAULT_SELECTOR_CACHE_CAPACITY)
    }
}
