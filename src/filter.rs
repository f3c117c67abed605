//! Sensitive-parameter filtering.
//!
//! Request parameters attached to error reports are scrubbed before they
//! leave the process. Keys are matched either by a case-insensitive
//! substring or by a caller-supplied regex; matching values are replaced
//! with a `"[FILTERED]"` literal at any nesting depth.

use regex::Regex;
use serde_json::{json, Map, Value};

/// Replacement written over any value whose key matches a filter.
pub const FILTERED: &str = "[FILTERED]";

/// Maximum recursion depth before a subtree is replaced wholesale.
const MAX_DEPTH: usize = 10;

/// Maximum number of elements retained from a sequence value.
const MAX_SEQUENCE_LEN: usize = 100;

/// Key names filtered by default.
pub const DEFAULT_FILTERED_KEYS: &[&str] = &[
    "password",
    "password_confirmation",
    "token",
    "secret",
    "api_key",
    "access_token",
];

/// A single key-matching rule.
#[derive(Debug, Clone)]
pub enum FilterPattern {
    /// Case-insensitive substring match against the key.
    Literal(String),
    /// Regex match against the key.
    Pattern(Regex),
}

impl FilterPattern {
    fn is_match(&self, key: &str) -> bool {
        match self {
            FilterPattern::Literal(needle) => {
                key.to_lowercase().contains(&needle.to_lowercase())
            }
            FilterPattern::Pattern(re) => re.is_match(key),
        }
    }
}

impl From<&str> for FilterPattern {
    fn from(s: &str) -> Self {
        FilterPattern::Literal(s.to_string())
    }
}

impl From<String> for FilterPattern {
    fn from(s: String) -> Self {
        FilterPattern::Literal(s)
    }
}

impl From<Regex> for FilterPattern {
    fn from(re: Regex) -> Self {
        FilterPattern::Pattern(re)
    }
}

/// The default filter set.
pub fn default_filters() -> Vec<FilterPattern> {
    DEFAULT_FILTERED_KEYS
        .iter()
        .map(|k| FilterPattern::from(*k))
        .collect()
}

/// Filter a parameter tree.
///
/// Returns `None` when `params` is not a JSON object; error events store
/// non-mapping parameters as absent.
pub fn filter_params(params: &Value, filters: &[FilterPattern]) -> Option<Value> {
    match params {
        Value::Object(map) => Some(filter_map(map, filters, 0)),
        _ => None,
    }
}

fn filter_map(map: &Map<String, Value>, filters: &[FilterPattern], depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return json!({ "__truncated__": "max depth exceeded" });
    }

    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if filters.iter().any(|f| f.is_match(key)) {
            out.insert(key.clone(), Value::String(FILTERED.to_string()));
            continue;
        }
        let filtered = match value {
            Value::Object(nested) => filter_map(nested, filters, depth + 1),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .take(MAX_SEQUENCE_LEN)
                    .map(|item| match item {
                        Value::Object(nested) => filter_map(nested, filters, depth + 1),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            other => other.clone(),
        };
        out.insert(key.clone(), filtered);
    }
    Value::Object(out)
}
