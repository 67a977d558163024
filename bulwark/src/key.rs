use std::fmt;
use std::fmt::Write;

use http::Method;
use serde_json::Value;

const SEPARATOR: &str = "::";

/// A deterministic cache key.
///
/// Derived keys have the shape `{path}::{METHOD}::{params}::{body}` where params and
/// body are canonical JSON. Putting the path first lets a mutation invalidate every
/// cached read under a resource path with a single prefix match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(method: &Method, path: &str, params: Option<&Value>, body: Option<&Value>) -> Self {
        let mut key = String::with_capacity(path.len() + 16);
        key.push_str(path);
        key.push_str(SEPARATOR);
        key.push_str(method.as_str());
        key.push_str(SEPARATOR);
        key.push_str(&canonical_or_empty(params));
        key.push_str(SEPARATOR);
        key.push_str(&canonical_or_empty(body));
        Self(key)
    }

    /// Use a caller supplied key verbatim.
    pub fn explicit(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if this key lies under the resource path `prefix`.
    pub fn is_under(&self, prefix: &str) -> bool {
        is_under(&self.0, prefix)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::explicit(raw)
    }
}

/// Segment aware prefix test: `/users` covers `/users`, `/users/7` and
/// `/users::GET::…` but not `/usersettings`.
pub(crate) fn is_under(candidate: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match candidate.strip_prefix(prefix) {
        None => false,
        Some(rest) => {
            rest.is_empty()
                || prefix.ends_with('/')
                || rest.starts_with('/')
                || rest.starts_with('?')
                || rest.starts_with(SEPARATOR)
        }
    }
}

// An absent value, `null` and `{}` all describe "no parameters".
fn canonical_or_empty(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::Object(map)) if map.is_empty() => String::new(),
        Some(value) => canonicalize(value),
    }
}

/// Serialize `value` as compact JSON with object keys sorted at every depth, so two
/// semantically identical values always produce the same string.
///
/// `serde_json::to_string` is not enough on its own: if any crate in the build turns
/// on serde_json's `preserve_order` feature, objects keep insertion order instead.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (name, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a JSON string value yields the quoted, escaped form.
                let _ = write!(out, "{}", Value::String(name.clone()));
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}
