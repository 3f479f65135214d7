//! Template interpolation and URL assembly.
//!
//! `{{var}}` substitution is a second pass applied to *values* after
//! expression evaluation (and to raw paths before dispatch); it never
//! runs on the expression AST itself.

use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use serde_json::{Map, Value};

use super::builtins::form_escape;
use super::eval::{format_value, EvalError};

static PATH_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static TEMPLATE_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap());

/// Path-segment escaping: unreserved characters pass through, space
/// stays `%20`.
const PATH_SEGMENT_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Substitutes every `{{name}}` placeholder using the provided lookup.
/// An unresolvable name is an error carrying the variable name.
pub fn interpolate_string(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> Result<String, EvalError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in TEMPLATE_VAR_RE.captures_iter(input) {
        let whole = caps.get(0).unwrap();
        let name = &caps[1];
        let value = lookup(name)
            .ok_or_else(|| EvalError::MissingTemplateVar(name.to_string()))?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(&format_value(&value));
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

/// Recursively interpolates `{{name}}` inside strings, arrays and
/// object values.
pub fn interpolate_value(
    value: Value,
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, EvalError> {
    match value {
        Value::String(text) => Ok(Value::String(interpolate_string(&text, lookup)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, lookup)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key, interpolate_value(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

/// Substitutes `:name` path params with URL-escaped variable values.
/// Returns the missing parameter name on failure so the caller can
/// specialize the diagnostic.
pub fn render_path(path: &str, vars: &Map<String, Value>) -> Result<String, String> {
    for caps in PATH_PARAM_RE.captures_iter(path) {
        if !vars.contains_key(&caps[1]) {
            return Err(caps[1].to_string());
        }
    }
    let out = PATH_PARAM_RE.replace_all(path, |caps: &regex::Captures<'_>| {
        let value = vars.get(&caps[1]).expect("checked above");
        utf8_percent_encode(&format_value(value), PATH_SEGMENT_ESCAPE).to_string()
    });
    Ok(out.into_owned())
}

/// Joins a base URL with a path. An absolute path (scheme-prefixed)
/// ignores the base.
pub fn combine_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    if base.is_empty() {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Appends query parameters in insertion order, form-escaped.
pub fn apply_query(url: &str, query: &Map<String, Value>) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    let mut out = String::from(url);
    let mut separator = if url.contains('?') { '&' } else { '?' };
    for (key, value) in query {
        out.push(separator);
        out.push_str(&form_escape(key));
        out.push('=');
        out.push_str(&form_escape(&format_value(value)));
        separator = '&';
    }
    out
}
