//! Built-in functions available in every expression context.

use chrono::{SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use serde_json::Value;

use super::eval::{format_value, number, EvalError};

/// Unreserved characters under application/x-www-form-urlencoded.
const FORM_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "env" => {
            expect_args(name, args, 1)?;
            let key = format_value(&args[0]);
            Ok(Value::String(std::env::var(key).unwrap_or_default()))
        }
        "uuid" => {
            expect_args(name, args, 0)?;
            Ok(Value::String(random_id()))
        }
        "len" => {
            expect_args(name, args, 1)?;
            match &args[0] {
                Value::Array(items) => Ok(number(items.len() as f64)),
                Value::Object(map) => Ok(number(map.len() as f64)),
                Value::String(text) => Ok(number(text.len() as f64)),
                _ => Err(EvalError::msg("len unsupported for type")),
            }
        }
        "regex" => {
            expect_args(name, args, 2)?;
            let pattern = format_value(&args[0]);
            let regex = regex::Regex::new(&pattern)
                .map_err(|err| EvalError::msg(format!("invalid regex: {err}")))?;
            Ok(Value::Bool(regex.is_match(&format_value(&args[1]))))
        }
        "jsonpath" => {
            expect_args(name, args, 2)?;
            json_path_lookup(&args[0], &format_value(&args[1]))
        }
        "now" => {
            expect_args(name, args, 0)?;
            Ok(Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)))
        }
        "urlencode" => {
            expect_args(name, args, 1)?;
            Ok(Value::String(form_escape(&format_value(&args[0]))))
        }
        _ => Err(EvalError::msg(format!("unknown function {name}"))),
    }
}

fn expect_args(name: &str, args: &[Value], want: usize) -> Result<(), EvalError> {
    if args.len() != want {
        return Err(EvalError::msg(format!(
            "{name} expects {want} argument{}, got {}",
            if want == 1 { "" } else { "s" },
            args.len()
        )));
    }
    Ok(())
}

/// 32 lowercase hex characters from 16 random bytes.
fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// application/x-www-form-urlencoded escaping: unreserved characters
/// pass through, space becomes `+`, everything else is `%XX`.
pub fn form_escape(input: &str) -> String {
    utf8_percent_encode(input, FORM_ESCAPE).to_string().replace("%20", "+")
}

/// Dot-field and integer-index jsonpath subset: `$.a.b[0]`. A path that
/// walks off the data yields null; malformed syntax is an error.
fn json_path_lookup(root: &Value, path: &str) -> Result<Value, EvalError> {
    let bytes = path.as_bytes();
    if bytes.first() != Some(&b'$') {
        return Err(EvalError::msg("jsonpath must start with $"));
    }
    let mut cur = root.clone();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                i += 1;
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                if start == i {
                    return Err(EvalError::msg("invalid jsonpath segment"));
                }
                let key = &path[start..i];
                cur = match cur {
                    Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
                    _ => return Ok(Value::Null),
                };
            }
            b'[' => {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if start == i || i >= bytes.len() || bytes[i] != b']' {
                    return Err(EvalError::msg("invalid jsonpath index"));
                }
                let idx: usize = path[start..i]
                    .parse()
                    .map_err(|_| EvalError::msg("invalid jsonpath index"))?;
                i += 1;
                cur = match cur {
                    Value::Array(items) => items.get(idx).cloned().unwrap_or(Value::Null),
                    _ => return Ok(Value::Null),
                };
            }
            _ => return Err(EvalError::msg("invalid jsonpath syntax")),
        }
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uuid_is_32_lowercase_hex_chars() {
        let Value::String(id) = call("uuid", &[]).unwrap() else { panic!() };
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        let Value::String(other) = call("uuid", &[]).unwrap() else { panic!() };
        assert_ne!(id, other);
    }

    #[test]
    fn len_over_arrays_objects_strings() {
        assert_eq!(call("len", &[json!([1, 2, 3])]).unwrap(), json!(3.0));
        assert_eq!(call("len", &[json!({"a": 1})]).unwrap(), json!(1.0));
        assert_eq!(call("len", &[json!("abcd")]).unwrap(), json!(4.0));
        assert!(call("len", &[json!(5)]).is_err());
    }

    #[test]
    fn env_missing_is_empty_string() {
        assert_eq!(call("env", &[json!("PIPETEST_DEFINITELY_UNSET")]).unwrap(), json!(""));
    }

    #[test]
    fn regex_match() {
        assert_eq!(call("regex", &[json!("^a+$"), json!("aaa")]).unwrap(), json!(true));
        assert_eq!(call("regex", &[json!("^a+$"), json!("b")]).unwrap(), json!(false));
        assert!(call("regex", &[json!("("), json!("x")]).is_err());
    }

    #[test]
    fn jsonpath_navigates_fields_and_indexes() {
        let data = json!({"a": {"b": [{"c": 42}]}});
        assert_eq!(call("jsonpath", &[data.clone(), json!("$.a.b[0].c")]).unwrap(), json!(42));
        assert_eq!(call("jsonpath", &[data.clone(), json!("$.missing")]).unwrap(), Value::Null);
        assert_eq!(call("jsonpath", &[data.clone(), json!("$")]).unwrap(), data);
        assert!(call("jsonpath", &[data, json!("no-dollar")]).is_err());
    }

    #[test]
    fn now_is_utc_rfc3339_with_nanos() {
        let Value::String(ts) = call("now", &[]).unwrap() else { panic!() };
        assert!(ts.ends_with('Z'));
        let parsed = chrono::DateTime::parse_from_rfc3339(&ts).expect("parses back");
        assert_eq!(parsed.timezone().local_minus_utc(), 0);
        // nanosecond precision: fractional part has 9 digits
        let frac = ts.split('.').nth(1).unwrap();
        assert_eq!(frac.trim_end_matches('Z').len(), 9);
    }

    #[test]
    fn urlencode_form_escapes() {
        assert_eq!(call("urlencode", &[json!("a b&c=d")]).unwrap(), json!("a+b%26c%3Dd"));
        assert_eq!(call("urlencode", &[json!("safe-_.~")]).unwrap(), json!("safe-_.~"));
    }

    #[test]
    fn argument_count_mismatch_is_an_error() {
        assert!(call("len", &[]).is_err());
        assert!(call("uuid", &[json!(1)]).is_err());
        assert!(call("jsonpath", &[json!(1)]).is_err());
    }

    #[test]
    fn unknown_function_is_an_error() {
        assert!(call("mystery", &[]).is_err());
    }
}
