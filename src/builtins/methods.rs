//! Bound-method dispatch on string and mapping values
//!
//! Member access resolves these names to a `Callable::Method` holding the
//! receiver; the actual work happens here at call time.

use super::filters::{capitalize_text, title_case};
use crate::env::Environment;
use crate::error::RenderError;
use crate::value::{Kwargs, Value};
use std::rc::Rc;

const STRING_METHODS: &[&str] = &[
    "capitalize",
    "endswith",
    "lower",
    "lstrip",
    "replace",
    "rstrip",
    "split",
    "startswith",
    "strip",
    "title",
    "upper",
];

const MAP_METHODS: &[&str] = &["get", "items", "keys", "values"];

/// Whether `name` is a known method for this receiver type.
pub fn has_method(receiver: &Value, name: &str) -> bool {
    match receiver {
        Value::String(_) => STRING_METHODS.contains(&name),
        Value::Map(_) => MAP_METHODS.contains(&name),
        _ => false,
    }
}

pub fn call_method(
    receiver: &Value,
    name: &str,
    args: &[Value],
    kwargs: &Kwargs,
    _env: &Rc<Environment>,
) -> Result<Value, RenderError> {
    if let Some((kwarg, _)) = kwargs.first() {
        return Err(crate::error::RenderErrorKind::UnknownKeywordArgument {
            context: name.to_string(),
            name: kwarg.clone(),
        }
        .into());
    }
    match receiver {
        Value::String(s) => string_method(s, name, args),
        Value::Map(_) => map_method(receiver, name, args),
        other => Err(RenderError::invalid_op(format!(
            "values of type {} have no methods",
            other.type_name()
        ))),
    }
}

fn str_at<'a>(context: &str, args: &'a [Value], index: usize) -> Result<&'a str, RenderError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(RenderError::type_error(context, "string", other)),
        None => Err(RenderError::arity_error(context, (index + 1).to_string(), args.len())),
    }
}

fn opt_chars(context: &str, args: &[Value]) -> Result<Option<Vec<char>>, RenderError> {
    match args.first() {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.chars().collect())),
        Some(other) => Err(RenderError::type_error(context, "string", other)),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value, RenderError> {
    match name {
        "upper" => Ok(Value::String(s.to_uppercase())),
        "lower" => Ok(Value::String(s.to_lowercase())),
        "title" => Ok(Value::String(title_case(s))),
        "capitalize" => Ok(Value::String(capitalize_text(s))),
        "strip" => Ok(Value::String(match opt_chars("strip", args)? {
            Some(set) => s.trim_matches(|c| set.contains(&c)).to_string(),
            None => s.trim().to_string(),
        })),
        "lstrip" => Ok(Value::String(match opt_chars("lstrip", args)? {
            Some(set) => s.trim_start_matches(|c| set.contains(&c)).to_string(),
            None => s.trim_start().to_string(),
        })),
        "rstrip" => Ok(Value::String(match opt_chars("rstrip", args)? {
            Some(set) => s.trim_end_matches(|c| set.contains(&c)).to_string(),
            None => s.trim_end().to_string(),
        })),
        "split" => {
            let parts: Vec<Value> = match args.first() {
                None | Some(Value::Null) => s
                    .split_whitespace()
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
                Some(Value::String(sep)) => {
                    if sep.is_empty() {
                        return Err(RenderError::invalid_op("split: empty separator"));
                    }
                    match args.get(1) {
                        Some(Value::Int(max)) if *max >= 0 => s
                            .splitn(*max as usize + 1, sep.as_str())
                            .map(|part| Value::String(part.to_string()))
                            .collect(),
                        Some(other) => {
                            return Err(RenderError::type_error("split", "integer", other))
                        }
                        None => s
                            .split(sep.as_str())
                            .map(|part| Value::String(part.to_string()))
                            .collect(),
                    }
                }
                Some(other) => return Err(RenderError::type_error("split", "string", other)),
            };
            Ok(Value::array(parts))
        }
        "replace" => {
            let old = str_at("replace", args, 0)?;
            let new = str_at("replace", args, 1)?;
            match args.get(2) {
                Some(Value::Int(count)) if *count >= 0 => {
                    Ok(Value::String(s.replacen(old, new, *count as usize)))
                }
                Some(other) => Err(RenderError::type_error("replace", "integer", other)),
                None => Ok(Value::String(s.replace(old, new))),
            }
        }
        "startswith" => affix_test("startswith", s, args, |s, p| s.starts_with(p)),
        "endswith" => affix_test("endswith", s, args, |s, p| s.ends_with(p)),
        other => Err(RenderError::invalid_op(format!(
            "unknown string method '{}'",
            other
        ))),
    }
}

/// `startswith`/`endswith` accept a single prefix or a sequence of
/// candidates, matching any.
fn affix_test(
    context: &str,
    s: &str,
    args: &[Value],
    probe: impl Fn(&str, &str) -> bool,
) -> Result<Value, RenderError> {
    match args.first() {
        Some(Value::String(affix)) => Ok(Value::Bool(probe(s, affix))),
        Some(Value::Array(candidates)) => {
            for candidate in candidates.iter() {
                match candidate {
                    Value::String(affix) => {
                        if probe(s, affix) {
                            return Ok(Value::Bool(true));
                        }
                    }
                    other => return Err(RenderError::type_error(context, "string", other)),
                }
            }
            Ok(Value::Bool(false))
        }
        Some(other) => Err(RenderError::type_error(context, "string or sequence", other)),
        None => Err(RenderError::arity_error(context, "1", 0)),
    }
}

fn map_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, RenderError> {
    let Some(entries) = receiver.as_map() else {
        return Err(RenderError::type_error("method call", "mapping", receiver));
    };
    let entries = entries.borrow();
    match name {
        "items" => Ok(Value::array(
            entries
                .iter()
                .map(|(k, v)| Value::array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        "keys" => Ok(Value::array(
            entries
                .keys()
                .map(|k| Value::String(k.clone()))
                .collect(),
        )),
        "values" => Ok(Value::array(entries.values().cloned().collect())),
        "get" => {
            let key = str_at("get", args, 0)?;
            Ok(entries
                .get(key)
                .cloned()
                .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Null)))
        }
        other => Err(RenderError::invalid_op(format!(
            "unknown mapping method '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod method_tests {
    use super::*;
    use crate::value::ValueMap;

    fn call(receiver: Value, name: &str, args: &[Value]) -> Result<Value, RenderError> {
        let env = Environment::new();
        call_method(&receiver, name, args, &Kwargs::new(), &env)
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(
            call(Value::from("hi there"), "upper", &[]).unwrap(),
            Value::from("HI THERE")
        );
        assert_eq!(
            call(Value::from("  pad  "), "strip", &[]).unwrap(),
            Value::from("pad")
        );
        assert_eq!(
            call(Value::from("xxpadxx"), "strip", &[Value::from("x")]).unwrap(),
            Value::from("pad")
        );
        assert_eq!(
            call(Value::from("  pad  "), "lstrip", &[]).unwrap(),
            Value::from("pad  ")
        );
        assert_eq!(
            call(Value::from("a,b,c"), "split", &[Value::from(",")]).unwrap(),
            Value::array(vec![Value::from("a"), Value::from("b"), Value::from("c")])
        );
        assert_eq!(
            call(Value::from("a b\tc"), "split", &[]).unwrap(),
            Value::array(vec![Value::from("a"), Value::from("b"), Value::from("c")])
        );
        assert_eq!(
            call(
                Value::from("a,b,c"),
                "split",
                &[Value::from(","), Value::Int(1)]
            )
            .unwrap(),
            Value::array(vec![Value::from("a"), Value::from("b,c")])
        );
        assert_eq!(
            call(
                Value::from("aaa"),
                "replace",
                &[Value::from("a"), Value::from("b"), Value::Int(2)]
            )
            .unwrap(),
            Value::from("bba")
        );
    }

    #[test]
    fn test_affix_methods() {
        assert_eq!(
            call(Value::from("hello"), "startswith", &[Value::from("he")]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(
                Value::from("hello"),
                "endswith",
                &[Value::array(vec![Value::from("x"), Value::from("lo")])]
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call(Value::from("hello"), "startswith", &[Value::from("x")]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_map_methods_preserve_order() {
        let mut m = ValueMap::new();
        m.insert("z".to_string(), Value::Int(1));
        m.insert("a".to_string(), Value::Int(2));
        let map = Value::map(m);

        assert_eq!(
            call(map.clone(), "keys", &[]).unwrap(),
            Value::array(vec![Value::from("z"), Value::from("a")])
        );
        assert_eq!(
            call(map.clone(), "values", &[]).unwrap(),
            Value::array(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            call(map.clone(), "items", &[]).unwrap(),
            Value::array(vec![
                Value::array(vec![Value::from("z"), Value::Int(1)]),
                Value::array(vec![Value::from("a"), Value::Int(2)]),
            ])
        );
    }

    #[test]
    fn test_map_get_with_default() {
        let mut m = ValueMap::new();
        m.insert("k".to_string(), Value::Int(1));
        let map = Value::map(m);
        assert_eq!(
            call(map.clone(), "get", &[Value::from("k")]).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            call(map.clone(), "get", &[Value::from("missing")]).unwrap(),
            Value::Null
        );
        assert_eq!(
            call(
                map,
                "get",
                &[Value::from("missing"), Value::from("fallback")]
            )
            .unwrap(),
            Value::from("fallback")
        );
    }

    #[test]
    fn test_has_method() {
        assert!(has_method(&Value::from("s"), "upper"));
        assert!(!has_method(&Value::from("s"), "items"));
        assert!(has_method(&Value::map(ValueMap::new()), "items"));
        assert!(!has_method(&Value::Int(1), "upper"));
    }
}
