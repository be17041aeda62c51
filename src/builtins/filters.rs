//! Filter implementations
//!
//! Every filter has the uniform signature `(args, kwargs, env) -> Value`
//! where `args[0]` is the piped value. Filters that dispatch to other
//! filters or tests (`map`, `select`, ...) go back through the registry so
//! they see exactly the same tables the template does.

use super::{attr_path, bool_option, check_args, str_arg};
use crate::env::Environment;
use crate::error::RenderError;
use crate::value::{BuiltinFn, Kwargs, Value};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

static FILTERS: Lazy<BTreeMap<&'static str, BuiltinFn>> = Lazy::new(|| {
    let mut table: BTreeMap<&'static str, BuiltinFn> = BTreeMap::new();
    table.insert("abs", filter_abs);
    table.insert("capitalize", filter_capitalize);
    table.insert("count", filter_length);
    table.insert("default", filter_default);
    table.insert("d", filter_default);
    table.insert("dictsort", filter_dictsort);
    table.insert("e", filter_escape);
    table.insert("escape", filter_escape);
    table.insert("first", filter_first);
    table.insert("float", filter_float);
    table.insert("indent", filter_indent);
    table.insert("int", filter_int);
    table.insert("items", filter_items);
    table.insert("join", filter_join);
    table.insert("last", filter_last);
    table.insert("length", filter_length);
    table.insert("list", filter_list);
    table.insert("lower", filter_lower);
    table.insert("map", filter_map);
    table.insert("max", filter_max);
    table.insert("min", filter_min);
    table.insert("reject", filter_reject);
    table.insert("rejectattr", filter_rejectattr);
    table.insert("replace", filter_replace);
    table.insert("reverse", filter_reverse);
    table.insert("round", filter_round);
    table.insert("select", filter_select);
    table.insert("selectattr", filter_selectattr);
    table.insert("sort", filter_sort);
    table.insert("string", filter_string);
    table.insert("sum", filter_sum);
    table.insert("title", filter_title);
    table.insert("tojson", filter_tojson);
    table.insert("trim", filter_trim);
    table.insert("unique", filter_unique);
    table.insert("upper", filter_upper);
    table
});

pub fn lookup(name: &str) -> Option<BuiltinFn> {
    FILTERS.get(name).copied()
}

// ============================================================================
// Helpers
// ============================================================================

fn piped<'a>(context: &str, args: &'a [Value]) -> Result<&'a Value, RenderError> {
    args.first()
        .ok_or_else(|| RenderError::arity_error(context, "1", 0))
}

/// The piped value as text; non-strings go through stringification the same
/// way `{{ value }}` would.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.render_string(),
    }
}

fn iterable(context: &str, value: &Value) -> Result<Vec<Value>, RenderError> {
    value
        .iter_values()
        .map_err(|_| RenderError::type_error(context, "iterable", value))
}

/// Ordering used by `sort`, `dictsort`, `min` and `max`: strings compare
/// case-insensitively unless asked otherwise.
fn compare(
    context: &str,
    a: &Value,
    b: &Value,
    case_sensitive: bool,
) -> Result<Ordering, RenderError> {
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) if !case_sensitive => {
            Some(x.to_lowercase().cmp(&y.to_lowercase()))
        }
        _ => a.try_cmp(b),
    };
    ordering.ok_or_else(|| {
        RenderError::invalid_op(format!(
            "{}: values of type {} and {} are not comparable",
            context,
            a.type_name(),
            b.type_name()
        ))
    })
}

pub(crate) fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut boundary = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if boundary {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            boundary = false;
        } else {
            out.push(c);
            boundary = true;
        }
    }
    out
}

pub(crate) fn capitalize_text(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

pub(crate) fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// ============================================================================
// String filters
// ============================================================================

fn filter_upper(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::String(text(piped("upper", args)?).to_uppercase()))
}

fn filter_lower(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::String(text(piped("lower", args)?).to_lowercase()))
}

fn filter_capitalize(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::String(capitalize_text(&text(piped(
        "capitalize",
        args,
    )?))))
}

fn filter_title(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::String(title_case(&text(piped("title", args)?))))
}

fn filter_trim(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    check_args("trim", args, 0, 1)?;
    let s = text(piped("trim", args)?);
    let trimmed = match args.get(1) {
        Some(_) => {
            let set: Vec<char> = str_arg("trim", args, 1)?.chars().collect();
            s.trim_matches(|c| set.contains(&c)).to_string()
        }
        None => s.trim().to_string(),
    };
    Ok(Value::String(trimmed))
}

fn filter_replace(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    check_args("replace", args, 2, 3)?;
    let s = text(piped("replace", args)?);
    let old = str_arg("replace", args, 1)?;
    let new = str_arg("replace", args, 2)?;
    let count = match kwargs.get("count").or_else(|| args.get(3)) {
        Some(Value::Int(n)) if *n >= 0 => Some(*n as usize),
        Some(other) => return Err(RenderError::type_error("replace", "integer", other)),
        None => None,
    };
    let replaced = match count {
        Some(n) => s.replacen(old, new, n),
        None => s.replace(old, new),
    };
    Ok(Value::String(replaced))
}

fn filter_indent(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let s = text(piped("indent", args)?);
    let width = match kwargs.get("width").or_else(|| args.get(1)) {
        Some(Value::Int(n)) if *n >= 0 => *n as usize,
        Some(other) => return Err(RenderError::type_error("indent", "integer", other)),
        None => 4,
    };
    let first = bool_option(kwargs, "first", args, 2, false);
    let blank = bool_option(kwargs, "blank", args, 3, false);
    let pad = " ".repeat(width);
    let out: Vec<String> = s
        .split('\n')
        .enumerate()
        .map(|(i, line)| {
            let wants_indent = i > 0 || first;
            let skip_blank = line.is_empty() && !blank;
            if wants_indent && !skip_blank {
                format!("{}{}", pad, line)
            } else {
                line.to_string()
            }
        })
        .collect();
    Ok(Value::String(out.join("\n")))
}

fn filter_escape(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::String(html_escape(&text(piped("escape", args)?))))
}

// ============================================================================
// Sequence filters
// ============================================================================

fn filter_length(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("length", args)?;
    match value.len() {
        Some(len) => Ok(Value::Int(len as i64)),
        None => Err(RenderError::type_error(
            "length",
            "string, sequence, or mapping",
            value,
        )),
    }
}

fn filter_join(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    check_args("join", args, 0, 1)?;
    let items = iterable("join", piped("join", args)?)?;
    let sep = match args.get(1) {
        Some(_) => str_arg("join", args, 1)?,
        None => "",
    };
    let attribute = match kwargs.get("attribute") {
        Some(Value::String(path)) => Some(path.as_str()),
        Some(other) => return Err(RenderError::type_error("join", "string", other)),
        None => None,
    };
    let parts: Vec<String> = items
        .iter()
        .map(|item| match attribute {
            Some(path) => attr_path(item, path).render_string(),
            None => item.render_string(),
        })
        .collect();
    Ok(Value::String(parts.join(sep)))
}

fn filter_first(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("first", args)?;
    match value {
        Value::String(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Ok(iterable("first", other)?
            .into_iter()
            .next()
            .unwrap_or(Value::Undefined)),
    }
}

fn filter_last(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("last", args)?;
    match value {
        Value::String(s) => Ok(s
            .chars()
            .last()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Undefined)),
        other => Ok(iterable("last", other)?
            .into_iter()
            .last()
            .unwrap_or(Value::Undefined)),
    }
}

fn filter_reverse(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("reverse", args)?;
    match value {
        Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
        other => {
            let mut items = iterable("reverse", other)?;
            items.reverse();
            Ok(Value::array(items))
        }
    }
}

fn filter_sort(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let mut items = iterable("sort", piped("sort", args)?)?;
    let reverse = bool_option(kwargs, "reverse", args, 1, false);
    let case_sensitive = bool_option(kwargs, "case_sensitive", args, 2, false);
    let attribute = match kwargs.get("attribute") {
        Some(Value::String(path)) => Some(path.clone()),
        Some(other) => return Err(RenderError::type_error("sort", "string", other)),
        None => None,
    };
    let key = |item: &Value| match &attribute {
        Some(path) => attr_path(item, path),
        None => item.clone(),
    };
    let mut error = None;
    items.sort_by(|a, b| {
        if error.is_some() {
            return Ordering::Equal;
        }
        match compare("sort", &key(a), &key(b), case_sensitive) {
            Ok(ordering) => ordering,
            Err(e) => {
                error = Some(e);
                Ordering::Equal
            }
        }
    });
    if let Some(error) = error {
        return Err(error);
    }
    if reverse {
        items.reverse();
    }
    Ok(Value::array(items))
}

fn filter_unique(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let items = iterable("unique", piped("unique", args)?)?;
    let case_sensitive = bool_option(kwargs, "case_sensitive", args, 1, false);
    let attribute = match kwargs.get("attribute") {
        Some(Value::String(path)) => Some(path.clone()),
        Some(other) => return Err(RenderError::type_error("unique", "string", other)),
        None => None,
    };
    let mut seen: Vec<Value> = Vec::new();
    let mut out = Vec::new();
    for item in items {
        let mut key = match &attribute {
            Some(path) => attr_path(&item, path),
            None => item.clone(),
        };
        if !case_sensitive {
            if let Value::String(s) = &key {
                key = Value::String(s.to_lowercase());
            }
        }
        if !seen.iter().any(|k| k == &key) {
            seen.push(key);
            out.push(item);
        }
    }
    Ok(Value::array(out))
}

fn filter_list(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::array(iterable("list", piped("list", args)?)?))
}

fn filter_min(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    extremum("min", args, kwargs, Ordering::Less)
}

fn filter_max(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    extremum("max", args, kwargs, Ordering::Greater)
}

fn extremum(
    context: &str,
    args: &[Value],
    kwargs: &Kwargs,
    keep: Ordering,
) -> Result<Value, RenderError> {
    let items = iterable(context, piped(context, args)?)?;
    let case_sensitive = bool_option(kwargs, "case_sensitive", args, 1, false);
    let attribute = match kwargs.get("attribute") {
        Some(Value::String(path)) => Some(path.clone()),
        Some(other) => return Err(RenderError::type_error(context, "string", other)),
        None => None,
    };
    let key = |item: &Value| match &attribute {
        Some(path) => attr_path(item, path),
        None => item.clone(),
    };
    let mut iter = items.into_iter();
    let mut best = iter.next().ok_or_else(|| {
        RenderError::invalid_op(format!("{}: sequence is empty", context))
    })?;
    for item in iter {
        if compare(context, &key(&item), &key(&best), case_sensitive)? == keep {
            best = item;
        }
    }
    Ok(best)
}

fn filter_sum(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let items = iterable("sum", piped("sum", args)?)?;
    let attribute = match kwargs.get("attribute").or_else(|| args.get(1)) {
        Some(Value::String(path)) => Some(path.clone()),
        Some(other) => return Err(RenderError::type_error("sum", "string", other)),
        None => None,
    };
    let mut acc = kwargs
        .get("start")
        .or_else(|| args.get(2))
        .cloned()
        .unwrap_or(Value::Int(0));
    for item in items {
        let term = match &attribute {
            Some(path) => attr_path(&item, path),
            None => item,
        };
        acc = acc.add(&term)?;
    }
    Ok(acc)
}

// ============================================================================
// Mapping filters
// ============================================================================

fn filter_items(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("items", args)?;
    match value {
        Value::Map(entries) => Ok(Value::array(
            entries
                .borrow()
                .iter()
                .map(|(k, v)| Value::array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        // chat templates probe optional mappings, so absent input is empty
        Value::Undefined => Ok(Value::array(Vec::new())),
        other => Err(RenderError::type_error("items", "mapping", other)),
    }
}

fn filter_dictsort(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("dictsort", args)?;
    let entries = match value {
        Value::Map(entries) => entries,
        other => return Err(RenderError::type_error("dictsort", "mapping", other)),
    };
    let case_sensitive = bool_option(kwargs, "case_sensitive", args, 1, false);
    let by = match kwargs.get("by").or_else(|| args.get(2)) {
        Some(Value::String(by)) if by == "key" || by == "value" => by.clone(),
        Some(other) => {
            return Err(RenderError::invalid_op(format!(
                "dictsort: sort by 'key' or 'value', not {}",
                other.render_string()
            )))
        }
        None => "key".to_string(),
    };
    let reverse = bool_option(kwargs, "reverse", args, 3, false);
    let mut pairs: Vec<(String, Value)> = entries
        .borrow()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut error = None;
    pairs.sort_by(|a, b| {
        if error.is_some() {
            return Ordering::Equal;
        }
        let (left, right) = if by == "key" {
            (Value::String(a.0.clone()), Value::String(b.0.clone()))
        } else {
            (a.1.clone(), b.1.clone())
        };
        match compare("dictsort", &left, &right, case_sensitive) {
            Ok(ordering) => ordering,
            Err(e) => {
                error = Some(e);
                Ordering::Equal
            }
        }
    });
    if let Some(error) = error {
        return Err(error);
    }
    if reverse {
        pairs.reverse();
    }
    Ok(Value::array(
        pairs
            .into_iter()
            .map(|(k, v)| Value::array(vec![Value::String(k), v]))
            .collect(),
    ))
}

// ============================================================================
// Numeric filters
// ============================================================================

fn filter_abs(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    match piped("abs", args)? {
        Value::Int(v) => v
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| RenderError::invalid_op("abs: integer overflow")),
        Value::Float(v) => Ok(Value::Float(v.abs())),
        other => Err(RenderError::type_error("abs", "number", other)),
    }
}

fn filter_round(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("round", args)?;
    let v = value
        .as_f64()
        .ok_or_else(|| RenderError::type_error("round", "number", value))?;
    let precision = match kwargs.get("precision").or_else(|| args.get(1)) {
        Some(Value::Int(p)) => *p,
        Some(other) => return Err(RenderError::type_error("round", "integer", other)),
        None => 0,
    };
    let factor = 10f64.powi(precision as i32);
    Ok(Value::Float((v * factor).round() / factor))
}

fn filter_int(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let fallback = || {
        kwargs
            .get("default")
            .or_else(|| args.get(1))
            .cloned()
            .unwrap_or(Value::Int(0))
    };
    let value = piped("int", args)?;
    Ok(match value {
        Value::Int(v) => Value::Int(*v),
        Value::Float(v) => Value::Int(*v as i64),
        Value::Bool(b) => Value::Int(*b as i64),
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(v) => Value::Int(v),
                Err(_) => match s.parse::<f64>() {
                    Ok(v) => Value::Int(v as i64),
                    Err(_) => fallback(),
                },
            }
        }
        _ => fallback(),
    })
}

fn filter_float(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let fallback = || {
        kwargs
            .get("default")
            .or_else(|| args.get(1))
            .cloned()
            .unwrap_or(Value::Float(0.0))
    };
    let value = piped("float", args)?;
    Ok(match value {
        Value::Int(v) => Value::Float(*v as f64),
        Value::Float(v) => Value::Float(*v),
        Value::Bool(b) => Value::Float(*b as i64 as f64),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => Value::Float(v),
            Err(_) => fallback(),
        },
        _ => fallback(),
    })
}

// ============================================================================
// Conversion and defaulting
// ============================================================================

fn filter_string(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    Ok(Value::String(text(piped("string", args)?)))
}

fn filter_default(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    check_args("default", args, 0, 2)?;
    let value = piped("default", args)?;
    let fallback = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()));
    let boolean = bool_option(kwargs, "boolean", args, 2, false);
    let use_fallback = value.is_undefined() || (boolean && !value.is_truthy());
    Ok(if use_fallback {
        fallback
    } else {
        value.clone()
    })
}

fn filter_tojson(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let value = piped("tojson", args)?;
    let indent = match kwargs.get("indent").or_else(|| args.get(1)) {
        Some(Value::Int(n)) if *n >= 0 => Some(*n as usize),
        Some(Value::Null) | None => None,
        Some(other) => return Err(RenderError::type_error("tojson", "integer", other)),
    };
    let rendered = match indent {
        None => serde_json::to_string(value),
        Some(width) => {
            let indent = " ".repeat(width).into_bytes();
            let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
            let mut buf = Vec::new();
            let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
            value
                .serialize(&mut serializer)
                .map(|()| String::from_utf8_lossy(&buf).into_owned())
        }
    };
    rendered
        .map(Value::String)
        .map_err(|e| RenderError::invalid_op(format!("tojson: {}", e)))
}

// ============================================================================
// Higher-order filters
// ============================================================================

fn filter_map(args: &[Value], kwargs: &Kwargs, env: &Rc<Environment>) -> Result<Value, RenderError> {
    let items = iterable("map", piped("map", args)?)?;
    if let Some(attribute) = kwargs.get("attribute") {
        let path = match attribute {
            Value::String(path) => path,
            other => return Err(RenderError::type_error("map", "string", other)),
        };
        let default = kwargs.get("default").cloned();
        let out = items
            .iter()
            .map(|item| {
                let value = attr_path(item, path);
                if value.is_undefined() {
                    default.clone().unwrap_or(Value::Undefined)
                } else {
                    value
                }
            })
            .collect();
        return Ok(Value::array(out));
    }
    let name = str_arg("map", args, 1)?;
    let extra = &args[2..];
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let mut call_args = Vec::with_capacity(extra.len() + 1);
        call_args.push(item);
        call_args.extend(extra.iter().cloned());
        out.push(super::apply_filter(name, &call_args, kwargs, env)?);
    }
    Ok(Value::array(out))
}

fn filter_select(args: &[Value], kwargs: &Kwargs, env: &Rc<Environment>) -> Result<Value, RenderError> {
    select_impl("select", args, kwargs, env, true)
}

fn filter_reject(args: &[Value], kwargs: &Kwargs, env: &Rc<Environment>) -> Result<Value, RenderError> {
    select_impl("reject", args, kwargs, env, false)
}

fn select_impl(
    context: &str,
    args: &[Value],
    kwargs: &Kwargs,
    env: &Rc<Environment>,
    keep: bool,
) -> Result<Value, RenderError> {
    let items = iterable(context, piped(context, args)?)?;
    let test = match args.get(1) {
        None => None,
        Some(Value::String(name)) => Some(name.as_str()),
        Some(other) => return Err(RenderError::type_error(context, "test name", other)),
    };
    let extra = if args.len() > 2 { &args[2..] } else { &[] };
    let mut out = Vec::new();
    for item in items {
        let passed = match test {
            None => item.is_truthy(),
            Some(name) => {
                let mut call_args = Vec::with_capacity(extra.len() + 1);
                call_args.push(item.clone());
                call_args.extend(extra.iter().cloned());
                super::apply_test(name, &call_args, kwargs, env)?
            }
        };
        if passed == keep {
            out.push(item);
        }
    }
    Ok(Value::array(out))
}

fn filter_selectattr(args: &[Value], kwargs: &Kwargs, env: &Rc<Environment>) -> Result<Value, RenderError> {
    selectattr_impl("selectattr", args, kwargs, env, true)
}

fn filter_rejectattr(args: &[Value], kwargs: &Kwargs, env: &Rc<Environment>) -> Result<Value, RenderError> {
    selectattr_impl("rejectattr", args, kwargs, env, false)
}

fn selectattr_impl(
    context: &str,
    args: &[Value],
    kwargs: &Kwargs,
    env: &Rc<Environment>,
    keep: bool,
) -> Result<Value, RenderError> {
    let items = iterable(context, piped(context, args)?)?;
    let path = str_arg(context, args, 1)?;
    let test = match args.get(2) {
        None => None,
        Some(Value::String(name)) => Some(name.as_str()),
        Some(other) => return Err(RenderError::type_error(context, "test name", other)),
    };
    let extra = if args.len() > 3 { &args[3..] } else { &[] };
    let mut out = Vec::new();
    for item in items {
        let subject = attr_path(&item, path);
        let passed = match test {
            None => subject.is_truthy(),
            Some(name) => {
                let mut call_args = Vec::with_capacity(extra.len() + 1);
                call_args.push(subject);
                call_args.extend(extra.iter().cloned());
                super::apply_test(name, &call_args, kwargs, env)?
            }
        };
        if passed == keep {
            out.push(item);
        }
    }
    Ok(Value::array(out))
}

#[cfg(test)]
mod filter_tests {
    use super::*;
    use crate::value::ValueMap;

    fn call(name: &str, args: &[Value]) -> Result<Value, RenderError> {
        let env = Environment::new();
        lookup(name).expect("filter should exist")(args, &Kwargs::new(), &env)
    }

    fn call_kw(name: &str, args: &[Value], kwargs: &[(&str, Value)]) -> Result<Value, RenderError> {
        let env = Environment::new();
        let kwargs: Kwargs = kwargs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        lookup(name).expect("filter should exist")(args, &kwargs, &env)
    }

    fn arr(items: Vec<Value>) -> Value {
        Value::array(items)
    }

    #[test]
    fn test_case_filters() {
        assert_eq!(
            call("upper", &[Value::from("héllo")]).unwrap(),
            Value::from("HÉLLO")
        );
        assert_eq!(
            call("capitalize", &[Value::from("hELLO world")]).unwrap(),
            Value::from("Hello world")
        );
        assert_eq!(
            call("title", &[Value::from("hello-world again")]).unwrap(),
            Value::from("Hello-World Again")
        );
    }

    #[test]
    fn test_upper_is_idempotent() {
        let once = call("upper", &[Value::from("MiXed")]).unwrap();
        let twice = call("upper", &[once.clone()]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_trim_with_custom_chars() {
        assert_eq!(
            call("trim", &[Value::from("  x  ")]).unwrap(),
            Value::from("x")
        );
        assert_eq!(
            call("trim", &[Value::from("--x--"), Value::from("-")]).unwrap(),
            Value::from("x")
        );
    }

    #[test]
    fn test_length_counts_code_points() {
        assert_eq!(
            call("length", &[Value::from("héllo")]).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            call("length", &[arr(vec![Value::Int(1), Value::Int(2)])]).unwrap(),
            Value::Int(2)
        );
        assert!(call("length", &[Value::Int(3)]).is_err());
    }

    #[test]
    fn test_join_with_attribute() {
        let users = arr(vec![
            Value::map(
                [("name".to_string(), Value::from("a"))]
                    .into_iter()
                    .collect::<ValueMap>(),
            ),
            Value::map(
                [("name".to_string(), Value::from("b"))]
                    .into_iter()
                    .collect::<ValueMap>(),
            ),
        ]);
        assert_eq!(
            call_kw(
                "join",
                &[users, Value::from(", ")],
                &[("attribute", Value::from("name"))]
            )
            .unwrap(),
            Value::from("a, b")
        );
    }

    #[test]
    fn test_sort_default_is_case_insensitive() {
        let out = call(
            "sort",
            &[arr(vec![
                Value::from("Banana"),
                Value::from("apple"),
                Value::from("cherry"),
            ])],
        )
        .unwrap();
        assert_eq!(
            out,
            arr(vec![
                Value::from("apple"),
                Value::from("Banana"),
                Value::from("cherry"),
            ])
        );
    }

    #[test]
    fn test_sort_by_attribute_and_reverse() {
        let mk = |n: i64| {
            Value::map(
                [("rank".to_string(), Value::Int(n))]
                    .into_iter()
                    .collect::<ValueMap>(),
            )
        };
        let out = call_kw(
            "sort",
            &[arr(vec![mk(2), mk(3), mk(1)])],
            &[("attribute", Value::from("rank")), ("reverse", Value::Bool(true))],
        )
        .unwrap();
        let ranks: Vec<Value> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m.get_attr("rank").unwrap())
            .collect();
        assert_eq!(ranks, vec![Value::Int(3), Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let input = arr(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        let once = call("sort", &[input]).unwrap();
        let twice = call("sort", &[once.clone()]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unique_keeps_first_occurrence() {
        let out = call(
            "unique",
            &[arr(vec![
                Value::from("a"),
                Value::from("A"),
                Value::from("b"),
                Value::from("a"),
            ])],
        )
        .unwrap();
        assert_eq!(out, arr(vec![Value::from("a"), Value::from("b")]));
    }

    #[test]
    fn test_first_last_and_empty() {
        let items = arr(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(call("first", &[items.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("last", &[items]).unwrap(), Value::Int(2));
        assert_eq!(call("first", &[arr(vec![])]).unwrap(), Value::Undefined);
        assert_eq!(call("first", &[Value::from("xy")]).unwrap(), Value::from("x"));
    }

    #[test]
    fn test_numeric_filters() {
        assert_eq!(call("abs", &[Value::Int(-3)]).unwrap(), Value::Int(3));
        assert_eq!(
            call("round", &[Value::Float(2.345), Value::Int(2)]).unwrap(),
            Value::Float(2.35)
        );
        assert_eq!(call("round", &[Value::Float(2.5)]).unwrap(), Value::Float(3.0));
        assert_eq!(call("int", &[Value::from("42")]).unwrap(), Value::Int(42));
        assert_eq!(call("int", &[Value::from("32.7")]).unwrap(), Value::Int(32));
        assert_eq!(call("int", &[Value::from("nope")]).unwrap(), Value::Int(0));
        assert_eq!(
            call("int", &[Value::from("nope"), Value::Int(-1)]).unwrap(),
            Value::Int(-1)
        );
        assert_eq!(
            call("float", &[Value::from("2.5")]).unwrap(),
            Value::Float(2.5)
        );
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(
            call("default", &[Value::Undefined, Value::from("d")]).unwrap(),
            Value::from("d")
        );
        assert_eq!(
            call("default", &[Value::from(""), Value::from("d")]).unwrap(),
            Value::from("")
        );
        assert_eq!(
            call_kw(
                "default",
                &[Value::from(""), Value::from("d")],
                &[("boolean", Value::Bool(true))]
            )
            .unwrap(),
            Value::from("d")
        );
    }

    #[test]
    fn test_tojson_preserves_map_order() {
        let mut m = ValueMap::new();
        m.insert("z".to_string(), Value::Int(1));
        m.insert("a".to_string(), Value::from("x"));
        assert_eq!(
            call("tojson", &[Value::map(m)]).unwrap(),
            Value::from(r#"{"z":1,"a":"x"}"#)
        );
    }

    #[test]
    fn test_tojson_roundtrip_is_exact() {
        let mut m = ValueMap::new();
        m.insert("n".to_string(), Value::Null);
        m.insert("i".to_string(), Value::Int(3));
        m.insert("f".to_string(), Value::Float(1.5));
        m.insert("s".to_string(), Value::from("text"));
        m.insert("a".to_string(), arr(vec![Value::Bool(true)]));
        let encoded = call("tojson", &[Value::map(m)]).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(encoded.as_str().unwrap()).expect("valid json");
        assert_eq!(parsed["i"], serde_json::json!(3));
        assert_eq!(parsed["f"], serde_json::json!(1.5));
        assert_eq!(parsed["a"][0], serde_json::json!(true));
        assert!(parsed["n"].is_null());
    }

    #[test]
    fn test_dictsort_sorts_by_key_by_default() {
        let mut m = ValueMap::new();
        m.insert("b".to_string(), Value::Int(2));
        m.insert("A".to_string(), Value::Int(1));
        let out = call("dictsort", &[Value::map(m)]).unwrap();
        let keys: Vec<Value> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|pair| pair.get_item(&Value::Int(0)))
            .collect();
        assert_eq!(keys, vec![Value::from("A"), Value::from("b")]);
    }

    #[test]
    fn test_sum_with_attribute_and_promotion() {
        assert_eq!(
            call("sum", &[arr(vec![Value::Int(1), Value::Int(2)])]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            call("sum", &[arr(vec![Value::Int(1), Value::Float(0.5)])]).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn test_map_with_filter_name() {
        let out = call(
            "map",
            &[
                arr(vec![Value::from("a"), Value::from("b")]),
                Value::from("upper"),
            ],
        )
        .unwrap();
        assert_eq!(out, arr(vec![Value::from("A"), Value::from("B")]));
    }

    #[test]
    fn test_map_with_attribute_and_default() {
        let mk = |name: Option<&str>| {
            let mut m = ValueMap::new();
            if let Some(name) = name {
                m.insert("name".to_string(), Value::from(name));
            }
            Value::map(m)
        };
        let out = call_kw(
            "map",
            &[arr(vec![mk(Some("a")), mk(None)])],
            &[("attribute", Value::from("name")), ("default", Value::from("?"))],
        )
        .unwrap();
        assert_eq!(out, arr(vec![Value::from("a"), Value::from("?")]));
    }

    #[test]
    fn test_select_and_reject() {
        let nums = arr((1..=4).map(Value::Int).collect());
        assert_eq!(
            call("select", &[nums.clone(), Value::from("even")]).unwrap(),
            arr(vec![Value::Int(2), Value::Int(4)])
        );
        assert_eq!(
            call("reject", &[nums.clone(), Value::from("even")]).unwrap(),
            arr(vec![Value::Int(1), Value::Int(3)])
        );
        // with no test, plain truthiness
        let mixed = arr(vec![Value::Int(0), Value::Int(7), Value::from("")]);
        assert_eq!(call("select", &[mixed]).unwrap(), arr(vec![Value::Int(7)]));
    }

    #[test]
    fn test_selectattr() {
        let mk = |role: &str| {
            let mut m = ValueMap::new();
            m.insert("role".to_string(), Value::from(role));
            Value::map(m)
        };
        let msgs = arr(vec![mk("user"), mk("assistant"), mk("user")]);
        let out = call(
            "selectattr",
            &[
                msgs,
                Value::from("role"),
                Value::from("equalto"),
                Value::from("user"),
            ],
        )
        .unwrap();
        assert_eq!(out.len(), Some(2));
    }

    #[test]
    fn test_escape() {
        assert_eq!(
            call("escape", &[Value::from("<a href=\"x\">&'")]).unwrap(),
            Value::from("&lt;a href=&#34;x&#34;&gt;&amp;&#39;")
        );
    }

    #[test]
    fn test_indent() {
        assert_eq!(
            call("indent", &[Value::from("a\nb"), Value::Int(2)]).unwrap(),
            Value::from("a\n  b")
        );
        assert_eq!(
            call_kw(
                "indent",
                &[Value::from("a\nb"), Value::Int(2)],
                &[("first", Value::Bool(true))]
            )
            .unwrap(),
            Value::from("  a\n  b")
        );
    }

    #[test]
    fn test_reverse_filter() {
        assert_eq!(
            call("reverse", &[Value::from("abc")]).unwrap(),
            Value::from("cba")
        );
        assert_eq!(
            call("reverse", &[arr(vec![Value::Int(1), Value::Int(2)])]).unwrap(),
            arr(vec![Value::Int(2), Value::Int(1)])
        );
    }

    #[test]
    fn test_min_max() {
        let nums = arr(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(call("min", &[nums.clone()]).unwrap(), Value::Int(1));
        assert_eq!(call("max", &[nums]).unwrap(), Value::Int(3));
        assert!(call("min", &[arr(vec![])]).is_err());
    }

    #[test]
    fn test_unknown_filter_is_not_registered() {
        assert!(lookup("frobnicate").is_none());
    }
}
