//! Global callables installed at the root scope

use crate::env::Environment;
use crate::error::{RenderError, RenderErrorKind};
use crate::value::{Kwargs, Value, ValueMap};
use std::fmt::Write as _;
use std::rc::Rc;

/// Install the globals into a root environment. The user context is declared
/// afterwards and may shadow any of these.
pub fn install(env: &Rc<Environment>) {
    env.declare("range", Value::builtin("range", global_range));
    env.declare("namespace", Value::builtin("namespace", global_namespace));
    env.declare(
        "raise_exception",
        Value::builtin("raise_exception", global_raise_exception),
    );
    env.declare(
        "strftime_now",
        Value::builtin("strftime_now", global_strftime_now),
    );
}

fn int_at(context: &str, args: &[Value], index: usize) -> Result<i64, RenderError> {
    match args.get(index) {
        Some(Value::Int(v)) => Ok(*v),
        Some(other) => Err(RenderError::type_error(context, "integer", other)),
        None => Err(RenderError::arity_error(context, "1-3", args.len())),
    }
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`,
/// materialized as a sequence.
fn global_range(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    if args.is_empty() || args.len() > 3 {
        return Err(RenderError::arity_error("range", "1-3", args.len()));
    }
    let (start, stop, step) = match args.len() {
        1 => (0, int_at("range", args, 0)?, 1),
        2 => (int_at("range", args, 0)?, int_at("range", args, 1)?, 1),
        _ => (
            int_at("range", args, 0)?,
            int_at("range", args, 1)?,
            int_at("range", args, 2)?,
        ),
    };
    if step == 0 {
        return Err(RenderError::invalid_op("range: step cannot be zero"));
    }
    let mut items = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        items.push(Value::Int(current));
        current = match current.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::array(items))
}

/// `namespace(**kwargs)`: a shared mutable map whose identity survives scope
/// boundaries, letting `{% set ns.attr = ... %}` escape loop-body locality.
fn global_namespace(args: &[Value], kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let mut entries = ValueMap::new();
    if let Some(seed) = args.first() {
        match seed {
            Value::Map(map) => {
                for (key, value) in map.borrow().iter() {
                    entries.insert(key.clone(), value.clone());
                }
            }
            other => return Err(RenderError::type_error("namespace", "mapping", other)),
        }
    }
    if args.len() > 1 {
        return Err(RenderError::arity_error("namespace", "0-1", args.len()));
    }
    for (key, value) in kwargs {
        entries.insert(key.clone(), value.clone());
    }
    Ok(Value::map(entries))
}

/// Abort the render with a message from the template.
fn global_raise_exception(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let message = args
        .first()
        .map(Value::render_string)
        .unwrap_or_else(|| "exception raised from template".to_string());
    Err(RenderErrorKind::Raised(message).into())
}

/// Current wall-clock time formatted with POSIX strftime tokens.
fn global_strftime_now(args: &[Value], _kwargs: &Kwargs, _env: &Rc<Environment>) -> Result<Value, RenderError> {
    let format = match args.first() {
        Some(Value::String(s)) => s,
        Some(other) => return Err(RenderError::type_error("strftime_now", "string", other)),
        None => return Err(RenderError::arity_error("strftime_now", "1", 0)),
    };
    let now = chrono::Local::now();
    let mut out = String::new();
    write!(out, "{}", now.format(format)).map_err(|_| {
        RenderError::invalid_op(format!("strftime_now: invalid format '{}'", format))
    })?;
    Ok(Value::String(out))
}
