// ABOUTME: Builtin registry: filter/test/global tables and bound-method dispatch

pub mod filters;
pub mod globals;
pub mod methods;

use crate::env::Environment;
use crate::error::RenderError;
use crate::value::{Kwargs, Value};
use std::rc::Rc;

/// Signature of a registered test predicate.
pub type TestFn = fn(&[Value], &Kwargs, &Rc<Environment>) -> Result<bool, RenderError>;

/// Apply a named filter. `args[0]` is the piped value.
pub fn apply_filter(
    name: &str,
    args: &[Value],
    kwargs: &Kwargs,
    env: &Rc<Environment>,
) -> Result<Value, RenderError> {
    match filters::lookup(name) {
        Some(filter) => filter(args, kwargs, env),
        None => Err(RenderError::unknown_filter(name)),
    }
}

/// Apply a named test. `args[0]` is the tested value.
pub fn apply_test(
    name: &str,
    args: &[Value],
    kwargs: &Kwargs,
    env: &Rc<Environment>,
) -> Result<bool, RenderError> {
    match tests::lookup(name) {
        Some(test) => test(args, kwargs, env),
        None => Err(RenderError::unknown_test(name)),
    }
}

pub fn has_filter(name: &str) -> bool {
    filters::lookup(name).is_some()
}

pub fn has_test(name: &str) -> bool {
    tests::lookup(name).is_some()
}

// ============================================================================
// Shared argument helpers
// ============================================================================

/// Check the number of caller-visible arguments (excluding the piped value
/// at index 0 for filters/tests).
pub(crate) fn check_args(
    context: &str,
    args: &[Value],
    min_user: usize,
    max_user: usize,
) -> Result<(), RenderError> {
    let given = args.len().saturating_sub(1);
    if given < min_user || given > max_user {
        let expected = if min_user == max_user {
            min_user.to_string()
        } else {
            format!("{}-{}", min_user, max_user)
        };
        return Err(RenderError::arity_error(context, expected, given));
    }
    Ok(())
}

pub(crate) fn str_arg<'a>(
    context: &str,
    args: &'a [Value],
    index: usize,
) -> Result<&'a str, RenderError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(RenderError::type_error(context, "string", other)),
        None => Err(RenderError::arity_error(
            context,
            format!("at least {}", index),
            args.len().saturating_sub(1),
        )),
    }
}

/// A boolean option passed either as a keyword or at a positional slot.
pub(crate) fn bool_option(
    kwargs: &Kwargs,
    name: &str,
    args: &[Value],
    index: usize,
    default: bool,
) -> bool {
    kwargs
        .get(name)
        .or_else(|| args.get(index))
        .map(Value::is_truthy)
        .unwrap_or(default)
}

/// Follow a dotted attribute path (`"user.name"`, `"0"`) into a value.
pub(crate) fn attr_path(value: &Value, path: &str) -> Value {
    let mut current = value.clone();
    for segment in path.split('.') {
        current = if segment.bytes().all(|b| b.is_ascii_digit()) {
            match segment.parse::<i64>() {
                Ok(index) => current.get_item(&Value::Int(index)),
                Err(_) => Value::Undefined,
            }
        } else {
            match current.get_attr(segment) {
                Some(next) => next,
                None => Value::Undefined,
            }
        };
        if current.is_undefined() {
            break;
        }
    }
    current
}
