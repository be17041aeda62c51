// ABOUTME: Tree-walking evaluator that renders a parsed template program

use crate::ast::*;
use crate::builtins;
use crate::env::Environment;
use crate::error::{RenderError, RenderErrorKind};
use crate::token::Span;
use crate::value::{Callable, Kwargs, Value, ValueMap};
use std::rc::Rc;

/// Control signal propagated out of statement evaluation. `break` and
/// `continue` travel as ordinary return values until the nearest enclosing
/// `for` consumes them; they are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

/// Render a program against a prepared root environment.
pub fn render(program: &Program, env: Rc<Environment>) -> Result<String, RenderError> {
    let mut out = String::new();
    exec_block(&program.body, &env, &mut out)?;
    Ok(out)
}

fn exec_block(
    stmts: &[Stmt],
    env: &Rc<Environment>,
    out: &mut String,
) -> Result<Flow, RenderError> {
    for stmt in stmts {
        match exec_stmt(stmt, env, out)? {
            Flow::Normal => {}
            flow => return Ok(flow),
        }
    }
    Ok(Flow::Normal)
}

fn exec_stmt(stmt: &Stmt, env: &Rc<Environment>, out: &mut String) -> Result<Flow, RenderError> {
    match stmt {
        Stmt::Text(text) => {
            out.push_str(text);
            Ok(Flow::Normal)
        }
        Stmt::Emit(expr) => {
            let value = eval_expr(expr, env)?;
            out.push_str(&value.render_string());
            Ok(Flow::Normal)
        }
        Stmt::Set {
            target,
            value,
            span,
        } => {
            let value = eval_expr(value, env)?;
            assign_target(env, target, value, *span)?;
            Ok(Flow::Normal)
        }
        Stmt::SetAttr {
            name,
            path,
            value,
            span,
        } => {
            let value = eval_expr(value, env)?;
            store_attr(env, name, path, value, *span)?;
            Ok(Flow::Normal)
        }
        Stmt::SetBlock { name, body, .. } => {
            let scope = Environment::with_parent(env.clone());
            let mut buf = String::new();
            let flow = exec_block(body, &scope, &mut buf)?;
            env.assign(name, Value::String(buf));
            Ok(flow)
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
            ..
        } => {
            if eval_expr(cond, env)?.is_truthy() {
                exec_block(then_body, env, out)
            } else {
                exec_block(else_body, env, out)
            }
        }
        Stmt::For {
            target,
            iterable,
            filter,
            body,
            else_body,
            span,
        } => exec_for(target, iterable, filter.as_ref(), body, else_body, *span, env, out),
        Stmt::Macro(decl) => {
            env.declare(
                decl.name.clone(),
                Value::Callable(Callable::Macro {
                    decl: decl.clone(),
                    env: env.clone(),
                }),
            );
            Ok(Flow::Normal)
        }
        Stmt::FilterBlock {
            filters,
            body,
            ..
        } => {
            let scope = Environment::with_parent(env.clone());
            let mut buf = String::new();
            let flow = exec_block(body, &scope, &mut buf)?;
            let mut value = Value::String(buf);
            for spec in filters {
                let (mut args, kwargs) = eval_args(&spec.args, env)?;
                args.insert(0, value);
                value = builtins::apply_filter(&spec.name, &args, &kwargs, env)
                    .map_err(|e| e.or_span(spec.span))?;
            }
            out.push_str(&value.render_string());
            Ok(flow)
        }
        Stmt::CallBlock { call, body, span } => {
            let ExprKind::Call { callee, args } = &call.kind else {
                return Err(RenderError::invalid_op("call block requires a macro call")
                    .or_span(*span));
            };
            let target = eval_expr(callee, env)?;
            let (pos, kwargs) = eval_args(args, env)?;
            let caller = Value::Callable(Callable::Caller {
                body: body.clone(),
                env: env.clone(),
            });
            let result = call_value(&target, &pos, &kwargs, env, Some(caller))
                .map_err(|e| e.or_span(*span))?;
            out.push_str(&result.render_string());
            Ok(Flow::Normal)
        }
        Stmt::Break(_) => Ok(Flow::Break),
        Stmt::Continue(_) => Ok(Flow::Continue),
    }
}

#[allow(clippy::too_many_arguments)]
fn exec_for(
    target: &LoopTarget,
    iterable: &Expr,
    filter: Option<&Expr>,
    body: &[Stmt],
    else_body: &[Stmt],
    span: Span,
    env: &Rc<Environment>,
    out: &mut String,
) -> Result<Flow, RenderError> {
    let iterable = eval_expr(iterable, env)?;
    let mut items = iterable.iter_values().map_err(|e| e.or_span(span))?;

    if let Some(filter) = filter {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            let probe = Environment::with_parent(env.clone());
            bind_target(&probe, target, &item, span)?;
            if eval_expr(filter, &probe)?.is_truthy() {
                kept.push(item);
            }
        }
        items = kept;
    }

    if items.is_empty() {
        return exec_block(else_body, env, out);
    }

    let parent_loop = env.lookup("loop");
    let len = items.len();
    for (index, item) in items.iter().enumerate() {
        let scope = Environment::isolated_child(env.clone());
        bind_target(&scope, target, item, span)?;
        scope.declare("loop", loop_value(index, len, &items, parent_loop.clone()));
        match exec_block(body, &scope, out)? {
            Flow::Normal => {}
            Flow::Break => break,
            Flow::Continue => continue,
        }
    }
    Ok(Flow::Normal)
}

/// Build the `loop` introspection value for one iteration.
fn loop_value(index: usize, len: usize, items: &[Value], parent: Option<Value>) -> Value {
    let mut entries = ValueMap::new();
    entries.insert("index".to_string(), Value::Int(index as i64 + 1));
    entries.insert("index0".to_string(), Value::Int(index as i64));
    entries.insert("revindex".to_string(), Value::Int((len - index) as i64));
    entries.insert("revindex0".to_string(), Value::Int((len - index - 1) as i64));
    entries.insert("first".to_string(), Value::Bool(index == 0));
    entries.insert("last".to_string(), Value::Bool(index == len - 1));
    entries.insert("length".to_string(), Value::Int(len as i64));
    entries.insert(
        "previtem".to_string(),
        if index > 0 {
            items[index - 1].clone()
        } else {
            Value::Undefined
        },
    );
    entries.insert(
        "nextitem".to_string(),
        items.get(index + 1).cloned().unwrap_or(Value::Undefined),
    );
    entries.insert(
        "cycle".to_string(),
        Value::Callable(Callable::Cycle { index0: index }),
    );
    if let Some(outer) = parent {
        let mut wrapper = ValueMap::new();
        wrapper.insert("loop".to_string(), outer);
        entries.insert("parent".to_string(), Value::map(wrapper));
    }
    Value::map(entries)
}

fn bind_target(
    scope: &Rc<Environment>,
    target: &LoopTarget,
    item: &Value,
    span: Span,
) -> Result<(), RenderError> {
    match target {
        LoopTarget::Name(name) => {
            scope.declare(name.clone(), item.clone());
            Ok(())
        }
        LoopTarget::Tuple(names) => {
            let parts = item.iter_values().map_err(|e| e.or_span(span))?;
            if parts.len() != names.len() {
                return Err(RenderError::from(RenderErrorKind::UnpackMismatch {
                    expected: names.len(),
                    actual: parts.len(),
                })
                .or_span(span));
            }
            for (name, part) in names.iter().zip(parts) {
                scope.declare(name.clone(), part);
            }
            Ok(())
        }
    }
}

/// `set` on a name or tuple of names.
fn assign_target(
    env: &Rc<Environment>,
    target: &LoopTarget,
    value: Value,
    span: Span,
) -> Result<(), RenderError> {
    match target {
        LoopTarget::Name(name) => {
            env.assign(name, value);
            Ok(())
        }
        LoopTarget::Tuple(names) => {
            let parts = value.iter_values().map_err(|e| e.or_span(span))?;
            if parts.len() != names.len() {
                return Err(RenderError::from(RenderErrorKind::UnpackMismatch {
                    expected: names.len(),
                    actual: parts.len(),
                })
                .or_span(span));
            }
            for (name, part) in names.iter().zip(parts) {
                env.assign(name, part);
            }
            Ok(())
        }
    }
}

/// `set ns.attr = value`: member-store on a shared map, bypassing scope
/// locality. This is how `namespace(...)` state survives loop iterations.
fn store_attr(
    env: &Rc<Environment>,
    name: &str,
    path: &[String],
    value: Value,
    span: Span,
) -> Result<(), RenderError> {
    let mut current = env.lookup(name).unwrap_or(Value::Undefined);
    for key in &path[..path.len() - 1] {
        current = match current.get_attr(key) {
            Some(next) => next,
            None => {
                return Err(RenderError::invalid_op(format!(
                    "cannot resolve attribute '{}' on '{}'",
                    key, name
                ))
                .or_span(span))
            }
        };
    }
    let last = &path[path.len() - 1];
    match current.as_map() {
        Some(entries) => {
            entries.borrow_mut().insert(last.clone(), value);
            Ok(())
        }
        None => Err(RenderError::invalid_op(format!(
            "cannot assign attribute '{}' on a value of type {}",
            last,
            current.type_name()
        ))
        .or_span(span)),
    }
}

// ============================================================================
// Expressions
// ============================================================================

pub(crate) fn eval_expr(expr: &Expr, env: &Rc<Environment>) -> Result<Value, RenderError> {
    match &expr.kind {
        ExprKind::Literal(literal) => Ok(match literal {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(v) => Value::Int(*v),
            Literal::Float(v) => Value::Float(*v),
            Literal::Str(s) => Value::String(s.clone()),
        }),
        // missing names are not an error; they resolve to undefined
        ExprKind::Var(name) => Ok(env.lookup(name).unwrap_or(Value::Undefined)),
        ExprKind::Array(items) => {
            let values = items
                .iter()
                .map(|item| eval_expr(item, env))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::array(values))
        }
        ExprKind::Map(entries) => {
            let mut map = ValueMap::new();
            for (key, value) in entries {
                let key = match eval_expr(key, env)? {
                    Value::String(s) => s,
                    other => other.render_string(),
                };
                map.insert(key, eval_expr(value, env)?);
            }
            Ok(Value::map(map))
        }
        ExprKind::Unary { op, operand } => {
            let value = eval_expr(operand, env)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => value.neg().map_err(|e| e.or_span(expr.span)),
                UnaryOp::Pos => {
                    if value.is_number() {
                        Ok(value)
                    } else {
                        Err(RenderError::type_error("unary '+'", "number", &value)
                            .or_span(expr.span))
                    }
                }
            }
        }
        ExprKind::Binary { op, left, right } => match op {
            // short-circuit, and the deciding operand is the result
            BinaryOp::And => {
                let value = eval_expr(left, env)?;
                if value.is_truthy() {
                    eval_expr(right, env)
                } else {
                    Ok(value)
                }
            }
            BinaryOp::Or => {
                let value = eval_expr(left, env)?;
                if value.is_truthy() {
                    Ok(value)
                } else {
                    eval_expr(right, env)
                }
            }
            _ => {
                let left = eval_expr(left, env)?;
                let right = eval_expr(right, env)?;
                binary_op(*op, &left, &right).map_err(|e| e.or_span(expr.span))
            }
        },
        ExprKind::Ternary {
            then,
            cond,
            otherwise,
        } => {
            if eval_expr(cond, env)?.is_truthy() {
                eval_expr(then, env)
            } else {
                match otherwise {
                    Some(expr) => eval_expr(expr, env),
                    None => Ok(Value::Undefined),
                }
            }
        }
        ExprKind::Filter { value, name, args } => {
            let piped = eval_expr(value, env)?;
            let (mut pos, kwargs) = eval_args(args, env)?;
            pos.insert(0, piped);
            builtins::apply_filter(name, &pos, &kwargs, env).map_err(|e| e.or_span(expr.span))
        }
        ExprKind::Test {
            value,
            name,
            args,
            negated,
        } => {
            let subject = eval_expr(value, env)?;
            let (mut pos, kwargs) = eval_args(args, env)?;
            pos.insert(0, subject);
            let result = builtins::apply_test(name, &pos, &kwargs, env)
                .map_err(|e| e.or_span(expr.span))?;
            Ok(Value::Bool(result != *negated))
        }
        ExprKind::Attr { base, name } => {
            let base = eval_expr(base, env)?;
            Ok(attr_lookup(&base, name))
        }
        ExprKind::Index { base, key } => {
            let base = eval_expr(base, env)?;
            let key = eval_expr(key, env)?;
            Ok(base.get_item(&key))
        }
        ExprKind::Slice {
            base,
            start,
            stop,
            step,
        } => {
            let base = eval_expr(base, env)?;
            let start = slice_bound(start.as_deref(), env)?;
            let stop = slice_bound(stop.as_deref(), env)?;
            let step = slice_bound(step.as_deref(), env)?.unwrap_or(1);
            base.slice(start, stop, step).map_err(|e| e.or_span(expr.span))
        }
        ExprKind::Call { callee, args } => {
            let target = eval_expr(callee, env)?;
            let (pos, kwargs) = eval_args(args, env)?;
            call_value(&target, &pos, &kwargs, env, None).map_err(|e| e.or_span(expr.span))
        }
    }
}

/// Dot access: mapping entry first, then a bound method, else undefined.
fn attr_lookup(base: &Value, name: &str) -> Value {
    if base.is_undefined() || base.is_null() {
        return Value::Undefined;
    }
    if let Some(value) = base.get_attr(name) {
        return value;
    }
    if builtins::methods::has_method(base, name) {
        return Value::Callable(Callable::Method {
            receiver: Box::new(base.clone()),
            name: name.to_string(),
        });
    }
    Value::Undefined
}

fn slice_bound(
    bound: Option<&Expr>,
    env: &Rc<Environment>,
) -> Result<Option<i64>, RenderError> {
    match bound {
        None => Ok(None),
        Some(expr) => match eval_expr(expr, env)? {
            Value::Int(v) => Ok(Some(v)),
            other => {
                Err(RenderError::type_error("slice", "integer", &other).or_span(expr.span))
            }
        },
    }
}

fn eval_args(args: &[Arg], env: &Rc<Environment>) -> Result<(Vec<Value>, Kwargs), RenderError> {
    let mut pos = Vec::new();
    let mut kwargs = Kwargs::new();
    for arg in args {
        match arg {
            Arg::Pos(expr) => pos.push(eval_expr(expr, env)?),
            Arg::Kw(name, expr) => {
                kwargs.insert(name.clone(), eval_expr(expr, env)?);
            }
        }
    }
    Ok((pos, kwargs))
}

/// Non-short-circuit binary operators over evaluated operands. Shared with
/// the parser's constant folder.
pub(crate) fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RenderError> {
    match op {
        BinaryOp::Add => left.add(right),
        BinaryOp::Sub => left.sub(right),
        BinaryOp::Mul => left.mul(right),
        BinaryOp::Div => left.div(right),
        BinaryOp::FloorDiv => left.floordiv(right),
        BinaryOp::Rem => left.rem(right),
        BinaryOp::Pow => left.pow(right),
        BinaryOp::Concat => left.concat(right),
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            match left.try_cmp(right) {
                Some(ordering) => Ok(Value::Bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })),
                None => Err(RenderError::invalid_op(format!(
                    "values of type {} and {} are not comparable",
                    left.type_name(),
                    right.type_name()
                ))),
            }
        }
        BinaryOp::In => Ok(Value::Bool(right.contains(left)?)),
        BinaryOp::NotIn => Ok(Value::Bool(!right.contains(left)?)),
        BinaryOp::And | BinaryOp::Or => Err(RenderError::invalid_op(
            "short-circuit operator evaluated eagerly",
        )),
    }
}

// ============================================================================
// Calls
// ============================================================================

/// Invoke any callable value. `caller` is bound for macro targets when the
/// invocation came from a `{% call %}` block.
pub(crate) fn call_value(
    target: &Value,
    args: &[Value],
    kwargs: &Kwargs,
    env: &Rc<Environment>,
    caller: Option<Value>,
) -> Result<Value, RenderError> {
    let Value::Callable(callable) = target else {
        return Err(RenderError::not_callable(target));
    };
    match callable {
        Callable::Builtin { f, .. } => f(args, kwargs, env),
        Callable::Host { f, .. } => f(args, kwargs),
        Callable::Method { receiver, name } => {
            builtins::methods::call_method(receiver, name, args, kwargs, env)
        }
        Callable::Cycle { index0 } => {
            if args.is_empty() {
                return Err(RenderError::arity_error("loop.cycle", "at least 1", 0));
            }
            Ok(args[index0 % args.len()].clone())
        }
        Callable::Caller { body, env: captured } => {
            let scope = Environment::isolated_child(captured.clone());
            let mut buf = String::new();
            exec_block(body, &scope, &mut buf)?;
            Ok(Value::String(buf))
        }
        Callable::Macro {
            decl,
            env: captured,
        } => call_macro(decl, captured, args, kwargs, caller),
    }
}

fn call_macro(
    decl: &MacroDecl,
    captured: &Rc<Environment>,
    args: &[Value],
    kwargs: &Kwargs,
    caller: Option<Value>,
) -> Result<Value, RenderError> {
    if args.len() > decl.params.len() {
        return Err(RenderError::arity_error(
            &decl.name,
            decl.params.len().to_string(),
            args.len(),
        ));
    }
    let scope = Environment::isolated_child(captured.clone());
    let mut kwargs = kwargs.clone();
    for (index, param) in decl.params.iter().enumerate() {
        let value = if index < args.len() {
            if kwargs.contains_key(&param.name) {
                return Err(RenderError::invalid_op(format!(
                    "{}: got multiple values for argument '{}'",
                    decl.name, param.name
                )));
            }
            args[index].clone()
        } else if let Some(value) = kwargs.shift_remove(&param.name) {
            value
        } else if let Some(default) = &param.default {
            // defaults see the captured scope plus the parameters bound so far
            eval_expr(default, &scope)?
        } else {
            return Err(RenderErrorKind::MissingArgument {
                context: decl.name.clone(),
                name: param.name.clone(),
            }
            .into());
        };
        scope.declare(param.name.clone(), value);
    }
    if let Some((name, _)) = kwargs.first() {
        return Err(RenderErrorKind::UnknownKeywordArgument {
            context: decl.name.clone(),
            name: name.clone(),
        }
        .into());
    }
    if let Some(caller) = caller {
        scope.declare("caller", caller);
    }
    let mut buf = String::new();
    exec_block(&decl.body, &scope, &mut buf)?;
    Ok(Value::String(buf))
}

#[cfg(test)]
mod tests {
    use crate::value::{Value, ValueMap};
    use crate::{parse, render, Options};

    fn render_str(source: &str, context: ValueMap) -> String {
        let program = parse(source, &Options::default()).expect("parse failed");
        render(&program, context).expect("render failed")
    }

    fn render_err(source: &str, context: ValueMap) -> crate::RenderError {
        let program = parse(source, &Options::default()).expect("parse failed");
        render(&program, context).expect_err("render should fail")
    }

    fn ctx(entries: &[(&str, Value)]) -> ValueMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_undefined_lookup_is_silent() {
        assert_eq!(render_str("[{{ missing }}]", ValueMap::new()), "[]");
        assert_eq!(
            render_str("[{{ missing.deep.path }}]", ValueMap::new()),
            "[]"
        );
        assert_eq!(render_str("[{{ missing['x'] }}]", ValueMap::new()), "[]");
    }

    #[test]
    fn test_loop_variable_fields() {
        let out = render_str(
            "{% for x in items %}{{ loop.index }}:{{ loop.index0 }}:{{ loop.revindex }}:{{ loop.first }}:{{ loop.last }};{% endfor %}",
            ctx(&[(
                "items",
                Value::array(vec![Value::from("a"), Value::from("b"), Value::from("c")]),
            )]),
        );
        assert_eq!(
            out,
            "1:0:3:true:false;2:1:2:false:false;3:2:1:false:true;"
        );
    }

    #[test]
    fn test_loop_previtem_nextitem() {
        let out = render_str(
            "{% for x in items %}({{ loop.previtem }}<{{ x }}>{{ loop.nextitem }}){% endfor %}",
            ctx(&[(
                "items",
                Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            )]),
        );
        assert_eq!(out, "(<1>2)(1<2>3)(2<3>)");
    }

    #[test]
    fn test_loop_cycle() {
        let out = render_str(
            "{% for x in items %}{{ loop.cycle('odd', 'even') }} {% endfor %}",
            ctx(&[(
                "items",
                Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            )]),
        );
        assert_eq!(out, "odd even odd ");
    }

    #[test]
    fn test_loop_parent_exposes_outer_loop() {
        let out = render_str(
            "{% for a in [1, 2] %}{% for b in [1] %}{{ loop.parent.loop.index }}{% endfor %}{% endfor %}",
            ValueMap::new(),
        );
        assert_eq!(out, "12");
    }

    #[test]
    fn test_loop_length_respects_filter() {
        let out = render_str(
            "{% for x in items if x > 1 %}{{ loop.length }}{% endfor %}",
            ctx(&[(
                "items",
                Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            )]),
        );
        assert_eq!(out, "22");
    }

    #[test]
    fn test_for_else_runs_only_when_empty() {
        let template = "{% for x in items %}{{ x }}{% else %}empty{% endfor %}";
        assert_eq!(
            render_str(template, ctx(&[("items", Value::array(vec![]))])),
            "empty"
        );
        assert_eq!(
            render_str(
                template,
                ctx(&[("items", Value::array(vec![Value::from("a")]))])
            ),
            "a"
        );
    }

    #[test]
    fn test_break_and_continue() {
        let out = render_str(
            "{% for x in items %}{% if x == 2 %}{% continue %}{% endif %}{% if x == 4 %}{% break %}{% endif %}{{ x }}{% endfor %}",
            ctx(&[(
                "items",
                Value::array((1..=5).map(Value::Int).collect()),
            )]),
        );
        assert_eq!(out, "13");
    }

    #[test]
    fn test_set_in_loop_is_local_to_iteration() {
        let out = render_str(
            "{% set x = 'outer' %}{% for i in [1, 2] %}{% set x = i %}{% endfor %}{{ x }}",
            ValueMap::new(),
        );
        assert_eq!(out, "outer");
    }

    #[test]
    fn test_set_in_if_escapes_to_enclosing_scope() {
        let out = render_str(
            "{% set x = 'a' %}{% if true %}{% set x = 'b' %}{% endif %}{{ x }}",
            ValueMap::new(),
        );
        assert_eq!(out, "b");
    }

    #[test]
    fn test_namespace_survives_iterations() {
        let out = render_str(
            "{% set ns = namespace(count=0) %}{% for i in [1, 2, 3] %}{% set ns.count = ns.count + i %}{% endfor %}{{ ns.count }}",
            ValueMap::new(),
        );
        assert_eq!(out, "6");
    }

    #[test]
    fn test_tuple_unpacking_in_for() {
        let out = render_str(
            "{% for pair in pairs %}{% endfor %}{% for k, v in pairs %}{{ k }}={{ v }};{% endfor %}",
            ctx(&[(
                "pairs",
                Value::array(vec![
                    Value::array(vec![Value::from("a"), Value::Int(1)]),
                    Value::array(vec![Value::from("b"), Value::Int(2)]),
                ]),
            )]),
        );
        assert_eq!(out, "a=1;b=2;");
    }

    #[test]
    fn test_tuple_unpack_arity_mismatch_is_an_error() {
        let err = render_err(
            "{% for a, b in items %}{% endfor %}",
            ctx(&[(
                "items",
                Value::array(vec![Value::array(vec![Value::Int(1)])]),
            )]),
        );
        assert!(err.to_string().contains("unpack"));
    }

    #[test]
    fn test_iterating_a_mapping_yields_keys() {
        let mut m = ValueMap::new();
        m.insert("b".to_string(), Value::Int(1));
        m.insert("a".to_string(), Value::Int(2));
        let out = render_str(
            "{% for k in m %}{{ k }}{% endfor %}",
            ctx(&[("m", Value::map(m))]),
        );
        assert_eq!(out, "ba");
    }

    #[test]
    fn test_map_items_method_destructures() {
        let mut m = ValueMap::new();
        m.insert("x".to_string(), Value::Int(1));
        m.insert("y".to_string(), Value::Int(2));
        let out = render_str(
            "{% for k, v in m.items() %}{{ k }}{{ v }}{% endfor %}",
            ctx(&[("m", Value::map(m))]),
        );
        assert_eq!(out, "x1y2");
    }

    #[test]
    fn test_macro_defaults_and_overrides() {
        let out = render_str(
            "{% macro greet(name, greeting='Hello') %}{{ greeting }}, {{ name }}!{% endmacro %}{{ greet('Alice') }}{{ greet('Bob', 'Hi') }}",
            ValueMap::new(),
        );
        assert_eq!(out, "Hello, Alice!Hi, Bob!");
    }

    #[test]
    fn test_macro_keyword_arguments() {
        let out = render_str(
            "{% macro tag(name, class='') %}<{{ name }} class='{{ class }}'>{% endmacro %}{{ tag('div', class='x') }}",
            ValueMap::new(),
        );
        assert_eq!(out, "<div class='x'>");
    }

    #[test]
    fn test_macro_missing_argument_errors() {
        let err = render_err(
            "{% macro f(a) %}{{ a }}{% endmacro %}{{ f() }}",
            ValueMap::new(),
        );
        assert!(err.to_string().contains("missing required argument"));
    }

    #[test]
    fn test_macro_unknown_keyword_errors() {
        let err = render_err(
            "{% macro f(a) %}{{ a }}{% endmacro %}{{ f(1, b=2) }}",
            ValueMap::new(),
        );
        assert!(err.to_string().contains("unknown keyword argument"));
    }

    #[test]
    fn test_macro_closure_captures_definition_scope() {
        let out = render_str(
            "{% set who = 'world' %}{% macro hello() %}hello {{ who }}{% endmacro %}{{ hello() }}",
            ValueMap::new(),
        );
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_recursive_macro() {
        let out = render_str(
            "{% macro count(n) %}{{ n }}{% if n > 1 %}{{ count(n - 1) }}{% endif %}{% endmacro %}{{ count(3) }}",
            ValueMap::new(),
        );
        assert_eq!(out, "321");
    }

    #[test]
    fn test_call_block_exposes_caller() {
        let out = render_str(
            "{% macro frame() %}[{{ caller() }}]{% endmacro %}{% call frame() %}inner{% endcall %}",
            ValueMap::new(),
        );
        assert_eq!(out, "[inner]");
    }

    #[test]
    fn test_filter_block() {
        let out = render_str(
            "{% filter upper %}hello {{ 'world' }}{% endfilter %}",
            ValueMap::new(),
        );
        assert_eq!(out, "HELLO WORLD");
    }

    #[test]
    fn test_set_block_captures_rendered_body() {
        let out = render_str(
            "{% set banner %}== {{ 'hi' | upper }} =={% endset %}{{ banner }}/{{ banner }}",
            ValueMap::new(),
        );
        assert_eq!(out, "== HI ==/== HI ==");
    }

    #[test]
    fn test_short_circuit_does_not_evaluate_other_side() {
        // f is undefined, so calling it would error; short-circuit must skip
        // it (the conditions come from the context so nothing folds away)
        assert_eq!(
            render_str(
                "{{ no and f() }}|{{ yes or f() }}",
                ctx(&[("no", Value::Bool(false)), ("yes", Value::Bool(true))])
            ),
            "false|true"
        );
    }

    #[test]
    fn test_and_or_return_the_deciding_operand() {
        assert_eq!(
            render_str(
                "{{ a or 'fallback' }}|{{ b and 'y' }}",
                ctx(&[("a", Value::from("")), ("b", Value::from("x"))])
            ),
            "fallback|y"
        );
    }

    #[test]
    fn test_division_by_zero_errors_at_render_time() {
        let err = render_err("{{ 1 // (1 - 1) }}", ValueMap::new());
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_calling_a_non_callable_errors() {
        let err = render_err("{{ x() }}", ctx(&[("x", Value::Int(3))]));
        assert!(err.to_string().contains("not callable"));
    }

    #[test]
    fn test_string_indexing_and_slicing() {
        assert_eq!(
            render_str("{{ s[0] }}{{ s[-1] }}{{ s[1:3] }}{{ s[::-1] }}", ctx(&[("s", Value::from("abcd"))])),
            "adbcdcba"
        );
    }

    #[test]
    fn test_in_operator() {
        assert_eq!(
            render_str(
                "{{ 'ell' in 'hello' }} {{ 2 in [1, 2] }} {{ 'k' in m }} {{ 3 not in [1, 2] }}",
                ctx(&[("m", {
                    let mut m = ValueMap::new();
                    m.insert("k".to_string(), Value::Int(1));
                    Value::map(m)
                })])
            ),
            "true true true true"
        );
    }
}
