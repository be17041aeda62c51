// ABOUTME: Dynamic value model shared by the parser, evaluator, and builtins

use crate::ast::{MacroDecl, Stmt};
use crate::env::Environment;
use crate::error::{RenderError, RenderErrorKind};
use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Insertion-ordered string-keyed mapping. Order is observable through
/// iteration, `.items()`, `dictsort` input order, and `tojson`.
pub type ValueMap = IndexMap<String, Value>;

/// Keyword arguments of a call, in source order.
pub type Kwargs = IndexMap<String, Value>;

/// Signature of a registered filter, test, or global builtin.
pub type BuiltinFn = fn(&[Value], &Kwargs, &Rc<Environment>) -> Result<Value, RenderError>;

/// Host-provided callable injected through [`Value::from_fn`].
pub type HostFn = dyn Fn(&[Value], &Kwargs) -> Result<Value, RenderError>;

/// A template runtime value.
///
/// `Undefined` is distinct from `Null`: it is what missing names and missing
/// members produce, stays silent through member access, and stringifies to
/// the empty string. Arrays and maps share storage on clone; the evaluator
/// never mutates a value it received except through the `namespace` member
/// store, which is the one place sharing is observable.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Rc<Vec<Value>>),
    Map(Rc<RefCell<ValueMap>>),
    Callable(Callable),
}

/// The function-like values: builtins, user macros, bound methods, the
/// per-iteration `loop.cycle`, the `call`-block `caller()`, and host closures.
#[derive(Clone)]
pub enum Callable {
    Builtin {
        name: &'static str,
        f: BuiltinFn,
    },
    /// User macro: the declaration plus the scope chain at definition site
    Macro {
        decl: Arc<MacroDecl>,
        env: Rc<Environment>,
    },
    /// Implicit `caller()` of a `{% call %}` block
    Caller {
        body: Arc<Vec<Stmt>>,
        env: Rc<Environment>,
    },
    /// Method bound to its receiver at member-access time
    Method {
        receiver: Box<Value>,
        name: String,
    },
    /// `loop.cycle(...)`, closed over the current iteration index
    Cycle {
        index0: usize,
    },
    Host {
        name: String,
        f: Rc<HostFn>,
    },
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callable::Builtin { name, .. } => write!(f, "Builtin({})", name),
            Callable::Macro { decl, .. } => write!(f, "Macro({})", decl.name),
            Callable::Caller { .. } => write!(f, "Caller"),
            Callable::Method { name, .. } => write!(f, "Method({})", name),
            Callable::Cycle { index0 } => write!(f, "Cycle({})", index0),
            Callable::Host { name, .. } => write!(f, "Host({})", name),
        }
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(items))
    }

    pub fn map(entries: ValueMap) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn builtin(name: &'static str, f: BuiltinFn) -> Value {
        Value::Callable(Callable::Builtin { name, f })
    }

    /// Adapter for host-language callables.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Value
    where
        F: Fn(&[Value], &Kwargs) -> Result<Value, RenderError> + 'static,
    {
        Value::Callable(Callable::Host {
            name: name.into(),
            f: Rc::new(f),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "none",
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Callable(_) => "callable",
        }
    }

    /// Truthiness in boolean contexts: empty-ish values are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Undefined => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Map(entries) => !entries.borrow().is_empty(),
            Value::Callable(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Rc<Vec<Value>>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Rc<RefCell<ValueMap>>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Number of items: code points for strings, elements for sequences,
    /// entries for mappings. `None` for everything without a length.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            Value::Map(entries) => Some(entries.borrow().len()),
            _ => None,
        }
    }

    /// The rendered form appended to template output. Strings are bare here;
    /// inside containers they render in quoted repr form instead.
    pub fn render_string(&self) -> String {
        self.to_string()
    }
}

// ============================================================================
// Arithmetic and comparison
// ============================================================================

fn num_op_error(name: &'static str, lhs: &Value, rhs: &Value) -> RenderError {
    RenderError::invalid_op(format!(
        "unsupported operand types for '{}': {} and {}",
        name,
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Python-style floor division on integers (rounds toward negative infinity).
fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Python-style modulo: result takes the sign of the divisor.
fn modulo_i64(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

fn modulo_f64(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

impl Value {
    pub fn add(&self, other: &Value) -> Result<Value, RenderError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_add(*b)
                .map(Value::Int)
                .ok_or_else(|| RenderErrorKind::IntegerOverflow.into()),
            (Value::String(a), Value::String(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Value::String(s))
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut items = Vec::with_capacity(a.len() + b.len());
                items.extend(a.iter().cloned());
                items.extend(b.iter().cloned());
                Ok(Value::array(items))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                _ => Err(num_op_error("+", self, other)),
            },
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, RenderError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_sub(*b)
                .map(Value::Int)
                .ok_or_else(|| RenderErrorKind::IntegerOverflow.into()),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a - b)),
                _ => Err(num_op_error("-", self, other)),
            },
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value, RenderError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a
                .checked_mul(*b)
                .map(Value::Int)
                .ok_or_else(|| RenderErrorKind::IntegerOverflow.into()),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a * b)),
                _ => Err(num_op_error("*", self, other)),
            },
        }
    }

    /// True division: always produces a float.
    pub fn div(&self, other: &Value) -> Result<Value, RenderError> {
        match (self.as_f64(), other.as_f64()) {
            (Some(_), Some(b)) if b == 0.0 => Err(RenderErrorKind::DivisionByZero.into()),
            (Some(a), Some(b)) => Ok(Value::Float(a / b)),
            _ => Err(num_op_error("/", self, other)),
        }
    }

    pub fn floordiv(&self, other: &Value) -> Result<Value, RenderError> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err(RenderErrorKind::DivisionByZero.into()),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(floor_div_i64(*a, *b))),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Err(RenderErrorKind::DivisionByZero.into()),
                (Some(a), Some(b)) => Ok(Value::Float((a / b).floor())),
                _ => Err(num_op_error("//", self, other)),
            },
        }
    }

    pub fn rem(&self, other: &Value) -> Result<Value, RenderError> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err(RenderErrorKind::DivisionByZero.into()),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(modulo_i64(*a, *b))),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(_), Some(b)) if b == 0.0 => Err(RenderErrorKind::DivisionByZero.into()),
                (Some(a), Some(b)) => Ok(Value::Float(modulo_f64(a, b))),
                _ => Err(num_op_error("%", self, other)),
            },
        }
    }

    /// Exponentiation. A negative integer exponent promotes to float.
    pub fn pow(&self, other: &Value) -> Result<Value, RenderError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => {
                if *b < 0 {
                    Ok(Value::Float((*a as f64).powf(*b as f64)))
                } else {
                    let exp = u32::try_from(*b)
                        .map_err(|_| RenderError::from(RenderErrorKind::IntegerOverflow))?;
                    a.checked_pow(exp)
                        .map(Value::Int)
                        .ok_or_else(|| RenderErrorKind::IntegerOverflow.into())
                }
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::Float(a.powf(b))),
                _ => Err(num_op_error("**", self, other)),
            },
        }
    }

    pub fn neg(&self) -> Result<Value, RenderError> {
        match self {
            Value::Int(v) => v
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| RenderErrorKind::IntegerOverflow.into()),
            Value::Float(v) => Ok(Value::Float(-v)),
            _ => Err(RenderError::invalid_op(format!(
                "cannot negate a value of type {}",
                self.type_name()
            ))),
        }
    }

    /// `~` stringifies both sides and concatenates.
    pub fn concat(&self, other: &Value) -> Result<Value, RenderError> {
        let mut s = self.render_string();
        s.push_str(&other.render_string());
        Ok(Value::String(s))
    }

    /// Ordering for `<`/`<=`/`>`/`>=` and `sort`. `None` when the two values
    /// have no defined order.
    pub fn try_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.try_cmp(y)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    /// Membership: substring for strings, element equality for sequences,
    /// key presence for mappings.
    pub fn contains(&self, needle: &Value) -> Result<bool, RenderError> {
        match self {
            Value::String(haystack) => match needle {
                Value::String(s) => Ok(haystack.contains(s.as_str())),
                _ => Err(RenderError::type_error("in", "string", needle)),
            },
            Value::Array(items) => Ok(items.iter().any(|v| v == needle)),
            Value::Map(entries) => match needle {
                Value::String(key) => Ok(entries.borrow().contains_key(key.as_str())),
                _ => Ok(false),
            },
            _ => Err(RenderError::type_error(
                "in",
                "string, sequence, or mapping",
                self,
            )),
        }
    }

    /// Subscript access `base[key]`. Missing members and unsupported bases
    /// yield `Undefined` rather than an error so that optional context
    /// variables can be probed freely.
    pub fn get_item(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::Map(entries), Value::String(name)) => entries
                .borrow()
                .get(name.as_str())
                .cloned()
                .unwrap_or(Value::Undefined),
            (Value::Array(items), Value::Int(idx)) => {
                lookup_index(items.len(), *idx, |i| items[i].clone())
            }
            (Value::String(s), Value::Int(idx)) => {
                let chars: Vec<char> = s.chars().collect();
                lookup_index(chars.len(), *idx, |i| Value::String(chars[i].to_string()))
            }
            _ => Value::Undefined,
        }
    }

    /// Dot access on mappings. Returns `None` when the key is absent so the
    /// evaluator can fall back to bound-method dispatch.
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        match self {
            Value::Map(entries) => entries.borrow().get(name).cloned(),
            _ => None,
        }
    }

    /// Python-style slicing over strings and sequences.
    pub fn slice(
        &self,
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    ) -> Result<Value, RenderError> {
        if step == 0 {
            return Err(RenderError::invalid_op("slice step cannot be zero"));
        }
        match self {
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let out: String = slice_indices(chars.len(), start, stop, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect();
                Ok(Value::String(out))
            }
            Value::Array(items) => {
                let out: Vec<Value> = slice_indices(items.len(), start, stop, step)
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect();
                Ok(Value::array(out))
            }
            _ => Err(RenderError::type_error(
                "slice",
                "string or sequence",
                self,
            )),
        }
    }

    /// Materialize the iteration items: elements of a sequence, keys of a
    /// mapping, code points of a string.
    pub fn iter_values(&self) -> Result<Vec<Value>, RenderError> {
        match self {
            Value::Array(items) => Ok(items.iter().cloned().collect()),
            Value::Map(entries) => Ok(entries
                .borrow()
                .keys()
                .map(|k| Value::String(k.clone()))
                .collect()),
            Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
            _ => Err(RenderError::type_error("iteration", "iterable", self)),
        }
    }

    /// Identity comparison backing the `sameas` test: shared storage for
    /// containers, strict same-variant equality for scalars.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

fn lookup_index(len: usize, idx: i64, get: impl Fn(usize) -> Value) -> Value {
    let idx = if idx < 0 { idx + len as i64 } else { idx };
    if idx < 0 || idx >= len as i64 {
        Value::Undefined
    } else {
        get(idx as usize)
    }
}

fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let norm = |v: i64, lo: i64, hi: i64| {
        let v = if v < 0 { v + len } else { v };
        v.clamp(lo, hi)
    };
    let (start, stop) = if step > 0 {
        (
            start.map_or(0, |v| norm(v, 0, len)),
            stop.map_or(len, |v| norm(v, 0, len)),
        )
    } else {
        (
            start.map_or(len - 1, |v| norm(v, -1, len - 1)),
            stop.map_or(-1, |v| norm(v, -1, len - 1)),
        )
    };
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    out
}

// ============================================================================
// Equality
// ============================================================================

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            _ => false,
        }
    }
}

// ============================================================================
// Stringification
// ============================================================================

fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_finite() && v.fract() == 0.0 {
        write!(f, "{:.1}", v)
    } else {
        write!(f, "{}", v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null | Value::Undefined => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write_float(f, *v),
            Value::String(s) => write!(f, "{}", s),
            _ => self.write_repr(f),
        }
    }
}

impl Value {
    /// Repr form used inside containers: strings are single-quoted.
    fn write_repr(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "none"),
            Value::Undefined => write!(f, "undefined"),
            Value::String(s) => {
                write!(f, "'")?;
                for c in s.chars() {
                    match c {
                        '\'' => write!(f, "\\'")?,
                        '\\' => write!(f, "\\\\")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                write!(f, "'")
            }
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.write_repr(f)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': ", key)?;
                    value.write_repr(f)?;
                }
                write!(f, "}}")
            }
            Value::Callable(c) => match c {
                Callable::Builtin { name, .. } => write!(f, "<builtin {}>", name),
                Callable::Macro { decl, .. } => write!(f, "<macro {}>", decl.name),
                Callable::Caller { .. } => write!(f, "<caller>"),
                Callable::Method { name, .. } => write!(f, "<bound method {}>", name),
                Callable::Cycle { .. } => write!(f, "<loop.cycle>"),
                Callable::Host { name, .. } => write!(f, "<function {}>", name),
            },
            other => write!(f, "{}", other),
        }
    }
}

// ============================================================================
// Serialization (drives the tojson filter)
// ============================================================================

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null | Value::Undefined => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let entries = entries.borrow();
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Callable(_) => Err(serde::ser::Error::custom(
                "callable values are not JSON serializable",
            )),
        }
    }
}

// ============================================================================
// Host conversions
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::array(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Value {
        Value::map(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::Null
    }
}
