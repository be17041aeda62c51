// ABOUTME: Error types for template parsing and rendering failures

use crate::token::Span;
use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// Errors produced while turning template source into a `Program`.
///
/// Every variant carries the byte offset of the offending source location.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unclosed string literal starting at offset {offset}")]
    UnclosedString { offset: usize },

    #[error("unclosed comment starting at offset {offset}")]
    UnclosedComment { offset: usize },

    #[error("unclosed tag starting at offset {offset}")]
    UnclosedTag { offset: usize },

    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("malformed number literal at offset {offset}")]
    MalformedNumber { offset: usize },

    #[error("unexpected {found} at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        offset: usize,
    },

    #[error("unexpected end of template, expected {expected}")]
    UnexpectedEof { expected: String },

    #[error("mismatched end tag at offset {offset}: expected {expected}, found '{found}'")]
    MismatchedEndTag {
        expected: String,
        found: String,
        offset: usize,
    },

    #[error("'{keyword}' outside of a for loop at offset {offset}")]
    OrphanedLoopControl {
        keyword: &'static str,
        offset: usize,
    },
}

/// What went wrong during a render.
#[derive(Error, Debug, Clone)]
pub enum RenderErrorKind {
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("unknown test '{0}'")]
    UnknownTest(String),

    /// Type mismatch with the operation or builtin that rejected the value
    #[error("{context}: expected {expected}, got {actual}")]
    TypeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("{context}: expected {expected} argument{}, got {actual}", if *.expected == "1" { "" } else { "s" })]
    ArityMismatch {
        context: String,
        expected: String,
        actual: usize,
    },

    #[error("{context}: unknown keyword argument '{name}'")]
    UnknownKeywordArgument { context: String, name: String },

    #[error("{context}: missing required argument '{name}'")]
    MissingArgument { context: String, name: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("cannot unpack {actual} value{} into {expected} name{}", if *.actual == 1 { "" } else { "s" }, if *.expected == 1 { "" } else { "s" })]
    UnpackMismatch { expected: usize, actual: usize },

    #[error("value of type {0} is not callable")]
    NotCallable(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Raised by the `raise_exception` global from inside a template
    #[error("{0}")]
    Raised(String),
}

/// Runtime failure that aborted a render.
///
/// Wraps a [`RenderErrorKind`] together with the source span of the AST node
/// the evaluator was working on, when one is known.
#[derive(Debug, Clone)]
pub struct RenderError {
    kind: RenderErrorKind,
    span: Option<Span>,
}

impl RenderError {
    pub fn new(kind: RenderErrorKind) -> Self {
        RenderError { kind, span: None }
    }

    pub fn kind(&self) -> &RenderErrorKind {
        &self.kind
    }

    /// Source offset of the originating node, if the evaluator knew it.
    pub fn offset(&self) -> Option<usize> {
        self.span.map(|s| s.start as usize)
    }

    /// Attach a span unless one is already present. Errors surface from deep
    /// inside value operations without location knowledge; the evaluator
    /// stamps the nearest enclosing node on the way out.
    pub fn or_span(mut self, span: Span) -> Self {
        if self.span.is_none() {
            self.span = Some(span);
        }
        self
    }

    /// Create a type mismatch error with full context
    pub fn type_error(context: &str, expected: &str, actual: &Value) -> Self {
        RenderError::new(RenderErrorKind::TypeMismatch {
            context: context.to_string(),
            expected: expected.to_string(),
            actual: actual.type_name().to_string(),
        })
    }

    /// Create an arity error with expected and actual counts
    pub fn arity_error(context: &str, expected: impl Into<String>, actual: usize) -> Self {
        RenderError::new(RenderErrorKind::ArityMismatch {
            context: context.to_string(),
            expected: expected.into(),
            actual,
        })
    }

    pub fn invalid_op(message: impl Into<String>) -> Self {
        RenderError::new(RenderErrorKind::InvalidOperation(message.into()))
    }

    pub fn unknown_filter(name: &str) -> Self {
        RenderError::new(RenderErrorKind::UnknownFilter(name.to_string()))
    }

    pub fn unknown_test(name: &str) -> Self {
        RenderError::new(RenderErrorKind::UnknownTest(name.to_string()))
    }

    pub fn not_callable(value: &Value) -> Self {
        RenderError::new(RenderErrorKind::NotCallable(value.type_name().to_string()))
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(span) = self.span {
            write!(f, " (at offset {})", span.start)?;
        }
        Ok(())
    }
}

impl std::error::Error for RenderError {}

impl From<RenderErrorKind> for RenderError {
    fn from(kind: RenderErrorKind) -> Self {
        RenderError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_display_with_span() {
        let err = RenderError::new(RenderErrorKind::DivisionByZero).or_span(Span::new(7, 12));
        assert_eq!(format!("{}", err), "division by zero (at offset 7)");
    }

    #[test]
    fn test_or_span_keeps_first() {
        let err = RenderError::new(RenderErrorKind::DivisionByZero)
            .or_span(Span::new(3, 4))
            .or_span(Span::new(9, 10));
        assert_eq!(err.offset(), Some(3));
    }

    #[test]
    fn test_arity_error_pluralization() {
        let one = RenderError::arity_error("join", "1", 3);
        assert_eq!(format!("{}", one), "join: expected 1 argument, got 3");

        let many = RenderError::arity_error("replace", "2-3", 1);
        assert_eq!(format!("{}", many), "replace: expected 2-3 arguments, got 1");
    }
}
