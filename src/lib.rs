// ABOUTME: Jinja-compatible template engine for LLM chat templates

//! A template engine implementing the Jinja dialect used by chat-template
//! files that drive prompt construction for instruction-tuned models:
//! expressions, control flow, filters, tests, macros, loop introspection,
//! and whitespace control over a dynamic value model.
//!
//! The pipeline is `source → tokens → Program → String`: [`parse`] runs the
//! lexer and parser (with constant folding), [`render`] walks the program
//! against a context. [`Template`] bundles the two for parse-once,
//! render-many use:
//!
//! ```
//! use chatplate::{Template, Value, ValueMap};
//!
//! let template = Template::new("Hello {{ name }}!").unwrap();
//! let mut context = ValueMap::new();
//! context.insert("name".to_string(), Value::from("World"));
//! assert_eq!(template.render(context).unwrap(), "Hello World!");
//! ```

pub mod ast;
pub mod builtins;
pub mod env;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;

pub use ast::Program;
pub use error::{ParseError, RenderError, RenderErrorKind};
pub use value::{Kwargs, Value, ValueMap};

/// Lexer behavior switches; explicit `-` strip markers always win over both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Remove the first newline after a `{% ... %}` or comment tag
    pub trim_blocks: bool,
    /// Strip whitespace from the start of a line to a `{% ... %}` tag
    pub lstrip_blocks: bool,
}

/// Parse template source into an immutable [`Program`].
///
/// A `Program` may be rendered any number of times, from multiple threads,
/// as long as each render gets its own context.
pub fn parse(source: &str, options: &Options) -> Result<Program, ParseError> {
    log::debug!("parsing template ({} bytes)", source.len());
    parser::parse(source, options)
}

/// Render a parsed program against a context.
pub fn render(program: &Program, context: ValueMap) -> Result<String, RenderError> {
    log::debug!(
        "rendering program ({} top-level nodes, {} context entries)",
        program.body.len(),
        context.len()
    );
    let env = env::Environment::new();
    builtins::globals::install(&env);
    for (name, value) in context {
        env.declare(name, value);
    }
    eval::render(program, env)
}

/// Parse-once, render-many convenience.
pub struct Template {
    program: Program,
}

impl Template {
    pub fn new(source: &str) -> Result<Self, ParseError> {
        Self::with_options(source, &Options::default())
    }

    pub fn with_options(source: &str, options: &Options) -> Result<Self, ParseError> {
        Ok(Template {
            program: parse(source, options)?,
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn render(&self, context: ValueMap) -> Result<String, RenderError> {
        render(&self.program, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_renders_repeatedly() {
        let template = Template::new("{{ n }}!").unwrap();
        for n in 0..3 {
            let mut context = ValueMap::new();
            context.insert("n".to_string(), Value::Int(n));
            assert_eq!(template.render(context).unwrap(), format!("{}!", n));
        }
    }

    #[test]
    fn test_parse_error_surfaces() {
        assert!(Template::new("{% if %}").is_err());
        assert!(Template::new("{{ x").is_err());
    }

    #[test]
    fn test_context_shadows_globals() {
        let template = Template::new("{{ range }}").unwrap();
        let mut context = ValueMap::new();
        context.insert("range".to_string(), Value::from("shadowed"));
        assert_eq!(template.render(context).unwrap(), "shadowed");
    }
}
