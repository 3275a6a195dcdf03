//! AUSTRA front-end compiler.
//!
//! A hand-written scanner, a recursive-descent parser, a type-directed
//! expression-tree builder, and the symbol tables behind method/property/
//! overload resolution. Given a source string and a host-provided
//! [`DataSource`], the compiler yields a typed, executable [`Expr`]
//! together with its result type; it also answers code-completion queries
//! by parsing up to a caret position and returning the in-scope members
//! (§6.2 of the language notes this crate implements).

pub mod compiler;

use compiler::ast::{Definition, Expr};
use compiler::datasource::DataSource;
use compiler::types::Type;

use compiler::parser::Parser;

pub use compiler::bindings::{Bindings, BindingsOptions};
pub use compiler::error::{CompileError, LexError, NameError, OverloadError, ParseError, TypeError, UsageError};

/// Compile one complete script (statements separated by `;`) to an
/// executable expression. `set`/`def` statements in `source` register
/// their side effects on `data_source` as a side effect of parsing; the
/// returned expression is the value of the script's final statement (or
/// `void` if it ended in a bare `set`/`def`).
pub fn parse_statement(
    source: &str,
    bindings: &Bindings,
    data_source: &mut dyn DataSource,
) -> Result<Expr, CompileError> {
    let mut parser = Parser::new(source, bindings, data_source).map_err(into_compile_error)?;
    parser.parse_program().map_err(into_compile_error)
}

/// Dry run: parse `source` and return just the result type, without caring
/// about the emitted tree. Used by hosts that only need to validate a
/// formula or preview its result type.
pub fn parse_type(
    source: &str,
    bindings: &Bindings,
    data_source: &mut dyn DataSource,
) -> Result<Type, CompileError> {
    parse_statement(source, bindings, data_source).map(|expr| expr.ty().clone())
}

/// Parse a single `def name [: "description"] = expr` and register it with
/// `data_source`, returning the registered [`Definition`].
pub fn parse_definition(
    source: &str,
    bindings: &Bindings,
    data_source: &mut dyn DataSource,
) -> Result<Definition, CompileError> {
    let mut parser = Parser::new(source, bindings, data_source).map_err(into_compile_error)?;
    parser.parse_definition().map_err(into_compile_error)
}

/// `members(source, text)` (§4.6/§6.2): members reachable on the value
/// named by the terminal object path ending at `text`'s caret, plus that
/// value's type when one could be determined. `source` is the full script
/// `text` is a caret-bounded prefix of; never fails.
pub fn members(
    source: &str,
    text: &str,
    bindings: &Bindings,
    data_source: &mut dyn DataSource,
) -> (Vec<String>, Option<Type>) {
    compiler::completion::members(source, text, bindings, data_source)
}

/// `class_members(text)`: static/constructor methods of the class or
/// namespace named by the last `Id::` in `text`.
pub fn class_members(text: &str, bindings: &Bindings) -> Vec<String> {
    compiler::completion::class_members(text, bindings)
}

/// `param_info(text)`: overload signatures for the call the caret
/// currently sits inside.
pub fn param_info(text: &str, bindings: &Bindings) -> Vec<String> {
    compiler::completion::param_info(text, bindings)
}

fn into_compile_error(bail: compiler::error::Bail) -> CompileError {
    match bail {
        compiler::error::Bail::Err(e) => e,
        // regular (non-completion) parses set the abort position to
        // infinity (§5), so `Abort` is unreachable here; treat it as the
        // closest legitimate error rather than panicking on a host bug.
        compiler::error::Bail::Abort => CompileError::Parse(ParseError::IncompleteExpression {
            span: compiler::tokens::Span::new(0, 0, 1, 1),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compiler::ast::Expr;
    use std::collections::HashMap;

    struct TestDataSource {
        vars: HashMap<String, Type>,
        defs: HashMap<String, Definition>,
    }

    impl TestDataSource {
        fn new() -> Self {
            Self {
                vars: HashMap::new(),
                defs: HashMap::new(),
            }
        }
    }

    impl DataSource for TestDataSource {
        fn get(&self, name: &str) -> Option<Type> {
            self.vars.get(&name.to_ascii_lowercase()).cloned()
        }
        fn set(&mut self, name: &str, ty: Option<Type>) {
            match ty {
                Some(t) => {
                    self.vars.insert(name.to_ascii_lowercase(), t);
                }
                None => {
                    self.vars.remove(&name.to_ascii_lowercase());
                }
            }
        }
        fn get_definition(&self, name: &str) -> Option<Definition> {
            self.defs.get(&name.to_ascii_lowercase()).cloned()
        }
        fn set_definition(&mut self, def: Definition) {
            self.defs.insert(def.name.to_ascii_lowercase(), def);
        }
        fn get_expression(&self, _name: &str, _is_def: bool) -> Option<Expr> {
            None
        }
        fn set_expression(&self, _name: &str, value: Expr) -> Expr {
            value
        }
        fn rent(&mut self, size: usize) -> Vec<Expr> {
            Vec::with_capacity(size)
        }
        fn recycle(&mut self, _list: Vec<Expr>) {}
    }

    #[test]
    fn let_in_power_expansion_yields_int_ten() {
        let bindings = Bindings::new(BindingsOptions::default());
        let mut ds = TestDataSource::new();
        let expr = parse_statement("let x = 3 in x^2 + 1", &bindings, &mut ds).unwrap();
        assert_eq!(*expr.ty(), Type::Int);
    }

    #[test]
    fn parse_type_is_a_dry_run() {
        let bindings = Bindings::new(BindingsOptions::default());
        let mut ds = TestDataSource::new();
        let ty = parse_type("1 < 2", &bindings, &mut ds).unwrap();
        assert_eq!(ty, Type::Bool);
    }

    #[test]
    fn parse_definition_registers_and_returns_the_definition() {
        let bindings = Bindings::new(BindingsOptions::default());
        let mut ds = TestDataSource::new();
        let def = parse_definition("def sq = 5 * 5", &bindings, &mut ds).unwrap();
        assert_eq!(def.name, "sq");
        assert!(ds.get_definition("sq").is_some());
    }

    #[test]
    fn duplicate_definition_is_a_usage_error() {
        let bindings = Bindings::new(BindingsOptions::default());
        let mut ds = TestDataSource::new();
        parse_definition("def sq = 5 * 5", &bindings, &mut ds).unwrap();
        let err = parse_definition("def sq = 6 * 6", &bindings, &mut ds).unwrap_err();
        assert!(matches!(err, CompileError::Usage(UsageError::DuplicateDefinition { .. })));
    }
}
