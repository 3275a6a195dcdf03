//! Tests for the overload-resolution algorithm (§4.4): live-set
//! elimination argument-by-argument, arity filtering, tie-breaking via
//! "prefer an exact first-argument match", and sentinel auto-materialization.

use austra_compiler::compiler::ast::{Constant, Definition, Expr};
use austra_compiler::compiler::datasource::DataSource;
use austra_compiler::compiler::types::Type;
use austra_compiler::{parse_statement, Bindings, BindingsOptions, CompileError, OverloadError};
use std::collections::HashMap;

struct MemoryDataSource {
    vars: HashMap<String, Type>,
    defs: HashMap<String, Definition>,
}

impl MemoryDataSource {
    fn new() -> Self {
        Self {
            vars: HashMap::new(),
            defs: HashMap::new(),
        }
    }
}

impl DataSource for MemoryDataSource {
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

fn compile(source: &str) -> Result<Expr, CompileError> {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    parse_statement(source, &bindings, &mut ds)
}

fn assert_compiles(label: &str, source: &str) -> Expr {
    match compile(source) {
        Ok(expr) => expr,
        Err(err) => panic!("[{}] failed to compile {:?}\n--- error ---\n{}", label, source, err),
    }
}

// DVector has two `new` overloads: a variadic `double...` constructor and a
// `(length, Zero-sentinel)` constructor. The sentinel formal is excluded
// from user-visible arity, so a single-argument call should resolve to the
// sentinel-bearing one and the emitted args should include the
// auto-materialized zero.
#[test]
fn dvector_new_single_arg_picks_zeros_constructor() {
    let expr = assert_compiles("dvector_zeros", "DVector::new(3)");
    match expr {
        Expr::Block(stmts, _, _) => match stmts.last().unwrap() {
            Expr::New { class, args, ty, .. } => {
                assert_eq!(class, "DVector");
                assert_eq!(*ty, Type::DVector);
                // length arg plus the auto-materialized Zero sentinel
                assert_eq!(args.len(), 2);
                match &args[1] {
                    Expr::Constant(Constant::Real(v), Type::Double, _) => assert_eq!(*v, 0.0),
                    other => panic!("expected materialized zero sentinel, got {:?}", other),
                }
            }
            other => panic!("expected a New expr, got {:?}", other),
        },
        other => panic!("expected a block, got {:?}", other),
    }
}

// The variadic `new` overload survives any number of double arguments,
// since its only live rival (the 2-arg `(int, Zero)` overload) is
// eliminated once arity no longer matches.
#[test]
fn dvector_new_variadic_accepts_any_arity() {
    let expr = assert_compiles("dvector_variadic", "DVector::new(1.0, 2.0, 3.0, 4.0)");
    match expr {
        Expr::Block(stmts, _, _) => match stmts.last().unwrap() {
            Expr::New { class, args, ty, .. } => {
                assert_eq!(class, "DVector");
                assert_eq!(*ty, Type::DVector);
                assert_eq!(args.len(), 4);
            }
            other => panic!("expected a New expr, got {:?}", other),
        },
        other => panic!("expected a block, got {:?}", other),
    }
}

// `Random::new()` has a single overload whose only formal is a sentinel;
// called with zero user arguments, the sentinel must still be
// materialized into the emitted arg list.
#[test]
fn random_new_materializes_sentinel_with_no_user_args() {
    let expr = assert_compiles("random_new", "Random::new()");
    match expr {
        Expr::Block(stmts, _, _) => match stmts.last().unwrap() {
            Expr::New { class, args, ty, .. } => {
                assert_eq!(class, "Random");
                assert_eq!(*ty, Type::Double);
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected a New expr, got {:?}", other),
        },
        other => panic!("expected a block, got {:?}", other),
    }
}

// DVector.stats() vs DVector.stats(weight): calling with zero arguments
// must still resolve (not ambiguous) once the weighted overload is
// eliminated by arity.
#[test]
fn dvector_stats_resolves_unweighted_overload() {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("v", Some(Type::DVector));
    let expr = parse_statement("v.stats()", &bindings, &mut ds).unwrap();
    assert!(matches!(expr.ty(), Type::Acc) || matches!(expr.ty(), Type::Double));
}

// Too many arguments for every overload of a class method (`Matrix::identity`
// takes exactly one `int`) must fail arity filtering entirely and report
// `OverloadError::NoMatch`, not panic or silently drop extra args.
#[test]
fn matrix_identity_with_wrong_arity_is_no_match() {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    let err = parse_statement("Matrix::identity(3, 4)", &bindings, &mut ds).unwrap_err();
    assert!(
        matches!(err, CompileError::Overload(OverloadError::NoMatch { .. })),
        "expected OverloadError::NoMatch, got {:?}",
        err
    );
}

// An unknown class method name is a name error, not an overload error:
// `class_method` lookup itself fails before any argument is parsed.
#[test]
fn unknown_class_method_is_a_name_error() {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    let err = parse_statement("DVector::frobnicate(1)", &bindings, &mut ds).unwrap_err();
    assert!(matches!(err, CompileError::Name(_)), "expected a name error, got {:?}", err);
}

// `math::sqrt` is reachable unqualified too, via the bare-call path that
// checks the `math.<name>` class-method table when no constructor exists
// under that bare name.
#[test]
fn bare_call_resolves_through_math_namespace() {
    let expr = assert_compiles("bare_sqrt", "sqrt(4.0)");
    assert_eq!(*expr.ty(), Type::Double);
}

// A lambda argument's registered formal names the lambda's *return* type,
// not the lambda's own `Type::Lambda(...)` shape; `map` over a `DVector`
// must still resolve when the lambda body evaluates to a `double`.
#[test]
fn lambda_argument_overload_match_uses_body_return_type() {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("v", Some(Type::DVector));
    let expr = parse_statement("v.map(x => x * 2.0)", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::DVector);
}
