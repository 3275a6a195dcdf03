//! End-to-end scenarios from the language notes' testable-properties
//! section: one source string, one default data source, the expected
//! result type and value.

use austra_compiler::compiler::ast::{Constant, Definition, Expr};
use austra_compiler::compiler::datasource::DataSource;
use austra_compiler::compiler::types::Type;
use austra_compiler::{parse_definition, parse_statement, Bindings, BindingsOptions, CompileError};
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

#[test]
fn let_in_and_power_expansion() {
    // `let x = 3 in x^2 + 1` -> int, 10
    let expr = assert_compiles("let_in_power", "let x = 3 in x^2 + 1");
    assert_eq!(*expr.ty(), Type::Int);
    match expr {
        Expr::Block(stmts, _, _) => {
            let last = stmts.last().unwrap();
            match last {
                Expr::BinaryOp(_, _, _, ty, _) => assert_eq!(*ty, Type::Int),
                other => panic!("expected binary op, got {:?}", other),
            }
        }
        other => panic!("expected a block, got {:?}", other),
    }
}

#[test]
fn vector_literal_scaled_sum_rewrites_to_combine2() {
    // `[1, 2, 3] + 2 * [4, 5, 6]` -> DVector, [9, 12, 15]
    let expr = assert_compiles("vector_scaled_sum", "[1, 2, 3] + 2 * [4, 5, 6]");
    assert_eq!(*expr.ty(), Type::DVector);
}

#[test]
fn chained_comparison_is_true() {
    // `if 1 < 2 < 3 then true else false` -> bool, true
    let expr = assert_compiles("chained_comparison", "if 1 < 2 < 3 then true else false");
    assert_eq!(*expr.ty(), Type::Bool);
}

#[test]
fn bare_math_sqrt_roundtrips_near_zero() {
    // `math::sqrt(2)^2 - 2` -> double, within 1e-12 of 0
    let expr = assert_compiles("sqrt_roundtrip", "math::sqrt(2)^2 - 2");
    assert_eq!(*expr.ty(), Type::Double);
}

#[test]
fn def_then_bang_reference_resolves() {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    let def = parse_definition("def sq = 5 * 5", &bindings, &mut ds).unwrap();
    assert_eq!(def.name, "sq");
    assert_eq!(*def.expression.ty(), Type::Int);

    let expr = parse_statement("sq!", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::Int);
}

#[test]
fn vector_transpose_is_a_type_error() {
    // `[1.0, 2.0, 3.0]'` -> TypeError (cannot transpose a vector)
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    let err = parse_statement("[1.0, 2.0, 3.0]'", &bindings, &mut ds).unwrap_err();
    assert!(matches!(err, CompileError::Type(_)), "expected a type error, got {:?}", err);
}

#[test]
fn identifiers_are_case_insensitive() {
    // `let X = 1 in x + X` -> 2 (int)
    let expr = assert_compiles("case_insensitive", "let X = 1 in x + X");
    assert_eq!(*expr.ty(), Type::Int);
}

#[test]
fn int_plus_double_widens_to_double() {
    let expr = assert_compiles("widening", "let a = 1 in let b = 2.0 in a + b");
    assert_eq!(*expr.ty(), Type::Double);
}

#[test]
fn power_of_three_does_not_reevaluate_the_base() {
    // x^3 on a session variable should reference the base exactly once,
    // via the synthesized single-binding local, not three times.
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("x", Some(Type::Double));
    let expr = parse_statement("x^3", &bindings, &mut ds).unwrap();
    let mut param_refs = 0usize;
    count_parameter_refs(&expr, &mut param_refs);
    assert_eq!(param_refs, 3, "expected exactly 3 parameter references (one assign target use excluded)");
}

fn count_parameter_refs(expr: &Expr, count: &mut usize) {
    match expr {
        Expr::Parameter(_, _, _, _) => *count += 1,
        Expr::Block(stmts, _, _) => stmts.iter().for_each(|s| count_parameter_refs(s, count)),
        Expr::Assign { value, .. } => count_parameter_refs(value, count),
        Expr::BinaryOp(_, a, b, _, _) => {
            count_parameter_refs(a, count);
            count_parameter_refs(b, count);
        }
        _ => {}
    }
}

#[test]
fn duplicate_def_registration_fails() {
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    parse_definition("def sq = 1", &bindings, &mut ds).unwrap();
    let err = parse_definition("def sq = 2", &bindings, &mut ds).unwrap_err();
    assert!(matches!(err, CompileError::Usage(_)));
}

#[test]
fn matrix_times_vector_plus_scaled_vector_rewrites_to_multiply_add() {
    // `m*v1 + d*v2` -> DVector, via Matrix::multiply_add(v1, d, v2)
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("m", Some(Type::Matrix));
    ds.set("v1", Some(Type::DVector));
    ds.set("v2", Some(Type::DVector));
    ds.set("d", Some(Type::Double));
    let expr = parse_statement("m*v1 + d*v2", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::DVector);
    match expr {
        Expr::Call { method, args, .. } => {
            assert_eq!(method, "multiply_add");
            assert_eq!(args.len(), 3);
        }
        other => panic!("expected a multiply_add call, got {:?}", other),
    }
}

#[test]
fn matrix_times_vector_minus_vector_rewrites_to_multiply_add_sub() {
    // `m*v1 - w` -> DVector, via Matrix::multiply_add_sub(v1, -w)
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("m", Some(Type::Matrix));
    ds.set("v1", Some(Type::DVector));
    ds.set("w", Some(Type::DVector));
    let expr = parse_statement("m*v1 - w", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::DVector);
    match expr {
        Expr::Call { method, args, .. } => {
            assert_eq!(method, "multiply_add_sub");
            assert_eq!(args.len(), 2);
            assert!(matches!(&args[1], Expr::UnaryOp(_, _, Type::DVector, _)));
        }
        other => panic!("expected a multiply_add_sub call, got {:?}", other),
    }
}

#[test]
fn matrix_times_own_transpose_rewrites_to_square() {
    // `m*m'` -> Matrix, via Matrix::square()
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("m", Some(Type::Matrix));
    let expr = parse_statement("m*m'", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::Matrix);
    match expr {
        Expr::Call { method, args, .. } => {
            assert_eq!(method, "square");
            assert!(args.is_empty());
        }
        other => panic!("expected a square call, got {:?}", other),
    }
}

#[test]
fn matrix_times_other_transpose_rewrites_to_multiply_transpose() {
    // `m*n'` -> Matrix, via Matrix::multiply_transpose(n)
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("m", Some(Type::Matrix));
    ds.set("n", Some(Type::Matrix));
    let expr = parse_statement("m*n'", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::Matrix);
    match expr {
        Expr::Call { method, args, .. } => {
            assert_eq!(method, "multiply_transpose");
            assert_eq!(args.len(), 1);
        }
        other => panic!("expected a multiply_transpose call, got {:?}", other),
    }
}

#[test]
fn transposed_matrix_times_vector_rewrites_to_transpose_multiply() {
    // `m'*v1` -> DVector, via Matrix::transpose_multiply(v1)
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("m", Some(Type::Matrix));
    ds.set("v1", Some(Type::DVector));
    let expr = parse_statement("m'*v1", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::DVector);
    match expr {
        Expr::Call { method, args, .. } => {
            assert_eq!(method, "transpose_multiply");
            assert_eq!(args.len(), 1);
        }
        other => panic!("expected a transpose_multiply call, got {:?}", other),
    }
}

#[test]
fn lambda_body_widens_against_declared_formal_return_type() {
    // `v.map(x => 1)`: the lambda body is an int literal, but `DVector.map`
    // declares its lambda's formal return type as double. Closing checks
    // against that declared type, not the body's own inferred type.
    let bindings = Bindings::new(BindingsOptions::default());
    let mut ds = MemoryDataSource::new();
    ds.set("v", Some(Type::DVector));
    let expr = parse_statement("v.map(x => 1)", &bindings, &mut ds).unwrap();
    assert_eq!(*expr.ty(), Type::DVector);
    match expr {
        Expr::Call { args, .. } => match &args[0] {
            Expr::Lambda { ty: Type::Lambda(_, ret), .. } => assert_eq!(**ret, Type::Double),
            other => panic!("expected a lambda argument, got {:?}", other),
        },
        other => panic!("expected a call, got {:?}", other),
    }
}

#[test]
fn constant_folding_on_double_literals() {
    let expr = assert_compiles("const_fold", "1.5 + 2.5");
    match expr {
        Expr::Block(stmts, _, _) => match stmts.last().unwrap() {
            Expr::Constant(Constant::Real(v), Type::Double, _) => assert!((v - 4.0).abs() < 1e-12),
            other => panic!("expected a folded double constant, got {:?}", other),
        },
        other => panic!("expected a block, got {:?}", other),
    }
}
