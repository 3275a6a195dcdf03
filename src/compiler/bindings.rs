//! Bindings registry (C3): static, case-insensitive tables for property,
//! method, overload, class-method, and completion-member resolution.
//!
//! The real runtime populates these by reflecting over its numeric
//! library. There's no such library here to reflect over, so the tables
//! are populated explicitly, the way the design notes suggest: a small
//! per-entry literal table rather than a code generator. The entries below
//! are a representative slice of the documented namespaces (`math`, `vec`,
//! `cvec`, `ivec`, `matrix`, `series`, `seq`, `cseq`, `iseq`, `model`,
//! `spline`) — enough to exercise every resolution rule in §4.2/§4.4, not
//! a byte-for-byte port of a real numeric API surface.

use crate::compiler::types::Type;
use std::collections::HashMap;

/// Markers telling the emitter to auto-supply an argument rather than
/// require one from the caller. Not counted toward user-visible arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelArg {
    Zero,
    One,
    Random,
    NormalRandom,
}

/// One formal parameter slot in a `MethodData`.
#[derive(Debug, Clone, PartialEq)]
pub enum Formal {
    Type(Type),
    /// trailing variadic slot; actuals convert to this element type
    Variadic(Type),
    Sentinel(SentinelArg),
}

/// A single overload: formal types, which positions are lambdas (and their
/// arity), and the return type.
#[derive(Debug, Clone)]
pub struct MethodData {
    pub formals: Vec<Formal>,
    /// `Some(1)`/`Some(2)` at a formal's index if that position is a 1- or
    /// 2-argument lambda; `None` otherwise.
    pub lambda_arity: Vec<Option<u8>>,
    pub return_type: Type,
    /// runtime symbol the emitter targets; opaque to the compiler itself.
    pub implementor: &'static str,
}

impl MethodData {
    /// Arguments actually expected from the caller: sentinel formals are
    /// auto-supplied and don't count; a trailing variadic formal counts as
    /// "at least this many".
    pub fn expected_args(&self) -> usize {
        self.formals
            .iter()
            .filter(|f| !matches!(f, Formal::Sentinel(_)))
            .count()
    }

    pub fn is_variadic(&self) -> bool {
        matches!(self.formals.last(), Some(Formal::Variadic(_)))
    }
}

/// An ordered overload set plus, per position, whether *any* surviving
/// overload expects a lambda there (consulted before the parser decides to
/// parse `=>`).
#[derive(Debug, Clone, Default)]
pub struct MethodList {
    pub overloads: Vec<MethodData>,
}

impl MethodList {
    fn single(m: MethodData) -> Self {
        Self {
            overloads: vec![m],
        }
    }

    /// Does any live overload expect a lambda at position `i`?
    pub fn lambda_at(&self, i: usize, live: &[bool]) -> Option<u8> {
        self.overloads
            .iter()
            .enumerate()
            .filter(|(j, _)| live.get(*j).copied().unwrap_or(true))
            .find_map(|(_, m)| m.lambda_arity.get(i).copied().flatten())
    }
}

fn key(ty: &Type, ident: &str) -> (Type, String) {
    (ty.clone(), ident.to_ascii_lowercase())
}

/// Configuration threaded through `Bindings::new` (§10.3).
#[derive(Debug, Clone, Default)]
pub struct BindingsOptions {
    /// registering a `def` whose body is statically a `Series` also emits
    /// a trailing `Series.SetName(name)` call. Off by default (§11.2).
    pub tag_series_on_def: bool,
}

pub struct Bindings {
    properties: HashMap<(Type, String), Type>,
    methods: HashMap<(Type, String), MethodData>,
    method_overloads: HashMap<(Type, String), MethodList>,
    class_methods: HashMap<String, MethodList>,
    class_members: HashMap<String, Vec<String>>,
    members: HashMap<Type, Vec<String>>,
    type_names: HashMap<String, Type>,
    pub options: BindingsOptions,
}

impl Bindings {
    pub fn new(options: BindingsOptions) -> Self {
        let mut b = Bindings {
            properties: HashMap::new(),
            methods: HashMap::new(),
            method_overloads: HashMap::new(),
            class_methods: HashMap::new(),
            class_members: HashMap::new(),
            members: HashMap::new(),
            type_names: HashMap::new(),
            options,
        };
        b.register_type_names();
        b.register_properties();
        b.register_instance_methods();
        b.register_class_methods();
        b.build_completion_tables();
        b
    }

    fn register_type_names(&mut self) {
        for (name, ty) in [
            ("int", Type::Int),
            ("double", Type::Double),
            ("complex", Type::Complex),
            ("bool", Type::Bool),
            ("string", Type::String),
            ("date", Type::Date),
            ("DVector", Type::DVector),
            ("CVector", Type::CVector),
            ("NVector", Type::NVector),
            ("Matrix", Type::Matrix),
            ("LMatrix", Type::LMatrix),
            ("RMatrix", Type::RMatrix),
            ("Series", Type::Series),
            ("Series<int>", Type::SeriesInt),
            ("Series<double>", Type::SeriesDouble),
            ("DSequence", Type::DSequence),
            ("CSequence", Type::CSequence),
            ("NSequence", Type::NSequence),
            ("Polynomial", Type::Polynomial),
            ("Acc", Type::Acc),
        ] {
            self.type_names.insert(name.to_ascii_lowercase(), ty);
        }
    }

    fn add_property(&mut self, ty: Type, name: &str, ret: Type) {
        self.properties.insert(key(&ty, name), ret);
    }

    fn add_method(&mut self, ty: Type, name: &str, m: MethodData) {
        self.methods.insert(key(&ty, name), m.clone());
        self.method_overloads
            .entry(key(&ty, name))
            .or_default()
            .overloads
            .push(m);
    }

    fn add_overload(&mut self, ty: Type, name: &str, m: MethodData) {
        self.method_overloads
            .entry(key(&ty, name))
            .or_default()
            .overloads
            .push(m);
    }

    fn add_class_method(&mut self, class: &str, method: &str, m: MethodData) {
        self.class_methods
            .entry(format!("{}.{}", class.to_ascii_lowercase(), method.to_ascii_lowercase()))
            .or_default()
            .overloads
            .push(m);
    }

    fn register_properties(&mut self) {
        self.add_property(Type::Complex, "real", Type::Double);
        self.add_property(Type::Complex, "imag", Type::Double);
        self.add_property(Type::Complex, "magnitude", Type::Double);
        self.add_property(Type::Complex, "phase", Type::Double);

        for vt in [Type::DVector, Type::CVector, Type::NVector] {
            self.add_property(vt.clone(), "length", Type::Int);
            self.add_property(vt.clone(), "norm", Type::Double);
            self.add_property(vt.clone(), "sum", Type::Double);
        }

        for mt in [Type::Matrix, Type::LMatrix, Type::RMatrix] {
            self.add_property(mt.clone(), "rows", Type::Int);
            self.add_property(mt.clone(), "cols", Type::Int);
            self.add_property(mt.clone(), "trace", Type::Double);
            self.add_property(mt.clone(), "determinant", Type::Double);
        }

        self.add_property(Type::Series, "count", Type::Int);
        self.add_property(Type::Series, "first", Type::Double);
        self.add_property(Type::Series, "last", Type::Double);
        self.add_property(Type::Series, "mean", Type::Double);
        self.add_property(Type::Series, "stddev", Type::Double);

        self.add_property(Type::Date, "day", Type::Int);
        self.add_property(Type::Date, "month", Type::Int);
        self.add_property(Type::Date, "year", Type::Int);

        self.add_property(Type::Polynomial, "degree", Type::Int);
    }

    fn register_instance_methods(&mut self) {
        // vector/matrix affine-rewrite helpers (§4.4 table). Registered so
        // the emitter's rewrite can validate argument types, even though
        // the rewrite itself constructs these calls rather than parsing them.
        self.add_method(
            Type::DVector,
            "combine2",
            MethodData {
                formals: vec![
                    Formal::Type(Type::Double),
                    Formal::Type(Type::Double),
                    Formal::Type(Type::DVector),
                    Formal::Type(Type::DVector),
                ],
                lambda_arity: vec![None, None, None, None],
                return_type: Type::DVector,
                implementor: "DVector::combine2",
            },
        );
        self.add_method(
            Type::Matrix,
            "multiply_add",
            MethodData {
                formals: vec![
                    Formal::Type(Type::DVector),
                    Formal::Type(Type::Double),
                    Formal::Type(Type::DVector),
                ],
                lambda_arity: vec![None, None, None],
                return_type: Type::DVector,
                implementor: "Matrix::multiply_add",
            },
        );
        self.add_method(
            Type::DVector,
            "multiply_add",
            MethodData {
                formals: vec![Formal::Type(Type::Double), Formal::Type(Type::DVector)],
                lambda_arity: vec![None, None],
                return_type: Type::DVector,
                implementor: "DVector::multiply_add",
            },
        );
        self.add_method(
            Type::Matrix,
            "multiply_add_sub",
            MethodData {
                formals: vec![Formal::Type(Type::DVector), Formal::Type(Type::DVector)],
                lambda_arity: vec![None, None],
                return_type: Type::DVector,
                implementor: "Matrix::multiply_add_sub",
            },
        );
        self.add_method(
            Type::DVector,
            "squared",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Double,
                implementor: "DVector::squared",
            },
        );
        self.add_method(
            Type::Matrix,
            "multiply_transpose",
            MethodData {
                formals: vec![Formal::Type(Type::Matrix)],
                lambda_arity: vec![None],
                return_type: Type::Matrix,
                implementor: "Matrix::multiply_transpose",
            },
        );
        self.add_method(
            Type::Matrix,
            "transpose_multiply",
            MethodData {
                formals: vec![Formal::Type(Type::DVector)],
                lambda_arity: vec![None],
                return_type: Type::DVector,
                implementor: "Matrix::transpose_multiply",
            },
        );
        self.add_method(
            Type::Matrix,
            "square",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Matrix,
                implementor: "Matrix::square",
            },
        );

        // lambda-taking higher-order methods, to exercise the lambda mask.
        self.add_method(
            Type::DVector,
            "map",
            MethodData {
                formals: vec![Formal::Type(Type::Double)],
                lambda_arity: vec![Some(1)],
                return_type: Type::DVector,
                implementor: "DVector::map",
            },
        );
        self.add_method(
            Type::DVector,
            "reduce",
            MethodData {
                formals: vec![Formal::Type(Type::Double), Formal::Type(Type::Double)],
                lambda_arity: vec![None, Some(2)],
                return_type: Type::Double,
                implementor: "DVector::reduce",
            },
        );
        self.add_method(
            Type::Series,
            "map",
            MethodData {
                formals: vec![Formal::Type(Type::Double)],
                lambda_arity: vec![Some(1)],
                return_type: Type::Series,
                implementor: "Series::map",
            },
        );
        self.add_method(
            Type::Series,
            "stats",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Acc,
                implementor: "Series::stats",
            },
        );
        self.add_method(
            Type::Series,
            "set_name",
            MethodData {
                formals: vec![Formal::Type(Type::String)],
                lambda_arity: vec![None],
                return_type: Type::Series,
                implementor: "Series::SetName",
            },
        );

        self.add_method(
            Type::Matrix,
            "transpose",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Matrix,
                implementor: "Matrix::transpose",
            },
        );
        self.add_method(
            Type::Matrix,
            "evd",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Evd,
                implementor: "Matrix::evd",
            },
        );
        self.add_method(
            Type::Matrix,
            "cholesky",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Cholesky,
                implementor: "Matrix::cholesky",
            },
        );

        // overloaded instance method: DVector.stats() vs DVector.stats(weight)
        self.add_overload(
            Type::DVector,
            "stats",
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Acc,
                implementor: "DVector::stats",
            },
        );
        self.methods.insert(
            key(&Type::DVector, "stats"),
            MethodData {
                formals: vec![],
                lambda_arity: vec![],
                return_type: Type::Acc,
                implementor: "DVector::stats",
            },
        );
        self.add_overload(
            Type::DVector,
            "stats",
            MethodData {
                formals: vec![Formal::Type(Type::DVector)],
                lambda_arity: vec![None],
                return_type: Type::Acc,
                implementor: "DVector::weighted_stats",
            },
        );
    }

    fn register_class_methods(&mut self) {
        // constructors (modelled as methods returning the constructed type)
        self.add_class_method(
            "DVector",
            "new",
            MethodData {
                formals: vec![Formal::Variadic(Type::Double)],
                lambda_arity: vec![None],
                return_type: Type::DVector,
                implementor: "DVector::new",
            },
        );
        self.add_class_method(
            "DVector",
            "new",
            MethodData {
                formals: vec![Formal::Type(Type::Int), Formal::Sentinel(SentinelArg::Zero)],
                lambda_arity: vec![None, None],
                return_type: Type::DVector,
                implementor: "DVector::zeros",
            },
        );
        self.add_class_method(
            "Matrix",
            "identity",
            MethodData {
                formals: vec![Formal::Type(Type::Int)],
                lambda_arity: vec![None],
                return_type: Type::Matrix,
                implementor: "Matrix::identity",
            },
        );
        self.add_class_method(
            "Random",
            "new",
            MethodData {
                formals: vec![Formal::Sentinel(SentinelArg::Random)],
                lambda_arity: vec![None],
                return_type: Type::Double,
                implementor: "Random::new",
            },
        );
        self.add_class_method(
            "NormalRandom",
            "new",
            MethodData {
                formals: vec![Formal::Sentinel(SentinelArg::NormalRandom)],
                lambda_arity: vec![None],
                return_type: Type::Double,
                implementor: "NormalRandom::new",
            },
        );

        // the `math` pseudo-class, reachable both as `math::f(x)` and `f(x)`
        for (name, ret) in [
            ("sin", Type::Double),
            ("cos", Type::Double),
            ("tan", Type::Double),
            ("exp", Type::Double),
            ("log", Type::Double),
            ("sqrt", Type::Double),
            ("abs", Type::Double),
        ] {
            self.add_class_method(
                "math",
                name,
                MethodData {
                    formals: vec![Formal::Type(Type::Double)],
                    lambda_arity: vec![None],
                    return_type: ret.clone(),
                    implementor: match name {
                        "sin" => "math::sin",
                        "cos" => "math::cos",
                        "tan" => "math::tan",
                        "exp" => "math::exp",
                        "log" => "math::log",
                        "sqrt" => "math::sqrt",
                        _ => "math::abs",
                    },
                },
            );
        }
        self.add_class_method(
            "math",
            "pow",
            MethodData {
                formals: vec![Formal::Type(Type::Double), Formal::Type(Type::Double)],
                lambda_arity: vec![None, None],
                return_type: Type::Double,
                implementor: "math::pow",
            },
        );

        self.add_class_method(
            "seq",
            "range",
            MethodData {
                formals: vec![Formal::Type(Type::Double), Formal::Type(Type::Double)],
                lambda_arity: vec![None, None],
                return_type: Type::DSequence,
                implementor: "DSequence::range",
            },
        );
        self.add_class_method(
            "spline",
            "fit",
            MethodData {
                formals: vec![Formal::Type(Type::Series)],
                lambda_arity: vec![None],
                return_type: Type::DateSpline,
                implementor: "DateSpline::fit",
            },
        );
        self.add_class_method(
            "model",
            "ar",
            MethodData {
                formals: vec![Formal::Type(Type::Series), Formal::Type(Type::Int)],
                lambda_arity: vec![None, None],
                return_type: Type::ARSModel,
                implementor: "ARSModel::fit",
            },
        );
    }

    fn build_completion_tables(&mut self) {
        for ((ty, name), _) in self.properties.iter() {
            self.members.entry(ty.clone()).or_default().push(name.clone());
        }
        for (ty, name) in self.methods.keys().cloned() {
            self.members.entry(ty).or_default().push(name);
        }
        for key in self.class_methods.keys() {
            if let Some((class, method)) = key.split_once('.') {
                self.class_members
                    .entry(class.to_string())
                    .or_default()
                    .push(method.to_string());
            }
        }
        for list in self.members.values_mut() {
            list.sort();
            list.dedup();
        }
        for list in self.class_members.values_mut() {
            list.sort();
            list.dedup();
        }
    }

    pub fn property(&self, ty: &Type, ident: &str) -> Option<&Type> {
        self.properties.get(&key(ty, ident))
    }

    pub fn method(&self, ty: &Type, ident: &str) -> Option<&MethodData> {
        self.methods.get(&key(ty, ident))
    }

    pub fn overloads(&self, ty: &Type, ident: &str) -> Option<&MethodList> {
        self.method_overloads.get(&key(ty, ident))
    }

    pub fn class_method(&self, class_method: &str) -> Option<&MethodList> {
        self.class_methods.get(&class_method.to_ascii_lowercase())
    }

    pub fn members(&self, ty: &Type) -> &[String] {
        self.members.get(ty).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn class_members(&self, class: &str) -> &[String] {
        self.class_members
            .get(class)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn type_name(&self, id: &str) -> Option<&Type> {
        self.type_names.get(&id.to_ascii_lowercase())
    }

    /// Root identifiers completion may offer with no preceding path: every
    /// registered class/constructor name (`math`, `DVector`, ...).
    pub fn global_roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self.class_members.keys().cloned().collect();
        roots.sort();
        roots.dedup();
        roots
    }
}
