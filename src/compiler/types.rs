//! The fixed, closed universe of AUSTRA value types.

use std::fmt;

/// A static type in the AUSTRA universe. Closed and known entirely to the
/// compiler — there is no user-defined type declaration surface, so this is
/// a flat enum rather than an open symbol-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Int,
    Double,
    Complex,
    Bool,
    String,
    Date,

    DVector,
    CVector,
    NVector,
    Matrix,
    LMatrix,
    RMatrix,

    Series,
    SeriesInt,
    SeriesDouble,

    DSequence,
    CSequence,
    NSequence,

    LinearSModel,
    LinearVModel,
    ARSModel,
    ARVModel,
    MASModel,
    MAVModel,
    MvoModel,
    Portfolio,
    SimplexModel,

    Evd,
    Cholesky,
    Lu,

    FftRModel,
    FftCModel,

    DateSpline,
    VectorSpline,

    Polynomial,
    Acc,

    /// A lambda/delegate type: `(params) -> result`.
    Lambda(Vec<Type>, Box<Type>),

    /// The type of a `set`/`def` statement result and of assignment
    /// expressions; carries no value.
    Void,

    /// Placeholder installed after a type error has already been reported,
    /// so downstream checks don't cascade a second diagnostic from the same
    /// mistake. Never surfaced to a host as a result type.
    Error,
}

impl Type {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Double | Type::Complex)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Type::DVector | Type::CVector | Type::NVector)
    }

    pub fn is_matrix(&self) -> bool {
        matches!(self, Type::Matrix | Type::LMatrix | Type::RMatrix)
    }

    /// Rank of a numeric type in the `int -> double -> complex` widening
    /// chain, used to pick the narrower of two convertible types.
    pub fn numeric_rank(&self) -> Option<u8> {
        match self {
            Type::Int => Some(0),
            Type::Double => Some(1),
            Type::Complex => Some(2),
            _ => None,
        }
    }

    /// The common type two numeric operands widen to, or `None` if they
    /// don't share a widening chain at all (e.g. a vector and a scalar).
    pub fn widen(a: &Type, b: &Type) -> Option<Type> {
        match (a.numeric_rank(), b.numeric_rank()) {
            (Some(ra), Some(rb)) => Some(if ra >= rb { a.clone() } else { b.clone() }),
            _ if a == b => Some(a.clone()),
            _ => None,
        }
    }

    /// Whether a value of type `from` is usable where `to` is expected,
    /// under the single permitted implicit conversions: identity,
    /// `int -> double`, and `int|double -> complex`.
    pub fn convertible_to(&self, to: &Type) -> bool {
        if self == to {
            return true;
        }
        match (self, to) {
            (Type::Int, Type::Double) => true,
            (Type::Int, Type::Complex) => true,
            (Type::Double, Type::Complex) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Double => write!(f, "double"),
            Type::Complex => write!(f, "complex"),
            Type::Bool => write!(f, "bool"),
            Type::String => write!(f, "string"),
            Type::Date => write!(f, "date"),
            Type::DVector => write!(f, "DVector"),
            Type::CVector => write!(f, "CVector"),
            Type::NVector => write!(f, "NVector"),
            Type::Matrix => write!(f, "Matrix"),
            Type::LMatrix => write!(f, "LMatrix"),
            Type::RMatrix => write!(f, "RMatrix"),
            Type::Series => write!(f, "Series"),
            Type::SeriesInt => write!(f, "Series<int>"),
            Type::SeriesDouble => write!(f, "Series<double>"),
            Type::DSequence => write!(f, "DSequence"),
            Type::CSequence => write!(f, "CSequence"),
            Type::NSequence => write!(f, "NSequence"),
            Type::LinearSModel => write!(f, "LinearSModel"),
            Type::LinearVModel => write!(f, "LinearVModel"),
            Type::ARSModel => write!(f, "ARSModel"),
            Type::ARVModel => write!(f, "ARVModel"),
            Type::MASModel => write!(f, "MASModel"),
            Type::MAVModel => write!(f, "MAVModel"),
            Type::MvoModel => write!(f, "MvoModel"),
            Type::Portfolio => write!(f, "Portfolio"),
            Type::SimplexModel => write!(f, "SimplexModel"),
            Type::Evd => write!(f, "EVD"),
            Type::Cholesky => write!(f, "Cholesky"),
            Type::Lu => write!(f, "LU"),
            Type::FftRModel => write!(f, "FftRModel"),
            Type::FftCModel => write!(f, "FftCModel"),
            Type::DateSpline => write!(f, "DateSpline"),
            Type::VectorSpline => write!(f, "VectorSpline"),
            Type::Polynomial => write!(f, "Polynomial"),
            Type::Acc => write!(f, "Acc"),
            Type::Lambda(params, ret) => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> {ret}")
            }
            Type::Void => write!(f, "void"),
            Type::Error => write!(f, "<error>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_is_monotone() {
        assert_eq!(Type::widen(&Type::Int, &Type::Double), Some(Type::Double));
        assert_eq!(
            Type::widen(&Type::Double, &Type::Complex),
            Some(Type::Complex)
        );
        assert_eq!(Type::widen(&Type::Int, &Type::Int), Some(Type::Int));
    }

    #[test]
    fn vectors_never_widen_to_matrices() {
        assert_eq!(Type::widen(&Type::DVector, &Type::Matrix), None);
    }

    #[test]
    fn convertibility_matches_widening_chain() {
        assert!(Type::Int.convertible_to(&Type::Double));
        assert!(Type::Int.convertible_to(&Type::Complex));
        assert!(Type::Double.convertible_to(&Type::Complex));
        assert!(!Type::Double.convertible_to(&Type::Int));
        assert!(!Type::Bool.convertible_to(&Type::Int));
    }
}
