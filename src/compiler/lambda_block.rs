//! Lambda block (C4): a stack of parameter frames consulted while parsing
//! and typing a lambda body.

use crate::compiler::ast::{Expr, ParamId};
use crate::compiler::types::Type;

struct Frame {
    params: Vec<(String, ParamId, Type)>,
}

/// Result of closing a frame: the return type the closer settled on, and
/// whether it had to apply the "upgraded" numeric-widening leniency.
pub struct Closed {
    pub return_type: Type,
    pub upgraded: bool,
}

#[derive(Default)]
pub struct LambdaBlock {
    frames: Vec<Frame>,
}

impl LambdaBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, params: Vec<(String, ParamId, Type)>) {
        self.frames.push(Frame { params });
    }

    /// Innermost-shadow-wins lookup by name, case-insensitive.
    pub fn lookup(&self, name: &str) -> Option<(ParamId, Type)> {
        for frame in self.frames.iter().rev() {
            if let Some((_, id, ty)) = frame
                .params
                .iter()
                .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            {
                return Some((*id, ty.clone()));
            }
        }
        None
    }

    /// Parameter names currently in scope, innermost frame first — used by
    /// completion to list live lambda parameters.
    pub fn gather_for_completion(&self) -> Vec<String> {
        let mut out = Vec::new();
        for frame in self.frames.iter().rev() {
            for (name, _, _) in &frame.params {
                out.push(name.clone());
            }
        }
        out
    }

    /// Pop the top frame and reconcile `body`'s type against the formal
    /// `return_type`, applying the single permitted implicit conversion
    /// (`int -> double`, `int|double -> complex`). If `allow_upgrade` is
    /// set, a `double` body is accepted where the formal return type is
    /// some other numeric type, and the caller is told the type was
    /// upgraded. Any other mismatch is an error left for the caller to
    /// raise with its own span.
    pub fn close(
        &mut self,
        body: &Expr,
        return_type: &Type,
        allow_upgrade: bool,
    ) -> Result<Closed, ()> {
        self.frames.pop().ok_or(())?;
        let body_ty = body.ty();
        if body_ty == return_type {
            return Ok(Closed {
                return_type: return_type.clone(),
                upgraded: false,
            });
        }
        if body_ty.convertible_to(return_type) {
            return Ok(Closed {
                return_type: return_type.clone(),
                upgraded: false,
            });
        }
        if allow_upgrade && *body_ty == Type::Double && return_type.is_numeric() {
            return Ok(Closed {
                return_type: Type::Double,
                upgraded: true,
            });
        }
        Err(())
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Constant;
    use crate::compiler::tokens::Span;

    fn dummy_span() -> Span {
        Span::new(0, 0, 1, 1)
    }

    #[test]
    fn innermost_shadow_wins() {
        let mut lb = LambdaBlock::new();
        lb.push(vec![("x".into(), ParamId(0), Type::Int)]);
        lb.push(vec![("x".into(), ParamId(1), Type::Double)]);
        let (id, ty) = lb.lookup("X").unwrap();
        assert_eq!(id, ParamId(1));
        assert_eq!(ty, Type::Double);
    }

    #[test]
    fn close_applies_int_to_double_widening() {
        let mut lb = LambdaBlock::new();
        lb.push(vec![("x".into(), ParamId(0), Type::Int)]);
        let body = Expr::Constant(Constant::Int(1), Type::Int, dummy_span());
        let closed = lb.close(&body, &Type::Double, false).unwrap();
        assert_eq!(closed.return_type, Type::Double);
        assert!(!closed.upgraded);
    }

    #[test]
    fn close_reports_upgrade_when_allowed() {
        let mut lb = LambdaBlock::new();
        lb.push(vec![("x".into(), ParamId(0), Type::Int)]);
        let body = Expr::Constant(Constant::Real(1.0), Type::Double, dummy_span());
        let closed = lb.close(&body, &Type::Complex, true).unwrap();
        assert!(closed.upgraded);
        assert_eq!(closed.return_type, Type::Double);
    }
}
