//! Parser / type-checker / emitter (C5): recursive-descent statement
//! parsing fused with Pratt-style expression parsing, consulting the
//! bindings registry (C3) and lambda block (C4) to type and emit nodes of
//! the expression tree (`ast::Expr`).

use crate::compiler::ast::*;
use crate::compiler::bindings::{Bindings, Formal, MethodList};
use crate::compiler::datasource::DataSource;
use crate::compiler::error::{Bail, NameError, OverloadError, ParseError, PResult, TypeError, UsageError};
use crate::compiler::lambda_block::LambdaBlock;
use crate::compiler::lexer::Scanner;
use crate::compiler::tokens::{Span, Token, TokenKind};
use crate::compiler::types::Type;
use std::collections::{HashMap, HashSet};

pub struct Parser<'a> {
    scanner: Scanner,
    current: Token,
    source: &'a str,
    bindings: &'a Bindings,
    data_source: &'a mut dyn DataSource,

    /// `let`/script-scoped locals, source order; one `Parser` lives for the
    /// whole of one host-provided `text`, so "script scope" is simply this
    /// parser's own lifetime (documented in DESIGN.md).
    top_let: Vec<(String, ParamId, Type)>,
    locals: HashMap<String, (ParamId, Type)>,
    pending_sets: HashMap<String, Type>,
    references: HashSet<String>,
    is_parsing_definition: bool,
    lambda_block: LambdaBlock,
    next_param_id: usize,
}

impl<'a> Parser<'a> {
    /// `Parser` is an internal implementation detail: hosts go through the
    /// crate-root `parse_statement`/`parse_type`/`parse_definition`/
    /// completion functions, which absorb `Bail` into the public
    /// `CompileError` before it ever reaches a caller outside this crate.
    pub(crate) fn new(
        source: &'a str,
        bindings: &'a Bindings,
        data_source: &'a mut dyn DataSource,
    ) -> PResult<Self> {
        let mut scanner = Scanner::new(source);
        let current = scanner.next_token()?;
        Ok(Self {
            scanner,
            current,
            source,
            bindings,
            data_source,
            top_let: Vec::new(),
            locals: HashMap::new(),
            pending_sets: HashMap::new(),
            references: HashSet::new(),
            is_parsing_definition: false,
            lambda_block: LambdaBlock::new(),
            next_param_id: 0,
        })
    }

    pub(crate) fn new_for_completion(
        source: &'a str,
        abort_pos: usize,
        bindings: &'a Bindings,
        data_source: &'a mut dyn DataSource,
    ) -> PResult<Self> {
        let mut scanner = Scanner::with_abort_position(source, abort_pos);
        let current = scanner.next_token()?;
        Ok(Self {
            scanner,
            current,
            source,
            bindings,
            data_source,
            top_let: Vec::new(),
            locals: HashMap::new(),
            pending_sets: HashMap::new(),
            references: HashSet::new(),
            is_parsing_definition: false,
            lambda_block: LambdaBlock::new(),
            next_param_id: 0,
        })
    }

    pub(crate) fn lambda_block(&self) -> &LambdaBlock {
        &self.lambda_block
    }

    pub(crate) fn locals(&self) -> &HashMap<String, (ParamId, Type)> {
        &self.locals
    }

    fn fresh_param(&mut self) -> ParamId {
        let id = ParamId(self.next_param_id);
        self.next_param_id += 1;
        id
    }

    fn bump(&mut self) -> PResult<Token> {
        let next = self.scanner.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn eat(&mut self, want: &TokenKind) -> PResult<Span> {
        if &self.current.kind == want {
            Ok(self.bump()?.span)
        } else {
            Err(Bail::from(ParseError::Unexpected {
                expected: want.to_string(),
                found: self.current.kind.to_string(),
                span: self.current.span,
            }))
        }
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.current.kind == kind
    }

    /// Like `eat`, but for the closing half of a bracket pair: reports
    /// `UnclosedBracket` naming the opening bracket and its span instead of
    /// a generic `Unexpected`, since "ran out of tokens before the match"
    /// is a more specific and more useful diagnostic here.
    fn eat_closing(&mut self, want: &TokenKind, bracket: char, open_span: Span) -> PResult<Span> {
        if &self.current.kind == want {
            Ok(self.bump()?.span)
        } else {
            Err(Bail::from(ParseError::UnclosedBracket { bracket, open_span }))
        }
    }

    // ---------------------------------------------------------------
    // Top-level statements
    // ---------------------------------------------------------------

    /// Parses the whole of `text` as a `;`-separated sequence of
    /// statements and returns one executable block expression.
    pub(crate) fn parse_program(&mut self) -> PResult<Expr> {
        let start = self.current.span;
        let mut stmts = Vec::new();
        loop {
            if self.at(&TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_statement()?);
            if self.at(&TokenKind::Semicolon) {
                self.bump()?;
                continue;
            }
            break;
        }
        if stmts.is_empty() {
            return Ok(Expr::Block(Vec::new(), Type::Void, start));
        }
        let ty = stmts.last().unwrap().ty().clone();
        let span = start.merge(self.current.span);
        Ok(Expr::Block(stmts, ty, span))
    }

    fn parse_statement(&mut self) -> PResult<Expr> {
        match &self.current.kind {
            TokenKind::Set => self.parse_set_stmt(),
            TokenKind::Def => self.parse_def_stmt(),
            _ => self.parse_formula(),
        }
    }

    fn parse_set_stmt(&mut self) -> PResult<Expr> {
        let start = self.eat(&TokenKind::Set)?;
        let mut assigns = Vec::new();
        loop {
            assigns.push(self.parse_assignment()?);
            if self.at(&TokenKind::Comma) {
                self.bump()?;
                continue;
            }
            break;
        }
        let span = start.merge(self.current.span);
        Ok(Expr::Block(assigns, Type::Void, span))
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        let (name, span) = self.expect_id()?;
        if self.at(&TokenKind::Assign) || self.at(&TokenKind::LeftArrow) {
            self.bump()?;
            let value = self.parse_formula()?;
            let ty = value.ty().clone();
            self.pending_sets.insert(name.to_ascii_lowercase(), ty.clone());
            self.data_source.set(&name, Some(ty.clone()));
            let wrapped = self.data_source.set_expression(&name, value);
            Ok(Expr::Assign {
                target: AssignTarget::SessionVar(name),
                value: Box::new(wrapped),
                ty,
                span,
            })
        } else {
            // assignment with no rhs deletes the session variable
            self.pending_sets.remove(&name.to_ascii_lowercase());
            self.data_source.set(&name, None);
            Ok(Expr::Assign {
                target: AssignTarget::SessionVar(name),
                value: Box::new(Expr::Block(Vec::new(), Type::Void, span)),
                ty: Type::Void,
                span,
            })
        }
    }

    fn parse_def_stmt(&mut self) -> PResult<Expr> {
        let def = self.parse_def_core()?;
        let span = def.expression.span();
        self.data_source.set_definition(def);
        Ok(Expr::Block(Vec::new(), Type::Void, span))
    }

    /// `parse_definition` entry point (§6.2): parse a `def` and hand the
    /// registered `Definition` back to the caller instead of discarding it
    /// into a void statement expression.
    pub(crate) fn parse_definition(&mut self) -> PResult<Definition> {
        let def = self.parse_def_core()?;
        self.data_source.set_definition(def.clone());
        Ok(def)
    }

    fn parse_def_core(&mut self) -> PResult<Definition> {
        let start = self.eat(&TokenKind::Def)?;
        let (name, name_span) = self.expect_id()?;

        if self.data_source.get_definition(&name).is_some() {
            return Err(Bail::from(UsageError::DuplicateDefinition { name }));
        }

        let mut description = None;
        if self.at(&TokenKind::Colon) {
            self.bump()?;
            description = Some(self.expect_str()?);
        }
        self.eat(&TokenKind::Assign)?;

        let body_start = self.references.len();
        self.is_parsing_definition = true;
        let body_result = self.parse_formula();
        self.is_parsing_definition = false;
        let mut body = body_result?;

        if self.bindings.options.tag_series_on_def && *body.ty() == Type::Series {
            let span = body.span();
            body = Expr::Call {
                target: CallTarget::Instance(Box::new(body)),
                method: "set_name".to_string(),
                args: vec![Expr::Constant(Constant::Str(name.clone()), Type::String, span)],
                ty: Type::Series,
                span,
            };
        }

        let children: Vec<String> = self.references.iter().skip(body_start).cloned().collect();
        let span = start.merge(body.span());
        let raw_text = self
            .source
            .get(start.start..body.span().end)
            .unwrap_or_default()
            .to_string();

        let _ = (name_span, span);
        Ok(Definition {
            name: name.clone(),
            source_text: raw_text,
            description,
            expression: body,
            children,
        })
    }

    // ---------------------------------------------------------------
    // Formula / let
    // ---------------------------------------------------------------

    fn parse_formula(&mut self) -> PResult<Expr> {
        if self.at(&TokenKind::Let) {
            let start = self.current.span;
            self.bump()?;
            let mut assigns = Vec::new();
            loop {
                let (name, span) = self.expect_id()?;
                if self.at(&TokenKind::LeftArrow) {
                    self.bump()?;
                } else {
                    self.eat(&TokenKind::Assign)?;
                }
                let value = self.parse_conditional()?;
                let ty = value.ty().clone();
                let id = self.fresh_param();
                self.locals.insert(name.to_ascii_lowercase(), (id, ty.clone()));
                self.top_let.push((name.clone(), id, ty.clone()));
                assigns.push(Expr::Assign {
                    target: AssignTarget::Local(id),
                    value: Box::new(value),
                    ty,
                    span,
                });
                if self.at(&TokenKind::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
            self.eat(&TokenKind::In)?;
            let body = self.parse_conditional()?;
            let ty = body.ty().clone();
            let span = start.merge(body.span());
            assigns.push(body);
            Ok(Expr::Block(assigns, ty, span))
        } else {
            self.parse_conditional()
        }
    }

    // ---------------------------------------------------------------
    // Conditional
    // ---------------------------------------------------------------

    fn parse_conditional(&mut self) -> PResult<Expr> {
        if !self.at(&TokenKind::If) {
            return self.parse_disj_conj();
        }
        let start = self.current.span;
        self.bump()?;
        let mut branches = Vec::new();

        let cond = self.parse_disj_conj()?;
        self.require_bool(&cond)?;
        self.eat(&TokenKind::Then)?;
        let then_val = self.parse_conditional()?;
        branches.push((cond, then_val));

        while self.at(&TokenKind::Elif) {
            self.bump()?;
            let cond = self.parse_disj_conj()?;
            self.require_bool(&cond)?;
            self.eat(&TokenKind::Then)?;
            let then_val = self.parse_conditional()?;
            branches.push((cond, then_val));
        }

        self.eat(&TokenKind::Else)?;
        let else_branch = self.parse_conditional()?;

        let mut ty = else_branch.ty().clone();
        for (_, val) in &branches {
            ty = self.unify(&ty, val.ty(), start)?;
        }
        let span = start.merge(else_branch.span());
        Ok(Expr::Condition {
            branches,
            else_branch: Box::new(else_branch),
            ty,
            span,
        })
    }

    fn unify(&self, a: &Type, b: &Type, span: Span) -> PResult<Type> {
        if a == b {
            return Ok(a.clone());
        }
        if let Some(w) = Type::widen(a, b) {
            return Ok(w);
        }
        Err(Bail::from(TypeError::Mismatch {
            expected: a.to_string(),
            found: b.to_string(),
            span,
        }))
    }

    fn require_bool(&self, e: &Expr) -> PResult<()> {
        if *e.ty() != Type::Bool {
            return Err(Bail::from(TypeError::Mismatch {
                expected: "bool".into(),
                found: e.ty().to_string(),
                span: e.span(),
            }));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // DisjConj / LogFactor / chained relops
    // ---------------------------------------------------------------

    fn parse_disj_conj(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_log_factor()?;
        loop {
            let op = match &self.current.kind {
                TokenKind::And => BinOp::And,
                TokenKind::Or => BinOp::Or,
                _ => break,
            };
            let span = self.current.span;
            self.bump()?;
            self.require_bool(&lhs)?;
            let rhs = self.parse_log_factor()?;
            self.require_bool(&rhs)?;
            let merged = lhs.span().merge(span).merge(rhs.span());
            lhs = Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), Type::Bool, merged);
        }
        Ok(lhs)
    }

    fn parse_log_factor(&mut self) -> PResult<Expr> {
        if self.at(&TokenKind::Not) {
            let span = self.current.span;
            self.bump()?;
            let inner = self.parse_log_factor()?;
            self.require_bool(&inner)?;
            let merged = span.merge(inner.span());
            return Ok(Expr::UnaryOp(UnOp::Not, Box::new(inner), Type::Bool, merged));
        }
        self.parse_relop_chain()
    }

    fn relop_kind(kind: &TokenKind) -> Option<BinOp> {
        match kind {
            TokenKind::Assign => Some(BinOp::Eq),
            TokenKind::LtGt | TokenKind::NotEq => Some(BinOp::Ne),
            TokenKind::Lt => Some(BinOp::Lt),
            TokenKind::LtEq => Some(BinOp::Le),
            TokenKind::Gt => Some(BinOp::Gt),
            TokenKind::GtEq => Some(BinOp::Ge),
            _ => None,
        }
    }

    /// `true` if both relops point the same monotonic direction and so may
    /// be chained (`a < b < c`, `a >= b >= c`); equality/inequality never
    /// chain.
    fn same_direction(a: BinOp, b: BinOp) -> bool {
        matches!(
            (a, b),
            (BinOp::Lt, BinOp::Lt)
                | (BinOp::Lt, BinOp::Le)
                | (BinOp::Le, BinOp::Lt)
                | (BinOp::Le, BinOp::Le)
                | (BinOp::Gt, BinOp::Gt)
                | (BinOp::Gt, BinOp::Ge)
                | (BinOp::Ge, BinOp::Gt)
                | (BinOp::Ge, BinOp::Ge)
        )
    }

    fn build_relop(&self, op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> PResult<Expr> {
        match op {
            BinOp::Eq | BinOp::Ne => {
                let ok = lhs.ty() == rhs.ty() || (lhs.ty().is_matrix() && rhs.ty().is_matrix());
                if !ok {
                    return Err(Bail::from(TypeError::OperatorMismatch {
                        op: if op == BinOp::Eq { "=".into() } else { "<>".into() },
                        lhs: lhs.ty().to_string(),
                        rhs: rhs.ty().to_string(),
                        span,
                    }));
                }
            }
            _ => {
                if !lhs.ty().is_numeric() || !rhs.ty().is_numeric() {
                    return Err(Bail::from(TypeError::OperatorMismatch {
                        op: "relop".into(),
                        lhs: lhs.ty().to_string(),
                        rhs: rhs.ty().to_string(),
                        span,
                    }));
                }
            }
        }
        Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), Type::Bool, span))
    }

    /// Parses `Additive Relop?` and, when the next relop continues the
    /// same monotonic direction, rewrites the chain as
    /// `(a op1 b) and (b op2 c) and ...` while binding each shared middle
    /// operand exactly once (§4.4, invariant 4) rather than duplicating
    /// the sub-expression in the tree.
    fn parse_relop_chain(&mut self) -> PResult<Expr> {
        let lhs = self.parse_additive()?;
        let Some(first_op) = Self::relop_kind(&self.current.kind) else {
            return Ok(lhs);
        };
        let op_span = self.current.span;
        self.bump()?;
        let rhs = self.parse_additive()?;

        if !matches!(
            first_op,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        ) {
            return self.build_relop(first_op, lhs, rhs, op_span);
        }

        let mut next_op = Self::relop_kind(&self.current.kind);
        if next_op.map(|o| Self::same_direction(first_op, o)) != Some(true) {
            return self.build_relop(first_op, lhs, rhs, op_span);
        }

        // chain: bind the shared middle operand once per boundary.
        let mut bindings = Vec::new();
        let mid_id = self.fresh_param();
        let mid_ty = rhs.ty().clone();
        let mid_span = rhs.span();
        bindings.push(Expr::Assign {
            target: AssignTarget::Local(mid_id),
            value: Box::new(rhs),
            ty: mid_ty.clone(),
            span: mid_span,
        });
        let mut prev_ref = Expr::Parameter(mid_id, "__chain".into(), mid_ty.clone(), mid_span);
        let mut chain = self.build_relop(first_op, lhs, prev_ref.clone(), op_span)?;

        loop {
            let Some(op) = next_op else { break };
            let op_span = self.current.span;
            self.bump()?;
            let next_rhs = self.parse_additive()?;

            let following = Self::relop_kind(&self.current.kind);
            if following.map(|o| Self::same_direction(op, o)) == Some(true) {
                let id = self.fresh_param();
                let ty = next_rhs.ty().clone();
                let span = next_rhs.span();
                bindings.push(Expr::Assign {
                    target: AssignTarget::Local(id),
                    value: Box::new(next_rhs),
                    ty: ty.clone(),
                    span,
                });
                let next_ref = Expr::Parameter(id, "__chain".into(), ty, span);
                let pair = self.build_relop(op, prev_ref.clone(), next_ref.clone(), op_span)?;
                chain = Expr::BinaryOp(
                    BinOp::And,
                    Box::new(chain),
                    Box::new(pair),
                    Type::Bool,
                    op_span,
                );
                prev_ref = next_ref;
                next_op = following;
            } else {
                let pair = self.build_relop(op, prev_ref.clone(), next_rhs, op_span)?;
                chain = Expr::BinaryOp(
                    BinOp::And,
                    Box::new(chain),
                    Box::new(pair),
                    Type::Bool,
                    op_span,
                );
                next_op = None;
            }
        }

        let span = chain.span();
        bindings.push(chain);
        Ok(Expr::Block(bindings, Type::Bool, span))
    }

    // ---------------------------------------------------------------
    // Additive / Multiplicative / Unary / Power
    // ---------------------------------------------------------------

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match &self.current.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let span = self.current.span;
            self.bump()?;
            let rhs = self.parse_multiplicative()?;
            lhs = self.build_additive(op, lhs, rhs, span)?;
        }
        Ok(lhs)
    }

    /// Builds `lhs op rhs`, applying the vector/matrix affine rewrites of
    /// §4.4 when the shape matches, and the string-concatenation coercion.
    fn build_additive(&self, op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> PResult<Expr> {
        if *lhs.ty() == Type::String || *rhs.ty() == Type::String {
            if op == BinOp::Add {
                return Ok(Expr::BinaryOp(
                    BinOp::Add,
                    Box::new(lhs),
                    Box::new(rhs),
                    Type::String,
                    span,
                ));
            }
        }

        if let Some(rewritten) = self.try_affine_rewrite(op, &lhs, &rhs, span) {
            return Ok(rewritten);
        }

        self.build_arith(op, lhs, rhs, span)
    }

    fn build_arith(&self, op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> PResult<Expr> {
        let ty = self.widen_arith(lhs.ty(), rhs.ty(), op, span)?;
        if let Some(folded) = fold_double_constants(op, &lhs, &rhs, span) {
            return Ok(folded);
        }
        Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), ty, span))
    }

    fn widen_arith(&self, a: &Type, b: &Type, op: BinOp, span: Span) -> PResult<Type> {
        if a.is_vector() && b.is_vector() {
            // plain `*`/`/`/`+`/`-` between two vectors is never defined;
            // `v*v` (same value) is rewritten to `squared()` before this is
            // reached, and elementwise ops go through `.*`/`./`.
            return Err(Bail::from(TypeError::OperatorMismatch {
                op: format!("{op:?}"),
                lhs: a.to_string(),
                rhs: b.to_string(),
                span,
            }));
        }
        if a.is_matrix() && b.is_matrix() {
            return Ok(Type::Matrix);
        }
        if let Some(w) = Type::widen(a, b) {
            if w.is_numeric() {
                return Ok(w);
            }
        }
        Err(Bail::from(TypeError::OperatorMismatch {
            op: format!("{op:?}"),
            lhs: a.to_string(),
            rhs: b.to_string(),
            span,
        }))
    }

    /// Recognizes `d1*v1 ± d2*v2`, `α*v ± w` (and commuted forms), `m*v1 ±
    /// d*v2`, `M*v ± w`, and `v*v`, rewriting them to the fused kernel calls
    /// the runtime provides. All rewrites preserve the observable result;
    /// they exist purely so the runtime can avoid allocating an
    /// intermediate vector.
    fn try_affine_rewrite(&self, op: BinOp, lhs: &Expr, rhs: &Expr, span: Span) -> Option<Expr> {
        if op != BinOp::Add && op != BinOp::Sub {
            return None;
        }
        if !lhs.ty().is_vector() && !rhs.ty().is_vector() {
            return None;
        }

        let scaled = |e: &Expr| -> Option<(Expr, Expr)> {
            if let Expr::BinaryOp(BinOp::Mul, a, b, _, _) = e {
                if a.ty().is_numeric() && b.ty().is_vector() {
                    return Some((a.as_ref().clone(), b.as_ref().clone()));
                }
                if b.ty().is_numeric() && a.ty().is_vector() {
                    return Some((b.as_ref().clone(), a.as_ref().clone()));
                }
            }
            None
        };

        let matrix_mul = |e: &Expr| -> Option<(Expr, Expr)> {
            if let Expr::BinaryOp(BinOp::Mul, a, b, _, _) = e {
                if *a.ty() == Type::Matrix && *b.ty() == Type::DVector {
                    return Some((a.as_ref().clone(), b.as_ref().clone()));
                }
            }
            None
        };

        if let (Some((d1, v1)), Some((d2, v2))) = (scaled(lhs), scaled(rhs)) {
            let ty = v1.ty().clone();
            let d2 = if op == BinOp::Sub {
                Expr::UnaryOp(UnOp::Neg, Box::new(d2), Type::Double, span)
            } else {
                d2
            };
            return Some(Expr::Call {
                target: CallTarget::Bare,
                method: "combine2".into(),
                args: vec![d1, d2, v1, v2],
                ty,
                span,
            });
        }

        if let (Some((m, v1)), Some((d, v2))) = (matrix_mul(lhs), scaled(rhs)) {
            let d = if op == BinOp::Sub {
                Expr::UnaryOp(UnOp::Neg, Box::new(d), Type::Double, span)
            } else {
                d
            };
            return Some(Expr::Call {
                target: CallTarget::Instance(Box::new(m)),
                method: "multiply_add".into(),
                args: vec![v1, d, v2],
                ty: Type::DVector,
                span,
            });
        }

        if let Some((m, v)) = matrix_mul(lhs) {
            if *rhs.ty() == Type::DVector {
                let w = if op == BinOp::Sub {
                    Expr::UnaryOp(UnOp::Neg, Box::new(rhs.clone()), Type::DVector, span)
                } else {
                    rhs.clone()
                };
                return Some(Expr::Call {
                    target: CallTarget::Instance(Box::new(m)),
                    method: "multiply_add_sub".into(),
                    args: vec![v, w],
                    ty: Type::DVector,
                    span,
                });
            }
        }

        if let Some((alpha, v)) = scaled(lhs) {
            if *rhs.ty() == *v.ty() {
                let ty = v.ty().clone();
                return Some(Expr::Call {
                    target: CallTarget::Instance(Box::new(v)),
                    method: "multiply_add".into(),
                    args: vec![alpha, rhs.clone()],
                    ty,
                    span,
                });
            }
        }
        if op == BinOp::Add {
            if let Some((alpha, v)) = scaled(rhs) {
                if *lhs.ty() == *v.ty() {
                    let ty = v.ty().clone();
                    return Some(Expr::Call {
                        target: CallTarget::Instance(Box::new(v)),
                        method: "multiply_add".into(),
                        args: vec![alpha, lhs.clone()],
                        ty,
                        span,
                    });
                }
            }
        }

        None
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match &self.current.kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                TokenKind::DotStar => BinOp::DotMul,
                TokenKind::DotSlash => BinOp::DotDiv,
                TokenKind::Backslash => BinOp::MatSolve,
                _ => break,
            };
            let span = self.current.span;
            self.bump()?;
            let rhs = self.parse_unary()?;
            lhs = self.build_multiplicative(op, lhs, rhs, span)?;
        }
        Ok(lhs)
    }

    fn build_multiplicative(&self, op: BinOp, lhs: Expr, rhs: Expr, span: Span) -> PResult<Expr> {
        match op {
            BinOp::DotMul | BinOp::DotDiv => {
                if lhs.ty() != rhs.ty() || !lhs.ty().is_vector() {
                    return Err(Bail::from(TypeError::OperatorMismatch {
                        op: format!("{op:?}"),
                        lhs: lhs.ty().to_string(),
                        rhs: rhs.ty().to_string(),
                        span,
                    }));
                }
                let ty = lhs.ty().clone();
                Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), ty, span))
            }
            BinOp::MatSolve => {
                if *lhs.ty() != Type::Matrix
                    || !(*rhs.ty() == Type::DVector || *rhs.ty() == Type::Matrix)
                {
                    return Err(Bail::from(TypeError::OperatorMismatch {
                        op: "\\".into(),
                        lhs: lhs.ty().to_string(),
                        rhs: rhs.ty().to_string(),
                        span,
                    }));
                }
                let ty = rhs.ty().clone();
                Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), ty, span))
            }
            BinOp::Mul if *lhs.ty() == Type::Matrix && is_matrix_transpose(&rhs) => {
                // M*M' (same matrix) -> square(); M*N' -> multiply_transpose(N)
                let other = unwrap_transpose(rhs);
                if same_value(&lhs, &other) {
                    Ok(Expr::Call {
                        target: CallTarget::Instance(Box::new(lhs)),
                        method: "square".into(),
                        args: vec![],
                        ty: Type::Matrix,
                        span,
                    })
                } else {
                    Ok(Expr::Call {
                        target: CallTarget::Instance(Box::new(lhs)),
                        method: "multiply_transpose".into(),
                        args: vec![other],
                        ty: Type::Matrix,
                        span,
                    })
                }
            }
            BinOp::Mul if is_matrix_transpose(&lhs) && *rhs.ty() == Type::DVector => {
                // M'*v -> M.transpose_multiply(v)
                let m = unwrap_transpose(lhs);
                Ok(Expr::Call {
                    target: CallTarget::Instance(Box::new(m)),
                    method: "transpose_multiply".into(),
                    args: vec![rhs],
                    ty: Type::DVector,
                    span,
                })
            }
            BinOp::Mul if *lhs.ty() == Type::Matrix && *rhs.ty() == Type::Matrix => {
                Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), Type::Matrix, span))
            }
            BinOp::Mul if *lhs.ty() == Type::Matrix && *rhs.ty() == Type::DVector => {
                Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), Type::DVector, span))
            }
            BinOp::Mul if lhs.ty().is_vector() && lhs.ty() == rhs.ty() && same_value(&lhs, &rhs) => {
                // v*v (the same value on both sides) -> squared()
                Ok(Expr::Call {
                    target: CallTarget::Instance(Box::new(lhs)),
                    method: "squared".into(),
                    args: vec![],
                    ty: Type::Double,
                    span,
                })
            }
            BinOp::Mul if lhs.ty().is_numeric() && rhs.ty().is_vector() => {
                let ty = rhs.ty().clone();
                Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), ty, span))
            }
            BinOp::Mul if lhs.ty().is_vector() && rhs.ty().is_numeric() => {
                let ty = lhs.ty().clone();
                Ok(Expr::BinaryOp(op, Box::new(lhs), Box::new(rhs), ty, span))
            }
            _ => self.build_arith(op, lhs, rhs, span),
        }
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        match &self.current.kind {
            TokenKind::Minus => {
                let span = self.current.span;
                self.bump()?;
                let inner = self.parse_unary()?;
                if !inner.ty().is_numeric() && !inner.ty().is_vector() && !inner.ty().is_matrix() {
                    return Err(Bail::from(TypeError::OperatorMismatch {
                        op: "-".into(),
                        lhs: inner.ty().to_string(),
                        rhs: String::new(),
                        span,
                    }));
                }
                let ty = inner.ty().clone();
                Ok(Expr::UnaryOp(UnOp::Neg, Box::new(inner), ty, span))
            }
            TokenKind::Plus => {
                self.bump()?;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_postfixed_factor()?;
        if !self.at(&TokenKind::Caret) {
            return Ok(base);
        }
        let span = self.current.span;
        self.bump()?;
        let exponent = self.parse_postfixed_factor()?;

        // DVector ^ DVector is the inner product.
        if base.ty().is_vector() && exponent.ty() == base.ty() {
            return Ok(Expr::BinaryOp(
                BinOp::Dot,
                Box::new(base),
                Box::new(exponent),
                Type::Double,
                span,
            ));
        }

        if let Expr::Constant(Constant::Int(n @ (2 | 3 | 4)), _, _) = &exponent {
            return Ok(self.expand_small_power(base, *n, span));
        }

        let ty = self.widen_arith(base.ty(), exponent.ty(), BinOp::Pow, span)?;
        Ok(Expr::BinaryOp(BinOp::Pow, Box::new(base), Box::new(exponent), ty, span))
    }

    /// `x^2`, `x^3`, `x^4` expand to repeated multiplication over a freshly
    /// bound parameter, so the emitted tree evaluates `x` exactly once
    /// (invariant 5) instead of copying the base sub-expression.
    fn expand_small_power(&mut self, base: Expr, n: i64, span: Span) -> Expr {
        let ty = base.ty().clone();
        let id = self.fresh_param();
        let bind = Expr::Assign {
            target: AssignTarget::Local(id),
            value: Box::new(base),
            ty: ty.clone(),
            span,
        };
        let reference = || Expr::Parameter(id, "__pow".into(), ty.clone(), span);
        let mut acc = Expr::BinaryOp(BinOp::Mul, Box::new(reference()), Box::new(reference()), ty.clone(), span);
        for _ in 2..n {
            acc = Expr::BinaryOp(BinOp::Mul, Box::new(acc), Box::new(reference()), ty.clone(), span);
        }
        Expr::Block(vec![bind, acc], ty, span)
    }

    // ---------------------------------------------------------------
    // Factor + postfix
    // ---------------------------------------------------------------

    fn parse_postfixed_factor(&mut self) -> PResult<Expr> {
        let mut e = self.parse_factor()?;
        loop {
            match &self.current.kind {
                TokenKind::Dot => {
                    self.bump()?;
                    e = self.parse_member_or_method(e)?;
                }
                TokenKind::Quote => {
                    let span = self.current.span;
                    self.bump()?;
                    e = self.apply_transpose(e, span)?;
                }
                TokenKind::LBracket => {
                    let span = self.current.span;
                    self.bump()?;
                    let index = self.parse_indexer(e.ty())?;
                    self.eat_closing(&TokenKind::RBracket, '[', span)?;
                    let ty = self.indexer_result_type(e.ty(), &index, span)?;
                    e = Expr::Index {
                        object: Box::new(e),
                        index,
                        ty,
                        span,
                    };
                }
                TokenKind::LBrace => {
                    let span = self.current.span;
                    self.bump()?;
                    let idx = self.parse_conditional()?;
                    self.eat_closing(&TokenKind::RBrace, '{', span)?;
                    let ty = e.ty().clone();
                    e = Expr::Index {
                        object: Box::new(e),
                        index: IndexKind::Safe(Box::new(idx)),
                        ty,
                        span,
                    };
                }
                TokenKind::Squared => {
                    // `e²` is the surface-syntax superset's alternate
                    // spelling of `e^2` (§9 "later variants"); route it
                    // through the same squaring/affine checks as `e*e`.
                    let span = self.current.span;
                    self.bump()?;
                    e = self.build_multiplicative(BinOp::Mul, e.clone(), e, span)?;
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn apply_transpose(&self, e: Expr, span: Span) -> PResult<Expr> {
        let ty = e.ty().clone();
        if !ty.is_matrix() && ty != Type::Complex && ty != Type::CVector {
            return Err(Bail::from(TypeError::NotTransposable {
                ty: ty.to_string(),
                span,
            }));
        }
        Ok(Expr::UnaryOp(UnOp::Transpose, Box::new(e), ty, span))
    }

    fn parse_member_or_method(&mut self, object: Expr) -> PResult<Expr> {
        let span = self.current.span;
        let object_ty = object.ty().clone();
        match self.current.kind.clone() {
            TokenKind::Functor(name) => {
                self.bump()?;
                let list = self
                    .bindings
                    .overloads(&object_ty, &name)
                    .cloned()
                    .ok_or_else(|| {
                        Bail::from(NameError::UnknownMember {
                            ty: object_ty.to_string(),
                            member: name.clone(),
                            span,
                        })
                    })?;
                let (args, ty) = self.parse_call_args(&list, &name, span)?;
                Ok(Expr::Call {
                    target: CallTarget::Instance(Box::new(object)),
                    method: name,
                    args,
                    ty,
                    span,
                })
            }
            TokenKind::Id(name) => {
                self.bump()?;
                let ty = self
                    .bindings
                    .property(&object_ty, &name)
                    .cloned()
                    .ok_or_else(|| {
                        Bail::from(NameError::UnknownMember {
                            ty: object_ty.to_string(),
                            member: name.clone(),
                            span,
                        })
                    })?;
                Ok(Expr::MemberAccess {
                    object: Box::new(object),
                    property: name,
                    ty,
                    span,
                })
            }
            other => Err(Bail::from(ParseError::Unexpected {
                expected: "property or method name".into(),
                found: other.to_string(),
                span,
            })),
        }
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::Int(n) => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Int(n), Type::Int, span))
            }
            TokenKind::Real(v) => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Real(v), Type::Double, span))
            }
            TokenKind::Imag(v) => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Complex(0.0, v), Type::Complex, span))
            }
            TokenKind::Str(s) => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Str(s), Type::String, span))
            }
            TokenKind::Date(d) => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Date(d), Type::Date, span))
            }
            TokenKind::True => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Bool(true), Type::Bool, span))
            }
            TokenKind::False => {
                self.bump()?;
                Ok(Expr::Constant(Constant::Bool(false), Type::Bool, span))
            }
            TokenKind::MultVarI(n, suffix) => {
                self.bump()?;
                let var = self.resolve_identifier(&suffix, span)?;
                Ok(Expr::BinaryOp(
                    BinOp::Mul,
                    Box::new(Expr::Constant(Constant::Int(n), Type::Int, span)),
                    Box::new(var),
                    Type::Double,
                    span,
                ))
            }
            TokenKind::MultVarR(v, suffix) => {
                self.bump()?;
                let var = self.resolve_identifier(&suffix, span)?;
                Ok(Expr::BinaryOp(
                    BinOp::Mul,
                    Box::new(Expr::Constant(Constant::Real(v), Type::Double, span)),
                    Box::new(var),
                    Type::Double,
                    span,
                ))
            }
            TokenKind::LParen => {
                let open_span = self.current.span;
                self.bump()?;
                let inner = self.parse_conditional()?;
                self.eat_closing(&TokenKind::RParen, '(', open_span)?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_vector_literal(),
            TokenKind::Id(name) => {
                self.bump()?;
                self.resolve_identifier(&name, span)
            }
            TokenKind::IdBang(name) => {
                self.bump()?;
                self.resolve_def_ref(&name, span)
            }
            TokenKind::Functor(name) => {
                self.bump()?;
                self.resolve_bare_call(&name, span)
            }
            TokenKind::ClassName(class) => {
                self.bump()?;
                self.resolve_class_call(&class, span)
            }
            TokenKind::Eof => Err(Bail::from(ParseError::IncompleteExpression { span })),
            other => Err(Bail::from(ParseError::Unexpected {
                expected: "expression".into(),
                found: other.to_string(),
                span,
            })),
        }
    }

    fn expect_id(&mut self) -> PResult<(String, Span)> {
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::Id(name) => {
                self.bump()?;
                Ok((name, span))
            }
            other => Err(Bail::from(ParseError::Unexpected {
                expected: "identifier".into(),
                found: other.to_string(),
                span,
            })),
        }
    }

    fn expect_str(&mut self) -> PResult<String> {
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::Str(s) => {
                self.bump()?;
                Ok(s)
            }
            other => Err(Bail::from(ParseError::Unexpected {
                expected: "string literal".into(),
                found: other.to_string(),
                span,
            })),
        }
    }

    // ---------------------------------------------------------------
    // Identifier resolution
    // ---------------------------------------------------------------

    fn resolve_identifier(&mut self, name: &str, span: Span) -> PResult<Expr> {
        let lower = name.to_ascii_lowercase();

        if let Some((id, ty)) = self.lambda_block.lookup(name) {
            return Ok(Expr::Parameter(id, name.to_string(), ty, span));
        }
        if let Some((id, ty)) = self.locals.get(&lower).cloned() {
            return Ok(Expr::Parameter(id, name.to_string(), ty, span));
        }

        // Session ("set") variables may never be referenced inside a def.
        if let Some(ty) = self
            .pending_sets
            .get(&lower)
            .cloned()
            .or_else(|| self.data_source.get(name))
        {
            if self.is_parsing_definition {
                return Err(Bail::from(UsageError::SessionVarInDef {
                    name: name.to_string(),
                    span,
                }));
            }
            return Ok(Expr::SessionVar(name.to_string(), ty, span));
        }

        Err(Bail::from(NameError::UnknownIdentifier {
            name: name.to_string(),
            span,
        }))
    }

    fn resolve_def_ref(&mut self, name: &str, span: Span) -> PResult<Expr> {
        let def = self
            .data_source
            .get_definition(name)
            .ok_or_else(|| {
                Bail::from(NameError::UnknownIdentifier {
                    name: name.to_string(),
                    span,
                })
            })?;
        self.references.insert(name.to_string());
        let ty = def.expression.ty().clone();
        Ok(Expr::DefRef(name.to_string(), ty, span))
    }

    fn resolve_bare_call(&mut self, name: &str, span: Span) -> PResult<Expr> {
        let ctor_key = format!("{name}.new");
        if let Some(list) = self.bindings.class_method(&ctor_key).cloned() {
            let (args, ty) = self.parse_call_args(&list, name, span)?;
            return Ok(Expr::New {
                class: name.to_string(),
                args,
                ty,
                span,
            });
        }
        let math_key = format!("math.{name}");
        if let Some(list) = self.bindings.class_method(&math_key).cloned() {
            let (args, ty) = self.parse_call_args(&list, name, span)?;
            return Ok(Expr::Call {
                target: CallTarget::Bare,
                method: name.to_string(),
                args,
                ty,
                span,
            });
        }
        Err(Bail::from(NameError::UnknownIdentifier {
            name: name.to_string(),
            span,
        }))
    }

    fn resolve_class_call(&mut self, class: &str, span: Span) -> PResult<Expr> {
        let method = match self.current.kind.clone() {
            TokenKind::Functor(m) => {
                self.bump()?;
                m
            }
            other => {
                return Err(Bail::from(ParseError::Unexpected {
                    expected: "method call".into(),
                    found: other.to_string(),
                    span,
                }))
            }
        };
        let key = format!("{class}.{method}");
        let list = self.bindings.class_method(&key).cloned().ok_or_else(|| {
            Bail::from(NameError::UnknownClass {
                name: key.clone(),
                span,
            })
        })?;
        let (args, ty) = self.parse_call_args(&list, &method, span)?;
        if method.eq_ignore_ascii_case("new") {
            Ok(Expr::New {
                class: class.to_string(),
                args,
                ty,
                span,
            })
        } else {
            Ok(Expr::Call {
                target: CallTarget::Class(class.to_string()),
                method,
                args,
                ty,
                span,
            })
        }
    }

    fn parse_vector_literal(&mut self) -> PResult<Expr> {
        let start = self.eat(&TokenKind::LBracket)?;
        let mut elems = Vec::new();
        if !self.at(&TokenKind::RBracket) {
            loop {
                elems.push(self.parse_conditional()?);
                if self.at(&TokenKind::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        let end = self.eat_closing(&TokenKind::RBracket, '[', start)?;
        let span = start.merge(end);

        let ty = if elems.iter().any(|e| *e.ty() == Type::Complex) {
            Type::CVector
        } else {
            Type::DVector
        };
        for e in &elems {
            if !e.ty().is_numeric() {
                return Err(Bail::from(TypeError::Mismatch {
                    expected: "numeric".into(),
                    found: e.ty().to_string(),
                    span: e.span(),
                }));
            }
        }
        Ok(Expr::New {
            class: ty.to_string(),
            args: elems,
            ty,
            span,
        })
    }

    // ---------------------------------------------------------------
    // Indexers
    // ---------------------------------------------------------------

    fn parse_indexer(&mut self, object_ty: &Type) -> PResult<IndexKind> {
        if object_ty.is_matrix() {
            let row = self.parse_dim()?;
            self.eat(&TokenKind::Comma)?;
            let col = self.parse_dim()?;
            return Ok(IndexKind::RowCol {
                row: Box::new(row),
                col: Box::new(col),
            });
        }
        self.parse_dim()
    }

    /// `:` is the baseline range separator inside `[...]`; `..` is the
    /// surface-syntax superset's alternate spelling of the same separator
    /// (§9 "later variants") and is accepted everywhere `:` is.
    fn at_range_sep(&self) -> bool {
        self.at(&TokenKind::Colon) || self.at(&TokenKind::DotDot)
    }

    fn parse_dim(&mut self) -> PResult<IndexKind> {
        if self.at_range_sep() {
            self.bump()?;
            if self.at(&TokenKind::RBracket) || self.at(&TokenKind::Comma) {
                return Ok(IndexKind::Range { start: None, end: None });
            }
            let end = self.parse_conditional()?;
            return Ok(IndexKind::Range {
                start: None,
                end: Some(Box::new(end)),
            });
        }
        if self.at(&TokenKind::RBracket) || self.at(&TokenKind::Comma) {
            return Ok(IndexKind::Range { start: None, end: None });
        }

        let from_end = if self.at(&TokenKind::Caret) {
            self.bump()?;
            true
        } else {
            false
        };
        let idx = self.parse_conditional()?;
        if self.at_range_sep() {
            self.bump()?;
            if self.at(&TokenKind::RBracket) || self.at(&TokenKind::Comma) {
                return Ok(IndexKind::Range {
                    start: Some(Box::new(idx)),
                    end: None,
                });
            }
            let end = self.parse_conditional()?;
            return Ok(IndexKind::Range {
                start: Some(Box::new(idx)),
                end: Some(Box::new(end)),
            });
        }
        Ok(IndexKind::Single {
            index: Box::new(idx),
            from_end,
        })
    }

    fn indexer_result_type(&self, object_ty: &Type, index: &IndexKind, span: Span) -> PResult<Type> {
        match index {
            IndexKind::RowCol { row, col } => {
                let row_full = matches!(**row, IndexKind::Range { start: None, end: None });
                let col_full = matches!(**col, IndexKind::Range { start: None, end: None });
                Ok(match (row_full, col_full) {
                    (false, false) => Type::Double,
                    _ => Type::DVector,
                })
            }
            IndexKind::Single { .. } => match object_ty {
                Type::Series => Ok(Type::Double),
                t if t.is_vector() => Ok(match t {
                    Type::CVector => Type::Complex,
                    Type::NVector => Type::Int,
                    _ => Type::Double,
                }),
                _ => Err(Bail::from(TypeError::Mismatch {
                    expected: "indexable".into(),
                    found: object_ty.to_string(),
                    span,
                })),
            },
            IndexKind::Range { .. } => Ok(object_ty.clone()),
            IndexKind::Safe(_) => Ok(object_ty.clone()),
        }
    }

    // ---------------------------------------------------------------
    // Overload resolution (§4.4)
    // ---------------------------------------------------------------

    fn lambda_param_types(&self, receiver: Option<&Type>, arity: u8, seed: Option<&Type>) -> Vec<Type> {
        let elem = match receiver {
            Some(Type::CVector) => Type::Complex,
            Some(Type::NVector) => Type::Int,
            _ => Type::Double,
        };
        match arity {
            1 => vec![elem],
            2 => vec![seed.cloned().unwrap_or(elem.clone()), elem],
            _ => vec![],
        }
    }

    /// Runs the five-step overload-resolution algorithm against a parsed
    /// `(` ... `)` argument list and returns the emitted actual arguments
    /// (with promotions and sentinel auto-arguments applied) plus the
    /// selected overload's return type.
    fn parse_call_args(
        &mut self,
        list: &MethodList,
        name: &str,
        call_span: Span,
    ) -> PResult<(Vec<Expr>, Type)> {
        let open_span = self.eat(&TokenKind::LParen)?;

        let mut live = vec![true; list.overloads.len()];
        let mut parsed: Vec<Expr> = Vec::new();

        if !self.at(&TokenKind::RParen) {
            let mut i = 0usize;
            loop {
                let lambda_arity = list.lambda_at(i, &live);
                let arg = if let Some(arity) = lambda_arity {
                    // the lambda's expected return type is the formal at
                    // this position, if every still-live overload agrees on
                    // it; ambiguous formals fall back to the body's own type.
                    let mut candidates: Vec<Type> = Vec::new();
                    for (j, m) in list.overloads.iter().enumerate() {
                        if !live[j] {
                            continue;
                        }
                        let formals = user_formals(m);
                        if let Some(f) = formals.get(i).or_else(|| formals.last().filter(|_| m.is_variadic())) {
                            match f {
                                Formal::Type(t) | Formal::Variadic(t) => candidates.push(t.clone()),
                                Formal::Sentinel(_) => {}
                            }
                        }
                    }
                    let expected_return = match candidates.as_slice() {
                        [t, rest @ ..] if rest.iter().all(|r| r == t) => Some(t.clone()),
                        _ => None,
                    };
                    self.parse_lambda_arg(arity, None, expected_return.as_ref())?
                } else {
                    self.parse_conditional()?
                };

                // for a lambda argument, the registered formal type names the
                // expected *return* type of the lambda body, not a value type
                // the lambda itself could convert to.
                let actual_ty = match arg.ty() {
                    Type::Lambda(_, ret) => ret.as_ref().clone(),
                    t => t.clone(),
                };

                for (j, m) in list.overloads.iter().enumerate() {
                    if !live[j] {
                        continue;
                    }
                    let formals = user_formals(m);
                    let formal = formals.get(i).or_else(|| formals.last().filter(|_| m.is_variadic()));
                    let Some(formal) = formal else {
                        live[j] = false;
                        continue;
                    };
                    let required = match formal {
                        Formal::Type(t) => t.clone(),
                        Formal::Variadic(t) => t.clone(),
                        Formal::Sentinel(_) => unreachable!("sentinels excluded from user_formals"),
                    };
                    if !actual_ty.convertible_to(&required) && actual_ty != required {
                        live[j] = false;
                    }
                }
                parsed.push(arg);

                if live.iter().all(|l| !l) {
                    return Err(Bail::from(OverloadError::NoMatch {
                        name: name.to_string(),
                        span: call_span,
                    }));
                }

                i += 1;
                if self.at(&TokenKind::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        self.eat_closing(&TokenKind::RParen, '(', open_span)?;

        let n = parsed.len();
        for (j, m) in list.overloads.iter().enumerate() {
            if !live[j] {
                continue;
            }
            let expected = m.expected_args();
            if m.is_variadic() {
                if n < expected.saturating_sub(1) {
                    live[j] = false;
                }
            } else if expected != n {
                live[j] = false;
            }
        }

        let candidates: Vec<usize> = (0..list.overloads.len()).filter(|j| live[*j]).collect();
        if candidates.is_empty() {
            return Err(Bail::from(OverloadError::NoMatch {
                name: name.to_string(),
                span: call_span,
            }));
        }

        let chosen = if candidates.len() == 1 {
            candidates[0]
        } else {
            self.pick_best(&candidates, &list.overloads, &parsed)
                .ok_or_else(|| {
                    Bail::from(OverloadError::Ambiguous {
                        name: name.to_string(),
                        span: call_span,
                    })
                })?
        };

        let method = &list.overloads[chosen];
        let final_args = self.materialize_args(method, parsed, call_span);
        Ok((final_args, method.return_type.clone()))
    }

    /// Prefer the overload matching the first actual type exactly; among
    /// the rest, prefer an `int -> double` promotion over any other.
    fn pick_best(
        &self,
        candidates: &[usize],
        overloads: &[crate::compiler::bindings::MethodData],
        args: &[Expr],
    ) -> Option<usize> {
        if let Some(first) = args.first() {
            let exact: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|&j| {
                    user_formals(&overloads[j])
                        .first()
                        .map(|f| match f {
                            Formal::Type(t) | Formal::Variadic(t) => t == first.ty(),
                            Formal::Sentinel(_) => false,
                        })
                        .unwrap_or(false)
                })
                .collect();
            if exact.len() == 1 {
                return Some(exact[0]);
            }
            if exact.len() > 1 {
                return exact.into_iter().next();
            }
        }
        candidates.first().copied()
    }

    fn materialize_args(
        &self,
        method: &crate::compiler::bindings::MethodData,
        mut parsed: Vec<Expr>,
        span: Span,
    ) -> Vec<Expr> {
        let mut out = Vec::new();
        let mut pi = 0usize;
        for formal in &method.formals {
            match formal {
                Formal::Type(t) => {
                    if pi < parsed.len() {
                        let a = std::mem::replace(
                            &mut parsed[pi],
                            Expr::Block(vec![], Type::Void, span),
                        );
                        pi += 1;
                        out.push(convert_if_needed(a, t, span));
                    }
                }
                Formal::Variadic(t) => {
                    // a trailing variadic formal consumes every remaining
                    // actual argument, converting each independently.
                    while pi < parsed.len() {
                        let a = std::mem::replace(
                            &mut parsed[pi],
                            Expr::Block(vec![], Type::Void, span),
                        );
                        pi += 1;
                        out.push(convert_if_needed(a, t, span));
                    }
                }
                Formal::Sentinel(s) => out.push(materialize_sentinel(*s, span)),
            }
        }
        out
    }

    /// `expected_return` is the overload's declared formal lambda return
    /// type at this argument position (e.g. `DVector.map`'s
    /// `Formal::Type(Type::Double)`), the type the body is widened/upgraded
    /// against when the lambda frame closes.
    fn parse_lambda_arg(
        &mut self,
        arity: u8,
        receiver: Option<&Type>,
        expected_return: Option<&Type>,
    ) -> PResult<Expr> {
        let start = self.current.span;
        let mut names = Vec::new();
        if self.at(&TokenKind::LParen) {
            let open_span = self.current.span;
            self.bump()?;
            loop {
                let (n, _) = self.expect_id()?;
                names.push(n);
                if self.at(&TokenKind::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
            self.eat_closing(&TokenKind::RParen, '(', open_span)?;
        } else {
            let (n, _) = self.expect_id()?;
            names.push(n);
        }
        self.eat(&TokenKind::FatArrow)?;

        let param_types = self.lambda_param_types(receiver, arity, None);
        let mut frame = Vec::new();
        for (i, n) in names.iter().enumerate() {
            let id = self.fresh_param();
            let ty = param_types.get(i).cloned().unwrap_or(Type::Double);
            frame.push((n.clone(), id, ty));
        }
        let param_ids: Vec<(String, ParamId)> =
            frame.iter().map(|(n, id, _)| (n.clone(), *id)).collect();
        self.lambda_block.push(frame);
        let body = self.parse_conditional()?;
        let return_type = expected_return.cloned().unwrap_or_else(|| body.ty().clone());
        let closed = self
            .lambda_block
            .close(&body, &return_type, true)
            .map_err(|_| {
                Bail::from(ParseError::InconsistentLambdaTypes { span: body.span() })
            })?;
        let span = start.merge(body.span());
        Ok(Expr::Lambda {
            params: param_ids,
            body: Box::new(body),
            ty: Type::Lambda(param_types, Box::new(closed.return_type)),
            span,
        })
    }
}

fn is_matrix_transpose(e: &Expr) -> bool {
    matches!(e, Expr::UnaryOp(UnOp::Transpose, inner, _, _) if *inner.ty() == Type::Matrix)
}

/// Unwraps a `UnOp::Transpose` node built by `is_matrix_transpose`'s check.
fn unwrap_transpose(e: Expr) -> Expr {
    match e {
        Expr::UnaryOp(UnOp::Transpose, inner, _, _) => *inner,
        other => other,
    }
}

/// Structural equality ignoring source position: two references to the
/// same local/parameter or the same session variable count as "the same
/// value" for rewrite purposes (e.g. detecting `v*v`), even though the two
/// `Expr` nodes were parsed at different spans.
fn same_value(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Parameter(ia, _, _, _), Expr::Parameter(ib, _, _, _)) => ia == ib,
        (Expr::SessionVar(na, _, _), Expr::SessionVar(nb, _, _)) => na.eq_ignore_ascii_case(nb),
        (Expr::DefRef(na, _, _), Expr::DefRef(nb, _, _)) => na.eq_ignore_ascii_case(nb),
        _ => false,
    }
}

/// `c1 op c2` on two `double` constants are pre-computed (§4.4) for
/// `+ - * / %`, rather than emitted as a binary-op node over two literals.
fn fold_double_constants(op: BinOp, lhs: &Expr, rhs: &Expr, span: Span) -> Option<Expr> {
    let (Expr::Constant(Constant::Real(a), Type::Double, _), Expr::Constant(Constant::Real(b), Type::Double, _)) =
        (lhs, rhs)
    else {
        return None;
    };
    let folded = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a % b,
        _ => return None,
    };
    Some(Expr::Constant(Constant::Real(folded), Type::Double, span))
}

fn convert_if_needed(a: Expr, target: &Type, span: Span) -> Expr {
    if a.ty() == target {
        a
    } else {
        Expr::Convert(Box::new(a), target.clone(), span)
    }
}

fn user_formals(m: &crate::compiler::bindings::MethodData) -> Vec<&Formal> {
    m.formals
        .iter()
        .filter(|f| !matches!(f, Formal::Sentinel(_)))
        .collect()
}

fn materialize_sentinel(s: crate::compiler::bindings::SentinelArg, span: Span) -> Expr {
    use crate::compiler::bindings::SentinelArg;
    match s {
        SentinelArg::Zero => Expr::Constant(Constant::Real(0.0), Type::Double, span),
        SentinelArg::One => Expr::Constant(Constant::Real(1.0), Type::Double, span),
        SentinelArg::Random => Expr::New {
            class: "Random".into(),
            args: vec![],
            ty: Type::Double,
            span,
        },
        SentinelArg::NormalRandom => Expr::New {
            class: "NormalRandom".into(),
            args: vec![],
            ty: Type::Double,
            span,
        },
    }
}
