//! Completion façade (C6): member/class-method/parameter-info queries over
//! a source prefix. Every entry point here is infallible — a parse error
//! or an `Abort` both degrade to an empty result, never a propagated error
//! (§4.7, §8 invariant 9).

use crate::compiler::bindings::{Bindings, Formal};
use crate::compiler::datasource::DataSource;
use crate::compiler::parser::Parser;
use crate::compiler::types::Type;

/// `members(source, text)`: members reachable on the value named by the
/// terminal object path ending at `text`'s caret, plus that value's type
/// when one could be determined.
pub fn members(
    source: &str,
    text: &str,
    bindings: &Bindings,
    data_source: &mut dyn DataSource,
) -> (Vec<String>, Option<Type>) {
    if caret_in_literal(text) {
        return (Vec::new(), None);
    }

    let trimmed = trim_incomplete_tail(text);
    let scope = scan_scope(source, trimmed.len(), bindings, data_source);
    let (base, prefix) = split_trailing_path(trimmed);

    if base.trim().is_empty() {
        let mut roots = bindings.global_roots();
        roots.extend(scope.names());
        roots.sort();
        roots.dedup();
        return (filter_prefix(roots, &prefix), None);
    }

    if let Some(ty) = resolve_base_type(&base, &scope, bindings, data_source) {
        return (filter_prefix(bindings.members(&ty).to_vec(), &prefix), Some(ty));
    }

    (Vec::new(), None)
}

/// `class_members(text)`: methods of the class/namespace named by the last
/// `Id::` in `text` (e.g. completing `math::s` lists every `math` member
/// starting with `s`).
pub fn class_members(text: &str, bindings: &Bindings) -> Vec<String> {
    if caret_in_literal(text) {
        return Vec::new();
    }
    let trimmed = trim_incomplete_tail(text);
    let Some((class, prefix)) = split_trailing_class_path(trimmed) else {
        return Vec::new();
    };
    filter_prefix(bindings.class_members(&class.to_ascii_lowercase()).to_vec(), &prefix)
}

/// `param_info(text)`: overload signatures for the call whose open `(`
/// the caret currently sits inside.
pub fn param_info(text: &str, bindings: &Bindings) -> Vec<String> {
    if caret_in_literal(text) {
        return Vec::new();
    }
    let trimmed = trim_incomplete_tail(text);
    let Some(open) = find_enclosing_call_paren(trimmed) else {
        return Vec::new();
    };
    let head = trimmed[..open].trim_end();

    if let Some((class, method)) = head.rsplit_once("::") {
        let key = format!("{}.{}", class.trim().to_ascii_lowercase(), method.trim().to_ascii_lowercase());
        if let Some(list) = bindings.class_method(&key) {
            return list.overloads.iter().map(|m| signature("", method.trim(), m)).collect();
        }
        return Vec::new();
    }

    if let Some((base, method)) = head.rsplit_once('.') {
        let base_ident = trailing_identifier(base);
        // only a bare identifier base is resolvable without re-running the
        // full scope scan; good enough for the common `x.method(` case.
        if let Some(ty) = bindings.type_name(&base_ident) {
            if let Some(list) = bindings.overloads(ty, method.trim()) {
                return list.overloads.iter().map(|m| signature(&ty.to_string(), method.trim(), m)).collect();
            }
        }
        return Vec::new();
    }

    let name = trailing_identifier(head);
    if name.is_empty() {
        return Vec::new();
    }
    let key = format!("math.{}", name.to_ascii_lowercase());
    if let Some(list) = bindings.class_method(&key) {
        return list.overloads.iter().map(|m| signature("", &name, m)).collect();
    }
    Vec::new()
}

fn signature(receiver: &str, name: &str, m: &crate::compiler::bindings::MethodData) -> String {
    let args: Vec<String> = m
        .formals
        .iter()
        .filter(|f| !matches!(f, Formal::Sentinel(_)))
        .map(|f| match f {
            Formal::Type(t) => t.to_string(),
            Formal::Variadic(t) => format!("{}...", t),
            Formal::Sentinel(_) => unreachable!("filtered above"),
        })
        .collect();
    if receiver.is_empty() {
        format!("{}({}) -> {}", name, args.join(", "), m.return_type)
    } else {
        format!("{}.{}({}) -> {}", receiver, name, args.join(", "), m.return_type)
    }
}

fn filter_prefix(mut names: Vec<String>, prefix: &str) -> Vec<String> {
    if prefix.is_empty() {
        return names;
    }
    names.retain(|n| n.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase()));
    names
}

/// In-scope names gathered from a best-effort partial parse: script-scoped
/// `let` locals plus live lambda parameters.
struct Scope {
    locals: Vec<(String, Type)>,
    lambda_params: Vec<String>,
}

impl Scope {
    fn names(&self) -> Vec<String> {
        self.locals
            .iter()
            .map(|(n, _)| n.clone())
            .chain(self.lambda_params.iter().cloned())
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<Type> {
        self.locals
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, t)| t.clone())
    }
}

/// Re-parse `source` with the abort position set to the caret, catching
/// *every* error (including `Abort`) and returning whatever scope state the
/// parser reached (§4.6/§4.7: "return best partial result").
fn scan_scope(source: &str, abort_pos: usize, bindings: &Bindings, data_source: &mut dyn DataSource) -> Scope {
    let Ok(mut parser) = Parser::new_for_completion(source, abort_pos, bindings, data_source) else {
        return Scope { locals: Vec::new(), lambda_params: Vec::new() };
    };
    let _ = parser.parse_program();
    let locals = parser.locals().iter().map(|(n, (_, t))| (n.clone(), t.clone())).collect();
    let lambda_params = parser.lambda_block().gather_for_completion();
    Scope { locals, lambda_params }
}

/// Resolve the static type of a base path by re-parsing it standalone,
/// with currently in-scope `let` locals re-bound to representative
/// literals of the same type ahead of it — the "prepend a detected `let
/// … in` header" retry of §4.6, since a throwaway re-parse otherwise has
/// no memory of the surrounding scope.
fn resolve_base_type(base: &str, scope: &Scope, bindings: &Bindings, data_source: &mut dyn DataSource) -> Option<Type> {
    let trimmed = base.trim();
    if trimmed.chars().all(|c| c.is_alphanumeric() || c == '_') && !trimmed.is_empty() {
        if let Some(ty) = scope.lookup(trimmed) {
            return Some(ty);
        }
        if let Some(ty) = data_source.get(trimmed) {
            return Some(ty);
        }
    }

    let header: String = scope
        .locals
        .iter()
        .map(|(name, ty)| format!("{} = {}", name, dummy_literal(ty)))
        .collect::<Vec<_>>()
        .join(", ");
    let retry = if header.is_empty() {
        format!("({})", trimmed)
    } else {
        format!("let {} in ({})", header, trimmed)
    };
    let mut parser = Parser::new(&retry, bindings, data_source).ok()?;
    let expr = parser.parse_program().ok()?;
    Some(expr.ty().clone())
}

fn dummy_literal(ty: &Type) -> &'static str {
    match ty {
        Type::Int => "0",
        Type::Double => "0.0",
        Type::Complex => "0i",
        Type::Bool => "true",
        Type::String => "\"\"",
        Type::Date => "1@jan2000",
        Type::DVector => "[0.0]",
        Type::CVector => "[0i]",
        Type::NVector => "[0]",
        _ => "0.0",
    }
}

fn trailing_identifier(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut i = bytes.len();
    while i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_') {
        i -= 1;
    }
    s[i..].to_string()
}

/// Split `text` (already trimmed) into the base object path and the
/// partial member name the caret sits in the middle of, e.g. `"a.foo().b"`
/// -> `("a.foo()", "b")`, `"a."` -> `("a", "")`. An empty base means there
/// is no preceding `.`: the prefix alone is a bare identifier/root name.
fn split_trailing_path(text: &str) -> (String, String) {
    let trimmed = text.trim_end();
    let prefix = trailing_identifier(trimmed);
    let rest = trimmed[..trimmed.len() - prefix.len()].trim_end();
    match rest.strip_suffix('.') {
        Some(before_dot) => (walk_back_postfix_chain(before_dot.trim_end()).to_string(), prefix),
        None => (String::new(), prefix),
    }
}

fn split_trailing_class_path(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_end();
    let prefix = trailing_identifier(trimmed);
    let rest = trimmed[..trimmed.len() - prefix.len()].trim_end();
    let before = rest.strip_suffix("::")?;
    Some((trailing_identifier(before.trim_end()), prefix))
}

/// Walk backward over one postfix chain (identifiers, `.`, matched
/// brackets) to find where the object path the caret is inside of begins.
fn walk_back_postfix_chain(text: &str) -> &str {
    let bytes = text.as_bytes();
    let mut i = text.len();
    let mut depth: i32 = 0;
    while i > 0 {
        let c = bytes[i - 1] as char;
        if depth > 0 {
            if c == ')' || c == ']' {
                depth += 1;
            } else if c == '(' || c == '[' {
                depth -= 1;
            }
            i -= 1;
            continue;
        }
        match c {
            ')' | ']' => {
                depth += 1;
                i -= 1;
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' || c == ':' || c == '\'' => {
                i -= 1;
            }
            _ => break,
        }
    }
    text[i..].trim_start_matches(|c: char| c == ',' || char::is_whitespace(c))
}

/// Position of the `(` whose call the caret is nested inside, skipping
/// over any fully-balanced parenthesised groups along the way.
fn find_enclosing_call_paren(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth: i32 = 0;
    for i in (0..bytes.len()).rev() {
        match bytes[i] {
            b')' => depth += 1,
            b'(' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// True if `text` ends inside an unterminated string or date-ish literal
/// (SPEC_FULL §11.3 / spec.md open question: return an empty list rather
/// than guessing).
fn caret_in_literal(text: &str) -> bool {
    let mut in_string = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if in_string && chars.peek() == Some(&'"') {
                chars.next();
                continue;
            }
            in_string = !in_string;
        }
    }
    in_string
}

#[derive(Clone, Copy, PartialEq)]
enum TrimState {
    /// scanning the trailing fragment for `=` (tail already complete) or a
    /// depth-0 `,` (tail is a dangling, not-yet-assigned entry)
    ScanTail,
    TailComplete,
    TrimAtComma,
    NoSeparator,
}

/// Back-to-front "last assignment trim" (§4.5): drop an incomplete
/// dangling `, id` (no `=` yet) tail so the remainder — the last complete
/// assignment list — still parses on its own.
fn trim_incomplete_tail(text: &str) -> &str {
    let bytes = text.as_bytes();
    let mut depth: i32 = 0;
    let mut state = TrimState::ScanTail;
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        match bytes[i] {
            b')' | b']' | b'}' => depth += 1,
            b'(' | b'[' | b'{' => depth -= 1,
            b'=' if depth == 0 => {
                state = TrimState::TailComplete;
                break;
            }
            b',' if depth == 0 => {
                state = TrimState::TrimAtComma;
                break;
            }
            _ => {}
        }
    }
    if i == 0 && state == TrimState::ScanTail {
        state = TrimState::NoSeparator;
    }
    match state {
        TrimState::TrimAtComma => &text[..i],
        TrimState::TailComplete | TrimState::NoSeparator | TrimState::ScanTail => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{Definition, Expr};
    use std::collections::HashMap;

    struct TestDataSource {
        vars: HashMap<String, Type>,
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
        fn get_definition(&self, _name: &str) -> Option<Definition> {
            None
        }
        fn set_definition(&mut self, _def: Definition) {}
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

    fn ds() -> TestDataSource {
        TestDataSource { vars: HashMap::new() }
    }

    #[test]
    fn trims_dangling_tail_assignment() {
        assert_eq!(trim_incomplete_tail("let a = 1, b = 2, c"), "let a = 1, b = 2");
        assert_eq!(trim_incomplete_tail("let a = 1, b = 2"), "let a = 1, b = 2");
    }

    #[test]
    fn splits_trailing_member_path() {
        let (base, prefix) = split_trailing_path("x.no");
        assert_eq!(base, "x");
        assert_eq!(prefix, "no");

        let (base, prefix) = split_trailing_path("x.");
        assert_eq!(base, "x");
        assert_eq!(prefix, "");
    }

    #[test]
    fn members_on_bare_identifier_uses_session_var_type() {
        let bindings = Bindings::new(crate::compiler::bindings::BindingsOptions::default());
        let mut data_source = ds();
        data_source.set("v", Some(Type::DVector));
        let (list, ty) = members("v.", "v.", &bindings, &mut data_source);
        assert_eq!(ty, Some(Type::DVector));
        assert!(list.iter().any(|m| m == "length"));
    }

    #[test]
    fn members_empty_when_caret_inside_string() {
        let bindings = Bindings::new(crate::compiler::bindings::BindingsOptions::default());
        let mut data_source = ds();
        let (list, ty) = members("\"abc", "\"abc", &bindings, &mut data_source);
        assert!(list.is_empty());
        assert!(ty.is_none());
    }

    #[test]
    fn class_members_lists_math_functions() {
        let bindings = Bindings::new(crate::compiler::bindings::BindingsOptions::default());
        let list = class_members("math::sq", &bindings);
        assert!(list.iter().any(|m| m.starts_with("sq")));
    }
}
