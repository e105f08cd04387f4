//! Analysis phases
//!
//! Pure checks that never mutate the tree. anal1 runs before type
//! inference and checks what the shape of the tree alone can tell:
//! duplicate fields, argument discipline. anal2 runs after the whole
//! front end and checks return coverage and leftover operators.
//! analf runs in the middle end and reports unreachable code.

use std::collections::HashSet;

use crate::ast::{Ast, NodeId, NodeKind, TypeKind};
use crate::pass::{Diag, Flow, Phase, WalkCtx};

#[derive(Default)]
pub struct Anal1 {
    pub diag: Diag,
}

#[derive(Default)]
pub struct Anal2 {
    pub diag: Diag,
}

#[derive(Default)]
pub struct AnalF {
    pub diag: Diag,
}

impl Phase for Anal1 {
    fn name(&self) -> &'static str {
        "anal1"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            // Duplicate field and method names in struct types.
            NodeKind::Type(TypeKind::Struct {
                fields, methods, ..
            }) => {
                let mut seen: HashSet<String> = HashSet::new();
                for field in fields.iter().chain(&methods) {
                    let name = match ast.kind(*field) {
                        NodeKind::StructTypeField { name: Some(n), .. } => Some(n.clone()),
                        NodeKind::Decl { name, .. } => Some(name.clone()),
                        _ => None,
                    };
                    if let Some(name) = name {
                        if !seen.insert(name.clone()) {
                            self.diag.error(
                                ast.loc(*field),
                                format!("duplicate field '{}' in struct type", name),
                            );
                        }
                    }
                }
            }

            // Duplicate initializers in struct constructors.
            NodeKind::StructCons { fields, .. } => {
                let mut seen: HashSet<String> = HashSet::new();
                for field in &fields {
                    if let NodeKind::StructField { name: Some(n), .. } = ast.kind(*field) {
                        if !seen.insert(n.clone()) {
                            self.diag.error(
                                ast.loc(*field),
                                format!("field '{}' initialized twice", n),
                            );
                        }
                    }
                }
            }

            // Optional argument defaults are inserted at call sites,
            // so they must be constants.
            NodeKind::FuncArg {
                initial: Some(initial),
                name,
                ..
            } => {
                if !ast.is_literal(initial) {
                    self.diag.error(
                        loc,
                        format!("the default of argument '{}' must be a constant", name),
                    );
                }
            }

            _ => {}
        }
        Flow::Ok
    }
}

/// Whether a statement returns (or raises) on every path through it.
fn returns_p(ast: &Ast, stmt: NodeId) -> bool {
    match ast.kind(stmt) {
        NodeKind::ReturnStmt { .. } | NodeKind::RaiseStmt { .. } => true,
        NodeKind::CompStmt { stmts, .. } => stmts.iter().any(|s| returns_p(ast, *s)),
        NodeKind::IfStmt {
            then_s,
            else_s: Some(else_s),
            ..
        } => returns_p(ast, *then_s) && returns_p(ast, *else_s),
        NodeKind::TryCatchStmt { body, handler, .. } => {
            returns_p(ast, *body) && returns_p(ast, *handler)
        }
        _ => false,
    }
}

impl Phase for Anal2 {
    fn name(&self) -> &'static str {
        "anal2"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            NodeKind::Func {
                rtype: Some(_),
                body,
                ..
            } => {
                if !returns_p(ast, body) {
                    self.diag.error(
                        loc,
                        "this function can reach its end without returning a value",
                    );
                }
            }

            // trans2 rewrites statement-level ++/--; anything left is
            // buried inside an expression, which is not supported.
            NodeKind::IncrDecr { .. } => {
                let under_stmt = matches!(
                    ctx.parent().map(|p| ast.kind(p)),
                    Some(NodeKind::ExpStmt { .. })
                );
                if !under_stmt {
                    self.diag
                        .error(loc, "++ and -- are only valid as statements");
                }
            }

            _ => {}
        }
        Flow::Ok
    }
}

/// Whether a statement never falls through to its successor.
fn terminates_p(ast: &Ast, stmt: NodeId) -> bool {
    matches!(
        ast.kind(stmt),
        NodeKind::ReturnStmt { .. }
            | NodeKind::RaiseStmt { .. }
            | NodeKind::BreakStmt { .. }
            | NodeKind::ContinueStmt { .. }
    )
}

impl Phase for AnalF {
    fn name(&self) -> &'static str {
        "analf"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        if let NodeKind::CompStmt { stmts, .. } = ast.kind(node).clone() {
            let mut dead = false;
            for stmt in &stmts {
                if dead {
                    self.diag.warn(ast.loc(*stmt), "unreachable statement");
                    break;
                }
                if terminates_p(ast, *stmt) {
                    dead = true;
                }
            }
        }
        Flow::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::CtEnv;
    use crate::parser::{ParseMode, Parser};
    use crate::pass::do_pass;
    use crate::trans::Trans1;

    fn anal(src: &str) -> (Anal1, Anal2, AnalF) {
        let mut ast = Ast::new();
        let mut env = CtEnv::new();
        let root = Parser::new(&mut ast, &mut env, src)
            .unwrap()
            .parse(ParseMode::Program)
            .unwrap();
        let mut t1 = Trans1::default();
        let mut a1 = Anal1::default();
        let mut ty1 = crate::typify::Typify1::default();
        let mut a2 = Anal2::default();
        let mut af = AnalF::default();
        do_pass(
            &mut ast,
            root,
            &mut [&mut t1, &mut a1, &mut ty1, &mut a2, &mut af],
            true,
        )
        .unwrap();
        (a1, a2, af)
    }

    #[test]
    fn duplicate_struct_fields_are_reported() {
        let (a1, _, _) = anal("type T = struct { int<8> x; int<8> x; };");
        assert_eq!(a1.diag.errors, 1);
    }

    #[test]
    fn missing_returns_are_reported() {
        let (_, a2, _) = anal("fun f = int<32>: { 1; }");
        assert_eq!(a2.diag.errors, 1);
        let (_, a2, _) = anal("fun f = int<32>: { return 1; }");
        assert_eq!(a2.diag.errors, 0);
        let (_, a2, _) =
            anal("fun f = (int<32> x) int<32>: { if (x) return 1; else return 2; }");
        assert_eq!(a2.diag.errors, 0);
        let (_, a2, _) = anal("fun f = (int<32> x) int<32>: { if (x) return 1; }");
        assert_eq!(a2.diag.errors, 1);
    }

    #[test]
    fn unreachable_code_warns() {
        let (_, _, af) = anal("fun f = int<32>: { return 1; 2; }");
        assert_eq!(af.diag.warnings, 1);
    }

    #[test]
    fn non_constant_defaults_are_rejected() {
        let (a1, _, _) = anal("var k = 1; fun f = (int<32> a = k) int<32>: { return a; }");
        assert_eq!(a1.diag.errors, 1);
    }
}
