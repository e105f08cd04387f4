//! Transformation phases
//!
//! Four rewrite phases interleaved with the analysis and typing
//! phases:
//!
//! - trans1 runs first and finishes what the parser left open:
//!   default offset magnitudes, function argument bookkeeping,
//!   implicit trimmer bounds, format-string splitting, back-edges
//!   from variables/returns/breaks to their enclosing constructs,
//!   and the rewrite of references to zero-argument functions into
//!   calls.
//! - trans2 runs after type inference: types used as offset units
//!   become their size in bits, struct references that resolve to
//!   methods become calls, and increment/decrement statements become
//!   assignments.
//! - trans3 folds `sizeof` of complete types into offset literals
//!   and resolves `isa` with concrete operand types.
//! - trans4 normalizes struct constructors to declaration field
//!   order ahead of code generation.

use crate::ast::{
    Ast, Complete, DeclKind, FormatPart, NodeId, NodeKind, Op, TypeKind,
};
use crate::pass::{Diag, Flow, Phase, WalkCtx};

#[derive(Default)]
pub struct Trans1 {
    pub diag: Diag,
}

#[derive(Default)]
pub struct Trans2 {
    pub diag: Diag,
}

#[derive(Default)]
pub struct Trans3 {
    pub diag: Diag,
}

#[derive(Default)]
pub struct Trans4 {
    pub diag: Diag,
}

/// Split a format string into literal runs and typed directives.
fn split_format(raw: &str) -> Result<Vec<FormatPart>, String> {
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            lit.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                lit.push('%');
                continue;
            }
            _ => {}
        }
        if !lit.is_empty() {
            parts.push(FormatPart::Lit(std::mem::take(&mut lit)));
        }
        match chars.next() {
            Some('s') => parts.push(FormatPart::Str),
            Some('c') => parts.push(FormatPart::Char),
            Some('v') => parts.push(FormatPart::Val),
            Some(k @ ('i' | 'u')) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let size: u32 = digits
                    .parse()
                    .map_err(|_| format!("missing width in %{} directive", k))?;
                if !(1..=64).contains(&size) {
                    return Err(format!("%{}{} width out of range", k, size));
                }
                parts.push(FormatPart::Int {
                    size,
                    signed: k == 'i',
                });
            }
            Some(other) => return Err(format!("unknown format directive '%{}'", other)),
            None => return Err("dangling '%' in format string".to_string()),
        }
    }
    if !lit.is_empty() {
        parts.push(FormatPart::Lit(lit));
    }
    Ok(parts)
}

/// Find the nearest enclosing node of interest in the parent chain.
fn nearest(ast: &Ast, parents: &[NodeId], pred: impl Fn(&NodeKind) -> bool) -> Option<NodeId> {
    parents.iter().rev().copied().find(|p| pred(ast.kind(*p)))
}

impl Phase for Trans1 {
    fn name(&self) -> &'static str {
        "trans1"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            // An omitted offset magnitude defaults to 1.
            NodeKind::Offset {
                magnitude: None,
                unit,
            } => {
                let one = ast.make_integer(loc, 1, 32, true);
                ast.node_mut(node).kind = NodeKind::Offset {
                    magnitude: Some(one),
                    unit,
                };
            }

            NodeKind::Func { args, vararg, .. } => {
                // Locate the first optional argument and check the
                // argument discipline: mandatory arguments cannot
                // follow optional ones, a vararg must come last.
                let mut first_opt: Option<u32> = None;
                for (i, arg) in args.iter().enumerate() {
                    let (has_initial, is_vararg) = match ast.kind(*arg) {
                        NodeKind::FuncArg {
                            initial, vararg, ..
                        } => (initial.is_some(), *vararg),
                        _ => (false, false),
                    };
                    if is_vararg && i != args.len() - 1 {
                        self.diag.error(loc, "a vararg argument must come last");
                    }
                    if has_initial && first_opt.is_none() {
                        first_opt = Some(i as u32);
                    }
                    if !has_initial && !is_vararg && first_opt.is_some() {
                        self.diag
                            .error(loc, "mandatory arguments cannot follow optional ones");
                    }
                }
                let nargs = args.len() as u32;
                if let NodeKind::Func {
                    nargs: n,
                    first_opt: fo,
                    ..
                } = &mut ast.node_mut(node).kind
                {
                    *n = nargs;
                    *fo = first_opt;
                }
                let _ = vararg;
            }

            // Implicit trimmer bounds: from defaults to 0UL, to
            // defaults to the container's length, an addend becomes
            // from + addend.
            NodeKind::Trimmer {
                container,
                from,
                to,
                addend,
            } => {
                let from = match from {
                    Some(f) => f,
                    None => ast.make_integer(loc, 0, 64, false),
                };
                let to = match (to, addend) {
                    (Some(t), _) => t,
                    (None, Some(addend)) => ast.add(
                        NodeKind::Exp {
                            op: Op::Add,
                            operands: vec![from, addend],
                            attr: None,
                        },
                        loc,
                    ),
                    (None, None) => ast.add(
                        NodeKind::Exp {
                            op: Op::Attr,
                            operands: vec![container],
                            attr: Some(crate::ast::Attr::Length),
                        },
                        loc,
                    ),
                };
                ast.node_mut(node).kind = NodeKind::Trimmer {
                    container,
                    from: Some(from),
                    to: Some(to),
                    addend: None,
                };
            }

            NodeKind::Format { raw, args, .. } => match split_format(&raw) {
                Ok(parts) => {
                    let directives = parts
                        .iter()
                        .filter(|p| !matches!(p, FormatPart::Lit(_)))
                        .count();
                    if directives != args.len() {
                        self.diag.error(
                            loc,
                            format!(
                                "format string wants {} arguments, {} given",
                                directives,
                                args.len()
                            ),
                        );
                    }
                    ast.node_mut(node).kind = NodeKind::Format { raw, parts, args };
                }
                Err(e) => self.diag.error(loc, e),
            },

            NodeKind::Var { decl, .. } => {
                // Record the enclosing function and the lexical
                // depth of the reference relative to it.
                let function = nearest(ast, ctx.parents, |k| matches!(k, NodeKind::Func { .. }));
                let mut fn_back = 0u32;
                for p in ctx.parents.iter().rev() {
                    if Some(*p) == function {
                        break;
                    }
                    if matches!(ast.kind(*p), NodeKind::CompStmt { .. }) {
                        fn_back += 1;
                    }
                }
                if let NodeKind::Var {
                    function: f,
                    fn_back: fb,
                    ..
                } = &mut ast.node_mut(node).kind
                {
                    *f = function;
                    *fb = fn_back;
                }

                // A reference to a function callable with no
                // actuals, outside a call position, becomes a call.
                let callable = match ast.kind(decl) {
                    NodeKind::Decl {
                        kind: DeclKind::Func,
                        initial,
                        ..
                    } => match ast.kind(*initial) {
                        NodeKind::Func {
                            args, first_opt, ..
                        } => args.is_empty() || *first_opt == Some(0),
                        _ => false,
                    },
                    _ => false,
                };
                let in_call_position = match ctx.parent().map(|p| ast.kind(p)) {
                    Some(NodeKind::Funcall { callee, .. }) => *callee == node,
                    _ => false,
                };
                if callable && !in_call_position {
                    let var = ast.node(node).clone();
                    let callee = ast.add(var.kind, loc);
                    ast.node_mut(node).kind = NodeKind::Funcall {
                        callee,
                        args: Vec::new(),
                        vararg_from: None,
                    };
                    return Flow::Restart;
                }
            }

            NodeKind::ReturnStmt { exp, function } => {
                if function.is_none() {
                    match nearest(ast, ctx.parents, |k| matches!(k, NodeKind::Func { .. })) {
                        Some(f) => {
                            ast.node_mut(node).kind = NodeKind::ReturnStmt {
                                exp,
                                function: Some(f),
                            };
                        }
                        None => self.diag.error(loc, "return outside of a function"),
                    }
                }
            }

            NodeKind::BreakStmt { target } | NodeKind::ContinueStmt { target } => {
                if target.is_none() {
                    let is_break = matches!(ast.kind(node), NodeKind::BreakStmt { .. });
                    match nearest(ast, ctx.parents, |k| matches!(k, NodeKind::LoopStmt { .. })) {
                        Some(l) => {
                            ast.node_mut(node).kind = if is_break {
                                NodeKind::BreakStmt { target: Some(l) }
                            } else {
                                NodeKind::ContinueStmt { target: Some(l) }
                            };
                        }
                        None => self.diag.error(
                            loc,
                            if is_break {
                                "break outside of a loop"
                            } else {
                                "continue outside of a loop"
                            },
                        ),
                    }
                }
            }

            _ => {}
        }
        Flow::Ok
    }
}

impl Phase for Trans2 {
    fn name(&self) -> &'static str {
        "trans2"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            // A type used as an offset unit becomes its size in
            // bits.
            NodeKind::Offset {
                magnitude,
                unit,
            } if ast.is_type(unit) => match ast.type_sizeof_bits(unit) {
                Some(bits) => {
                    let unit = ast.make_integer(loc, bits as i64, 64, false);
                    ast.node_mut(node).kind = NodeKind::Offset { magnitude, unit };
                }
                None => self
                    .diag
                    .error(loc, "the unit type has no constant size"),
            },
            NodeKind::Type(TypeKind::Offset { base, unit }) if ast.is_type(unit) => {
                match ast.type_sizeof_bits(unit) {
                    Some(bits) => {
                        let unit = ast.make_integer(loc, bits as i64, 64, false);
                        ast.node_mut(node).kind =
                            NodeKind::Type(TypeKind::Offset { base, unit });
                    }
                    None => self
                        .diag
                        .error(loc, "the unit type has no constant size"),
                }
            }

            // A struct reference that resolves to a method becomes a
            // zero-argument call of the method closure.
            NodeKind::StructRef { sct, ref name } => {
                let is_method = ast
                    .ty(sct)
                    .and_then(|sty| match ast.type_kind(sty) {
                        Some(TypeKind::Struct { methods, .. }) => Some(methods.clone()),
                        _ => None,
                    })
                    .map(|methods| {
                        methods.iter().any(|m| {
                            matches!(ast.kind(*m), NodeKind::Decl { name: n, .. } if n == name)
                        })
                    })
                    .unwrap_or(false);
                if is_method {
                    let sref = ast.node(node).clone();
                    let callee = ast.add(sref.kind, loc);
                    ast.node_mut(callee).ty = sref.ty;
                    ast.node_mut(node).kind = NodeKind::Funcall {
                        callee,
                        args: Vec::new(),
                        vararg_from: None,
                    };
                    // The call's type is the method's return type.
                    let rtype = sref.ty.and_then(|fty| match ast.type_kind(fty) {
                        Some(TypeKind::Function { rtype, .. }) => Some(*rtype),
                        _ => None,
                    });
                    if let Some(rtype) = rtype {
                        ast.set_ty(node, rtype);
                    }
                }
            }

            // x++; and x--; become assignments.
            NodeKind::ExpStmt { exp } => {
                if let NodeKind::IncrDecr { exp: lhs, delta } = ast.kind(exp).clone() {
                    let ty = ast.ty(lhs);
                    let (size, signed) = match ty.and_then(|t| ast.type_kind(t)) {
                        Some(TypeKind::Integral { size, signed }) => (*size, *signed),
                        _ => (32, true),
                    };
                    let one = ast.make_integer(loc, delta as i64, size, signed);
                    let sum = ast.add(
                        NodeKind::Exp {
                            op: Op::Add,
                            operands: vec![lhs, one],
                            attr: None,
                        },
                        loc,
                    );
                    if let Some(ty) = ty {
                        ast.set_ty(sum, ty);
                    }
                    ast.node_mut(node).kind = NodeKind::AssStmt { lhs, exp: sum };
                }
            }

            _ => {}
        }
        Flow::Ok
    }
}

impl Phase for Trans3 {
    fn name(&self) -> &'static str {
        "trans3"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            // sizeof of a complete type is a constant offset.
            NodeKind::Exp {
                op: Op::Sizeof,
                operands,
                ..
            } => {
                let ty = operands[0];
                if ast.type_is_complete(ty) == Complete::Yes {
                    if let Some(bits) = ast.type_sizeof_bits(ty) {
                        let mag = ast.make_integer(loc, bits as i64, 64, false);
                        let unit = ast.make_integer(loc, 1, 64, false);
                        let offty = ast.make_offset_u64_b1(loc);
                        ast.node_mut(node).kind = NodeKind::Offset {
                            magnitude: Some(mag),
                            unit,
                        };
                        ast.set_ty(node, offty);
                        ast.set_literal(node, true);
                    }
                }
            }

            // isa over a concrete (non-any) operand type resolves
            // now.
            NodeKind::Isa { ty, exp } => {
                if let Some(ety) = ast.ty(exp) {
                    if !ast.type_is_any(ety) && !ast.type_is_any(ty) {
                        let result = ast.type_equal_p(ety, ty);
                        let boolty = ast.make_integral_type(loc, 32, true);
                        ast.node_mut(node).kind = NodeKind::Integer {
                            value: result as i64,
                        };
                        ast.set_ty(node, boolty);
                        ast.set_literal(node, true);
                    }
                }
            }

            _ => {}
        }
        Flow::Ok
    }
}

impl Phase for Trans4 {
    fn name(&self) -> &'static str {
        "trans4"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        // Struct constructors are normalized to declaration field
        // order; the code generator then emits fields positionally.
        if let NodeKind::StructCons { ty, fields } = ast.kind(node).clone() {
            let tfields = match ast.type_kind(ty) {
                Some(TypeKind::Struct { fields, .. }) => fields.clone(),
                _ => return Flow::Ok,
            };
            let mut ordered: Vec<NodeId> = Vec::with_capacity(fields.len());
            for tfield in &tfields {
                let tname = match ast.kind(*tfield) {
                    NodeKind::StructTypeField { name: Some(n), .. } => n.clone(),
                    _ => continue,
                };
                if let Some(f) = fields.iter().copied().find(|f| {
                    matches!(ast.kind(*f), NodeKind::StructField { name: Some(n), .. } if *n == tname)
                }) {
                    ordered.push(f);
                }
            }
            // Unnamed initializers keep their positional order.
            for f in &fields {
                if matches!(ast.kind(*f), NodeKind::StructField { name: None, .. }) {
                    ordered.push(*f);
                }
            }
            if ordered.len() == fields.len() {
                ast.node_mut(node).kind = NodeKind::StructCons {
                    ty,
                    fields: ordered,
                };
            }
        }
        Flow::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_strings_split_into_typed_parts() {
        let parts = split_format("x=%i32, name=%s, %u8%%").unwrap();
        assert_eq!(
            parts,
            vec![
                FormatPart::Lit("x=".to_string()),
                FormatPart::Int {
                    size: 32,
                    signed: true
                },
                FormatPart::Lit(", name=".to_string()),
                FormatPart::Str,
                FormatPart::Lit(", ".to_string()),
                FormatPart::Int {
                    size: 8,
                    signed: false
                },
                FormatPart::Lit("%".to_string()),
            ]
        );
        assert!(split_format("%x").is_err());
        assert!(split_format("%i").is_err());
        assert!(split_format("%i128").is_err());
    }
}
