//! Promotion phase
//!
//! typify1 accepts operand pairs that are promoteable rather than
//! equal; this phase makes every such conversion explicit by
//! wrapping the operand in a cast node. After promo, the code
//! generator can assume that the operands of an operation have
//! exactly the operation's computed type.
//!
//! It also performs the index/label normalizations: array indexes
//! and trimmer bounds become 64-bit unsigned, struct field labels
//! become bit offsets with unit 1.

use crate::ast::{Ast, DeclKind, NodeId, NodeKind, Op, TypeKind};
use crate::pass::{Diag, Flow, Phase, WalkCtx};
use crate::typify::{offset_parts, promoted_int};

#[derive(Default)]
pub struct Promo {
    pub diag: Diag,
}

/// Wrap `child` in a cast to `ty` unless it already has that type.
fn cast_to(ast: &mut Ast, child: NodeId, ty: NodeId) -> NodeId {
    let needs = match ast.ty(child) {
        Some(t) => !ast.type_equal_p(t, ty),
        None => false,
    };
    if !needs {
        return child;
    }
    let loc = ast.loc(child);
    let literal = ast.is_literal(child);
    let cast = ast.add(NodeKind::Cast { ty, exp: child }, loc);
    ast.set_ty(cast, ty);
    ast.set_literal(cast, literal);
    cast
}

/// Cast an offset operand to the promoted base type while keeping
/// its own unit; unit conversion proper happens in code generation.
fn cast_offset_base(ast: &mut Ast, child: NodeId, base: NodeId) -> NodeId {
    let loc = ast.loc(child);
    let unit = match ast.ty(child).and_then(|t| offset_parts(ast, t)) {
        Some((_, unit)) => ast.unit_bits(unit).unwrap_or(1),
        None => return child,
    };
    let target = ast.make_offset_type_bits(loc, base, unit);
    cast_to(ast, child, target)
}

impl Promo {
    /// Cast both operands of a binary expression to the type the
    /// operation computes with.
    fn promote_operands(&mut self, ast: &mut Ast, node: NodeId, op: Op, operands: &[NodeId]) {
        let loc = ast.loc(node);
        if operands.len() != 2 {
            return;
        }
        let (a, b) = (operands[0], operands[1]);
        let (aty, bty) = match (ast.ty(a), ast.ty(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return,
        };

        let new: Option<(NodeId, NodeId)> = match op {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::CeilDiv | Op::Mod | Op::BAnd | Op::BOr
            | Op::BXor | Op::Eq | Op::Ne | Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                if ast.type_is_integral(aty) && ast.type_is_integral(bty) {
                    promoted_int(ast, loc, aty, bty).map(|t| (cast_to(ast, a, t), cast_to(ast, b, t)))
                } else if ast.type_is_offset(aty) && ast.type_is_offset(bty) {
                    let (ba, _) = match offset_parts(ast, aty) {
                        Some(p) => p,
                        None => return,
                    };
                    let (bb, _) = match offset_parts(ast, bty) {
                        Some(p) => p,
                        None => return,
                    };
                    promoted_int(ast, loc, ba, bb).map(|base| {
                        (
                            cast_offset_base(ast, a, base),
                            cast_offset_base(ast, b, base),
                        )
                    })
                } else if ast.type_is_offset(aty) && ast.type_is_integral(bty) {
                    // OFF x INT keeps the offset base in sync.
                    let (ba, _) = match offset_parts(ast, aty) {
                        Some(p) => p,
                        None => return,
                    };
                    promoted_int(ast, loc, ba, bty)
                        .map(|base| (cast_offset_base(ast, a, base), cast_to(ast, b, base)))
                } else if ast.type_is_integral(aty) && ast.type_is_offset(bty) {
                    let (bb, _) = match offset_parts(ast, bty) {
                        Some(p) => p,
                        None => return,
                    };
                    promoted_int(ast, loc, aty, bb)
                        .map(|base| (cast_to(ast, a, base), cast_offset_base(ast, b, base)))
                } else {
                    None
                }
            }
            Op::And | Op::Or => {
                let boolty = ast.make_integral_type(loc, 32, true);
                Some((cast_to(ast, a, boolty), cast_to(ast, b, boolty)))
            }
            Op::Shl | Op::Shr | Op::Pow => {
                let shiftty = ast.make_integral_type(loc, 32, false);
                Some((a, cast_to(ast, b, shiftty)))
            }
            Op::In => {
                let etype = match ast.type_kind(bty) {
                    Some(TypeKind::Array { etype, .. }) => *etype,
                    _ => return,
                };
                Some((cast_to(ast, a, etype), b))
            }
            _ => None,
        };

        if let Some((na, nb)) = new {
            if let NodeKind::Exp { operands, .. } = &mut ast.node_mut(node).kind {
                operands[0] = na;
                operands[1] = nb;
            }
        }
    }
}

impl Phase for Promo {
    fn name(&self) -> &'static str {
        "promo"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            NodeKind::Exp { op, operands, .. } => {
                self.promote_operands(ast, node, op, &operands);
            }

            NodeKind::CondExp {
                cond,
                then_e,
                else_e,
            } => {
                if let Some(ty) = ast.ty(node) {
                    let boolty = ast.make_integral_type(loc, 32, true);
                    let cond = cast_to(ast, cond, boolty);
                    let then_e = cast_to(ast, then_e, ty);
                    let else_e = cast_to(ast, else_e, ty);
                    ast.node_mut(node).kind = NodeKind::CondExp {
                        cond,
                        then_e,
                        else_e,
                    };
                }
            }

            // Array indexes are 64-bit unsigned.
            NodeKind::Indexer { container, index } => {
                let u64t = ast.make_integral_type(loc, 64, false);
                let index = cast_to(ast, index, u64t);
                ast.node_mut(node).kind = NodeKind::Indexer { container, index };
            }
            NodeKind::Trimmer {
                container,
                from,
                to,
                addend,
            } => {
                let u64t = ast.make_integral_type(loc, 64, false);
                let from = from.map(|f| cast_to(ast, f, u64t));
                let to = to.map(|t| cast_to(ast, t, u64t));
                ast.node_mut(node).kind = NodeKind::Trimmer {
                    container,
                    from,
                    to,
                    addend,
                };
            }

            // Struct field labels become bit offsets with unit 1.
            NodeKind::StructTypeField {
                name,
                ty,
                label: Some(label),
                optcond,
                msb,
            } => {
                if let Some(bits) = ast.offset_bits(label) {
                    let mag = ast.make_integer(loc, bits as i64, 64, false);
                    let unit = ast.make_integer(loc, 1, 64, false);
                    let new_label = ast.add(
                        NodeKind::Offset {
                            magnitude: Some(mag),
                            unit,
                        },
                        loc,
                    );
                    let offty = ast.make_offset_u64_b1(loc);
                    ast.set_ty(new_label, offty);
                    ast.set_literal(new_label, true);
                    ast.node_mut(node).kind = NodeKind::StructTypeField {
                        name,
                        ty,
                        label: Some(new_label),
                        optcond,
                        msb,
                    };
                }
            }

            // Call actuals take the formal types exactly.
            NodeKind::Funcall { callee, args, vararg_from } => {
                let formals: Vec<NodeId> = match ast.ty(callee).and_then(|t| match ast
                    .type_kind(t)
                {
                    Some(TypeKind::Function { args, .. }) => Some(args.clone()),
                    _ => None,
                }) {
                    Some(f) => f,
                    None => return Flow::Ok,
                };
                let mut new_args = args.clone();
                for (i, actual) in args.iter().enumerate() {
                    if let Some(vf) = vararg_from {
                        if i >= vf as usize {
                            break;
                        }
                    }
                    let fty = match formals.get(i).map(|f| ast.kind(*f)) {
                        Some(NodeKind::FuncTypeArg { ty, .. }) => *ty,
                        _ => continue,
                    };
                    if let NodeKind::FuncallArg { exp, name } = ast.kind(*actual).clone() {
                        let exp = cast_to(ast, exp, fty);
                        let arg = ast.add(NodeKind::FuncallArg { exp, name }, ast.loc(*actual));
                        new_args[i] = arg;
                    }
                }
                ast.node_mut(node).kind = NodeKind::Funcall {
                    callee,
                    args: new_args,
                    vararg_from,
                };
            }

            NodeKind::AssStmt { lhs, exp } => {
                if let Some(lty) = ast.ty(lhs) {
                    let exp = cast_to(ast, exp, lty);
                    ast.node_mut(node).kind = NodeKind::AssStmt { lhs, exp };
                }
            }

            NodeKind::ReturnStmt {
                exp: Some(exp),
                function,
            } => {
                let rtype = function.and_then(|f| match ast.kind(f) {
                    NodeKind::Func { rtype, .. } => *rtype,
                    _ => None,
                });
                if let Some(rtype) = rtype {
                    let exp = cast_to(ast, exp, rtype);
                    ast.node_mut(node).kind = NodeKind::ReturnStmt {
                        exp: Some(exp),
                        function,
                    };
                }
            }

            // Annotated variable initializers convert to the
            // declared type.
            NodeKind::Decl {
                kind: DeclKind::Var,
                name,
                initial,
                order,
            } => {
                if let Some(annot) = ast.ty(node) {
                    if !matches!(ast.kind(initial), NodeKind::FuncArg { .. } | NodeKind::NullStmt) {
                        let initial = cast_to(ast, initial, annot);
                        ast.node_mut(node).kind = NodeKind::Decl {
                            kind: DeclKind::Var,
                            name,
                            initial,
                            order,
                        };
                    }
                }
            }

            NodeKind::StructCons { ty, fields } => {
                let tfields = match ast.type_kind(ty) {
                    Some(TypeKind::Struct { fields, .. }) => fields.clone(),
                    _ => return Flow::Ok,
                };
                let mut new_fields = fields.clone();
                for (i, field) in fields.iter().enumerate() {
                    if let NodeKind::StructField {
                        name: Some(fname),
                        exp,
                    } = ast.kind(*field).clone()
                    {
                        let fty = tfields.iter().find_map(|tf| match ast.kind(*tf) {
                            NodeKind::StructTypeField {
                                name: Some(n), ty, ..
                            } if *n == fname => Some(*ty),
                            _ => None,
                        });
                        if let Some(fty) = fty {
                            let exp = cast_to(ast, exp, fty);
                            let nf = ast.add(
                                NodeKind::StructField {
                                    name: Some(fname),
                                    exp,
                                },
                                ast.loc(*field),
                            );
                            new_fields[i] = nf;
                        }
                    }
                }
                ast.node_mut(node).kind = NodeKind::StructCons {
                    ty,
                    fields: new_fields,
                };
            }

            _ => {}
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
    use crate::typify::{int_parts, Typify1};

    fn front(src: &str) -> (Ast, NodeId) {
        let mut ast = Ast::new();
        let mut env = CtEnv::new();
        let root = Parser::new(&mut ast, &mut env, src)
            .unwrap()
            .parse(ParseMode::Expression)
            .unwrap();
        let mut t1 = Trans1::default();
        let mut ty1 = Typify1::default();
        let mut promo = Promo::default();
        do_pass(&mut ast, root, &mut [&mut t1, &mut ty1, &mut promo], true).unwrap();
        assert_eq!(ty1.diag.errors, 0, "{:?}", ty1.diag.messages);
        (ast, root)
    }

    #[test]
    fn mixed_width_addition_gets_casts() {
        let (ast, root) = front("1 + 2L");
        match ast.kind(root) {
            NodeKind::Exp { operands, .. } => {
                // The narrow operand is cast to int<64>.
                assert!(matches!(ast.kind(operands[0]), NodeKind::Cast { .. }));
                assert!(!matches!(ast.kind(operands[1]), NodeKind::Cast { .. }));
            }
            other => panic!("expected an expression, got {:?}", other),
        }
    }

    #[test]
    fn indexes_are_normalized_to_u64() {
        let (ast, root) = front("[1,2,3][0]");
        match ast.kind(root) {
            NodeKind::Indexer { index, .. } => {
                let ity = ast.ty(*index).unwrap();
                assert_eq!(int_parts(&ast, ity), Some((64, false)));
            }
            other => panic!("expected an indexer, got {:?}", other),
        }
    }
}
