//! Type inference and type checking
//!
//! typify1 computes, bottom-up, the type of every expression node
//! from the types of its children, reporting violations with source
//! locations. Literal types come from the parser; everything else
//! follows the rules of the type system: integral arithmetic with
//! promotion, offset arithmetic with unit normalization to the GCD,
//! the funcall discipline (named-argument reordering, optional
//! filling, vararg marking), the attribute table, and the struct
//! rules (integral structs, unions, labels).
//!
//! typify2 runs after the rewrites that depend on inferred types:
//! it annotates every type node with its completeness, validates
//! static array bounds, forbids casts to void/any/function types,
//! and requires sizeof arguments to be complete.

use poke_core::gcd64;

use crate::ast::{
    Ast, Attr, Builtin, Complete, DeclKind, FormatPart, Loc, NodeId, NodeKind, Op, TypeKind,
};
use crate::pass::{Diag, Flow, Phase, WalkCtx};

#[derive(Default)]
pub struct Typify1 {
    pub diag: Diag,
}

#[derive(Default)]
pub struct Typify2 {
    pub diag: Diag,
}

/* Shared helpers.  */

/// Size and sign of an integral type node.
pub fn int_parts(ast: &Ast, ty: NodeId) -> Option<(u32, bool)> {
    match ast.type_kind(ty) {
        Some(TypeKind::Integral { size, signed }) => Some((*size, *signed)),
        _ => None,
    }
}

/// Base and unit of an offset type node.
pub fn offset_parts(ast: &Ast, ty: NodeId) -> Option<(NodeId, NodeId)> {
    match ast.type_kind(ty) {
        Some(TypeKind::Offset { base, unit }) => Some((*base, *unit)),
        _ => None,
    }
}

/// The integral type two integral operands promote to: the larger
/// width; signed only when both are signed.
pub fn promoted_int(ast: &mut Ast, loc: Loc, a: NodeId, b: NodeId) -> Option<NodeId> {
    let (sa, ga) = int_parts(ast, a)?;
    let (sb, gb) = int_parts(ast, b)?;
    Some(ast.make_integral_type(loc, sa.max(sb), ga && gb))
}

/// The declared type of the entity a declaration binds.
pub fn decl_type(ast: &Ast, decl: NodeId) -> Option<NodeId> {
    if let Some(ty) = ast.ty(decl) {
        return Some(ty);
    }
    match ast.kind(decl) {
        NodeKind::Decl { initial, .. } => match ast.kind(*initial) {
            NodeKind::FuncArg { ty, .. } => Some(*ty),
            _ => ast.ty(*initial),
        },
        _ => None,
    }
}

/// The `Func` node behind a callee expression, when the callee is a
/// direct reference to a declared function or method. Needed for
/// argument names and defaults.
fn callee_func(ast: &Ast, callee: NodeId) -> Option<NodeId> {
    match ast.kind(callee) {
        NodeKind::Var { decl, .. } => match ast.kind(*decl) {
            NodeKind::Decl {
                kind: DeclKind::Func,
                initial,
                ..
            } => Some(*initial),
            _ => None,
        },
        NodeKind::StructRef { sct, name } => {
            let sty = ast.ty(*sct)?;
            match ast.type_kind(sty) {
                Some(TypeKind::Struct { methods, .. }) => {
                    methods.iter().find_map(|m| match ast.kind(*m) {
                        NodeKind::Decl {
                            name: n, initial, ..
                        } if n == name => Some(*initial),
                        _ => None,
                    })
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Signature of an intrinsic: argument types and result type.
fn builtin_sig(ast: &mut Ast, loc: Loc, which: Builtin) -> (Vec<NodeId>, NodeId) {
    let i32t = ast.make_integral_type(loc, 32, true);
    let u64t = ast.make_integral_type(loc, 64, false);
    match which {
        Builtin::Open => {
            let s = ast.make_string_type(loc);
            (vec![s, u64t], i32t)
        }
        Builtin::Close | Builtin::SetIos | Builtin::SetEndian => {
            let void = ast.add(NodeKind::Type(TypeKind::Void), loc);
            (vec![i32t], void)
        }
        Builtin::Flush => {
            let off = ast.make_offset_u64_b1(loc);
            let void = ast.add(NodeKind::Type(TypeKind::Void), loc);
            (vec![i32t, off], void)
        }
        Builtin::GetIos | Builtin::GetEndian => (vec![], i32t),
        Builtin::IoSize => {
            let base = ast.make_integral_type(loc, 64, false);
            let off = ast.make_offset_type_bits(loc, base, 8);
            (vec![i32t], off)
        }
    }
}

impl Typify1 {
    fn expect_ty(&mut self, ast: &Ast, node: NodeId) -> Option<NodeId> {
        let ty = ast.ty(node);
        if ty.is_none() {
            // A child failed to type; the error was already
            // reported there.
            self.diag.errors = self.diag.errors.max(1);
        }
        ty
    }

    /// Both operands promote to a common type, or the pair is
    /// rejected.
    fn common_type(&mut self, ast: &mut Ast, loc: Loc, a: NodeId, b: NodeId) -> Option<NodeId> {
        if ast.type_equal_p(a, b) {
            return Some(a);
        }
        if ast.type_is_integral(a) && ast.type_is_integral(b) {
            return promoted_int(ast, loc, a, b);
        }
        if ast.type_is_offset(a) && ast.type_is_offset(b) {
            let (ba, ua) = offset_parts(ast, a)?;
            let (bb, ub) = offset_parts(ast, b)?;
            let base = promoted_int(ast, loc, ba, bb)?;
            let (ua, ub) = (ast.unit_bits(ua)?, ast.unit_bits(ub)?);
            return Some(ast.make_offset_type_bits(loc, base, gcd64(ua, ub)));
        }
        if ast.type_promoteable_p(b, a, false) {
            return Some(a);
        }
        if ast.type_promoteable_p(a, b, false) {
            return Some(b);
        }
        None
    }

    fn exp_type(
        &mut self,
        ast: &mut Ast,
        loc: Loc,
        op: Op,
        operands: &[NodeId],
        attr: Option<Attr>,
    ) -> Option<NodeId> {
        let aty = self.expect_ty(ast, operands[0]);
        match op {
            Op::Add | Op::Sub | Op::BOr | Op::BXor | Op::BAnd | Op::Mod => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                if ast.type_is_integral(a) && ast.type_is_integral(b) {
                    return promoted_int(ast, loc, a, b);
                }
                if ast.type_is_offset(a) && ast.type_is_offset(b) {
                    let (ba, ua) = offset_parts(ast, a)?;
                    let (bb, ub) = offset_parts(ast, b)?;
                    let base = promoted_int(ast, loc, ba, bb)?;
                    let ua = ast.unit_bits(ua)?;
                    let ub = ast.unit_bits(ub)?;
                    return Some(ast.make_offset_type_bits(loc, base, gcd64(ua, ub)));
                }
                if op == Op::Add && ast.type_is_string(a) && ast.type_is_string(b) {
                    return Some(a);
                }
                if op == Op::Add && ast.type_is_array(a) && ast.type_is_array(b) {
                    if !ast.type_equal_p(a, b) {
                        self.diag
                            .error(loc, "array concatenation wants equal element types");
                        return None;
                    }
                    // The result length is only known at run-time.
                    if let Some(TypeKind::Array { etype, .. }) = ast.type_kind(a) {
                        let etype = *etype;
                        return Some(ast.add(
                            NodeKind::Type(TypeKind::Array { etype, bound: None }),
                            loc,
                        ));
                    }
                }
                self.diag.error(
                    loc,
                    format!(
                        "invalid operands to {:?}: {} and {}",
                        op,
                        ast.type_name(a),
                        ast.type_name(b)
                    ),
                );
                None
            }
            Op::Mul => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                if ast.type_is_integral(a) && ast.type_is_integral(b) {
                    return promoted_int(ast, loc, a, b);
                }
                // INT x OFF and OFF x INT scale the offset.
                for (off, int) in [(a, b), (b, a)] {
                    if ast.type_is_offset(off) && ast.type_is_integral(int) {
                        let (base, unit) = offset_parts(ast, off)?;
                        let base = promoted_int(ast, loc, base, int)?;
                        let unit = ast.unit_bits(unit)?;
                        return Some(ast.make_offset_type_bits(loc, base, unit));
                    }
                    if ast.type_is_string(off) && ast.type_is_integral(int) {
                        return Some(if ast.type_is_string(a) { a } else { b });
                    }
                }
                self.diag.error(loc, "invalid operands to *");
                None
            }
            Op::Div | Op::CeilDiv => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                if ast.type_is_integral(a) && ast.type_is_integral(b) {
                    return promoted_int(ast, loc, a, b);
                }
                if ast.type_is_offset(a) && ast.type_is_offset(b) {
                    // Offset over offset is a pure number.
                    let (ba, _) = offset_parts(ast, a)?;
                    let (bb, _) = offset_parts(ast, b)?;
                    return promoted_int(ast, loc, ba, bb);
                }
                if ast.type_is_offset(a) && ast.type_is_integral(b) {
                    let (base, unit) = offset_parts(ast, a)?;
                    let base = promoted_int(ast, loc, base, b)?;
                    let unit = ast.unit_bits(unit)?;
                    return Some(ast.make_offset_type_bits(loc, base, unit));
                }
                self.diag.error(loc, "invalid operands to division");
                None
            }
            Op::Shl | Op::Shr | Op::Pow => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                if !ast.type_is_integral(b) {
                    self.diag.error(loc, "the second operand must be integral");
                    return None;
                }
                if ast.type_is_integral(a) || ast.type_is_offset(a) {
                    return Some(a);
                }
                self.diag
                    .error(loc, "the first operand must be integral or an offset");
                None
            }
            Op::Eq | Op::Ne => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                let comparable = self.common_type(ast, loc, a, b).is_some()
                    || (ast.type_is_array(a) && ast.type_equal_p(a, b))
                    || matches!(
                        (ast.type_kind(a), ast.type_kind(b)),
                        (Some(TypeKind::Struct { .. }), Some(TypeKind::Struct { .. }))
                            | (
                                Some(TypeKind::Function { .. }),
                                Some(TypeKind::Function { .. })
                            )
                    ) && ast.type_equal_p(a, b);
                if !comparable {
                    self.diag.error(
                        loc,
                        format!(
                            "cannot compare {} with {}",
                            ast.type_name(a),
                            ast.type_name(b)
                        ),
                    );
                    return None;
                }
                Some(ast.make_integral_type(loc, 32, true))
            }
            Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                let ordered = (ast.type_is_integral(a) && ast.type_is_integral(b))
                    || (ast.type_is_offset(a) && ast.type_is_offset(b))
                    || (ast.type_is_string(a) && ast.type_is_string(b));
                if !ordered {
                    self.diag.error(
                        loc,
                        format!(
                            "cannot order {} against {}",
                            ast.type_name(a),
                            ast.type_name(b)
                        ),
                    );
                    return None;
                }
                Some(ast.make_integral_type(loc, 32, true))
            }
            Op::And | Op::Or => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                if !ast.type_is_integral(a) || !ast.type_is_integral(b) {
                    self.diag.error(loc, "logical operands must be integral");
                    return None;
                }
                Some(ast.make_integral_type(loc, 32, true))
            }
            Op::Not => {
                let a = aty?;
                if !ast.type_is_integral(a) {
                    self.diag.error(loc, "logical operand must be integral");
                    return None;
                }
                Some(ast.make_integral_type(loc, 32, true))
            }
            Op::Neg | Op::Pos | Op::BNot => {
                let a = aty?;
                if !ast.type_is_integral(a) {
                    self.diag.error(loc, "operand must be integral");
                    return None;
                }
                Some(a)
            }
            Op::BConc => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                let ((sa, ga), (sb, _)) = match (int_parts(ast, a), int_parts(ast, b)) {
                    (Some(x), Some(y)) => (x, y),
                    _ => {
                        self.diag.error(loc, "::: wants integral operands");
                        return None;
                    }
                };
                if sa + sb > 64 {
                    self.diag
                        .error(loc, "the width of a ::: result cannot exceed 64 bits");
                    return None;
                }
                Some(ast.make_integral_type(loc, sa + sb, ga))
            }
            Op::In => {
                let a = aty?;
                let b = self.expect_ty(ast, operands[1])?;
                let etype = match ast.type_kind(b) {
                    Some(TypeKind::Array { etype, .. }) => *etype,
                    _ => {
                        self.diag
                            .error(loc, "the right operand of 'in' must be an array");
                        return None;
                    }
                };
                if !ast.type_promoteable_p(a, etype, false) {
                    self.diag
                        .error(loc, "the left operand cannot be an element of the array");
                    return None;
                }
                Some(ast.make_integral_type(loc, 32, true))
            }
            Op::Sizeof => Some(ast.make_offset_u64_b1(loc)),
            Op::Typeof => Some(ast.make_any_type(loc)),
            Op::Attr => self.attr_type(ast, loc, attr?, operands),
        }
    }

    /// The attribute table: the set each attribute is defined on
    /// and its result type.
    fn attr_type(
        &mut self,
        ast: &mut Ast,
        loc: Loc,
        attr: Attr,
        operands: &[NodeId],
    ) -> Option<NodeId> {
        let vty = self.expect_ty(ast, operands[0])?;
        if attr.takes_index() {
            let ity = self.expect_ty(ast, operands[1])?;
            if !ast.type_is_integral(ity) {
                self.diag.error(loc, "attribute index must be integral");
                return None;
            }
        }
        let is_composite = matches!(
            ast.type_kind(vty),
            Some(TypeKind::Array { .. }) | Some(TypeKind::Struct { .. })
        ) || ast.type_is_any(vty);
        match attr {
            Attr::Size | Attr::Mapped | Attr::Strict | Attr::Ios => {}
            Attr::Length => {
                let ok = ast.type_is_array(vty)
                    || ast.type_is_string(vty)
                    || ast.type_is_any(vty)
                    || matches!(ast.type_kind(vty), Some(TypeKind::Struct { .. }));
                if !ok {
                    self.diag.error(loc, "'length is not defined for this value");
                    return None;
                }
            }
            Attr::Signed => {
                if !ast.type_is_integral(vty) {
                    self.diag.error(loc, "'signed is defined on integral values");
                    return None;
                }
            }
            Attr::Magnitude | Attr::Unit => {
                if !ast.type_is_offset(vty) {
                    self.diag.error(loc, "this attribute is defined on offsets");
                    return None;
                }
            }
            Attr::Offset => {
                if !is_composite {
                    self.diag
                        .error(loc, "'offset is defined on structs, arrays and any");
                    return None;
                }
            }
            Attr::Elem | Attr::EOffset | Attr::ESize | Attr::EName => {
                if !is_composite {
                    self.diag
                        .error(loc, "element attributes are defined on composites");
                    return None;
                }
            }
        }
        Some(match attr {
            Attr::Size | Attr::Offset | Attr::EOffset | Attr::ESize => {
                ast.make_offset_u64_b1(loc)
            }
            Attr::Length | Attr::Unit => ast.make_integral_type(loc, 64, false),
            Attr::Signed | Attr::Mapped | Attr::Strict | Attr::Ios => {
                ast.make_integral_type(loc, 32, true)
            }
            Attr::Magnitude => offset_parts(ast, vty)?.0,
            Attr::Elem => ast.make_any_type(loc),
            Attr::EName => ast.make_string_type(loc),
        })
    }

    /// Funcall typing: resolve the formals, reorder named actuals,
    /// fill omitted optionals, mark the vararg tail, check
    /// promoteability, and take the return type.
    fn funcall(&mut self, ast: &mut Ast, loc: Loc, node: NodeId) -> Option<NodeId> {
        let (callee, args) = match ast.kind(node) {
            NodeKind::Funcall { callee, args, .. } => (*callee, args.clone()),
            _ => return None,
        };

        // Intrinsics have a fixed signature.
        if let NodeKind::BuiltinRef { which } = *ast.kind(callee) {
            let (formals, rtype) = builtin_sig(ast, loc, which);
            let mut actuals = args;
            // open's flags argument is optional and defaults to 0.
            if which == Builtin::Open && actuals.len() == 1 {
                let zero = ast.make_integer(loc, 0, 64, false);
                actuals.push(ast.add(NodeKind::FuncallArg { exp: zero, name: None }, loc));
            }
            if actuals.len() != formals.len() {
                self.diag.error(
                    loc,
                    format!("intrinsic wants {} arguments, {} given", formals.len(), actuals.len()),
                );
                return None;
            }
            for (actual, formal) in actuals.iter().zip(&formals) {
                let exp = match ast.kind(*actual) {
                    NodeKind::FuncallArg { exp, .. } => *exp,
                    _ => continue,
                };
                let aty = self.expect_ty(ast, exp)?;
                if !ast.type_promoteable_p(aty, *formal, true) {
                    self.diag.error(loc, "argument type mismatch in intrinsic call");
                    return None;
                }
            }
            if let NodeKind::Funcall { args, .. } = &mut ast.node_mut(node).kind {
                *args = actuals;
            }
            return Some(rtype);
        }

        let cty = self.expect_ty(ast, callee)?;
        let (rtype, ftargs) = match ast.type_kind(cty) {
            Some(TypeKind::Function { rtype, args }) => (*rtype, args.clone()),
            _ => {
                self.diag.error(loc, "called value is not a function");
                return None;
            }
        };
        let func = callee_func(ast, callee);

        let has_vararg = ftargs
            .last()
            .map(|a| matches!(ast.kind(*a), NodeKind::FuncTypeArg { vararg: true, .. }))
            .unwrap_or(false);
        let nformals = ftargs.len();
        let nfixed = if has_vararg { nformals - 1 } else { nformals };

        // Slot the actuals: positional in order, named by formal
        // name (which needs the declared function).
        let mut slots: Vec<Option<NodeId>> = vec![None; nfixed];
        let mut tail: Vec<NodeId> = Vec::new();
        let mut next_positional = 0usize;
        for actual in &args {
            let name = match ast.kind(*actual) {
                NodeKind::FuncallArg { name, .. } => name.clone(),
                _ => None,
            };
            match name {
                Some(name) => {
                    let func = match func {
                        Some(f) => f,
                        None => {
                            self.diag.error(
                                loc,
                                "named arguments need a directly named function",
                            );
                            return None;
                        }
                    };
                    let formal_names: Vec<String> = match ast.kind(func) {
                        NodeKind::Func { args, .. } => args
                            .iter()
                            .map(|a| match ast.kind(*a) {
                                NodeKind::FuncArg { name, .. } => name.clone(),
                                _ => String::new(),
                            })
                            .collect(),
                        _ => Vec::new(),
                    };
                    match formal_names.iter().position(|n| *n == name) {
                        Some(i) if i < nfixed => {
                            if slots[i].is_some() {
                                self.diag
                                    .error(loc, format!("argument '{}' given twice", name));
                                return None;
                            }
                            slots[i] = Some(*actual);
                        }
                        _ => {
                            self.diag
                                .error(loc, format!("no formal argument named '{}'", name));
                            return None;
                        }
                    }
                }
                None => {
                    if next_positional < nfixed {
                        slots[next_positional] = Some(*actual);
                        next_positional += 1;
                    } else if has_vararg {
                        tail.push(*actual);
                    } else {
                        self.diag.error(loc, "too many arguments in call");
                        return None;
                    }
                }
            }
        }

        // Fill omitted optionals from the declared defaults.
        let mut ordered = Vec::with_capacity(nformals);
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(a) => ordered.push(*a),
                None => {
                    let default = func.and_then(|f| match ast.kind(f) {
                        NodeKind::Func { args, .. } => {
                            args.get(i).and_then(|a| match ast.kind(*a) {
                                NodeKind::FuncArg { initial, .. } => *initial,
                                _ => None,
                            })
                        }
                        _ => None,
                    });
                    match default {
                        Some(d) => {
                            let arg =
                                ast.add(NodeKind::FuncallArg { exp: d, name: None }, loc);
                            ordered.push(arg);
                        }
                        None => {
                            self.diag
                                .error(loc, format!("missing argument {} in call", i + 1));
                            return None;
                        }
                    }
                }
            }
        }

        // Type-check fixed actuals against the formals.
        for (actual, formal) in ordered.iter().zip(&ftargs) {
            let fty = match ast.kind(*formal) {
                NodeKind::FuncTypeArg { ty, .. } => *ty,
                _ => continue,
            };
            let exp = match ast.kind(*actual) {
                NodeKind::FuncallArg { exp, .. } => *exp,
                _ => continue,
            };
            let aty = self.expect_ty(ast, exp)?;
            if !ast.type_promoteable_p(aty, fty, true) {
                self.diag.error(
                    loc,
                    format!(
                        "argument of type {} cannot be passed where {} is wanted",
                        ast.type_name(aty),
                        ast.type_name(fty)
                    ),
                );
                return None;
            }
        }

        let vararg_from = if has_vararg {
            Some(nfixed as u32)
        } else {
            None
        };
        ordered.extend(tail);
        if let NodeKind::Funcall {
            args, vararg_from: vf, ..
        } = &mut ast.node_mut(node).kind
        {
            *args = ordered;
            *vf = vararg_from;
        }
        Some(rtype)
    }

    /// Struct type validation: integral structs need an integral
    /// itype matched exactly by the field widths; pinned unions are
    /// forbidden; labels and optional fields are forbidden inside
    /// integral and pinned structs and unions.
    fn check_struct_type(&mut self, ast: &mut Ast, loc: Loc, node: NodeId) {
        let (fields, pinned, union_p, itype) = match ast.type_kind(node) {
            Some(TypeKind::Struct {
                fields,
                pinned,
                union_p,
                itype,
                ..
            }) => (fields.clone(), *pinned, *union_p, *itype),
            _ => return,
        };

        if pinned && union_p {
            self.diag.error(loc, "pinned unions are not allowed");
        }

        let restricted = itype.is_some() || pinned || union_p;
        for field in &fields {
            if let NodeKind::StructTypeField {
                label, optcond, ..
            } = ast.kind(*field)
            {
                if restricted && (label.is_some() || optcond.is_some()) {
                    self.diag.error(
                        ast.loc(*field),
                        "labels and optional fields are not allowed in integral or pinned \
                         structs and unions",
                    );
                }
            }
        }

        if let Some(itype) = itype {
            let width = match int_parts(ast, itype) {
                Some((w, _)) => w as u64,
                None => {
                    self.diag
                        .error(loc, "the itype of an integral struct must be integral");
                    return;
                }
            };
            let mut sum = 0u64;
            let mut ok = true;
            for field in &fields {
                if let NodeKind::StructTypeField { ty, .. } = ast.kind(*field) {
                    match ast.type_sizeof_bits(*ty) {
                        Some(bits) => sum += bits,
                        None => {
                            self.diag.error(
                                ast.loc(*field),
                                "fields of an integral struct must have constant size",
                            );
                            ok = false;
                        }
                    }
                }
            }
            if ok && sum != width {
                self.diag.error(
                    loc,
                    format!(
                        "the fields of this integral struct amount to {} bits, \
                         but its itype is {} bits wide",
                        sum, width
                    ),
                );
            }
        }
    }
}

impl Phase for Typify1 {
    fn name(&self) -> &'static str {
        "typify1"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn pre(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        // Functions get their type up front so recursive references
        // inside the body can resolve it.
        if let NodeKind::Func { rtype, args, .. } = ast.kind(node).clone() {
            let loc = ast.loc(node);
            let rtype = match rtype {
                Some(t) => t,
                None => ast.add(NodeKind::Type(TypeKind::Void), loc),
            };
            let mut targs = Vec::with_capacity(args.len());
            for arg in &args {
                if let NodeKind::FuncArg {
                    ty,
                    initial,
                    vararg,
                    ..
                } = ast.kind(*arg).clone()
                {
                    targs.push(ast.add(
                        NodeKind::FuncTypeArg {
                            ty,
                            optional: initial.is_some(),
                            vararg,
                        },
                        loc,
                    ));
                }
            }
            let fty = ast.add(
                NodeKind::Type(TypeKind::Function {
                    rtype,
                    args: targs,
                }),
                loc,
            );
            ast.set_ty(node, fty);
        }
        Flow::Ok
    }

    fn post(&mut self, ast: &mut Ast, ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        let ty: Option<NodeId> = match ast.kind(node).clone() {
            NodeKind::Integer { .. } | NodeKind::Str { .. } => return Flow::Ok,

            NodeKind::BuiltinRef { .. } => {
                let in_call_position = matches!(
                    ctx.parent().map(|p| ast.kind(p)),
                    Some(NodeKind::Funcall { callee, .. }) if *callee == node
                );
                if !in_call_position {
                    self.diag.error(loc, "this intrinsic must be called");
                }
                return Flow::Ok;
            }

            NodeKind::Offset { magnitude, unit } => (|| {
                let mag = magnitude?;
                let mty = self.expect_ty(ast, mag)?;
                if !ast.type_is_integral(mty) {
                    self.diag
                        .error(loc, "offset magnitudes must be integral");
                    return None;
                }
                let unit_bits = match ast.unit_bits(unit) {
                    Some(0) => {
                        self.diag.error(loc, "offset units must be positive");
                        return None;
                    }
                    Some(bits) => bits,
                    None => {
                        self.diag.error(loc, "offset unit is not constant");
                        return None;
                    }
                };
                // Normalize type units to their bit count here so
                // everything downstream sees integer units.
                if ast.is_type(unit) {
                    let new_unit = ast.make_integer(loc, unit_bits as i64, 64, false);
                    ast.node_mut(node).kind = NodeKind::Offset {
                        magnitude: Some(mag),
                        unit: new_unit,
                    };
                }
                let literal = ast.is_literal(mag);
                ast.set_literal(node, literal);
                Some(ast.make_offset_type_bits(loc, mty, unit_bits))
            })(),

            NodeKind::Exp { op, operands, attr } => {
                self.exp_type(ast, loc, op, &operands, attr)
            }

            NodeKind::CondExp {
                cond,
                then_e,
                else_e,
            } => (|| {
                let cty = self.expect_ty(ast, cond)?;
                if !ast.type_is_integral(cty) {
                    self.diag.error(loc, "the condition must be integral");
                    return None;
                }
                let a = self.expect_ty(ast, then_e)?;
                let b = self.expect_ty(ast, else_e)?;
                match self.common_type(ast, loc, a, b) {
                    Some(t) => Some(t),
                    None => {
                        self.diag
                            .error(loc, "the alternatives have incompatible types");
                        None
                    }
                }
            })(),

            NodeKind::Cast { ty, exp } => (|| {
                let from = self.expect_ty(ast, exp)?;
                let ok = ast.type_promoteable_p(from, ty, true)
                    || ast.type_is_any(from)
                    || (ast.type_is_array(from) && ast.type_is_array(ty));
                if !ok {
                    self.diag.error(
                        loc,
                        format!(
                            "{} cannot be converted to {}",
                            ast.type_name(from),
                            ast.type_name(ty)
                        ),
                    );
                    return None;
                }
                Some(ty)
            })(),

            NodeKind::Isa { exp, .. } => (|| {
                self.expect_ty(ast, exp)?;
                Some(ast.make_integral_type(loc, 32, true))
            })(),

            NodeKind::Map {
                ty, ios, offset, ..
            } => (|| {
                if !ast.type_mappable_p(ty) {
                    self.diag.error(loc, "this type cannot be mapped");
                    return None;
                }
                let oty = self.expect_ty(ast, offset)?;
                if !ast.type_is_offset(oty) {
                    self.diag.error(loc, "the map offset must be an offset");
                    return None;
                }
                if let Some(ios) = ios {
                    let ity = self.expect_ty(ast, ios)?;
                    if !ast.type_is_integral(ity) {
                        self.diag.error(loc, "the IOS of a map must be integral");
                        return None;
                    }
                }
                Some(ty)
            })(),

            NodeKind::ArrayLit { initializers } => (|| {
                if initializers.is_empty() {
                    self.diag
                        .error(loc, "empty array literals have no element type");
                    return None;
                }
                let mut etype: Option<NodeId> = None;
                let mut count: u64 = 0;
                for init in &initializers {
                    let (index, exp) = match ast.kind(*init) {
                        NodeKind::ArrayInitializer { index, exp } => (*index, *exp),
                        _ => continue,
                    };
                    let ety = self.expect_ty(ast, exp)?;
                    match etype {
                        None => etype = Some(ety),
                        Some(t) => {
                            if !ast.type_equal_p(t, ety) {
                                self.diag.error(
                                    loc,
                                    "array elements must all have the same type",
                                );
                                return None;
                            }
                        }
                    }
                    match index {
                        Some(index) => match ast.integer_value(index) {
                            Some(i) if i >= 0 => count = count.max(i as u64 + 1),
                            _ => {
                                self.diag.error(
                                    loc,
                                    "array initializer indexes must be constant and \
                                     non-negative",
                                );
                                return None;
                            }
                        },
                        None => count += 1,
                    }
                }
                let etype = etype?;
                let bound = ast.make_integer(loc, count as i64, 64, false);
                Some(ast.add(
                    NodeKind::Type(TypeKind::Array {
                        etype,
                        bound: Some(bound),
                    }),
                    loc,
                ))
            })(),

            NodeKind::Indexer { container, index } => (|| {
                let ity = self.expect_ty(ast, index)?;
                if !ast.type_is_integral(ity) {
                    self.diag.error(loc, "index expressions must be integral");
                    return None;
                }
                let cty = self.expect_ty(ast, container)?;
                match ast.type_kind(cty) {
                    Some(TypeKind::Array { etype, .. }) => Some(*etype),
                    Some(TypeKind::StrT) => Some(ast.make_integral_type(loc, 8, false)),
                    _ => {
                        self.diag
                            .error(loc, "only arrays and strings can be indexed");
                        None
                    }
                }
            })(),

            NodeKind::Trimmer {
                container,
                from,
                to,
                ..
            } => (|| {
                for bound in [from, to].into_iter().flatten() {
                    let bty = self.expect_ty(ast, bound)?;
                    if !ast.type_is_integral(bty) {
                        self.diag.error(loc, "trimmer bounds must be integral");
                        return None;
                    }
                }
                let cty = self.expect_ty(ast, container)?;
                match ast.type_kind(cty) {
                    Some(TypeKind::Array { etype, .. }) => {
                        let etype = *etype;
                        Some(ast.add(
                            NodeKind::Type(TypeKind::Array { etype, bound: None }),
                            loc,
                        ))
                    }
                    Some(TypeKind::StrT) => Some(ast.make_string_type(loc)),
                    _ => {
                        self.diag
                            .error(loc, "only arrays and strings can be trimmed");
                        None
                    }
                }
            })(),

            NodeKind::StructCons { ty, fields } => (|| {
                let (tfields, union_p) = match ast.type_kind(ty) {
                    Some(TypeKind::Struct {
                        fields, union_p, ..
                    }) => (fields.clone(), *union_p),
                    _ => {
                        self.diag
                            .error(loc, "struct constructors want a struct type");
                        return None;
                    }
                };
                if union_p && fields.len() > 1 {
                    self.diag.error(
                        loc,
                        "a union constructor takes at most one initializer",
                    );
                    return None;
                }
                for field in &fields {
                    let (name, exp) = match ast.kind(*field) {
                        NodeKind::StructField { name, exp } => (name.clone(), *exp),
                        _ => continue,
                    };
                    let name = match name {
                        Some(n) => n,
                        None => {
                            self.diag
                                .error(loc, "struct initializers must name their field");
                            return None;
                        }
                    };
                    let tfield = tfields.iter().find_map(|tf| match ast.kind(*tf) {
                        NodeKind::StructTypeField {
                            name: Some(n), ty, ..
                        } if *n == name => Some(*ty),
                        _ => None,
                    });
                    match tfield {
                        Some(fty) => {
                            let ety = self.expect_ty(ast, exp)?;
                            if !ast.type_promoteable_p(ety, fty, false) {
                                self.diag.error(
                                    loc,
                                    format!("initializer for '{}' has the wrong type", name),
                                );
                                return None;
                            }
                        }
                        None => {
                            self.diag.error(
                                loc,
                                format!("the struct type has no field named '{}'", name),
                            );
                            return None;
                        }
                    }
                }
                Some(ty)
            })(),

            NodeKind::StructRef { sct, name } => (|| {
                let sty = self.expect_ty(ast, sct)?;
                let (tfields, methods) = match ast.type_kind(sty) {
                    Some(TypeKind::Struct {
                        fields, methods, ..
                    }) => (fields.clone(), methods.clone()),
                    _ => {
                        self.diag
                            .error(loc, "only struct values have fields");
                        return None;
                    }
                };
                let field = tfields.iter().find_map(|tf| match ast.kind(*tf) {
                    NodeKind::StructTypeField {
                        name: Some(n), ty, ..
                    } if *n == name => Some(*ty),
                    _ => None,
                });
                if let Some(fty) = field {
                    return Some(fty);
                }
                let method = methods.iter().find_map(|m| match ast.kind(*m) {
                    NodeKind::Decl {
                        name: n, initial, ..
                    } if *n == name => Some(*initial),
                    _ => None,
                });
                match method {
                    Some(func) => ast.ty(func),
                    None => {
                        self.diag.error(
                            loc,
                            format!("the struct has no field or method named '{}'", name),
                        );
                        None
                    }
                }
            })(),

            NodeKind::Funcall { .. } => self.funcall(ast, loc, node),

            NodeKind::Var { decl, .. } => match decl_type(ast, decl) {
                Some(ty) => Some(ty),
                None => {
                    self.diag
                        .error(loc, "the referenced declaration has no type yet");
                    None
                }
            },

            NodeKind::Lambda { func } => ast.ty(func),

            NodeKind::Format { parts, args, .. } => (|| {
                let mut ai = 0usize;
                for part in &parts {
                    let want: Option<NodeId> = match part {
                        FormatPart::Lit(_) => continue,
                        FormatPart::Int { size, signed } => {
                            Some(ast.make_integral_type(loc, *size, *signed))
                        }
                        FormatPart::Str => Some(ast.make_string_type(loc)),
                        FormatPart::Char => Some(ast.make_integral_type(loc, 8, false)),
                        FormatPart::Val => None,
                    };
                    let arg = match args.get(ai) {
                        Some(a) => *a,
                        None => break,
                    };
                    ai += 1;
                    let aty = self.expect_ty(ast, arg)?;
                    if let Some(want) = want {
                        if !ast.type_promoteable_p(aty, want, false) {
                            self.diag.error(
                                loc,
                                format!(
                                    "format argument {} has type {}, directive wants {}",
                                    ai,
                                    ast.type_name(aty),
                                    ast.type_name(want)
                                ),
                            );
                            return None;
                        }
                    }
                }
                Some(ast.make_string_type(loc))
            })(),

            NodeKind::IncrDecr { exp, .. } => (|| {
                let ty = self.expect_ty(ast, exp)?;
                if !ast.type_is_integral(ty) {
                    self.diag
                        .error(loc, "++ and -- want an integral operand");
                    return None;
                }
                Some(ty)
            })(),

            NodeKind::Type(TypeKind::Struct { .. }) => {
                self.check_struct_type(ast, loc, node);
                return Flow::Ok;
            }

            NodeKind::LoopIterator { decl, container } => {
                if let Some(cty) = self.expect_ty(ast, container) {
                    let ety = match ast.type_kind(cty) {
                        Some(TypeKind::Array { etype, .. }) => Some(*etype),
                        Some(TypeKind::StrT) => Some(ast.make_integral_type(loc, 8, false)),
                        _ => {
                            self.diag
                                .error(loc, "for-in wants an array or string container");
                            None
                        }
                    };
                    if let Some(ety) = ety {
                        ast.set_ty(decl, ety);
                    }
                }
                return Flow::Ok;
            }

            NodeKind::Decl { kind, initial, .. } => {
                // A type-annotated variable requires a promoteable
                // initializer.
                if kind == DeclKind::Var {
                    if let (Some(annot), Some(ity)) = (ast.ty(node), ast.ty(initial)) {
                        if !ast.type_promoteable_p(ity, annot, true) {
                            self.diag.error(
                                loc,
                                format!(
                                    "initializer of type {} does not fit declared type {}",
                                    ast.type_name(ity),
                                    ast.type_name(annot)
                                ),
                            );
                        }
                    }
                }
                return Flow::Ok;
            }

            NodeKind::AssStmt { lhs, exp } => {
                if let (Some(lty), Some(rty)) = (ast.ty(lhs), ast.ty(exp)) {
                    if !ast.type_promoteable_p(rty, lty, true) {
                        self.diag.error(
                            loc,
                            format!(
                                "cannot assign {} to a location of type {}",
                                ast.type_name(rty),
                                ast.type_name(lty)
                            ),
                        );
                    }
                }
                return Flow::Ok;
            }

            NodeKind::IfStmt { cond, .. } => {
                if let Some(cty) = ast.ty(cond) {
                    if !ast.type_is_integral(cty) {
                        self.diag.error(loc, "the condition must be integral");
                    }
                }
                return Flow::Ok;
            }

            NodeKind::LoopStmt { cond, selector, .. } => {
                for c in [cond, selector].into_iter().flatten() {
                    if let Some(cty) = ast.ty(c) {
                        if !ast.type_is_integral(cty) {
                            self.diag
                                .error(loc, "loop conditions must be integral");
                        }
                    }
                }
                return Flow::Ok;
            }

            NodeKind::ReturnStmt { exp, function } => {
                let rtype = function
                    .and_then(|f| match ast.kind(f) {
                        NodeKind::Func { rtype, .. } => *rtype,
                        _ => None,
                    });
                match (exp, rtype) {
                    (Some(e), Some(rt)) => {
                        if let Some(ety) = ast.ty(e) {
                            if !ast.type_promoteable_p(ety, rt, true) {
                                self.diag.error(
                                    loc,
                                    format!(
                                        "returning {} from a function returning {}",
                                        ast.type_name(ety),
                                        ast.type_name(rt)
                                    ),
                                );
                            }
                        }
                    }
                    (Some(_), None) => {
                        self.diag
                            .error(loc, "void functions cannot return a value");
                    }
                    (None, Some(_)) => {
                        self.diag
                            .error(loc, "this function must return a value");
                    }
                    (None, None) => {}
                }
                return Flow::Ok;
            }

            NodeKind::RaiseStmt { exp } => {
                if let Some(e) = exp {
                    if let Some(ety) = ast.ty(e) {
                        let is_exception = matches!(
                            ast.type_kind(ety),
                            Some(TypeKind::Struct { name: Some(n), .. }) if n == "Exception"
                        ) || ast.type_is_any(ety);
                        if !is_exception {
                            self.diag
                                .error(loc, "raise wants an Exception value");
                        }
                    }
                }
                return Flow::Ok;
            }

            NodeKind::TryUntilStmt { exp, .. } => {
                if let Some(ety) = ast.ty(exp) {
                    let ok = ast.type_is_integral(ety)
                        || matches!(
                            ast.type_kind(ety),
                            Some(TypeKind::Struct { name: Some(n), .. }) if n == "Exception"
                        )
                        || ast.type_is_any(ety);
                    if !ok {
                        self.diag.error(
                            loc,
                            "until wants an exception code or Exception value",
                        );
                    }
                }
                return Flow::Ok;
            }

            _ => return Flow::Ok,
        };

        match ty {
            Some(ty) => {
                ast.set_ty(node, ty);
                // Literality feeds the folder: an expression over
                // literal children can be folded.
                if let NodeKind::Exp { operands, .. } = ast.kind(node) {
                    let all = operands.clone().iter().all(|o| ast.is_literal(*o));
                    ast.set_literal(node, all);
                }
                Flow::Ok
            }
            None => {
                // Poisoned; the error count stops the pipeline after
                // this phase.
                Flow::Ok
            }
        }
    }
}

impl Phase for Typify2 {
    fn name(&self) -> &'static str {
        "typify2"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            NodeKind::Type(tk) => {
                let complete = ast.type_is_complete(node);
                ast.node_mut(node).complete = complete;
                if let TypeKind::Array {
                    bound: Some(bound), ..
                } = tk
                {
                    if let Some(n) = ast.integer_value(bound) {
                        if n < 0 {
                            self.diag
                                .error(loc, "array bounds cannot be negative");
                        }
                    }
                }
            }
            NodeKind::Cast { ty, .. } => {
                let bad = matches!(
                    ast.type_kind(ty),
                    Some(TypeKind::Void) | Some(TypeKind::Any) | Some(TypeKind::Function { .. })
                );
                if bad {
                    self.diag.error(
                        loc,
                        "casts to void, any or function types are not allowed",
                    );
                }
            }
            NodeKind::Exp {
                op: Op::Sizeof,
                operands,
                ..
            } => {
                if ast.type_is_complete(operands[0]) != Complete::Yes {
                    self.diag
                        .error(loc, "sizeof wants a complete type");
                }
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

    fn typify(src: &str) -> Result<(Ast, NodeId, Typify1), String> {
        let mut ast = Ast::new();
        let mut env = CtEnv::new();
        let root = Parser::new(&mut ast, &mut env, src)?.parse(ParseMode::Expression)?;
        let mut t1 = Trans1::default();
        let mut ty1 = Typify1::default();
        do_pass(&mut ast, root, &mut [&mut t1, &mut ty1], true)?;
        if t1.diag.errors > 0 {
            return Err(t1.diag.messages.join("\n"));
        }
        Ok((ast, root, ty1))
    }

    fn typify_ok(src: &str) -> (Ast, NodeId) {
        let (ast, root, ty1) = typify(src).unwrap();
        assert_eq!(ty1.diag.errors, 0, "{:?}", ty1.diag.messages);
        (ast, root)
    }

    fn typify_err(src: &str) -> Vec<String> {
        let (_, _, ty1) = typify(src).unwrap();
        assert!(ty1.diag.errors > 0, "expected a type error");
        ty1.diag.messages
    }

    #[test]
    fn integral_addition_promotes() {
        let (ast, root) = typify_ok("1 + 2");
        let ty = ast.ty(root).unwrap();
        assert_eq!(int_parts(&ast, ty), Some((32, true)));

        let (ast, root) = typify_ok("1 + 2L");
        let ty = ast.ty(root).unwrap();
        assert_eq!(int_parts(&ast, ty), Some((64, true)));

        let (ast, root) = typify_ok("1U + 2");
        let ty = ast.ty(root).unwrap();
        assert_eq!(int_parts(&ast, ty), Some((32, false)));
    }

    #[test]
    fn offset_addition_normalizes_units_to_gcd() {
        let (ast, root) = typify_ok("4#8 + 4#12");
        let ty = ast.ty(root).unwrap();
        let (_, unit) = offset_parts(&ast, ty).unwrap();
        assert_eq!(ast.integer_value(unit), Some(4));
    }

    #[test]
    fn offset_division_is_a_number() {
        let (ast, root) = typify_ok("8#8 / 2#8");
        let ty = ast.ty(root).unwrap();
        assert!(ast.type_is_integral(ty));
    }

    #[test]
    fn string_and_int_multiply() {
        let (ast, root) = typify_ok("\"ab\" * 3");
        assert!(ast.type_is_string(ast.ty(root).unwrap()));
    }

    #[test]
    fn bconc_widths_add_and_cap_at_64() {
        let (ast, root) = typify_ok("1 ::: 2");
        let ty = ast.ty(root).unwrap();
        assert_eq!(int_parts(&ast, ty), Some((64, true)));
        let msgs = typify_err("1L ::: 2");
        assert!(msgs.iter().any(|m| m.contains("64")));
    }

    #[test]
    fn comparisons_are_booleans() {
        let (ast, root) = typify_ok("1 < 2");
        assert_eq!(int_parts(&ast, ast.ty(root).unwrap()), Some((32, true)));
        typify_err("1 < \"x\"");
    }

    #[test]
    fn sizeof_yields_the_size_type() {
        let (ast, root) = typify_ok("[1,2,3]'length");
        assert_eq!(int_parts(&ast, ast.ty(root).unwrap()), Some((64, false)));
    }

    #[test]
    fn attribute_definedness_is_checked() {
        typify_err("1'length");
        typify_err("\"s\"'magnitude");
        typify_ok("(4#8)'magnitude");
    }

    #[test]
    fn indexing_strings_gives_bytes() {
        let (ast, root) = typify_ok("\"abc\"[1]");
        assert_eq!(int_parts(&ast, ast.ty(root).unwrap()), Some((8, false)));
    }

    #[test]
    fn array_literals_demand_equal_element_types() {
        typify_ok("[1, 2, 3]");
        typify_err("[1, \"x\"]");
        typify_err("[1, 2L]");
    }

    #[test]
    fn maps_want_offsets() {
        typify_ok("uint<8> @ 0#B");
        typify_err("uint<8> @ 3");
    }
}
