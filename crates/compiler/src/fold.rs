//! Constant folding
//!
//! Folds pure expressions over integral, offset and string literals,
//! respecting the types computed by typify1: integral arithmetic
//! wraps modulo the operand width, offset arithmetic normalizes
//! units to the GCD, string concatenation and repetition fold to
//! string literals.
//!
//! Division and modulus by a literal zero are compile-time errors
//! here; with non-literal operands they become run-time exceptions
//! instead.

use poke_core::gcd64;
use poke_core::value::truncate;

use crate::ast::{Ast, Loc, NodeId, NodeKind, Op, TypeKind};
use crate::pass::{Diag, Flow, Phase, WalkCtx};
use crate::typify::int_parts;

#[derive(Default)]
pub struct Fold {
    pub diag: Diag,
}

/// A literal operand value, unpacked.
#[derive(Debug, Clone, PartialEq)]
enum Lit {
    Int { value: i64, size: u32, signed: bool },
    Str(String),
    Off { bits: i64, unit: u64, size: u32, signed: bool },
}

fn literal_of(ast: &Ast, node: NodeId) -> Option<Lit> {
    if !ast.is_literal(node) {
        return None;
    }
    match ast.kind(node) {
        NodeKind::Integer { value } => {
            let (size, signed) = int_parts(ast, ast.ty(node)?)?;
            Some(Lit::Int {
                value: *value,
                size,
                signed,
            })
        }
        NodeKind::Str { value } => Some(Lit::Str(value.clone())),
        NodeKind::Offset { magnitude, unit } => {
            let mag = ast.integer_value((*magnitude)?)?;
            let unit = ast.integer_value(*unit)? as u64;
            let (size, signed) = int_parts(ast, ast.ty((*magnitude)?)?)?;
            Some(Lit::Off {
                bits: mag * unit as i64,
                unit,
                size,
                signed,
            })
        }
        _ => None,
    }
}

impl Fold {
    /// Store an integer result back into the node, keeping its
    /// computed type.
    fn put_int(&mut self, ast: &mut Ast, node: NodeId, value: i64) {
        let (size, signed) = ast
            .ty(node)
            .and_then(|t| int_parts(ast, t))
            .unwrap_or((64, true));
        ast.node_mut(node).kind = NodeKind::Integer {
            value: truncate(value, size, signed),
        };
        ast.set_literal(node, true);
    }

    fn put_bool(&mut self, ast: &mut Ast, node: NodeId, value: bool) {
        ast.node_mut(node).kind = NodeKind::Integer {
            value: value as i64,
        };
        ast.set_literal(node, true);
    }

    fn put_str(&mut self, ast: &mut Ast, node: NodeId, value: String) {
        ast.node_mut(node).kind = NodeKind::Str { value };
        ast.set_literal(node, true);
    }

    /// Store an offset result: magnitude in the given unit, typed
    /// with the node's offset type base.
    fn put_off(&mut self, ast: &mut Ast, loc: Loc, node: NodeId, bits: i64, unit: u64) {
        let (size, signed) = ast
            .ty(node)
            .and_then(|t| match ast.type_kind(t) {
                Some(TypeKind::Offset { base, .. }) => int_parts(ast, *base),
                _ => None,
            })
            .unwrap_or((64, true));
        let mag = ast.make_integer(loc, truncate(bits / unit as i64, size, signed), size, signed);
        let unit = ast.make_integer(loc, unit as i64, 64, false);
        ast.node_mut(node).kind = NodeKind::Offset {
            magnitude: Some(mag),
            unit,
        };
        ast.set_literal(node, true);
    }

    fn fold_binary(&mut self, ast: &mut Ast, loc: Loc, node: NodeId, op: Op, a: Lit, b: Lit) {
        use Lit::*;
        match (op, a, b) {
            (_, Int { value: va, size, signed }, Int { value: vb, .. }) => {
                let wrap = |v: i64| truncate(v, size, signed);
                let (ua, ub) = (va as u64, vb as u64);
                match op {
                    Op::Add => self.put_int(ast, node, wrap(va.wrapping_add(vb))),
                    Op::Sub => self.put_int(ast, node, wrap(va.wrapping_sub(vb))),
                    Op::Mul => self.put_int(ast, node, wrap(va.wrapping_mul(vb))),
                    Op::Div | Op::CeilDiv | Op::Mod => {
                        if vb == 0 {
                            self.diag
                                .error(loc, "division by zero in a constant expression");
                            return;
                        }
                        let r = match op {
                            Op::Div if signed => va.wrapping_div(vb),
                            Op::Div => (ua / ub) as i64,
                            Op::Mod if signed => va.wrapping_rem(vb),
                            Op::Mod => (ua % ub) as i64,
                            _ if signed => {
                                let q = va.wrapping_div(vb);
                                if va % vb != 0 && (va < 0) == (vb < 0) {
                                    q + 1
                                } else {
                                    q
                                }
                            }
                            _ => {
                                let q = ua / ub;
                                (if ua % ub != 0 { q + 1 } else { q }) as i64
                            }
                        };
                        self.put_int(ast, node, wrap(r));
                    }
                    Op::Pow => {
                        let mut result: i64 = 1;
                        let mut base = va;
                        let mut exp = vb as u64;
                        while exp > 0 {
                            if exp & 1 == 1 {
                                result = result.wrapping_mul(base);
                            }
                            base = base.wrapping_mul(base);
                            exp >>= 1;
                        }
                        self.put_int(ast, node, wrap(result));
                    }
                    Op::BAnd => self.put_int(ast, node, wrap(va & vb)),
                    Op::BOr => self.put_int(ast, node, wrap(va | vb)),
                    Op::BXor => self.put_int(ast, node, wrap(va ^ vb)),
                    Op::Shl => self.put_int(ast, node, wrap(va.wrapping_shl(vb as u32))),
                    Op::Shr => {
                        let r = if signed {
                            va.wrapping_shr(vb as u32)
                        } else {
                            (ua.wrapping_shr(vb as u32)) as i64
                        };
                        self.put_int(ast, node, wrap(r));
                    }
                    Op::BConc => {
                        // Result width comes from the node type.
                        let bsize = match ast.ty(node).and_then(|t| int_parts(ast, t)) {
                            Some((total, _)) => total - size,
                            None => return,
                        };
                        let bmask = if bsize == 64 { u64::MAX } else { (1u64 << bsize) - 1 };
                        self.put_int(ast, node, ((ua << bsize) | (ub & bmask)) as i64);
                    }
                    Op::Eq => self.put_bool(ast, node, va == vb),
                    Op::Ne => self.put_bool(ast, node, va != vb),
                    Op::Lt => self.put_bool(ast, node, if signed { va < vb } else { ua < ub }),
                    Op::Gt => self.put_bool(ast, node, if signed { va > vb } else { ua > ub }),
                    Op::Le => self.put_bool(ast, node, if signed { va <= vb } else { ua <= ub }),
                    Op::Ge => self.put_bool(ast, node, if signed { va >= vb } else { ua >= ub }),
                    Op::And => self.put_bool(ast, node, va != 0 && vb != 0),
                    Op::Or => self.put_bool(ast, node, va != 0 || vb != 0),
                    _ => {}
                }
            }

            (Op::Add, Str(sa), Str(sb)) => self.put_str(ast, node, format!("{}{}", sa, sb)),
            (Op::Mul, Str(s), Int { value, .. }) | (Op::Mul, Int { value, .. }, Str(s)) => {
                self.put_str(ast, node, s.repeat(value.max(0) as usize))
            }
            (Op::Eq, Str(sa), Str(sb)) => self.put_bool(ast, node, sa == sb),
            (Op::Ne, Str(sa), Str(sb)) => self.put_bool(ast, node, sa != sb),
            (Op::Lt, Str(sa), Str(sb)) => self.put_bool(ast, node, sa < sb),
            (Op::Gt, Str(sa), Str(sb)) => self.put_bool(ast, node, sa > sb),
            (Op::Le, Str(sa), Str(sb)) => self.put_bool(ast, node, sa <= sb),
            (Op::Ge, Str(sa), Str(sb)) => self.put_bool(ast, node, sa >= sb),

            (_, Off { bits: ba, unit: ua, .. }, Off { bits: bb, unit: ub, .. }) => {
                let g = gcd64(ua, ub);
                match op {
                    Op::Add => self.put_off(ast, loc, node, ba + bb, g),
                    Op::Sub => self.put_off(ast, loc, node, ba - bb, g),
                    Op::Mod => {
                        if bb == 0 {
                            self.diag
                                .error(loc, "division by zero in a constant expression");
                        } else {
                            self.put_off(ast, loc, node, ba % bb, g);
                        }
                    }
                    Op::Div | Op::CeilDiv => {
                        if bb == 0 {
                            self.diag
                                .error(loc, "division by zero in a constant expression");
                        } else {
                            let q = ba / bb;
                            let q = if op == Op::CeilDiv && ba % bb != 0 { q + 1 } else { q };
                            self.put_int(ast, node, q);
                        }
                    }
                    Op::Eq => self.put_bool(ast, node, ba == bb),
                    Op::Ne => self.put_bool(ast, node, ba != bb),
                    Op::Lt => self.put_bool(ast, node, ba < bb),
                    Op::Gt => self.put_bool(ast, node, ba > bb),
                    Op::Le => self.put_bool(ast, node, ba <= bb),
                    Op::Ge => self.put_bool(ast, node, ba >= bb),
                    _ => {}
                }
            }
            (Op::Mul, Off { bits, unit, .. }, Int { value, .. })
            | (Op::Mul, Int { value, .. }, Off { bits, unit, .. }) => {
                self.put_off(ast, loc, node, bits * value, unit)
            }
            (Op::Div, Off { bits, unit, .. }, Int { value, .. }) => {
                if value == 0 {
                    self.diag
                        .error(loc, "division by zero in a constant expression");
                } else {
                    self.put_off(ast, loc, node, bits / value, unit)
                }
            }
            _ => {}
        }
    }
}

impl Phase for Fold {
    fn name(&self) -> &'static str {
        "fold"
    }

    fn diag(&mut self) -> &mut Diag {
        &mut self.diag
    }

    fn post(&mut self, ast: &mut Ast, _ctx: &WalkCtx, node: NodeId) -> Flow {
        let loc = ast.loc(node);
        match ast.kind(node).clone() {
            NodeKind::Exp { op, operands, .. } => match operands.len() {
                1 => {
                    if let Some(Lit::Int { value, size, signed }) = literal_of(ast, operands[0]) {
                        match op {
                            Op::Neg => self.put_int(ast, node, value.wrapping_neg()),
                            Op::Pos => self.put_int(ast, node, value),
                            Op::BNot => {
                                self.put_int(ast, node, truncate(!value, size, signed))
                            }
                            Op::Not => self.put_bool(ast, node, value == 0),
                            _ => {}
                        }
                    }
                }
                2 => {
                    if let (Some(a), Some(b)) =
                        (literal_of(ast, operands[0]), literal_of(ast, operands[1]))
                    {
                        self.fold_binary(ast, loc, node, op, a, b);
                    }
                }
                _ => {}
            },

            // A literal condition selects its branch.
            NodeKind::CondExp {
                cond,
                then_e,
                else_e,
            } => {
                if let Some(Lit::Int { value, .. }) = literal_of(ast, cond) {
                    let chosen = if value != 0 { then_e } else { else_e };
                    let picked = ast.node(chosen).clone();
                    let ty = ast.ty(node);
                    ast.node_mut(node).kind = picked.kind;
                    ast.node_mut(node).literal_p = picked.literal_p;
                    if let Some(ty) = ty {
                        ast.set_ty(node, ty);
                    }
                }
            }

            // Casts of integral literals re-truncate in place.
            NodeKind::Cast { ty, exp } => {
                if let Some(lit) = literal_of(ast, exp) {
                    match (lit, ast.type_kind(ty).cloned()) {
                        (
                            Lit::Int { value, .. },
                            Some(TypeKind::Integral { size, signed }),
                        ) => {
                            ast.node_mut(node).kind = NodeKind::Integer {
                                value: truncate(value, size, signed),
                            };
                            ast.set_literal(node, true);
                        }
                        (
                            Lit::Off { bits, .. },
                            Some(TypeKind::Offset { base, unit }),
                        ) => {
                            if let (Some((size, signed)), Some(unit)) =
                                (int_parts(ast, base), ast.integer_value(unit))
                            {
                                let mag = ast.make_integer(
                                    loc,
                                    truncate(bits / unit, size, signed),
                                    size,
                                    signed,
                                );
                                let unit = ast.make_integer(loc, unit, 64, false);
                                ast.node_mut(node).kind = NodeKind::Offset {
                                    magnitude: Some(mag),
                                    unit,
                                };
                                ast.set_literal(node, true);
                            }
                        }
                        (Lit::Str(s), Some(TypeKind::StrT)) => {
                            self.put_str(ast, node, s);
                        }
                        _ => {}
                    }
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
    use crate::promo::Promo;
    use crate::trans::Trans1;
    use crate::typify::Typify1;

    fn fold(src: &str) -> (Ast, NodeId, Fold) {
        let mut ast = Ast::new();
        let mut env = CtEnv::new();
        let root = Parser::new(&mut ast, &mut env, src)
            .unwrap()
            .parse(ParseMode::Expression)
            .unwrap();
        let mut t1 = Trans1::default();
        let mut ty1 = Typify1::default();
        let mut promo = Promo::default();
        let mut f = Fold::default();
        do_pass(
            &mut ast,
            root,
            &mut [&mut t1, &mut ty1, &mut promo, &mut f],
            true,
        )
        .unwrap();
        assert_eq!(ty1.diag.errors, 0, "{:?}", ty1.diag.messages);
        (ast, root, f)
    }

    fn fold_int(src: &str) -> i64 {
        let (ast, root, f) = fold(src);
        assert_eq!(f.diag.errors, 0, "{:?}", f.diag.messages);
        ast.integer_value(root).expect("folded to an integer")
    }

    #[test]
    fn arithmetic_folds_with_wrap() {
        assert_eq!(fold_int("1 + 2 * 3"), 7);
        assert_eq!(fold_int("(255 as uint<8>) + (1 as uint<8>)"), 0);
        assert_eq!(fold_int("-5 % 3"), -2);
        assert_eq!(fold_int("2 ** 10"), 1024);
        assert_eq!(fold_int("7 /^ 2"), 4);
    }

    #[test]
    fn comparisons_fold_signed_and_unsigned() {
        assert_eq!(fold_int("1 < 2"), 1);
        // 0xff as unsigned 8-bit is large, as signed it is -1.
        assert_eq!(fold_int("(0xff as uint<8>) > (1 as uint<8>)"), 1);
        assert_eq!(fold_int("(0xff as int<8>) > (1 as int<8>)"), 0);
    }

    #[test]
    fn strings_concatenate() {
        let (ast, root, _) = fold("\"foo\" + \"bar\"");
        match ast.kind(root) {
            NodeKind::Str { value } => assert_eq!(value, "foobar"),
            other => panic!("expected a string, got {:?}", other),
        }
    }

    #[test]
    fn offsets_fold_to_gcd_units() {
        let (ast, root, _) = fold("4#8 + 4#12");
        // 32 + 48 bits = 80 bits = 20 units of gcd(8,12)=4.
        match ast.kind(root) {
            NodeKind::Offset { magnitude, unit } => {
                assert_eq!(ast.integer_value(magnitude.unwrap()), Some(20));
                assert_eq!(ast.integer_value(*unit), Some(4));
            }
            other => panic!("expected an offset, got {:?}", other),
        }
    }

    #[test]
    fn literal_division_by_zero_is_a_fold_error() {
        let (_, _, f) = fold("1 / 0");
        assert!(f.diag.errors > 0);
        let (_, _, f) = fold("1 % 0");
        assert!(f.diag.errors > 0);
    }

    #[test]
    fn literal_conditions_select_a_branch() {
        assert_eq!(fold_int("1 ? 10 : 20"), 10);
        assert_eq!(fold_int("0 ? 10 : 20"), 20);
    }
}
