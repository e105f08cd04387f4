//! Code generation
//!
//! A single walk over the fully-decorated AST emitting PVM
//! instructions. Every semantic decision has been taken by the
//! earlier phases: lexical addresses sit on the variable nodes,
//! operand types are exact after promo, struct constructors are in
//! declaration order, units are integer bit counts. What remains
//! here is translation plus the bookkeeping that keeps the run-time
//! environment isomorphic to the compile-time one: a frame push for
//! every scope the parser pushed, a variable binding for every
//! declaration the parser registered, in the same order.
//!
//! Value immediates are allocated in the VM heap as pinned boxes (or
//! immediate words) and embedded in `push` instructions.

use poke_core::program::{Insn, Label, Program};
use poke_core::value::{truncate, Heap, HeapBox, Value};
use poke_runtime::Vm;

use crate::ast::{
    Ast, Attr, Builtin, DeclKind, NodeId, NodeKind, Op, TypeKind,
};
use crate::typify::{int_parts, offset_parts};

/// What the generated program is expected to leave on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenMode {
    /// Declarations and statements; no result value.
    Program,
    /// Ditto, but the last expression statement keeps its value.
    Statement,
    /// A single expression; its value is the result.
    Expression,
}

struct LoopCtx {
    brk: Label,
    cont: Label,
    frame_depth: u32,
    handler_depth: u32,
}

struct FuncCtx {
    handler_depth: u32,
}

pub struct CodeGen<'a> {
    ast: &'a Ast,
    vm: &'a mut Vm,
    program: Program,
    loops: Vec<LoopCtx>,
    funcs: Vec<FuncCtx>,
    frame_depth: u32,
    handler_depth: u32,
}

/// Generate a program for the given root node.
pub fn generate(ast: &Ast, root: NodeId, vm: &mut Vm, mode: GenMode) -> Result<Program, String> {
    let mut gen = CodeGen {
        ast,
        vm,
        program: Program::new(),
        loops: Vec::new(),
        funcs: Vec::new(),
        frame_depth: 0,
        handler_depth: 0,
    };
    gen.gen_root(root, mode)?;
    Ok(gen.program)
}

impl<'a> CodeGen<'a> {
    fn heap(&mut self) -> &mut Heap {
        &mut self.vm.heap
    }

    fn emit(&mut self, insn: Insn) {
        self.program.append(insn);
    }

    fn ice(&self, node: NodeId, what: &str) -> String {
        format!(
            "{}: internal compiler error in codegen: {}",
            self.ast.loc(node),
            what
        )
    }

    fn ty_of(&self, node: NodeId) -> Result<NodeId, String> {
        self.ast
            .ty(node)
            .ok_or_else(|| self.ice(node, "expression has no type"))
    }

    /* Immediates.  */

    fn imm_integral(&mut self, v: i64, size: u32, signed: bool) -> Value {
        if size <= 32 {
            self.heap().make_integral(v, size, signed)
        } else if signed {
            let v = truncate(v, size, true);
            self.heap().alloc_perm(HeapBox::Long(v, size))
        } else {
            let v = truncate(v, size, false) as u64;
            self.heap().alloc_perm(HeapBox::ULong(v, size))
        }
    }

    fn imm_str(&mut self, s: &str) -> Value {
        self.heap().alloc_perm(HeapBox::Str(s.to_string()))
    }

    fn push_int(&mut self, v: i64, size: u32, signed: bool) {
        let imm = self.imm_integral(v, size, signed);
        self.emit(Insn::Push(imm));
    }

    /* Roots.  */

    fn gen_root(&mut self, root: NodeId, mode: GenMode) -> Result<(), String> {
        match (mode, self.ast.kind(root)) {
            (GenMode::Expression, _) => self.gen_expr(root),
            (_, NodeKind::Program { stmts }) => {
                let stmts = stmts.clone();
                let keep = if mode == GenMode::Statement {
                    stmts.iter().rposition(|s| self.can_keep(*s))
                } else {
                    None
                };
                for (i, stmt) in stmts.iter().enumerate() {
                    self.gen_stmt(*stmt, keep == Some(i))?;
                }
                Ok(())
            }
            _ => Err(self.ice(root, "unexpected root node")),
        }
    }

    /* Statements.  */

    /// Whether a statement can produce the result value of a
    /// statement-mode compilation.
    fn can_keep(&self, stmt: NodeId) -> bool {
        matches!(
            self.ast.kind(stmt),
            NodeKind::ExpStmt { .. } | NodeKind::TryCatchStmt { .. } | NodeKind::CompStmt { .. }
        )
    }

    fn gen_stmt(&mut self, node: NodeId, keep: bool) -> Result<(), String> {
        match self.ast.kind(node).clone() {
            NodeKind::NullStmt => Ok(()),

            NodeKind::Decl { kind, initial, .. } => {
                match kind {
                    DeclKind::Var => {
                        self.gen_expr(initial)?;
                        self.emit(Insn::PopVar);
                    }
                    DeclKind::Func => {
                        self.gen_func(initial)?;
                        self.emit(Insn::PopVar);
                    }
                    DeclKind::Type => {
                        self.gen_type_value(initial)?;
                        self.emit(Insn::PopVar);
                    }
                    // Units are compile-time only.
                    DeclKind::Unit => {}
                }
                Ok(())
            }

            NodeKind::CompStmt { stmts, num_decls } => {
                self.emit(Insn::PushF(num_decls));
                self.frame_depth += 1;
                let kept = if keep {
                    stmts.iter().rposition(|s| self.can_keep(*s))
                } else {
                    None
                };
                for (i, stmt) in stmts.iter().enumerate() {
                    self.gen_stmt(*stmt, kept == Some(i))?;
                }
                self.emit(Insn::PopF);
                self.frame_depth -= 1;
                Ok(())
            }

            NodeKind::ExpStmt { exp } => {
                self.gen_expr(exp)?;
                if !keep {
                    self.emit(Insn::Drop);
                }
                Ok(())
            }

            NodeKind::AssStmt { lhs, exp } => match self.ast.kind(lhs).clone() {
                NodeKind::Var { back, over, .. } => {
                    self.gen_expr(exp)?;
                    self.emit(Insn::SetVar { back, over });
                    Ok(())
                }
                NodeKind::Indexer { container, index } => {
                    self.gen_expr(container)?;
                    self.gen_expr(index)?;
                    self.gen_expr(exp)?;
                    self.emit(Insn::ASet);
                    Ok(())
                }
                NodeKind::StructRef { sct, name } => {
                    self.gen_expr(sct)?;
                    self.gen_expr(exp)?;
                    self.emit(Insn::SSet(name));
                    Ok(())
                }
                _ => Err(self.ice(lhs, "invalid assignment target")),
            },

            NodeKind::IfStmt {
                cond,
                then_s,
                else_s,
            } => {
                let else_l = self.program.fresh_label();
                let end_l = self.program.fresh_label();
                self.gen_expr(cond)?;
                self.emit(Insn::Bz(else_l));
                self.gen_stmt(then_s, false)?;
                self.emit(Insn::Jmp(end_l));
                self.program.append_label(else_l);
                if let Some(else_s) = else_s {
                    self.gen_stmt(else_s, false)?;
                }
                self.program.append_label(end_l);
                Ok(())
            }

            NodeKind::LoopStmt {
                cond,
                iterator,
                selector,
                body,
            } => match iterator {
                None => self.gen_while(cond, body),
                Some(iterator) => self.gen_for_in(iterator, cond, selector, body),
            },

            NodeKind::ReturnStmt { exp, .. } => {
                match exp {
                    Some(exp) => self.gen_expr(exp)?,
                    None => self.emit(Insn::Push(Value::NULL)),
                }
                // Handlers installed since the function started must
                // not survive the return.
                let base = self.funcs.last().map(|f| f.handler_depth).unwrap_or(0);
                for _ in base..self.handler_depth {
                    self.emit(Insn::PopE);
                }
                self.emit(Insn::Return);
                Ok(())
            }

            NodeKind::BreakStmt { .. } | NodeKind::ContinueStmt { .. } => {
                let is_break = matches!(self.ast.kind(node), NodeKind::BreakStmt { .. });
                let ctx = self
                    .loops
                    .last()
                    .ok_or_else(|| self.ice(node, "break/continue outside a loop"))?;
                let (target, frames, handlers) = (
                    if is_break { ctx.brk } else { ctx.cont },
                    self.frame_depth - ctx.frame_depth,
                    self.handler_depth - ctx.handler_depth,
                );
                for _ in 0..handlers {
                    self.emit(Insn::PopE);
                }
                for _ in 0..frames {
                    self.emit(Insn::PopF);
                }
                self.emit(Insn::Jmp(target));
                Ok(())
            }

            NodeKind::TryCatchStmt {
                body,
                filter,
                handler,
                ..
            } => {
                let handler_l = self.program.fresh_label();
                let done_l = self.program.fresh_label();

                self.emit(Insn::PushE { handler: handler_l });
                self.handler_depth += 1;
                self.gen_stmt(body, keep)?;
                self.emit(Insn::PopE);
                self.handler_depth -= 1;
                self.emit(Insn::Jmp(done_l));

                // On entry the exception is on the stack; bind it
                // into the handler frame, matching the declaration
                // the parser registered there.
                self.program.append_label(handler_l);
                self.emit(Insn::PushF(1));
                self.frame_depth += 1;
                self.emit(Insn::PopVar);
                if let Some(filter) = filter {
                    let reraise_l = self.program.fresh_label();
                    self.gen_expr(filter)?;
                    self.emit(Insn::Bz(reraise_l));
                    self.gen_stmt(handler, keep)?;
                    self.emit(Insn::PopF);
                    self.emit(Insn::Jmp(done_l));
                    self.program.append_label(reraise_l);
                    self.emit(Insn::PushVar { back: 0, over: 0 });
                    self.emit(Insn::PopF);
                    self.emit(Insn::Raise);
                } else {
                    self.gen_stmt(handler, keep)?;
                    self.emit(Insn::PopF);
                }
                self.frame_depth -= 1;
                self.program.append_label(done_l);
                Ok(())
            }

            NodeKind::TryUntilStmt { body, exp } => {
                // Loop the body until an exception matching the
                // expression arrives; other exceptions propagate.
                let begin_l = self.program.fresh_label();
                let handler_l = self.program.fresh_label();
                let swallow_l = self.program.fresh_label();
                let done_l = self.program.fresh_label();

                self.program.append_label(begin_l);
                self.emit(Insn::PushE { handler: handler_l });
                self.handler_depth += 1;
                self.gen_stmt(body, false)?;
                self.emit(Insn::PopE);
                self.handler_depth -= 1;
                self.emit(Insn::Jmp(begin_l));

                self.program.append_label(handler_l);
                self.emit(Insn::Dup);
                self.emit(Insn::Sref("code".to_string()));
                let ety = self.ty_of(exp)?;
                self.gen_expr(exp)?;
                if !self.ast.type_is_integral(ety) {
                    self.emit(Insn::Sref("code".to_string()));
                }
                self.emit(Insn::Eq);
                self.emit(Insn::Bnz(swallow_l));
                self.emit(Insn::Raise);
                self.program.append_label(swallow_l);
                self.emit(Insn::Drop);
                self.program.append_label(done_l);
                let _ = done_l;
                Ok(())
            }

            NodeKind::RaiseStmt { exp } => {
                match exp {
                    Some(exp) => {
                        self.gen_expr(exp)?;
                        self.emit(Insn::Raise);
                    }
                    None => self.emit(Insn::RaiseCode(0)),
                }
                Ok(())
            }

            NodeKind::PrintStmt { exp, format } => {
                if let Some(exp) = exp {
                    self.gen_expr(exp)?;
                    self.emit(Insn::Print);
                }
                if let Some(format) = format {
                    self.gen_expr(format)?;
                    self.emit(Insn::Puts);
                }
                Ok(())
            }

            other => Err(self.ice(node, &format!("not a statement: {:?}", other))),
        }
    }

    fn gen_while(&mut self, cond: Option<NodeId>, body: NodeId) -> Result<(), String> {
        let begin_l = self.program.fresh_label();
        let end_l = self.program.fresh_label();
        self.loops.push(LoopCtx {
            brk: end_l,
            cont: begin_l,
            frame_depth: self.frame_depth,
            handler_depth: self.handler_depth,
        });
        self.program.append_label(begin_l);
        if let Some(cond) = cond {
            self.gen_expr(cond)?;
            self.emit(Insn::Bz(end_l));
        }
        self.gen_stmt(body, false)?;
        self.emit(Insn::Jmp(begin_l));
        self.program.append_label(end_l);
        self.loops.pop();
        Ok(())
    }

    /// For-in loops materialize the iterator frame the parser laid
    /// out: slot 0 the container, slot 1 the running index, slot 2
    /// the iteration variable.
    fn gen_for_in(
        &mut self,
        iterator: NodeId,
        cond: Option<NodeId>,
        selector: Option<NodeId>,
        body: NodeId,
    ) -> Result<(), String> {
        let container = match self.ast.kind(iterator) {
            NodeKind::LoopIterator { container, .. } => *container,
            _ => return Err(self.ice(iterator, "malformed loop iterator")),
        };

        self.emit(Insn::PushF(3));
        self.frame_depth += 1;
        self.gen_expr(container)?;
        self.emit(Insn::PopVar);
        self.push_int(0, 64, false);
        self.emit(Insn::PopVar);
        self.emit(Insn::Push(Value::NULL));
        self.emit(Insn::PopVar);

        let begin_l = self.program.fresh_label();
        let cont_l = self.program.fresh_label();
        let end_l = self.program.fresh_label();
        self.loops.push(LoopCtx {
            brk: end_l,
            cont: cont_l,
            frame_depth: self.frame_depth,
            handler_depth: self.handler_depth,
        });

        self.program.append_label(begin_l);
        self.emit(Insn::PushVar { back: 0, over: 1 });
        self.emit(Insn::PushVar { back: 0, over: 0 });
        self.emit(Insn::ElemsOf);
        self.emit(Insn::Lt);
        self.emit(Insn::Bz(end_l));

        self.emit(Insn::PushVar { back: 0, over: 0 });
        self.emit(Insn::PushVar { back: 0, over: 1 });
        self.emit(Insn::ARef);
        self.emit(Insn::SetVar { back: 0, over: 2 });

        if let Some(cond) = cond {
            self.gen_expr(cond)?;
            self.emit(Insn::Bz(end_l));
        }
        if let Some(selector) = selector {
            self.gen_expr(selector)?;
            self.emit(Insn::Bz(cont_l));
        }
        self.gen_stmt(body, false)?;

        self.program.append_label(cont_l);
        self.emit(Insn::PushVar { back: 0, over: 1 });
        self.push_int(1, 64, false);
        self.emit(Insn::Add);
        self.emit(Insn::SetVar { back: 0, over: 1 });
        self.emit(Insn::Jmp(begin_l));

        self.program.append_label(end_l);
        self.loops.pop();
        self.emit(Insn::PopF);
        self.frame_depth -= 1;
        Ok(())
    }

    /* Functions.  */

    /// Emit a function body inline (jumped over) and leave a closure
    /// over the current environment on the stack.
    fn gen_func(&mut self, func: NodeId) -> Result<(), String> {
        let (rtype, args, body) = match self.ast.kind(func) {
            NodeKind::Func {
                rtype, args, body, ..
            } => (*rtype, args.clone(), *body),
            _ => return Err(self.ice(func, "expected a function")),
        };

        let after_l = self.program.fresh_label();
        let entry_l = self.program.fresh_label();
        self.emit(Insn::Jmp(after_l));
        self.program.append_label(entry_l);

        // Prologue: one frame for the arguments, bound in
        // declaration order (the caller pushes them reversed).
        self.emit(Insn::PushF(args.len() as u32));
        for _ in &args {
            self.emit(Insn::PopVar);
        }

        self.funcs.push(FuncCtx {
            handler_depth: self.handler_depth,
        });
        let saved_frames = self.frame_depth;
        self.frame_depth += 1;
        self.gen_stmt(body, false)?;
        self.frame_depth = saved_frames;
        self.funcs.pop();

        // Falling off the end: void functions return null, others
        // raise; the analysis phase rejects the reachable cases.
        if rtype.is_none() {
            self.emit(Insn::Push(Value::NULL));
            self.emit(Insn::Return);
        } else {
            self.emit(Insn::RaiseCode(
                poke_core::ExceptionCode::NoReturn.into(),
            ));
        }

        self.program.append_label(after_l);
        self.emit(Insn::MkCls { entry: entry_l });
        Ok(())
    }

    /* Expressions.  */

    fn gen_expr(&mut self, node: NodeId) -> Result<(), String> {
        match self.ast.kind(node).clone() {
            NodeKind::Integer { value } => {
                let ty = self.ty_of(node)?;
                let (size, signed) = int_parts(self.ast, ty)
                    .ok_or_else(|| self.ice(node, "integer without an integral type"))?;
                self.push_int(value, size, signed);
                Ok(())
            }

            NodeKind::Str { value } => {
                let imm = self.imm_str(&value);
                self.emit(Insn::Push(imm));
                Ok(())
            }

            NodeKind::Offset { magnitude, unit } => {
                let magnitude =
                    magnitude.ok_or_else(|| self.ice(node, "offset without a magnitude"))?;
                let unit = self
                    .ast
                    .integer_value(unit)
                    .ok_or_else(|| self.ice(node, "offset unit is not constant"))? as u64;
                self.gen_expr(magnitude)?;
                self.emit(Insn::MkOff { unit });
                Ok(())
            }

            NodeKind::Var { back, over, .. } => {
                self.emit(Insn::PushVar { back, over });
                Ok(())
            }

            NodeKind::Exp { op, operands, attr } => self.gen_exp(node, op, &operands, attr),

            NodeKind::CondExp {
                cond,
                then_e,
                else_e,
            } => {
                let else_l = self.program.fresh_label();
                let end_l = self.program.fresh_label();
                self.gen_expr(cond)?;
                self.emit(Insn::Bz(else_l));
                self.gen_expr(then_e)?;
                self.emit(Insn::Jmp(end_l));
                self.program.append_label(else_l);
                self.gen_expr(else_e)?;
                self.program.append_label(end_l);
                Ok(())
            }

            NodeKind::Cast { ty, exp } => self.gen_cast(node, ty, exp),

            NodeKind::Isa { ty, exp } => {
                self.gen_expr(exp)?;
                self.gen_type_value(ty)?;
                self.emit(Insn::IsA);
                Ok(())
            }

            NodeKind::Map {
                strict,
                ty,
                ios,
                offset,
            } => {
                self.gen_type_value(ty)?;
                match ios {
                    Some(ios) => self.gen_expr(ios)?,
                    None => self.emit(Insn::Push(Value::NULL)),
                }
                self.gen_expr(offset)?;
                self.emit(Insn::Map { strict });
                Ok(())
            }

            NodeKind::ArrayLit { initializers } => {
                let aty = self.ty_of(node)?;
                let etype = match self.ast.type_kind(aty) {
                    Some(TypeKind::Array { etype, .. }) => *etype,
                    _ => return Err(self.ice(node, "array literal without an array type")),
                };
                let mut count: u32 = 0;
                for init in initializers {
                    let (index, exp) = match self.ast.kind(init) {
                        NodeKind::ArrayInitializer { index, exp } => (*index, *exp),
                        _ => continue,
                    };
                    self.gen_expr(exp)?;
                    count += 1;
                    if let Some(index) = index {
                        // An indexed initializer fills every element
                        // from the current position up to the index.
                        let upto = self
                            .ast
                            .integer_value(index)
                            .ok_or_else(|| self.ice(init, "non-constant initializer index"))?
                            as u32;
                        while count <= upto {
                            self.emit(Insn::Dup);
                            count += 1;
                        }
                    }
                }
                self.gen_type_value(etype)?;
                self.emit(Insn::MkArr { nelem: count });
                Ok(())
            }

            NodeKind::Indexer { container, index } => {
                self.gen_expr(container)?;
                self.gen_expr(index)?;
                self.emit(Insn::ARef);
                Ok(())
            }

            NodeKind::Trimmer {
                container,
                from,
                to,
                ..
            } => {
                let from = from.ok_or_else(|| self.ice(node, "trimmer without bounds"))?;
                let to = to.ok_or_else(|| self.ice(node, "trimmer without bounds"))?;
                self.gen_expr(container)?;
                self.gen_expr(from)?;
                self.gen_expr(to)?;
                self.emit(Insn::ATrim);
                Ok(())
            }

            NodeKind::StructCons { ty, fields } => self.gen_struct_cons(node, ty, &fields),

            NodeKind::StructRef { sct, name } => {
                self.gen_expr(sct)?;
                self.emit(Insn::Sref(name));
                Ok(())
            }

            NodeKind::Funcall {
                callee,
                args,
                vararg_from,
            } => self.gen_funcall(node, callee, &args, vararg_from),

            NodeKind::Lambda { func } => self.gen_func(func),

            NodeKind::Format { parts, args, .. } => {
                use crate::ast::FormatPart;
                // Build the result string left to right.
                let empty = self.imm_str("");
                self.emit(Insn::Push(empty));
                let mut ai = 0usize;
                for part in parts {
                    match part {
                        FormatPart::Lit(s) => {
                            let imm = self.imm_str(&s);
                            self.emit(Insn::Push(imm));
                        }
                        FormatPart::Int { .. } => {
                            self.gen_expr(args[ai])?;
                            ai += 1;
                            self.emit(Insn::ItoS { base: 10 });
                        }
                        FormatPart::Char => {
                            self.gen_expr(args[ai])?;
                            ai += 1;
                            self.emit(Insn::CtoS);
                        }
                        FormatPart::Str => {
                            self.gen_expr(args[ai])?;
                            ai += 1;
                        }
                        FormatPart::Val => {
                            self.gen_expr(args[ai])?;
                            ai += 1;
                            self.emit(Insn::VtoS);
                        }
                    }
                    self.emit(Insn::SConc);
                }
                Ok(())
            }

            other => Err(self.ice(node, &format!("cannot generate code for {:?}", other))),
        }
    }

    fn gen_exp(
        &mut self,
        node: NodeId,
        op: Op,
        operands: &[NodeId],
        attr: Option<Attr>,
    ) -> Result<(), String> {
        // Attributes first; they have their own table.
        if op == Op::Attr {
            return self.gen_attr(node, attr, operands);
        }

        // Unary operators.
        if !op.is_binary() {
            match op {
                Op::Typeof => {
                    self.gen_expr(operands[0])?;
                    self.emit(Insn::TypOf);
                    return Ok(());
                }
                Op::Sizeof => {
                    return Err(self.ice(node, "sizeof survived the front end"));
                }
                _ => {}
            }
            self.gen_expr(operands[0])?;
            match op {
                Op::Neg => self.emit(Insn::Neg),
                Op::Pos => {}
                Op::BNot => self.emit(Insn::BNot),
                Op::Not => self.emit(Insn::Not),
                _ => return Err(self.ice(node, "unexpected unary operator")),
            }
            return Ok(());
        }

        let (a, b) = (operands[0], operands[1]);
        let aty = self.ty_of(a)?;
        let bty = self.ty_of(b)?;
        let a_off = self.ast.type_is_offset(aty);
        let b_off = self.ast.type_is_offset(bty);

        // Offset arithmetic scales magnitudes into the result unit.
        if (a_off || b_off)
            && matches!(
                op,
                Op::Add | Op::Sub | Op::Mod | Op::Mul | Op::Div | Op::CeilDiv | Op::Shl | Op::Shr
            )
        {
            return self.gen_offset_arith(node, op, a, b);
        }

        self.gen_expr(a)?;
        self.gen_expr(b)?;
        let insn = match op {
            Op::Add if self.ast.type_is_string(aty) => Insn::SConc,
            Op::Add if self.ast.type_is_array(aty) => Insn::AConc,
            Op::Add => Insn::Add,
            Op::Sub => Insn::Sub,
            Op::Mul if self.ast.type_is_string(aty) => Insn::SMul,
            Op::Mul if self.ast.type_is_string(bty) => {
                // INT x STR: commute to the string-first form.
                self.emit(Insn::Swap);
                Insn::SMul
            }
            Op::Mul => Insn::Mul,
            Op::Div => Insn::Div,
            Op::CeilDiv => Insn::CeilDiv,
            Op::Mod => Insn::Mod,
            Op::Pow => Insn::Pow,
            Op::BAnd => Insn::BAnd,
            Op::BOr => Insn::BOr,
            Op::BXor => Insn::BXor,
            Op::Shl => Insn::Shl,
            Op::Shr => Insn::Shr,
            Op::BConc => Insn::BConc,
            Op::And => Insn::And,
            Op::Or => Insn::Or,
            Op::Eq => Insn::Eq,
            Op::Ne => Insn::Ne,
            Op::Lt => Insn::Lt,
            Op::Gt => Insn::Gt,
            Op::Le => Insn::Le,
            Op::Ge => Insn::Ge,
            Op::In => Insn::AIn,
            _ => return Err(self.ice(node, "unexpected binary operator")),
        };
        self.emit(insn);
        Ok(())
    }

    /// The unit of an offset-typed node, in bits.
    fn unit_of(&self, node: NodeId) -> Result<u64, String> {
        let ty = self.ty_of(node)?;
        let (_, unit) = offset_parts(self.ast, ty)
            .ok_or_else(|| self.ice(node, "offset operand without an offset type"))?;
        self.ast
            .unit_bits(unit)
            .ok_or_else(|| self.ice(node, "offset unit is not constant"))
    }

    /// Base-type width and sign of an offset-typed node.
    fn base_of(&self, node: NodeId) -> Result<(u32, bool), String> {
        let ty = self.ty_of(node)?;
        let (base, _) = offset_parts(self.ast, ty)
            .ok_or_else(|| self.ice(node, "offset operand without an offset type"))?;
        int_parts(self.ast, base).ok_or_else(|| self.ice(node, "offset base is not integral"))
    }

    /// Emit the magnitude of an offset operand scaled by
    /// `unit / g`.
    fn gen_scaled_magnitude(&mut self, node: NodeId, g: u64) -> Result<(), String> {
        let unit = self.unit_of(node)?;
        let (size, signed) = self.base_of(node)?;
        self.gen_expr(node)?;
        self.emit(Insn::OffMag);
        let factor = unit / g;
        if factor != 1 {
            self.push_int(factor as i64, size, signed);
            self.emit(Insn::Mul);
        }
        Ok(())
    }

    fn gen_offset_arith(
        &mut self,
        node: NodeId,
        op: Op,
        a: NodeId,
        b: NodeId,
    ) -> Result<(), String> {
        let aty = self.ty_of(a)?;
        let bty = self.ty_of(b)?;
        let a_off = self.ast.type_is_offset(aty);
        let b_off = self.ast.type_is_offset(bty);

        match op {
            // OFF (+|-|%) OFF, result in the GCD unit.
            Op::Add | Op::Sub | Op::Mod if a_off && b_off => {
                let g = poke_core::gcd64(self.unit_of(a)?, self.unit_of(b)?);
                self.gen_scaled_magnitude(a, g)?;
                self.gen_scaled_magnitude(b, g)?;
                self.emit(match op {
                    Op::Add => Insn::Add,
                    Op::Sub => Insn::Sub,
                    _ => Insn::Mod,
                });
                self.emit(Insn::MkOff { unit: g });
                Ok(())
            }
            // OFF / OFF is a pure number.
            Op::Div | Op::CeilDiv if a_off && b_off => {
                let g = poke_core::gcd64(self.unit_of(a)?, self.unit_of(b)?);
                self.gen_scaled_magnitude(a, g)?;
                self.gen_scaled_magnitude(b, g)?;
                self.emit(if op == Op::Div {
                    Insn::Div
                } else {
                    Insn::CeilDiv
                });
                Ok(())
            }
            // OFF scaled by an integer.
            Op::Mul | Op::Div | Op::CeilDiv if a_off => {
                let unit = self.unit_of(a)?;
                self.gen_expr(a)?;
                self.emit(Insn::OffMag);
                self.gen_expr(b)?;
                self.emit(match op {
                    Op::Mul => Insn::Mul,
                    Op::Div => Insn::Div,
                    _ => Insn::CeilDiv,
                });
                self.emit(Insn::MkOff { unit });
                Ok(())
            }
            Op::Mul if b_off => {
                let unit = self.unit_of(b)?;
                self.gen_expr(a)?;
                self.gen_expr(b)?;
                self.emit(Insn::OffMag);
                self.emit(Insn::Mul);
                self.emit(Insn::MkOff { unit });
                Ok(())
            }
            Op::Shl | Op::Shr if a_off => {
                let unit = self.unit_of(a)?;
                self.gen_expr(a)?;
                self.emit(Insn::OffMag);
                self.gen_expr(b)?;
                self.emit(if op == Op::Shl { Insn::Shl } else { Insn::Shr });
                self.emit(Insn::MkOff { unit });
                Ok(())
            }
            _ => Err(self.ice(node, "unexpected offset operation")),
        }
    }

    fn gen_attr(
        &mut self,
        node: NodeId,
        attr: Option<Attr>,
        operands: &[NodeId],
    ) -> Result<(), String> {
        let attr = attr.ok_or_else(|| self.ice(node, "unresolved attribute"))?;
        self.gen_expr(operands[0])?;
        match attr {
            Attr::Size => self.emit(Insn::Sizeof),
            Attr::Length => self.emit(Insn::ElemsOf),
            Attr::Signed => {
                // Known statically from the operand type.
                let ty = self.ty_of(operands[0])?;
                let signed = matches!(
                    self.ast.type_kind(ty),
                    Some(TypeKind::Integral { signed: true, .. })
                );
                self.emit(Insn::Drop);
                self.push_int(signed as i64, 32, true);
            }
            Attr::Magnitude => self.emit(Insn::OffMag),
            Attr::Unit => self.emit(Insn::OffUnit),
            Attr::Offset => self.emit(Insn::AttrOffset),
            Attr::Mapped => self.emit(Insn::AttrMapped),
            Attr::Strict => self.emit(Insn::AttrStrict),
            Attr::Ios => self.emit(Insn::AttrIos),
            Attr::Elem | Attr::EOffset | Attr::ESize | Attr::EName => {
                self.gen_expr(operands[1])?;
                self.emit(match attr {
                    Attr::Elem => Insn::AttrElem,
                    Attr::EOffset => Insn::AttrEOffset,
                    Attr::ESize => Insn::AttrESize,
                    _ => Insn::AttrEName,
                });
            }
        }
        Ok(())
    }

    fn gen_cast(&mut self, node: NodeId, ty: NodeId, exp: NodeId) -> Result<(), String> {
        let from = self.ty_of(exp)?;

        // To any: the value is already dynamic.
        if self.ast.type_is_any(ty) {
            return self.gen_expr(exp);
        }
        // From any: checked at run time.
        if self.ast.type_is_any(from) {
            self.gen_expr(exp)?;
            self.gen_type_value(ty)?;
            self.emit(Insn::CastAny);
            return Ok(());
        }

        if let Some((size, signed)) = int_parts(self.ast, ty) {
            self.gen_expr(exp)?;
            // Integral structs recompose to their itype first.
            if self.ast.type_integral_struct_itype(from).is_some() {
                self.emit(Insn::SToI);
            }
            self.emit(Insn::IToI { size, signed });
            return Ok(());
        }

        if self.ast.type_is_offset(ty) && self.ast.type_is_offset(from) {
            let uf = self.unit_of(exp)?;
            let (base, ut_node) =
                offset_parts(self.ast, ty).ok_or_else(|| self.ice(node, "offset type"))?;
            let ut = self
                .ast
                .unit_bits(ut_node)
                .ok_or_else(|| self.ice(node, "offset unit is not constant"))?;
            let (size, signed) =
                int_parts(self.ast, base).ok_or_else(|| self.ice(node, "offset base"))?;
            self.gen_expr(exp)?;
            self.emit(Insn::OffMag);
            self.emit(Insn::IToI { size, signed });
            if uf != ut {
                self.push_int(uf as i64, size, signed);
                self.emit(Insn::Mul);
                self.push_int(ut as i64, size, signed);
                self.emit(Insn::Div);
            }
            self.emit(Insn::MkOff { unit: ut });
            return Ok(());
        }

        if self.ast.type_is_array(ty) {
            self.gen_expr(exp)?;
            self.gen_type_value(ty)?;
            self.emit(Insn::AToA);
            return Ok(());
        }

        if self.ast.type_is_string(ty) {
            return self.gen_expr(exp);
        }

        Err(self.ice(node, "unsupported cast"))
    }

    fn gen_struct_cons(
        &mut self,
        node: NodeId,
        ty: NodeId,
        fields: &[NodeId],
    ) -> Result<(), String> {
        let (tfields, methods, union_p) = match self.ast.type_kind(ty) {
            Some(TypeKind::Struct {
                fields,
                methods,
                union_p,
                ..
            }) => (fields.clone(), methods.clone(), *union_p),
            _ => return Err(self.ice(node, "struct constructor without a struct type")),
        };

        let mut names: Vec<Option<String>> = Vec::new();

        if union_p {
            // A union value holds its single chosen alternative, or
            // the first one by default.
            let (name, exp) = match fields.first().map(|f| self.ast.kind(*f)) {
                Some(NodeKind::StructField { name, exp }) => (name.clone(), Some(*exp)),
                _ => {
                    let first = tfields.first().ok_or_else(|| self.ice(node, "empty union"))?;
                    match self.ast.kind(*first) {
                        NodeKind::StructTypeField { name, ty, .. } => {
                            let fty = *ty;
                            let n = name.clone();
                            self.gen_default(node, fty)?;
                            names.push(n);
                            (None, None)
                        }
                        _ => return Err(self.ice(node, "malformed union type")),
                    }
                }
            };
            if let Some(exp) = exp {
                self.gen_expr(exp)?;
                names.push(name);
            }
        } else {
            // Initializers are in declaration order after trans4;
            // missing fields take default values.
            let mut fi = 0usize;
            for tfield in &tfields {
                let (tname, fty) = match self.ast.kind(*tfield) {
                    NodeKind::StructTypeField { name, ty, .. } => (name.clone(), *ty),
                    _ => continue,
                };
                let given = fields.get(fi).and_then(|f| match self.ast.kind(*f) {
                    NodeKind::StructField { name: Some(n), exp } if Some(n) == tname.as_ref() => {
                        Some(*exp)
                    }
                    _ => None,
                });
                match given {
                    Some(exp) => {
                        self.gen_expr(exp)?;
                        fi += 1;
                    }
                    None => self.gen_default(node, fty)?,
                }
                names.push(tname);
            }
        }

        // For a declared type the method closures come from the
        // type value itself, captured at the declaration; only
        // inline struct types compile their methods here.
        let mut method_names = Vec::new();
        if !matches!(
            self.ast.kind(ty),
            NodeKind::Type(TypeKind::Named { .. })
        ) {
            for m in &methods {
                if let NodeKind::Decl { name, initial, .. } = self.ast.kind(*m).clone() {
                    self.gen_func(initial)?;
                    method_names.push(name);
                }
            }
        }

        self.gen_type_value(ty)?;
        self.emit(Insn::MkSct {
            fields: names,
            methods: method_names,
        });
        Ok(())
    }

    /// The default value of a type, for struct fields without an
    /// initializer.
    fn gen_default(&mut self, at: NodeId, ty: NodeId) -> Result<(), String> {
        match self.ast.type_kind(ty).cloned() {
            Some(TypeKind::Integral { size, signed }) => {
                self.push_int(0, size, signed);
                Ok(())
            }
            Some(TypeKind::StrT) => {
                let imm = self.imm_str("");
                self.emit(Insn::Push(imm));
                Ok(())
            }
            Some(TypeKind::Offset { base, unit }) => {
                let (size, signed) =
                    int_parts(self.ast, base).ok_or_else(|| self.ice(at, "offset base"))?;
                let unit = self
                    .ast
                    .unit_bits(unit)
                    .ok_or_else(|| self.ice(at, "offset unit is not constant"))?;
                self.push_int(0, size, signed);
                self.emit(Insn::MkOff { unit });
                Ok(())
            }
            Some(TypeKind::Array { etype, bound }) => {
                let n = bound
                    .and_then(|b| self.ast.integer_value(b))
                    .unwrap_or(0)
                    .max(0) as u32;
                for _ in 0..n {
                    self.gen_default(at, etype)?;
                }
                self.gen_type_value(etype)?;
                self.emit(Insn::MkArr { nelem: n });
                Ok(())
            }
            Some(TypeKind::Struct { .. }) => {
                let cons = Vec::new();
                self.gen_struct_cons(at, ty, &cons)
            }
            _ => {
                self.emit(Insn::Push(Value::NULL));
                Ok(())
            }
        }
    }

    fn gen_funcall(
        &mut self,
        node: NodeId,
        callee: NodeId,
        args: &[NodeId],
        vararg_from: Option<u32>,
    ) -> Result<(), String> {
        // Intrinsics lower to dedicated instructions.
        if let NodeKind::BuiltinRef { which } = self.ast.kind(callee) {
            let which = *which;
            return self.gen_builtin(node, which, args);
        }

        let arg_exp = |gen: &CodeGen, a: NodeId| match gen.ast.kind(a) {
            NodeKind::FuncallArg { exp, .. } => Ok(*exp),
            _ => Err(gen.ice(a, "malformed call argument")),
        };

        let nfixed = vararg_from.map(|v| v as usize).unwrap_or(args.len());

        // The callee binds arguments front to back, so they are
        // pushed back to front: the vararg array first, then the
        // fixed arguments in reverse.
        if let Some(vf) = vararg_from {
            let tail = &args[vf as usize..];
            for a in tail {
                let exp = arg_exp(self, *a)?;
                self.gen_expr(exp)?;
            }
            self.emit(Insn::MkTyAny);
            self.emit(Insn::MkArr {
                nelem: tail.len() as u32,
            });
        }
        for a in args[..nfixed].iter().rev() {
            let exp = arg_exp(self, *a)?;
            self.gen_expr(exp)?;
        }

        self.gen_expr(callee)?;
        self.emit(Insn::Call);
        Ok(())
    }

    fn gen_builtin(&mut self, node: NodeId, which: Builtin, args: &[NodeId]) -> Result<(), String> {
        let exp = |gen: &CodeGen, i: usize| -> Result<NodeId, String> {
            match args.get(i).map(|a| gen.ast.kind(*a)) {
                Some(NodeKind::FuncallArg { exp, .. }) => Ok(*exp),
                _ => Err(gen.ice(node, "missing intrinsic argument")),
            }
        };
        match which {
            Builtin::Open => {
                self.gen_expr(exp(self, 0)?)?;
                self.gen_expr(exp(self, 1)?)?;
                self.emit(Insn::IToI {
                    size: 64,
                    signed: false,
                });
                self.emit(Insn::IosOpen);
            }
            Builtin::Close => {
                self.gen_expr(exp(self, 0)?)?;
                self.emit(Insn::IToI {
                    size: 32,
                    signed: true,
                });
                self.emit(Insn::IosClose);
                self.emit(Insn::Push(Value::NULL));
            }
            Builtin::Flush => {
                self.gen_expr(exp(self, 0)?)?;
                self.emit(Insn::IToI {
                    size: 32,
                    signed: true,
                });
                self.gen_expr(exp(self, 1)?)?;
                self.emit(Insn::IosFlush);
                self.emit(Insn::Push(Value::NULL));
            }
            Builtin::GetIos => self.emit(Insn::IosCur),
            Builtin::SetIos => {
                self.gen_expr(exp(self, 0)?)?;
                self.emit(Insn::IToI {
                    size: 32,
                    signed: true,
                });
                self.emit(Insn::IosSetCur);
                self.emit(Insn::Push(Value::NULL));
            }
            Builtin::IoSize => {
                self.gen_expr(exp(self, 0)?)?;
                self.emit(Insn::IToI {
                    size: 32,
                    signed: true,
                });
                self.emit(Insn::IosSize);
            }
            Builtin::GetEndian => self.emit(Insn::GetEndian),
            Builtin::SetEndian => {
                self.gen_expr(exp(self, 0)?)?;
                self.emit(Insn::SetEndian);
                self.emit(Insn::Push(Value::NULL));
            }
        }
        Ok(())
    }

    /* Types as run-time values.  */

    fn gen_type_value(&mut self, ty: NodeId) -> Result<(), String> {
        // A reference to a declared type reuses the type value bound
        // at the declaration; method closures were captured there.
        if let NodeKind::Type(TypeKind::Named { back, over, .. }) = self.ast.kind(ty) {
            let (back, over) = (*back, *over);
            self.emit(Insn::PushVar { back, over });
            return Ok(());
        }
        match self.ast.type_kind(ty).cloned() {
            Some(TypeKind::Integral { size, signed }) => {
                self.emit(Insn::MkTyI { size, signed });
                Ok(())
            }
            Some(TypeKind::StrT) => {
                self.emit(Insn::MkTyS);
                Ok(())
            }
            Some(TypeKind::Void) => {
                self.emit(Insn::MkTyV);
                Ok(())
            }
            Some(TypeKind::Any) => {
                self.emit(Insn::MkTyAny);
                Ok(())
            }
            Some(TypeKind::Array { etype, bound }) => {
                self.gen_type_value(etype)?;
                match bound {
                    None => {
                        self.emit(Insn::MkTyA { bounded: false });
                    }
                    Some(bound) => {
                        let bty = self.ty_of(bound)?;
                        if self.ast.type_is_offset(bty) {
                            // A size bound fixes the element count
                            // at compile time.
                            let bits = self
                                .ast
                                .offset_bits(bound)
                                .ok_or_else(|| self.ice(bound, "non-constant size bound"))?;
                            let esize = self
                                .ast
                                .type_sizeof_bits(etype)
                                .ok_or_else(|| self.ice(bound, "size-bounded array of an incomplete type"))?;
                            if esize == 0 || bits % esize != 0 {
                                return Err(self.ice(
                                    bound,
                                    "the size bound is not a multiple of the element size",
                                ));
                            }
                            self.push_int((bits / esize) as i64, 64, false);
                        } else {
                            self.gen_expr(bound)?;
                            self.emit(Insn::IToI {
                                size: 64,
                                signed: false,
                            });
                        }
                        self.emit(Insn::MkTyA { bounded: true });
                    }
                }
                Ok(())
            }
            Some(TypeKind::Struct {
                fields,
                methods,
                pinned,
                union_p,
                itype,
                name,
            }) => {
                let mut fspecs = Vec::with_capacity(fields.len());
                for field in &fields {
                    if let NodeKind::StructTypeField {
                        name, ty, label, ..
                    } = self.ast.kind(*field).clone()
                    {
                        self.gen_type_value(ty)?;
                        let label = match label {
                            None => None,
                            Some(l) => Some(
                                self.ast
                                    .offset_bits(l)
                                    .ok_or_else(|| self.ice(l, "non-constant field label"))?,
                            ),
                        };
                        fspecs.push((name, label));
                    }
                }
                if let Some(itype) = itype {
                    self.gen_type_value(itype)?;
                }
                let mut method_names = Vec::new();
                for m in &methods {
                    if let NodeKind::Decl { name, initial, .. } = self.ast.kind(*m).clone() {
                        self.gen_func(initial)?;
                        method_names.push(name);
                    }
                }
                self.emit(Insn::MkTySct {
                    name,
                    fields: fspecs,
                    methods: method_names,
                    pinned,
                    union_p,
                    integral: itype.is_some(),
                });
                Ok(())
            }
            Some(TypeKind::Function { rtype, args }) => {
                for arg in &args {
                    if let NodeKind::FuncTypeArg { ty, .. } = self.ast.kind(*arg) {
                        self.gen_type_value(*ty)?;
                    }
                }
                self.gen_type_value(rtype)?;
                self.emit(Insn::MkTyF {
                    nargs: args.len() as u32,
                });
                Ok(())
            }
            Some(TypeKind::Offset { base, unit }) => {
                self.gen_type_value(base)?;
                let unit = self
                    .ast
                    .unit_bits(unit)
                    .ok_or_else(|| self.ice(ty, "offset unit is not constant"))?;
                self.emit(Insn::MkTyO { unit });
                Ok(())
            }
            Some(TypeKind::Named { .. }) => Err(self.ice(ty, "unresolved type reference")),
            None => Err(self.ice(ty, "expected a type node")),
        }
    }
}
