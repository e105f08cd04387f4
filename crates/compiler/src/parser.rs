//! Parser for Poke source
//!
//! A hand-written recursive-descent parser producing the arena AST.
//! The parser owns name resolution: it maintains the compile-time
//! environment, pushing frames at scope boundaries, registering
//! declarations, and resolving every identifier reference to its
//! declaration and lexical address `(back, over)` on the spot. The
//! later phases therefore never look names up again.

use crate::ast::{
    Ast, Attr, Builtin, DeclKind, Loc, NodeId, NodeKind, Op, TypeKind,
};
use crate::env::{CtEnv, Namespace};
use crate::lexer::{tokenize, Tok, Token};

/// What a source buffer is parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// A sequence of declarations and statements.
    Program,
    /// Ditto; the driver returns the value of the last expression
    /// statement.
    Statement,
    /// A single expression.
    Expression,
}

pub struct Parser<'a> {
    toks: Vec<Token>,
    pos: usize,
    ast: &'a mut Ast,
    env: &'a mut CtEnv,
}

impl<'a> Parser<'a> {
    pub fn new(ast: &'a mut Ast, env: &'a mut CtEnv, src: &str) -> Result<Parser<'a>, String> {
        Ok(Parser {
            toks: tokenize(src)?,
            pos: 0,
            ast,
            env,
        })
    }

    /// Parse the whole buffer, returning the root node: a `Program`
    /// for program/statement modes, the expression itself for
    /// expression mode.
    pub fn parse(&mut self, mode: ParseMode) -> Result<NodeId, String> {
        match mode {
            ParseMode::Expression => {
                let e = self.parse_expr()?;
                self.expect_eof()?;
                Ok(e)
            }
            ParseMode::Program | ParseMode::Statement => {
                let loc = self.loc();
                let mut stmts = Vec::new();
                while !self.at_eof() {
                    stmts.push(self.parse_item()?);
                }
                Ok(self.ast.add(NodeKind::Program { stmts }, loc))
            }
        }
    }

    /* Token plumbing.  */

    fn peek(&self) -> &Tok {
        &self.toks[self.pos].tok
    }

    fn peek2(&self) -> &Tok {
        let i = (self.pos + 1).min(self.toks.len() - 1);
        &self.toks[i].tok
    }

    fn loc(&self) -> Loc {
        self.toks[self.pos].loc
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].tok.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn expect_eof(&self) -> Result<(), String> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(format!("{}: trailing input after expression", self.loc()))
        }
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Tok::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), String> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(format!("{}: expected '{}'", self.loc(), p))
        }
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Ident(name) if name == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.advance() {
            Tok::Ident(name) => Ok(name),
            _ => Err(format!("{}: expected identifier", self.loc())),
        }
    }

    /* Declarations and statements.  */

    fn parse_item(&mut self) -> Result<NodeId, String> {
        if self.is_kw("var") {
            return self.parse_var_decl();
        }
        if self.is_kw("type") {
            return self.parse_type_decl();
        }
        if self.is_kw("unit") {
            return self.parse_unit_decl();
        }
        if self.is_kw("fun") {
            return self.parse_fun_decl();
        }
        self.parse_stmt()
    }

    fn register_decl(
        &mut self,
        loc: Loc,
        kind: DeclKind,
        name: &str,
        initial: NodeId,
    ) -> Result<NodeId, String> {
        let type_p = kind == DeclKind::Type;
        let order = self.env.next_over();
        let decl = self.ast.add(
            NodeKind::Decl {
                kind,
                name: name.to_string(),
                initial,
                order,
            },
            loc,
        );
        let ns = if kind == DeclKind::Unit {
            Namespace::Units
        } else {
            Namespace::Main
        };
        if !self.env.register(ns, name, decl, type_p) {
            return Err(format!("{}: '{}' is already declared", loc, name));
        }
        Ok(decl)
    }

    fn parse_var_decl(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        self.advance(); // var
        let name = self.expect_ident()?;
        let annot = if self.eat_punct(":") {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect_punct("=")?;
        let init = self.parse_expr()?;
        self.expect_punct(";")?;
        let decl = self.register_decl(loc, DeclKind::Var, &name, init)?;
        if let Some(annot) = annot {
            self.ast.set_ty(decl, annot);
        }
        Ok(decl)
    }

    fn parse_type_decl(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        self.advance(); // type
        let name = self.expect_ident()?;
        self.expect_punct("=")?;
        let ty = self.parse_type()?;
        self.expect_punct(";")?;
        // Declaring a struct type names it; the name is what its
        // equality goes by.
        if let NodeKind::Type(TypeKind::Struct { name: tname, .. }) = &mut self.ast.node_mut(ty).kind
        {
            if tname.is_none() {
                *tname = Some(name.clone());
            }
        }
        self.register_decl(loc, DeclKind::Type, &name, ty)
    }

    fn parse_unit_decl(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        self.advance(); // unit
        let name = self.expect_ident()?;
        self.expect_punct("=")?;
        let bits = self.parse_unit_value()?;
        self.expect_punct(";")?;
        if bits == 0 {
            return Err(format!("{}: unit '{}' must be positive", loc, name));
        }
        let value = self.ast.make_integer(loc, bits as i64, 64, false);
        self.register_decl(loc, DeclKind::Unit, &name, value)
    }

    /// Unit initializers are constant products of integer literals
    /// and previously declared units.
    fn parse_unit_value(&mut self) -> Result<u64, String> {
        let mut acc = self.parse_unit_factor()?;
        while self.eat_punct("*") {
            acc *= self.parse_unit_factor()?;
        }
        Ok(acc)
    }

    fn parse_unit_factor(&mut self) -> Result<u64, String> {
        let loc = self.loc();
        match self.advance() {
            Tok::Int { value, .. } => Ok(value as u64),
            Tok::Ident(name) => match self.env.lookup(Namespace::Units, &name) {
                Some((decl, _, _)) => {
                    let initial = match self.ast.kind(decl) {
                        NodeKind::Decl { initial, .. } => *initial,
                        _ => return Err(format!("{}: bad unit reference", loc)),
                    };
                    self.ast
                        .integer_value(initial)
                        .map(|v| v as u64)
                        .ok_or_else(|| format!("{}: unit '{}' is not constant", loc, name))
                }
                None => Err(format!("{}: unknown unit '{}'", loc, name)),
            },
            _ => Err(format!("{}: expected a unit expression", loc)),
        }
    }

    fn parse_fun_decl(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        self.advance(); // fun
        let name = self.expect_ident()?;
        self.expect_punct("=")?;
        // Register the function before its body so it can recurse.
        let placeholder = self.ast.add(NodeKind::NullStmt, loc);
        let decl = self.register_decl(loc, DeclKind::Func, &name, placeholder)?;
        let func = self.parse_func(false)?;
        if let NodeKind::Decl { initial, .. } = &mut self.ast.node_mut(decl).kind {
            *initial = func;
        }
        self.eat_punct(";");
        Ok(decl)
    }

    /// `(args) rtype: body` or `rtype: body`.
    fn parse_func(&mut self, method_p: bool) -> Result<NodeId, String> {
        let loc = self.loc();
        // Arguments live in their own frame, bound by the call
        // prologue in declaration order.
        self.env.push_frame();
        let mut args = Vec::new();
        let mut vararg = false;
        if self.eat_punct("(") {
            if !self.is_punct(")") {
                loop {
                    let aloc = self.loc();
                    if self.eat_punct("...") {
                        let aname = self.expect_ident()?;
                        let any = self.ast.add(NodeKind::Type(TypeKind::Any), aloc);
                        let aty = self.ast.add(
                            NodeKind::Type(TypeKind::Array {
                                etype: any,
                                bound: None,
                            }),
                            aloc,
                        );
                        let arg = self.ast.add(
                            NodeKind::FuncArg {
                                name: aname.clone(),
                                ty: aty,
                                initial: None,
                                vararg: true,
                            },
                            aloc,
                        );
                        self.register_decl(aloc, DeclKind::Var, &aname, arg)?;
                        args.push(arg);
                        vararg = true;
                        break;
                    }
                    let aty = self.parse_type()?;
                    let aname = self.expect_ident()?;
                    let initial = if self.eat_punct("=") {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    let arg = self.ast.add(
                        NodeKind::FuncArg {
                            name: aname.clone(),
                            ty: aty,
                            initial,
                            vararg: false,
                        },
                        aloc,
                    );
                    self.register_decl(aloc, DeclKind::Var, &aname, arg)?;
                    args.push(arg);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
            }
            self.expect_punct(")")?;
        }

        let rtype = if self.eat_kw("void") {
            None
        } else {
            Some(self.parse_type()?)
        };
        self.expect_punct(":")?;
        let body = self.parse_comp_stmt()?;
        self.env.pop_frame();

        let nargs = args.len() as u32;
        Ok(self.ast.add(
            NodeKind::Func {
                rtype,
                args,
                body,
                nargs,
                first_opt: None,
                vararg,
                method_p,
            },
            loc,
        ))
    }

    fn parse_stmt(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();

        if self.is_punct("{") {
            return self.parse_comp_stmt();
        }
        if self.eat_punct(";") {
            return Ok(self.ast.add(NodeKind::NullStmt, loc));
        }
        if self.eat_kw("if") {
            self.expect_punct("(")?;
            let cond = self.parse_expr()?;
            self.expect_punct(")")?;
            let then_s = self.parse_stmt()?;
            let else_s = if self.eat_kw("else") {
                Some(self.parse_stmt()?)
            } else {
                None
            };
            return Ok(self.ast.add(
                NodeKind::IfStmt {
                    cond,
                    then_s,
                    else_s,
                },
                loc,
            ));
        }
        if self.eat_kw("while") {
            self.expect_punct("(")?;
            let cond = self.parse_expr()?;
            self.expect_punct(")")?;
            let body = self.parse_stmt()?;
            return Ok(self.ast.add(
                NodeKind::LoopStmt {
                    cond: Some(cond),
                    iterator: None,
                    selector: None,
                    body,
                },
                loc,
            ));
        }
        if self.eat_kw("for") {
            return self.parse_for_stmt(loc);
        }
        if self.eat_kw("return") {
            let exp = if self.is_punct(";") {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(";")?;
            return Ok(self.ast.add(
                NodeKind::ReturnStmt {
                    exp,
                    function: None,
                },
                loc,
            ));
        }
        if self.eat_kw("break") {
            self.expect_punct(";")?;
            return Ok(self.ast.add(NodeKind::BreakStmt { target: None }, loc));
        }
        if self.eat_kw("continue") {
            self.expect_punct(";")?;
            return Ok(self.ast.add(NodeKind::ContinueStmt { target: None }, loc));
        }
        if self.eat_kw("try") {
            return self.parse_try_stmt(loc);
        }
        if self.eat_kw("raise") {
            let exp = if self.is_punct(";") {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(";")?;
            return Ok(self.ast.add(NodeKind::RaiseStmt { exp }, loc));
        }
        if self.eat_kw("print") {
            let exp = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(self.ast.add(
                NodeKind::PrintStmt {
                    exp: Some(exp),
                    format: None,
                },
                loc,
            ));
        }
        if self.eat_kw("printf") {
            let fmt = self.parse_format_body(loc)?;
            self.expect_punct(";")?;
            return Ok(self.ast.add(
                NodeKind::PrintStmt {
                    exp: None,
                    format: Some(fmt),
                },
                loc,
            ));
        }

        // Assignment, increment/decrement, or a plain expression.
        let exp = self.parse_expr()?;
        if self.eat_punct("=") {
            if !matches!(
                self.ast.kind(exp),
                NodeKind::Var { .. } | NodeKind::Indexer { .. } | NodeKind::StructRef { .. }
            ) {
                return Err(format!("{}: invalid assignment target", loc));
            }
            let rhs = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(self.ast.add(NodeKind::AssStmt { lhs: exp, exp: rhs }, loc));
        }
        self.expect_punct(";")?;
        Ok(self.ast.add(NodeKind::ExpStmt { exp }, loc))
    }

    fn parse_comp_stmt(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        self.expect_punct("{")?;
        self.env.push_frame();
        let mut stmts = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(format!("{}: unterminated block", loc));
            }
            stmts.push(self.parse_item()?);
        }
        self.expect_punct("}")?;
        self.env.pop_frame();
        let num_decls = stmts
            .iter()
            .filter(|s| matches!(self.ast.kind(**s), NodeKind::Decl { .. }))
            .count() as u32;
        Ok(self.ast.add(NodeKind::CompStmt { stmts, num_decls }, loc))
    }

    /// `for (v in container [where cond]) body`
    ///
    /// The iterator frame holds two hidden slots (the container and
    /// the running index) followed by the iteration variable; the
    /// code generator reproduces exactly this layout.
    fn parse_for_stmt(&mut self, loc: Loc) -> Result<NodeId, String> {
        self.expect_punct("(")?;
        self.eat_kw("var");
        let vname = self.expect_ident()?;
        if !self.eat_kw("in") {
            return Err(format!("{}: expected 'in'", self.loc()));
        }

        self.env.push_frame();
        let hidden = self.ast.add(NodeKind::NullStmt, loc);
        self.register_decl(loc, DeclKind::Var, " container", hidden)?;
        self.register_decl(loc, DeclKind::Var, " index", hidden)?;

        let container = self.parse_expr()?;
        let vdecl = self.register_decl(loc, DeclKind::Var, &vname, hidden)?;

        let selector = if self.eat_kw("where") {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_punct(")")?;
        let body = self.parse_stmt()?;
        self.env.pop_frame();

        let iterator = self.ast.add(
            NodeKind::LoopIterator {
                decl: vdecl,
                container,
            },
            loc,
        );
        Ok(self.ast.add(
            NodeKind::LoopStmt {
                cond: None,
                iterator: Some(iterator),
                selector,
                body,
            },
            loc,
        ))
    }

    /// `try S catch ... S` or `try S until E;`
    fn parse_try_stmt(&mut self, loc: Loc) -> Result<NodeId, String> {
        let body = self.parse_stmt()?;

        if self.eat_kw("until") {
            let exp = self.parse_expr()?;
            self.expect_punct(";")?;
            return Ok(self.ast.add(NodeKind::TryUntilStmt { body, exp }, loc));
        }

        if !self.eat_kw("catch") {
            return Err(format!("{}: expected 'catch' or 'until'", self.loc()));
        }

        // The handler frame always binds the caught exception; when
        // the source names no variable a hidden slot takes it.
        self.env.push_frame();
        let hidden = self.ast.add(NodeKind::NullStmt, loc);

        let mut arg = None;
        let mut filter = None;
        if self.eat_punct("(") {
            // catch (Exception e)
            let cty = self.parse_type()?;
            let ename = self.expect_ident()?;
            let decl = self.register_decl(loc, DeclKind::Var, &ename, hidden)?;
            self.ast.set_ty(decl, cty);
            arg = Some(decl);
            self.expect_punct(")")?;
            if self.eat_kw("if") {
                filter = Some(self.parse_expr()?);
            }
        } else if self.eat_kw("if") {
            // Either `catch if e : T` (a binding) or `catch if EXPR`
            // (a filter).
            if let (Tok::Ident(name), Tok::Punct(":")) = (self.peek().clone(), self.peek2().clone())
            {
                self.advance();
                self.advance();
                let ty = self.parse_type()?;
                let decl = self.register_decl(loc, DeclKind::Var, &name, hidden)?;
                self.ast.set_ty(decl, ty);
                arg = Some(decl);
            } else {
                let decl = self.register_decl(loc, DeclKind::Var, " exc", hidden)?;
                arg = Some(decl);
                filter = Some(self.parse_expr()?);
            }
        } else {
            let decl = self.register_decl(loc, DeclKind::Var, " exc", hidden)?;
            arg = Some(decl);
        }

        let handler = self.parse_stmt()?;
        self.env.pop_frame();

        Ok(self.ast.add(
            NodeKind::TryCatchStmt {
                body,
                arg,
                filter,
                handler,
            },
            loc,
        ))
    }

    /// The body of `format(...)` / `printf ...`: a format string
    /// plus arguments. The string is split into parts by trans1.
    fn parse_format_body(&mut self, loc: Loc) -> Result<NodeId, String> {
        let parened = self.eat_punct("(");
        let raw = match self.advance() {
            Tok::Str(s) => s,
            _ => return Err(format!("{}: expected a format string", loc)),
        };
        let mut args = Vec::new();
        while self.eat_punct(",") {
            args.push(self.parse_expr()?);
        }
        if parened {
            self.expect_punct(")")?;
        }
        Ok(self.ast.add(
            NodeKind::Format {
                raw,
                parts: Vec::new(),
                args,
            },
            loc,
        ))
    }

    /* Types.  */

    /// Whether the upcoming tokens open a type.
    fn at_type(&self) -> bool {
        match self.peek() {
            Tok::Ident(name) => match name.as_str() {
                "int" | "uint" | "string" | "void" | "any" | "offset" | "struct" | "union"
                | "pinned" => true,
                _ => matches!(
                    self.env
                        .lookup(Namespace::Main, name)
                        .map(|(d, _, _)| self.ast.kind(d)),
                    Some(NodeKind::Decl {
                        kind: DeclKind::Type,
                        ..
                    })
                ),
            },
            Tok::Punct("(") => false,
            _ => false,
        }
    }

    fn parse_type(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        let mut base = self.parse_base_type()?;
        // Array postfixes.
        while self.is_punct("[") {
            self.advance();
            let bound = if self.is_punct("]") {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct("]")?;
            base = self.ast.add(
                NodeKind::Type(TypeKind::Array { etype: base, bound }),
                loc,
            );
        }
        Ok(base)
    }

    fn parse_base_type(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();

        if self.eat_punct("(") {
            // Function type: (T, T?...) RT
            let mut args = Vec::new();
            if !self.is_punct(")") {
                loop {
                    let aloc = self.loc();
                    let vararg = self.eat_punct("...");
                    let ty = self.parse_type()?;
                    let optional = self.eat_punct("?");
                    args.push(self.ast.add(
                        NodeKind::FuncTypeArg {
                            ty,
                            optional,
                            vararg,
                        },
                        aloc,
                    ));
                    if !self.eat_punct(",") {
                        break;
                    }
                }
            }
            self.expect_punct(")")?;
            let rtype = if self.eat_kw("void") {
                self.ast.add(NodeKind::Type(TypeKind::Void), loc)
            } else {
                self.parse_type()?
            };
            return Ok(self
                .ast
                .add(NodeKind::Type(TypeKind::Function { rtype, args }), loc));
        }

        let name = self.expect_ident()?;
        match name.as_str() {
            "int" | "uint" => {
                let signed = name == "int";
                let size = if self.eat_punct("<") {
                    let size = match self.advance() {
                        Tok::Int { value, .. } if (1..=64).contains(&value) => value as u32,
                        _ => return Err(format!("{}: integral width must be 1..64", loc)),
                    };
                    self.expect_punct(">")?;
                    size
                } else {
                    32
                };
                Ok(self
                    .ast
                    .add(NodeKind::Type(TypeKind::Integral { size, signed }), loc))
            }
            "string" => Ok(self.ast.add(NodeKind::Type(TypeKind::StrT), loc)),
            "void" => Ok(self.ast.add(NodeKind::Type(TypeKind::Void), loc)),
            "any" => Ok(self.ast.add(NodeKind::Type(TypeKind::Any), loc)),
            "offset" => {
                self.expect_punct("<")?;
                let base = self.parse_type()?;
                self.expect_punct(",")?;
                let unit = self.parse_offset_unit()?;
                self.expect_punct(">")?;
                Ok(self
                    .ast
                    .add(NodeKind::Type(TypeKind::Offset { base, unit }), loc))
            }
            "pinned" => {
                let sub = self.parse_base_type()?;
                match &mut self.ast.node_mut(sub).kind {
                    NodeKind::Type(TypeKind::Struct { pinned, .. }) => {
                        *pinned = true;
                        Ok(sub)
                    }
                    _ => Err(format!("{}: 'pinned' applies to struct types", loc)),
                }
            }
            "struct" => self.parse_struct_type(loc, false),
            "union" => self.parse_struct_type(loc, true),
            _ => {
                // A use of a declared type: a reference node that
                // remembers where the type value is bound.
                match self.env.lookup(Namespace::Main, &name) {
                    Some((decl, back, over)) => match self.ast.kind(decl) {
                        NodeKind::Decl {
                            kind: DeclKind::Type,
                            initial,
                            ..
                        } => {
                            let referent = *initial;
                            Ok(self.ast.add(
                                NodeKind::Type(TypeKind::Named {
                                    back,
                                    over,
                                    referent,
                                }),
                                loc,
                            ))
                        }
                        _ => Err(format!("{}: '{}' is not a type", loc, name)),
                    },
                    None => Err(format!("{}: unknown type '{}'", loc, name)),
                }
            }
        }
    }

    fn parse_struct_type(&mut self, loc: Loc, union_p: bool) -> Result<NodeId, String> {
        // Integral structs name their itype before the braces:
        // struct int<16> { ... }
        let itype = if !self.is_punct("{") {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect_punct("{")?;

        let mut fields = Vec::new();
        let mut methods = Vec::new();
        // big/little scopes apply to the fields that follow them.
        let mut cur_msb: Option<bool> = None;

        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(format!("{}: unterminated struct type", loc));
            }
            let floc = self.loc();

            if self.eat_kw("big") {
                self.expect_punct(";")?;
                cur_msb = Some(true);
                continue;
            }
            if self.eat_kw("little") {
                self.expect_punct(";")?;
                cur_msb = Some(false);
                continue;
            }
            if self.eat_kw("method") {
                let mname = self.expect_ident()?;
                self.expect_punct("=")?;
                let placeholder = self.ast.add(NodeKind::NullStmt, floc);
                let order = self.env.next_over();
                let decl = self.ast.add(
                    NodeKind::Decl {
                        kind: DeclKind::Func,
                        name: mname,
                        initial: placeholder,
                        order,
                    },
                    floc,
                );
                let func = self.parse_func(true)?;
                if let NodeKind::Decl { initial, .. } = &mut self.ast.node_mut(decl).kind {
                    *initial = func;
                }
                self.eat_punct(";");
                methods.push(decl);
                continue;
            }

            let fty = self.parse_type()?;
            let fname = match self.peek() {
                Tok::Ident(_) => Some(self.expect_ident()?),
                _ => None,
            };
            let label = if self.eat_punct("@") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            let optcond = if self.eat_kw("if") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect_punct(";")?;
            fields.push(self.ast.add(
                NodeKind::StructTypeField {
                    name: fname,
                    ty: fty,
                    label,
                    optcond,
                    msb: cur_msb,
                },
                floc,
            ));
        }
        self.expect_punct("}")?;

        Ok(self.ast.add(
            NodeKind::Type(TypeKind::Struct {
                fields,
                methods,
                pinned: false,
                union_p,
                itype,
                name: None,
            }),
            loc,
        ))
    }

    /// The unit of an offset type or literal: an integer (bits), a
    /// declared unit name, or a type whose size becomes the unit.
    fn parse_offset_unit(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        match self.peek().clone() {
            Tok::Int { value, .. } => {
                self.advance();
                Ok(self.ast.make_integer(loc, value, 64, false))
            }
            Tok::Ident(name) => {
                if let Some((decl, _, _)) = self.env.lookup(Namespace::Units, &name) {
                    self.advance();
                    let initial = match self.ast.kind(decl) {
                        NodeKind::Decl { initial, .. } => *initial,
                        _ => return Err(format!("{}: bad unit reference", loc)),
                    };
                    let bits = self
                        .ast
                        .integer_value(initial)
                        .ok_or_else(|| format!("{}: unit '{}' is not constant", loc, name))?;
                    return Ok(self.ast.make_integer(loc, bits, 64, false));
                }
                if self.at_type() {
                    // A type used as a unit; trans2 replaces it by
                    // its size in bits.
                    return self.parse_type();
                }
                Err(format!("{}: unknown unit '{}'", loc, name))
            }
            _ => Err(format!("{}: expected an offset unit", loc)),
        }
    }

    /* Expressions.  */

    pub fn parse_expr(&mut self) -> Result<NodeId, String> {
        self.parse_cond_expr()
    }

    fn parse_cond_expr(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        let cond = self.parse_binary_expr(0)?;
        if self.eat_punct("?") {
            let then_e = self.parse_expr()?;
            self.expect_punct(":")?;
            let else_e = self.parse_cond_expr()?;
            return Ok(self.ast.add(
                NodeKind::CondExp {
                    cond,
                    then_e,
                    else_e,
                },
                loc,
            ));
        }
        Ok(cond)
    }

    /// Binary operator precedence levels, loosest first.
    fn binop_at(&self, level: usize) -> Option<Op> {
        let t = self.peek();
        let op = match (level, t) {
            (0, Tok::Punct("||")) => Op::Or,
            (1, Tok::Punct("&&")) => Op::And,
            (2, Tok::Punct("|")) => Op::BOr,
            (3, Tok::Punct("^")) => Op::BXor,
            (4, Tok::Punct("&")) => Op::BAnd,
            (5, Tok::Punct("==")) => Op::Eq,
            (5, Tok::Punct("!=")) => Op::Ne,
            (6, Tok::Punct("<")) => Op::Lt,
            (6, Tok::Punct(">")) => Op::Gt,
            (6, Tok::Punct("<=")) => Op::Le,
            (6, Tok::Punct(">=")) => Op::Ge,
            (6, Tok::Ident(n)) if n == "in" => Op::In,
            (7, Tok::Punct(":::")) => Op::BConc,
            (8, Tok::Punct("<<")) => Op::Shl,
            (8, Tok::Punct(">>")) => Op::Shr,
            (9, Tok::Punct("+")) => Op::Add,
            (9, Tok::Punct("-")) => Op::Sub,
            (10, Tok::Punct("*")) => Op::Mul,
            (10, Tok::Punct("/")) => Op::Div,
            (10, Tok::Punct("/^")) => Op::CeilDiv,
            (10, Tok::Punct("%")) => Op::Mod,
            (11, Tok::Punct("**")) => Op::Pow,
            _ => return None,
        };
        Some(op)
    }

    const MAX_BINOP_LEVEL: usize = 11;

    fn parse_binary_expr(&mut self, level: usize) -> Result<NodeId, String> {
        if level > Self::MAX_BINOP_LEVEL {
            return self.parse_cast_expr();
        }
        let loc = self.loc();
        let mut lhs = self.parse_binary_expr(level + 1)?;
        while let Some(op) = self.binop_at(level) {
            self.advance();
            let rhs = self.parse_binary_expr(level + 1)?;
            lhs = self.ast.add(
                NodeKind::Exp {
                    op,
                    operands: vec![lhs, rhs],
                    attr: None,
                },
                loc,
            );
        }
        Ok(lhs)
    }

    /// Casts, isa and offset literals bind tighter than any binary
    /// operator.
    fn parse_cast_expr(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        let mut e = self.parse_unary_expr()?;
        loop {
            if self.eat_kw("as") {
                let ty = self.parse_type()?;
                e = self.ast.add(NodeKind::Cast { ty, exp: e }, loc);
            } else if self.eat_kw("isa") {
                let ty = self.parse_type()?;
                e = self.ast.add(NodeKind::Isa { ty, exp: e }, loc);
            } else if self.eat_punct("#") {
                let unit = self.parse_offset_unit()?;
                e = self.ast.add(
                    NodeKind::Offset {
                        magnitude: Some(e),
                        unit,
                    },
                    loc,
                );
            } else {
                break;
            }
        }
        Ok(e)
    }

    fn parse_unary_expr(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        for (p, op) in [
            ("!", Op::Not),
            ("~", Op::BNot),
            ("-", Op::Neg),
            ("+", Op::Pos),
        ] {
            if self.is_punct(p) {
                self.advance();
                let e = self.parse_unary_expr()?;
                return Ok(self.ast.add(
                    NodeKind::Exp {
                        op,
                        operands: vec![e],
                        attr: None,
                    },
                    loc,
                ));
            }
        }
        self.parse_postfix_expr()
    }

    fn parse_postfix_expr(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();
        let mut e = self.parse_primary_expr()?;
        loop {
            if self.is_punct("[") {
                self.advance();
                // Trimmer with an omitted lower bound: a[:N].
                let index = if self.is_punct(":") {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                if self.eat_punct(":") {
                    // a[from:to], a[from:] and a[from:+count].
                    let (to, addend) = if self.eat_punct("+") {
                        (None, Some(self.parse_expr()?))
                    } else if self.is_punct("]") {
                        (None, None)
                    } else {
                        (Some(self.parse_expr()?), None)
                    };
                    self.expect_punct("]")?;
                    e = self.ast.add(
                        NodeKind::Trimmer {
                            container: e,
                            from: index,
                            to,
                            addend,
                        },
                        loc,
                    );
                } else {
                    let index =
                        index.ok_or_else(|| format!("{}: expected an index expression", loc))?;
                    self.expect_punct("]")?;
                    e = self.ast.add(
                        NodeKind::Indexer {
                            container: e,
                            index,
                        },
                        loc,
                    );
                }
            } else if self.is_punct("(") {
                self.advance();
                let mut args = Vec::new();
                if !self.is_punct(")") {
                    loop {
                        let aloc = self.loc();
                        if self.is_punct(":") {
                            self.advance();
                            let name = self.expect_ident()?;
                            let exp = self.parse_expr()?;
                            args.push(self.ast.add(
                                NodeKind::FuncallArg {
                                    exp,
                                    name: Some(name),
                                },
                                aloc,
                            ));
                        } else {
                            let exp = self.parse_expr()?;
                            args.push(
                                self.ast
                                    .add(NodeKind::FuncallArg { exp, name: None }, aloc),
                            );
                        }
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                }
                self.expect_punct(")")?;
                e = self.ast.add(
                    NodeKind::Funcall {
                        callee: e,
                        args,
                        vararg_from: None,
                    },
                    loc,
                );
            } else if self.is_punct(".") {
                self.advance();
                let name = self.expect_ident()?;
                e = self.ast.add(NodeKind::StructRef { sct: e, name }, loc);
            } else if let Tok::Attr(name) = self.peek().clone() {
                self.advance();
                let attr = Attr::from_name(&name)
                    .ok_or_else(|| format!("{}: unknown attribute '{}'", loc, name))?;
                let mut operands = vec![e];
                if attr.takes_index() {
                    self.expect_punct("(")?;
                    operands.push(self.parse_expr()?);
                    self.expect_punct(")")?;
                }
                e = self.ast.add(
                    NodeKind::Exp {
                        op: Op::Attr,
                        operands,
                        attr: Some(attr),
                    },
                    loc,
                );
            } else if self.is_punct("++") || self.is_punct("--") {
                let delta = if self.is_punct("++") { 1 } else { -1 };
                self.advance();
                e = self.ast.add(NodeKind::IncrDecr { exp: e, delta }, loc);
            } else {
                break;
            }
        }
        Ok(e)
    }

    fn parse_primary_expr(&mut self) -> Result<NodeId, String> {
        let loc = self.loc();

        match self.peek().clone() {
            Tok::Int {
                value,
                size,
                signed,
            } => {
                self.advance();
                Ok(self.ast.make_integer(loc, value, size, signed))
            }
            Tok::Char(c) => {
                self.advance();
                Ok(self.ast.make_integer(loc, c as i64, 8, false))
            }
            Tok::Str(s) => {
                self.advance();
                let ty = self.ast.add(NodeKind::Type(TypeKind::StrT), loc);
                let n = self.ast.add(NodeKind::Str { value: s }, loc);
                self.ast.set_ty(n, ty);
                self.ast.set_literal(n, true);
                Ok(n)
            }
            Tok::Punct("(") => {
                self.advance();
                let e = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            Tok::Punct("[") => {
                self.advance();
                let mut initializers = Vec::new();
                if !self.is_punct("]") {
                    loop {
                        let iloc = self.loc();
                        if self.eat_punct(".") {
                            self.expect_punct("[")?;
                            let index = self.parse_expr()?;
                            self.expect_punct("]")?;
                            self.expect_punct("=")?;
                            let exp = self.parse_expr()?;
                            initializers.push(self.ast.add(
                                NodeKind::ArrayInitializer {
                                    index: Some(index),
                                    exp,
                                },
                                iloc,
                            ));
                        } else {
                            let exp = self.parse_expr()?;
                            initializers.push(
                                self.ast
                                    .add(NodeKind::ArrayInitializer { index: None, exp }, iloc),
                            );
                        }
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                }
                self.expect_punct("]")?;
                Ok(self.ast.add(NodeKind::ArrayLit { initializers }, loc))
            }
            Tok::Punct("#") => {
                // Unit-only offset literal; the magnitude defaults
                // to 1 in trans1.
                self.advance();
                let unit = self.parse_offset_unit()?;
                Ok(self.ast.add(
                    NodeKind::Offset {
                        magnitude: None,
                        unit,
                    },
                    loc,
                ))
            }
            Tok::Ident(name) if name == "sizeof" => {
                self.advance();
                self.expect_punct("(")?;
                let ty = self.parse_type()?;
                self.expect_punct(")")?;
                Ok(self.ast.add(
                    NodeKind::Exp {
                        op: Op::Sizeof,
                        operands: vec![ty],
                        attr: None,
                    },
                    loc,
                ))
            }
            Tok::Ident(name) if name == "lambda" => {
                self.advance();
                let func = self.parse_func(false)?;
                Ok(self.ast.add(NodeKind::Lambda { func }, loc))
            }
            Tok::Ident(name) if name == "format" => {
                self.advance();
                self.parse_format_body(loc)
            }
            Tok::Ident(name) => {
                // Type keywords (or a declared type name) open a map
                // or a struct constructor.
                if self.at_type() {
                    return self.parse_type_headed_expr(loc);
                }
                self.advance();
                match self.env.lookup(Namespace::Main, &name) {
                    Some((decl, back, over)) => {
                        let is_type = matches!(
                            self.ast.kind(decl),
                            NodeKind::Decl {
                                kind: DeclKind::Type,
                                ..
                            }
                        );
                        if is_type {
                            return Err(format!("{}: type '{}' used as a value", loc, name));
                        }
                        Ok(self.ast.add(
                            NodeKind::Var {
                                name,
                                decl,
                                back,
                                over,
                                function: None,
                                fn_back: 0,
                            },
                            loc,
                        ))
                    }
                    None => match Builtin::from_name(&name) {
                        Some(which) => Ok(self.ast.add(NodeKind::BuiltinRef { which }, loc)),
                        None => Err(format!("{}: undefined name '{}'", loc, name)),
                    },
                }
            }
            t => Err(format!("{}: unexpected token {:?}", loc, t)),
        }
    }

    /// An expression opened by a type: `T @ [IOS :] OFF` maps,
    /// `T { ... }` constructs a struct.
    fn parse_type_headed_expr(&mut self, loc: Loc) -> Result<NodeId, String> {
        let ty = self.parse_type()?;

        if self.eat_punct("@") {
            // The operands are parsed below the ternary level so the
            // optional `IOS :` separator stays unambiguous.
            let first = self.parse_binary_expr(0)?;
            let (ios, offset) = if self.eat_punct(":") {
                (Some(first), self.parse_binary_expr(0)?)
            } else {
                (None, first)
            };
            return Ok(self.ast.add(
                NodeKind::Map {
                    strict: true,
                    ty,
                    ios,
                    offset,
                },
                loc,
            ));
        }

        if self.eat_punct("{") {
            let mut fields = Vec::new();
            if !self.is_punct("}") {
                loop {
                    let floc = self.loc();
                    let name = match (self.peek().clone(), self.peek2().clone()) {
                        (Tok::Ident(n), Tok::Punct("=")) => {
                            self.advance();
                            self.advance();
                            Some(n)
                        }
                        _ => None,
                    };
                    let exp = self.parse_expr()?;
                    fields.push(self.ast.add(NodeKind::StructField { name, exp }, floc));
                    if !self.eat_punct(",") {
                        break;
                    }
                }
            }
            self.expect_punct("}")?;
            return Ok(self.ast.add(NodeKind::StructCons { ty, fields }, loc));
        }

        Err(format!(
            "{}: a type here must head a map ('@') or a constructor ('{{')",
            loc
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_src(src: &str, mode: ParseMode) -> Result<(Ast, CtEnv, NodeId), String> {
        let mut ast = Ast::new();
        let mut env = CtEnv::new();
        let root = Parser::new(&mut ast, &mut env, src)?.parse(mode)?;
        Ok((ast, env, root))
    }

    #[test]
    fn vars_resolve_to_lexical_addresses() {
        let (ast, _, root) =
            parse_src("var x = 1; var y = 2; { var z = x; y; }", ParseMode::Program).unwrap();
        let stmts = match ast.kind(root) {
            NodeKind::Program { stmts } => stmts.clone(),
            _ => panic!(),
        };
        // The inner block: z's initializer sees x at (1, 0), the
        // statement sees y at (1, 1).
        let block = stmts[2];
        let inner = match ast.kind(block) {
            NodeKind::CompStmt { stmts, .. } => stmts.clone(),
            other => panic!("expected a block, got {:?}", other),
        };
        let z = inner[0];
        let zinit = match ast.kind(z) {
            NodeKind::Decl { initial, .. } => *initial,
            other => panic!("expected a decl, got {:?}", other),
        };
        match ast.kind(zinit) {
            NodeKind::Var { back, over, .. } => assert_eq!((*back, *over), (1, 0)),
            other => panic!("expected a var, got {:?}", other),
        }
        let ystmt = match ast.kind(inner[1]) {
            NodeKind::ExpStmt { exp } => *exp,
            other => panic!("expected an expression statement, got {:?}", other),
        };
        match ast.kind(ystmt) {
            NodeKind::Var { back, over, .. } => assert_eq!((*back, *over), (1, 1)),
            other => panic!("expected a var, got {:?}", other),
        }
    }

    #[test]
    fn undefined_names_are_rejected() {
        let err = parse_src("nope;", ParseMode::Program).unwrap_err();
        assert!(err.contains("undefined name"));
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let err = parse_src("var x = 1; var x = 2;", ParseMode::Program).unwrap_err();
        assert!(err.contains("already declared"));
    }

    #[test]
    fn precedence_shapes_the_tree() {
        let (ast, _, root) = parse_src("1 + 2 * 3", ParseMode::Expression).unwrap();
        match ast.kind(root) {
            NodeKind::Exp { op: Op::Add, operands, .. } => {
                assert!(matches!(
                    ast.kind(operands[1]),
                    NodeKind::Exp { op: Op::Mul, .. }
                ));
            }
            other => panic!("expected +, got {:?}", other),
        }
    }

    #[test]
    fn maps_parse_with_and_without_ios() {
        let (ast, _, root) = parse_src("int<12> @ 4#b", ParseMode::Expression).unwrap();
        match ast.kind(root) {
            NodeKind::Map { ios: None, .. } => {}
            other => panic!("expected a map, got {:?}", other),
        }
        let (ast, _, root) = parse_src("uint<8> @ 0 : 16#b", ParseMode::Expression).unwrap();
        match ast.kind(root) {
            NodeKind::Map { ios: Some(_), .. } => {}
            other => panic!("expected a map with ios, got {:?}", other),
        }
    }

    #[test]
    fn offset_literals_and_unitless_offsets() {
        let (ast, _, root) = parse_src("4#8", ParseMode::Expression).unwrap();
        match ast.kind(root) {
            NodeKind::Offset { magnitude: Some(_), .. } => {}
            other => panic!("expected an offset, got {:?}", other),
        }
        let (ast, _, root) = parse_src("#8", ParseMode::Expression).unwrap();
        match ast.kind(root) {
            NodeKind::Offset { magnitude: None, .. } => {}
            other => panic!("expected an offset, got {:?}", other),
        }
    }

    #[test]
    fn struct_types_with_fields_and_itype() {
        let (ast, env, _) = parse_src(
            "type Word = struct int<16> { int<8> hi; int<8> lo; };",
            ParseMode::Program,
        )
        .unwrap();
        let (decl, _, _) = env.lookup(Namespace::Main, "Word").unwrap();
        let ty = match ast.kind(decl) {
            NodeKind::Decl { initial, .. } => *initial,
            _ => panic!(),
        };
        match ast.type_kind(ty) {
            Some(TypeKind::Struct {
                fields,
                itype: Some(_),
                name: Some(n),
                ..
            }) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(n, "Word");
            }
            other => panic!("expected an integral struct, got {:?}", other),
        }
    }

    #[test]
    fn functions_bind_their_arguments() {
        let (ast, env, _) = parse_src(
            "fun add = (int<32> a, int<32> b) int<32>: { return a + b; }",
            ParseMode::Program,
        )
        .unwrap();
        let (decl, _, _) = env.lookup(Namespace::Main, "add").unwrap();
        let func = match ast.kind(decl) {
            NodeKind::Decl { initial, .. } => *initial,
            _ => panic!(),
        };
        match ast.kind(func) {
            NodeKind::Func { nargs: 2, .. } => {}
            other => panic!("expected a function, got {:?}", other),
        }
    }

    #[test]
    fn catch_binding_forms() {
        // Both spellings bind the exception variable.
        for src in [
            "try { 1; } catch (any e) { e; }",
            "try { 1; } catch if e : any { e; }",
        ] {
            let (ast, _, root) = parse_src(src, ParseMode::Program).unwrap();
            let stmts = match ast.kind(root) {
                NodeKind::Program { stmts } => stmts.clone(),
                _ => panic!(),
            };
            match ast.kind(stmts[0]) {
                NodeKind::TryCatchStmt { arg: Some(_), .. } => {}
                other => panic!("expected try-catch with binding, got {:?}", other),
            }
        }
    }

    #[test]
    fn builtins_resolve_when_undeclared() {
        let (ast, _, root) = parse_src("get_ios()", ParseMode::Expression).unwrap();
        match ast.kind(root) {
            NodeKind::Funcall { callee, .. } => {
                assert!(matches!(ast.kind(*callee), NodeKind::BuiltinRef { .. }));
            }
            other => panic!("expected a funcall, got {:?}", other),
        }
    }
}
