//! Abstract syntax tree
//!
//! The AST is an arena: every node is owned by the [`Ast`] container
//! and addressed by a [`NodeId`] handle. Shared children (notably
//! type nodes, which declarations hand out to every use site) are
//! plain handles; back-edges that would form cycles in an ownership
//! graph (a variable's enclosing function, a return's function, a
//! break's loop) are handles too and never imply ownership. The
//! whole tree is freed in bulk when the container drops.
//!
//! Each node carries a monotonically increasing uid, a source
//! location, a type handle filled in by the type inference phase,
//! and a literal flag driven by the constant folder.

use std::fmt;

/// Handle into the AST arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Source location, 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Loc {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Operator codes for expression nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    BNot,
    Shl,
    Shr,
    BConc,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Neg,
    Pos,
    In,
    Sizeof,
    Typeof,
    Attr,
}

impl Op {
    pub fn is_binary(self) -> bool {
        !matches!(
            self,
            Op::Not | Op::Neg | Op::Pos | Op::BNot | Op::Sizeof | Op::Typeof
        )
    }
}

/// Attribute codes, resolved from `'name` identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    Size,
    Length,
    Signed,
    Magnitude,
    Unit,
    Offset,
    Mapped,
    Strict,
    Ios,
    Elem,
    EOffset,
    ESize,
    EName,
}

impl Attr {
    pub fn from_name(name: &str) -> Option<Attr> {
        Some(match name {
            "size" => Attr::Size,
            "length" => Attr::Length,
            "signed" => Attr::Signed,
            "magnitude" => Attr::Magnitude,
            "unit" => Attr::Unit,
            "offset" => Attr::Offset,
            "mapped" => Attr::Mapped,
            "strict" => Attr::Strict,
            "ios" => Attr::Ios,
            "elem" => Attr::Elem,
            "eoffset" => Attr::EOffset,
            "esize" => Attr::ESize,
            "ename" => Attr::EName,
            _ => return None,
        })
    }

    /// Whether the attribute takes an index argument.
    pub fn takes_index(self) -> bool {
        matches!(self, Attr::Elem | Attr::EOffset | Attr::ESize | Attr::EName)
    }
}

/// Kinds of declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Var,
    Type,
    Func,
    Unit,
}

/// Intrinsic functions provided by the VM rather than user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Open,
    Close,
    Flush,
    GetIos,
    SetIos,
    IoSize,
    GetEndian,
    SetEndian,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "open" => Builtin::Open,
            "close" => Builtin::Close,
            "flush" => Builtin::Flush,
            "get_ios" => Builtin::GetIos,
            "set_ios" => Builtin::SetIos,
            "iosize" => Builtin::IoSize,
            "get_endian" => Builtin::GetEndian,
            "set_endian" => Builtin::SetEndian,
            _ => return None,
        })
    }
}

/// One piece of a processed format string.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatPart {
    Lit(String),
    /// `%iN` / `%uN`
    Int { size: u32, signed: bool },
    /// `%s`
    Str,
    /// `%c`
    Char,
    /// `%v`: any value, printed with the VM output parameters.
    Val,
}

/// Completeness of a type: whether its bit size is a compile-time
/// constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Complete {
    #[default]
    Unknown,
    Yes,
    No,
}

/// Type node payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// A use of a declared type. `referent` is the declared type
    /// node; the lexical address locates the run-time slot holding
    /// the type value, so generated code reuses the value bound at
    /// the declaration (and with it any closures captured there).
    Named {
        back: u32,
        over: u32,
        referent: NodeId,
    },
    Integral {
        size: u32,
        signed: bool,
    },
    StrT,
    Void,
    Any,
    Array {
        etype: NodeId,
        bound: Option<NodeId>,
    },
    Struct {
        /// `StructTypeField` nodes.
        fields: Vec<NodeId>,
        /// Method declarations (`Decl` of kind `Func`).
        methods: Vec<NodeId>,
        pinned: bool,
        union_p: bool,
        /// Integral structs: the integral type they amount to.
        itype: Option<NodeId>,
        /// Declared name; anonymous struct types have none and are
        /// never equal to anything, themselves included.
        name: Option<String>,
    },
    Function {
        rtype: NodeId,
        /// `FuncTypeArg` nodes.
        args: Vec<NodeId>,
    },
    Offset {
        base: NodeId,
        /// An `Integer` node in bits, or (before trans2) a type
        /// node used as a unit.
        unit: NodeId,
    },
}

/// Node payloads. One variant per node code.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Program {
        stmts: Vec<NodeId>,
    },
    Identifier {
        name: String,
    },
    Integer {
        value: i64,
    },
    Str {
        value: String,
    },
    Exp {
        op: Op,
        operands: Vec<NodeId>,
        attr: Option<Attr>,
    },
    CondExp {
        cond: NodeId,
        then_e: NodeId,
        else_e: NodeId,
    },
    Cast {
        ty: NodeId,
        exp: NodeId,
    },
    Isa {
        ty: NodeId,
        exp: NodeId,
    },
    Map {
        strict: bool,
        ty: NodeId,
        ios: Option<NodeId>,
        offset: NodeId,
    },
    ArrayLit {
        /// `ArrayInitializer` nodes.
        initializers: Vec<NodeId>,
    },
    ArrayInitializer {
        index: Option<NodeId>,
        exp: NodeId,
    },
    Indexer {
        container: NodeId,
        index: NodeId,
    },
    Trimmer {
        container: NodeId,
        from: Option<NodeId>,
        to: Option<NodeId>,
        addend: Option<NodeId>,
    },
    StructCons {
        ty: NodeId,
        /// `StructField` nodes.
        fields: Vec<NodeId>,
    },
    StructField {
        name: Option<String>,
        exp: NodeId,
    },
    StructRef {
        sct: NodeId,
        name: String,
    },
    Offset {
        magnitude: Option<NodeId>,
        unit: NodeId,
    },
    Funcall {
        callee: NodeId,
        /// `FuncallArg` nodes.
        args: Vec<NodeId>,
        /// Index of the first actual falling into a vararg tail.
        vararg_from: Option<u32>,
    },
    FuncallArg {
        exp: NodeId,
        name: Option<String>,
    },
    Var {
        name: String,
        /// The declaration this reference resolved to. A back-edge;
        /// not owned.
        decl: NodeId,
        back: u32,
        over: u32,
        /// Enclosing function, filled by trans1. A back-edge.
        function: Option<NodeId>,
        /// Lexical depth of the reference relative to the enclosing
        /// function's frame.
        fn_back: u32,
    },
    Lambda {
        func: NodeId,
    },
    Format {
        raw: String,
        /// Filled by trans1 from `raw`.
        parts: Vec<FormatPart>,
        args: Vec<NodeId>,
    },
    IncrDecr {
        exp: NodeId,
        /// +1 or -1.
        delta: i32,
    },
    BuiltinRef {
        which: Builtin,
    },
    Type(TypeKind),
    StructTypeField {
        name: Option<String>,
        ty: NodeId,
        label: Option<NodeId>,
        optcond: Option<NodeId>,
        /// Endianness recorded from an enclosing big/little scope.
        msb: Option<bool>,
    },
    FuncTypeArg {
        ty: NodeId,
        optional: bool,
        vararg: bool,
    },
    Func {
        /// None means void.
        rtype: Option<NodeId>,
        /// `FuncArg` nodes.
        args: Vec<NodeId>,
        body: NodeId,
        nargs: u32,
        first_opt: Option<u32>,
        vararg: bool,
        method_p: bool,
    },
    FuncArg {
        name: String,
        ty: NodeId,
        initial: Option<NodeId>,
        vararg: bool,
    },
    Decl {
        kind: DeclKind,
        name: String,
        initial: NodeId,
        /// Frame-local ordinal assigned by the environment.
        order: u32,
    },
    CompStmt {
        stmts: Vec<NodeId>,
        /// Number of declarations directly in this statement;
        /// sizes the run-time frame.
        num_decls: u32,
    },
    NullStmt,
    AssStmt {
        lhs: NodeId,
        exp: NodeId,
    },
    IfStmt {
        cond: NodeId,
        then_s: NodeId,
        else_s: Option<NodeId>,
    },
    LoopStmt {
        /// While-condition, when present.
        cond: Option<NodeId>,
        /// `LoopIterator`, for for-in loops.
        iterator: Option<NodeId>,
        /// Selector condition of a for-in (`where` clause).
        selector: Option<NodeId>,
        body: NodeId,
    },
    LoopIterator {
        decl: NodeId,
        container: NodeId,
    },
    ReturnStmt {
        exp: Option<NodeId>,
        /// Enclosing function. A back-edge, filled by trans1.
        function: Option<NodeId>,
    },
    ExpStmt {
        exp: NodeId,
    },
    TryCatchStmt {
        body: NodeId,
        /// `Decl` for the caught exception, when bound.
        arg: Option<NodeId>,
        filter: Option<NodeId>,
        handler: NodeId,
    },
    TryUntilStmt {
        body: NodeId,
        exp: NodeId,
    },
    PrintStmt {
        /// Simple `print EXPR;`.
        exp: Option<NodeId>,
        /// `printf FMT, ARGS;` carries a `Format` node instead.
        format: Option<NodeId>,
    },
    BreakStmt {
        /// Enclosing loop. A back-edge, filled by trans1.
        target: Option<NodeId>,
    },
    ContinueStmt {
        target: Option<NodeId>,
    },
    RaiseStmt {
        exp: Option<NodeId>,
    },
}

/// One AST node.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub uid: u32,
    pub loc: Loc,
    /// Type handle, filled by typify1 for expressions.
    pub ty: Option<NodeId>,
    /// Whether the node is a literal (constant) expression.
    pub literal_p: bool,
    /// Completeness annotation for type nodes.
    pub complete: Complete,
}

/// The AST container: an arena of nodes plus the uid counter.
#[derive(Debug, Default)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Ast {
        Ast::default()
    }

    pub fn add(&mut self, kind: NodeKind, loc: Loc) -> NodeId {
        let uid = self.nodes.len() as u32;
        self.nodes.push(Node {
            kind,
            uid,
            loc,
            ty: None,
            literal_p: false,
            complete: Complete::Unknown,
        });
        NodeId(uid)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn loc(&self, id: NodeId) -> Loc {
        self.node(id).loc
    }

    pub fn ty(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ty
    }

    pub fn set_ty(&mut self, id: NodeId, ty: NodeId) {
        self.node_mut(id).ty = Some(ty);
    }

    pub fn is_literal(&self, id: NodeId) -> bool {
        self.node(id).literal_p
    }

    pub fn set_literal(&mut self, id: NodeId, literal: bool) {
        self.node_mut(id).literal_p = literal;
    }

    /// Make an integer literal with an attached integral type.
    pub fn make_integer(&mut self, loc: Loc, value: i64, size: u32, signed: bool) -> NodeId {
        let ty = self.add(NodeKind::Type(TypeKind::Integral { size, signed }), loc);
        let n = self.add(NodeKind::Integer { value }, loc);
        self.set_ty(n, ty);
        self.set_literal(n, true);
        n
    }

    /// Children of a node, in traversal order. Type subtrees come
    /// last so the driver can skip them when the pass does not
    /// request them. Back-edges are not children.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        use NodeKind::*;
        let mut out = Vec::new();
        match &self.node(id).kind {
            Program { stmts } => out.extend(stmts),
            Identifier { .. } | Integer { .. } | Str { .. } | NullStmt | BuiltinRef { .. } => {}
            Exp { operands, .. } => out.extend(operands),
            CondExp {
                cond,
                then_e,
                else_e,
            } => out.extend([*cond, *then_e, *else_e]),
            Cast { ty, exp } | Isa { ty, exp } => out.extend([*ty, *exp]),
            Map {
                ty, ios, offset, ..
            } => {
                out.push(*ty);
                out.extend(ios);
                out.push(*offset);
            }
            ArrayLit { initializers } => out.extend(initializers),
            ArrayInitializer { index, exp } => {
                out.extend(index);
                out.push(*exp);
            }
            Indexer { container, index } => out.extend([*container, *index]),
            Trimmer {
                container,
                from,
                to,
                addend,
            } => {
                out.push(*container);
                out.extend(from);
                out.extend(to);
                out.extend(addend);
            }
            StructCons { ty, fields } => {
                out.push(*ty);
                out.extend(fields);
            }
            StructField { exp, .. } => out.push(*exp),
            StructRef { sct, .. } => out.push(*sct),
            Offset { magnitude, unit } => {
                out.extend(magnitude);
                out.push(*unit);
            }
            Funcall { callee, args, .. } => {
                out.push(*callee);
                out.extend(args);
            }
            FuncallArg { exp, .. } => out.push(*exp),
            Var { .. } => {}
            Lambda { func } => out.push(*func),
            Format { args, .. } => out.extend(args),
            IncrDecr { exp, .. } => out.push(*exp),
            Type(t) => match t {
                // The referent belongs to its declaration, which
                // already processed it.
                TypeKind::Named { .. } => {}
                TypeKind::Integral { .. }
                | TypeKind::StrT
                | TypeKind::Void
                | TypeKind::Any => {}
                TypeKind::Array { etype, bound } => {
                    out.push(*etype);
                    out.extend(bound);
                }
                TypeKind::Struct {
                    fields,
                    methods,
                    itype,
                    ..
                } => {
                    out.extend(fields);
                    out.extend(methods);
                    out.extend(itype);
                }
                TypeKind::Function { rtype, args } => {
                    out.extend(args);
                    out.push(*rtype);
                }
                TypeKind::Offset { base, unit } => out.extend([*base, *unit]),
            },
            StructTypeField {
                ty,
                label,
                optcond,
                ..
            } => {
                out.push(*ty);
                out.extend(label);
                out.extend(optcond);
            }
            FuncTypeArg { ty, .. } => out.push(*ty),
            Func {
                rtype, args, body, ..
            } => {
                out.extend(args);
                out.extend(rtype);
                out.push(*body);
            }
            FuncArg { ty, initial, .. } => {
                out.push(*ty);
                out.extend(initial);
            }
            Decl { initial, .. } => out.push(*initial),
            CompStmt { stmts, .. } => out.extend(stmts),
            AssStmt { lhs, exp } => out.extend([*lhs, *exp]),
            IfStmt {
                cond,
                then_s,
                else_s,
            } => {
                out.push(*cond);
                out.push(*then_s);
                out.extend(else_s);
            }
            LoopStmt {
                cond,
                iterator,
                selector,
                body,
            } => {
                out.extend(iterator);
                out.extend(cond);
                out.extend(selector);
                out.push(*body);
            }
            LoopIterator { decl, container } => out.extend([*decl, *container]),
            ReturnStmt { exp, .. } => out.extend(exp),
            ExpStmt { exp } => out.push(*exp),
            TryCatchStmt {
                body,
                arg,
                filter,
                handler,
            } => {
                out.push(*body);
                out.extend(arg);
                out.extend(filter);
                out.push(*handler);
            }
            TryUntilStmt { body, exp } => out.extend([*body, *exp]),
            PrintStmt { exp, format } => {
                out.extend(exp);
                out.extend(format);
            }
            BreakStmt { .. } | ContinueStmt { .. } => {}
            RaiseStmt { exp } => out.extend(exp),
        }
        out
    }

    pub fn is_type(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Type(_))
    }

    /* Type predicates and operations.  */

    /// The kind of a type node. References to declared types are
    /// followed, so callers always see the structural kind.
    pub fn type_kind(&self, id: NodeId) -> Option<&TypeKind> {
        match &self.node(id).kind {
            NodeKind::Type(TypeKind::Named { referent, .. }) => self.type_kind(*referent),
            NodeKind::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn type_is_integral(&self, id: NodeId) -> bool {
        matches!(self.type_kind(id), Some(TypeKind::Integral { .. }))
    }

    pub fn type_is_offset(&self, id: NodeId) -> bool {
        matches!(self.type_kind(id), Some(TypeKind::Offset { .. }))
    }

    pub fn type_is_string(&self, id: NodeId) -> bool {
        matches!(self.type_kind(id), Some(TypeKind::StrT))
    }

    pub fn type_is_array(&self, id: NodeId) -> bool {
        matches!(self.type_kind(id), Some(TypeKind::Array { .. }))
    }

    pub fn type_is_void(&self, id: NodeId) -> bool {
        matches!(self.type_kind(id), Some(TypeKind::Void))
    }

    pub fn type_is_any(&self, id: NodeId) -> bool {
        matches!(self.type_kind(id), Some(TypeKind::Any))
    }

    /// Integral structs are structs declared with an itype.
    pub fn type_integral_struct_itype(&self, id: NodeId) -> Option<NodeId> {
        match self.type_kind(id) {
            Some(TypeKind::Struct { itype, .. }) => *itype,
            _ => None,
        }
    }

    /// Whether two type nodes denote the same type.
    ///
    /// - `any` equals `any`; integral types by size and sign;
    /// - arrays by element type, plus bound equality when both
    ///   bounds are constant;
    /// - named structs by name, anonymous structs never;
    /// - functions per-argument (optionality, vararg and types);
    /// - offsets when base types are equal and the units are equal
    ///   integer literals;
    /// - `string` equals only `string`.
    pub fn type_equal_p(&self, a: NodeId, b: NodeId) -> bool {
        let (ta, tb) = match (self.type_kind(a), self.type_kind(b)) {
            (Some(ta), Some(tb)) => (ta, tb),
            _ => return false,
        };
        match (ta, tb) {
            (TypeKind::Any, TypeKind::Any) => true,
            (TypeKind::Void, TypeKind::Void) => true,
            (TypeKind::StrT, TypeKind::StrT) => true,
            (
                TypeKind::Integral { size: sa, signed: ga },
                TypeKind::Integral { size: sb, signed: gb },
            ) => sa == sb && ga == gb,
            (
                TypeKind::Array { etype: ea, bound: ba },
                TypeKind::Array { etype: eb, bound: bb },
            ) => {
                if let (Some(ba), Some(bb)) = (ba, bb) {
                    if let (Some(na), Some(nb)) =
                        (self.integer_value(*ba), self.integer_value(*bb))
                    {
                        if na != nb {
                            return false;
                        }
                    }
                }
                self.type_equal_p(*ea, *eb)
            }
            (TypeKind::Struct { name: na, .. }, TypeKind::Struct { name: nb, .. }) => {
                match (na, nb) {
                    (Some(na), Some(nb)) => na == nb,
                    _ => false,
                }
            }
            (
                TypeKind::Function { rtype: ra, args: aa },
                TypeKind::Function { rtype: rb, args: ab },
            ) => {
                if aa.len() != ab.len() || !self.type_equal_p(*ra, *rb) {
                    return false;
                }
                aa.iter().zip(ab).all(|(x, y)| {
                    let (xo, xv, xt) = self.func_type_arg(*x);
                    let (yo, yv, yt) = self.func_type_arg(*y);
                    xo == yo && xv == yv && self.type_equal_p(xt, yt)
                })
            }
            (
                TypeKind::Offset { base: ba, unit: ua },
                TypeKind::Offset { base: bb, unit: ub },
            ) => {
                let (ua, ub) = match (self.integer_value(*ua), self.integer_value(*ub)) {
                    (Some(ua), Some(ub)) => (ua, ub),
                    // Units not known yet (identifiers or types); no
                    // equality can be guaranteed.
                    _ => return false,
                };
                ua == ub && self.type_equal_p(*ba, *bb)
            }
            _ => false,
        }
    }

    fn func_type_arg(&self, id: NodeId) -> (bool, bool, NodeId) {
        match &self.node(id).kind {
            NodeKind::FuncTypeArg {
                ty,
                optional,
                vararg,
            } => (*optional, *vararg, *ty),
            _ => (false, false, id),
        }
    }

    /// Whether `from` is promoteable to `to`. Reflexive but not
    /// commutative.
    pub fn type_promoteable_p(&self, from: NodeId, to: NodeId, promote_array_of_any: bool) -> bool {
        if self.type_equal_p(from, to) {
            return true;
        }
        // Void promotes to nothing; anything else promotes to any.
        if self.type_is_void(from) {
            return false;
        }
        if self.type_is_any(to) {
            return true;
        }
        if self.type_is_integral(from) && self.type_is_integral(to) {
            return true;
        }
        if self.type_is_offset(from) && self.type_is_offset(to) {
            return true;
        }
        if let (
            Some(TypeKind::Array { etype: fe, bound: fb }),
            Some(TypeKind::Array { etype: te, bound: tb }),
        ) = (self.type_kind(from), self.type_kind(to))
        {
            if promote_array_of_any && self.type_is_any(*te) {
                return true;
            }
            if !self.type_equal_p(*fe, *te) {
                return false;
            }
            // A constant target bound must be matched exactly.
            if let Some(tb) = tb {
                if let Some(tn) = self.integer_value(*tb) {
                    match fb.and_then(|fb| self.integer_value(fb)) {
                        Some(fn_) if fn_ == tn => {}
                        _ => return false,
                    }
                }
            }
            return true;
        }
        // An integral struct promotes to integral types.
        if self.type_integral_struct_itype(from).is_some() && self.type_is_integral(to) {
            return true;
        }
        false
    }

    /// Whether values of the type can be mapped in IO.
    pub fn type_mappable_p(&self, id: NodeId) -> bool {
        match self.type_kind(id) {
            Some(TypeKind::Integral { .. })
            | Some(TypeKind::StrT)
            | Some(TypeKind::Offset { .. }) => true,
            Some(TypeKind::Array { etype, .. }) => self.type_mappable_p(*etype),
            Some(TypeKind::Struct { fields, .. }) => fields.iter().all(|f| {
                match &self.node(*f).kind {
                    NodeKind::StructTypeField { ty, .. } => self.type_mappable_p(*ty),
                    _ => true,
                }
            }),
            _ => false,
        }
    }

    /// The literal value of an `Integer` node.
    pub fn integer_value(&self, id: NodeId) -> Option<i64> {
        match &self.node(id).kind {
            NodeKind::Integer { value } => Some(*value),
            _ => None,
        }
    }

    /// The constant bit value of an offset-literal node
    /// (magnitude times unit, both integer literals).
    pub fn offset_bits(&self, id: NodeId) -> Option<u64> {
        match &self.node(id).kind {
            NodeKind::Offset { magnitude, unit } => {
                let mag = self.integer_value((*magnitude)?)?;
                let unit = self.integer_value(*unit)?;
                Some(mag as u64 * unit as u64)
            }
            _ => None,
        }
    }

    /// Whether the type's bit size is a compile-time constant. The
    /// children are assumed to carry correct annotations already.
    pub fn type_is_complete(&self, id: NodeId) -> Complete {
        match self.type_kind(id) {
            // type_kind resolves named references.
            Some(TypeKind::Named { .. }) => Complete::No,
            Some(TypeKind::Integral { .. })
            | Some(TypeKind::Offset { .. })
            | Some(TypeKind::Function { .. }) => Complete::Yes,
            Some(TypeKind::Any) | Some(TypeKind::Void) | Some(TypeKind::StrT) => Complete::No,
            Some(TypeKind::Struct {
                fields, union_p, ..
            }) => {
                let mut complete = Complete::Yes;
                for field in fields {
                    if let NodeKind::StructTypeField {
                        ty,
                        label,
                        optcond,
                        ..
                    } = &self.node(*field).kind
                    {
                        let label_constant = match label {
                            None => true,
                            Some(l) => self.offset_bits(*l).is_some(),
                        };
                        if !label_constant
                            || optcond.is_some()
                            || self.type_is_complete(*ty) == Complete::No
                        {
                            complete = Complete::No;
                            break;
                        }
                    }
                }
                // A union with complete fields is complete only if
                // every alternative has the same size.
                if complete == Complete::Yes && *union_p {
                    let mut size: Option<u64> = None;
                    for field in fields {
                        if let NodeKind::StructTypeField { ty, .. } = &self.node(*field).kind {
                            let fsize = self.type_sizeof_bits(*ty);
                            match (size, fsize) {
                                (None, Some(s)) => size = Some(s),
                                (Some(prev), Some(s)) if prev == s => {}
                                _ => {
                                    complete = Complete::No;
                                    break;
                                }
                            }
                        }
                    }
                }
                complete
            }
            Some(TypeKind::Array { etype, bound }) => match bound {
                Some(bound)
                    if self.is_literal(*bound)
                        && (self.integer_value(*bound).is_some()
                            || self.offset_bits(*bound).is_some()) =>
                {
                    self.type_is_complete(*etype)
                }
                _ => Complete::No,
            },
            None => Complete::No,
        }
    }

    /// The size in bits of a complete type: integrals their width,
    /// offsets their base width, arrays bound times element size,
    /// structs by layout (pinned takes the max, labeled fields
    /// extend to label plus size, plain fields accumulate),
    /// functions zero.
    pub fn type_sizeof_bits(&self, id: NodeId) -> Option<u64> {
        match self.type_kind(id)? {
            TypeKind::Integral { size, .. } => Some(*size as u64),
            TypeKind::Offset { base, .. } => self.type_sizeof_bits(*base),
            TypeKind::Function { .. } => Some(0),
            TypeKind::Array { etype, bound } => {
                let bound = (*bound)?;
                let esize = self.type_sizeof_bits(*etype)?;
                if let Some(n) = self.integer_value(bound) {
                    Some(n as u64 * esize)
                } else {
                    // An offset bound gives the array size directly.
                    self.offset_bits(bound)
                }
            }
            TypeKind::Struct {
                fields, pinned, ..
            } => {
                let mut accum = 0u64;
                for field in fields {
                    if let NodeKind::StructTypeField { ty, label, .. } = &self.node(*field).kind {
                        let fsize = self.type_sizeof_bits(*ty)?;
                        if *pinned {
                            accum = accum.max(fsize);
                        } else if let Some(label) = label {
                            let label_bits = self.offset_bits(*label)?;
                            accum = accum.max(label_bits + fsize);
                        } else {
                            accum += fsize;
                        }
                    }
                }
                Some(accum)
            }
            TypeKind::StrT | TypeKind::Void | TypeKind::Any | TypeKind::Named { .. } => None,
        }
    }

    /// Structural copy of a type subtree. Shared children of
    /// non-type kinds (bound expressions, labels) stay shared.
    pub fn dup_type(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id).clone();
        let kind = match node.kind {
            NodeKind::Type(TypeKind::Array { etype, bound }) => {
                let etype = self.dup_type(etype);
                NodeKind::Type(TypeKind::Array { etype, bound })
            }
            NodeKind::Type(TypeKind::Offset { base, unit }) => {
                let base = self.dup_type(base);
                NodeKind::Type(TypeKind::Offset { base, unit })
            }
            other => other,
        };
        let new = self.add(kind, node.loc);
        self.node_mut(new).ty = node.ty;
        self.node_mut(new).literal_p = node.literal_p;
        self.node_mut(new).complete = node.complete;
        new
    }

    /* Fresh type node constructors, used by the phases.  */

    pub fn make_integral_type(&mut self, loc: Loc, size: u32, signed: bool) -> NodeId {
        self.add(NodeKind::Type(TypeKind::Integral { size, signed }), loc)
    }

    pub fn make_string_type(&mut self, loc: Loc) -> NodeId {
        self.add(NodeKind::Type(TypeKind::StrT), loc)
    }

    pub fn make_any_type(&mut self, loc: Loc) -> NodeId {
        self.add(NodeKind::Type(TypeKind::Any), loc)
    }

    /// An offset type with the given base and a constant unit in
    /// bits.
    pub fn make_offset_type_bits(&mut self, loc: Loc, base: NodeId, unit_bits: u64) -> NodeId {
        let unit = self.make_integer(loc, unit_bits as i64, 64, false);
        self.add(NodeKind::Type(TypeKind::Offset { base, unit }), loc)
    }

    /// The canonical size type: offset<uint<64>,1>.
    pub fn make_offset_u64_b1(&mut self, loc: Loc) -> NodeId {
        let base = self.make_integral_type(loc, 64, false);
        self.make_offset_type_bits(loc, base, 1)
    }

    /// The constant bit value of an offset-unit node: an integer
    /// literal, or a complete type used as a unit.
    pub fn unit_bits(&self, unit: NodeId) -> Option<u64> {
        if let Some(v) = self.integer_value(unit) {
            return Some(v as u64);
        }
        if self.is_type(unit) {
            return self.type_sizeof_bits(unit);
        }
        None
    }

    /// A short printable name for diagnostics.
    pub fn type_name(&self, id: NodeId) -> String {
        match self.type_kind(id) {
            Some(TypeKind::Integral { size, signed }) => {
                format!("{}int<{}>", if *signed { "" } else { "u" }, size)
            }
            Some(TypeKind::StrT) => "string".to_string(),
            Some(TypeKind::Void) => "void".to_string(),
            Some(TypeKind::Any) => "any".to_string(),
            Some(TypeKind::Array { etype, .. }) => format!("{}[]", self.type_name(*etype)),
            Some(TypeKind::Struct { name, .. }) => name
                .clone()
                .unwrap_or_else(|| "struct {...}".to_string()),
            Some(TypeKind::Function { .. }) => "function".to_string(),
            Some(TypeKind::Offset { base, unit }) => {
                let unit = self
                    .integer_value(*unit)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("offset<{},{}>", self.type_name(*base), unit)
            }
            Some(TypeKind::Named { referent, .. }) => self.type_name(*referent),
            None => "<no type>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn itype(ast: &mut Ast, size: u32, signed: bool) -> NodeId {
        ast.add(
            NodeKind::Type(TypeKind::Integral { size, signed }),
            Loc::default(),
        )
    }

    #[test]
    fn integral_equality_is_size_and_sign() {
        let mut ast = Ast::new();
        let a = itype(&mut ast, 32, true);
        let b = itype(&mut ast, 32, true);
        let c = itype(&mut ast, 32, false);
        let d = itype(&mut ast, 16, true);
        assert!(ast.type_equal_p(a, b));
        assert!(!ast.type_equal_p(a, c));
        assert!(!ast.type_equal_p(a, d));
    }

    #[test]
    fn array_equality_checks_constant_bounds() {
        let mut ast = Ast::new();
        let e = itype(&mut ast, 8, false);
        let three = ast.make_integer(Loc::default(), 3, 64, false);
        let four = ast.make_integer(Loc::default(), 4, 64, false);
        let a3 = ast.add(
            NodeKind::Type(TypeKind::Array {
                etype: e,
                bound: Some(three),
            }),
            Loc::default(),
        );
        let a4 = ast.add(
            NodeKind::Type(TypeKind::Array {
                etype: e,
                bound: Some(four),
            }),
            Loc::default(),
        );
        let an = ast.add(
            NodeKind::Type(TypeKind::Array {
                etype: e,
                bound: None,
            }),
            Loc::default(),
        );
        assert!(!ast.type_equal_p(a3, a4));
        // A non-constant bound leaves the length check to runtime.
        assert!(ast.type_equal_p(a3, an));
        assert!(ast.type_equal_p(an, a3));
    }

    #[test]
    fn anonymous_structs_are_never_equal() {
        let mut ast = Ast::new();
        let anon = ast.add(
            NodeKind::Type(TypeKind::Struct {
                fields: vec![],
                methods: vec![],
                pinned: false,
                union_p: false,
                itype: None,
                name: None,
            }),
            Loc::default(),
        );
        assert!(!ast.type_equal_p(anon, anon));
    }

    #[test]
    fn equality_is_symmetric_and_transitive() {
        let mut ast = Ast::new();
        let e = itype(&mut ast, 16, false);
        let three = ast.make_integer(Loc::default(), 3, 64, false);
        let mk = |ast: &mut Ast, bound: Option<NodeId>| {
            ast.add(
                NodeKind::Type(TypeKind::Array { etype: e, bound }),
                Loc::default(),
            )
        };
        let t = mk(&mut ast, Some(three));
        let u = mk(&mut ast, None);
        let v = mk(&mut ast, Some(three));
        for (a, b) in [(t, u), (u, v), (t, v)] {
            assert!(ast.type_equal_p(a, a));
            assert_eq!(ast.type_equal_p(a, b), ast.type_equal_p(b, a));
        }
        // Promotability is reflexive and transitive on integrals.
        let i8t = itype(&mut ast, 8, true);
        let i16t = itype(&mut ast, 16, true);
        let i32t = itype(&mut ast, 32, true);
        assert!(ast.type_promoteable_p(i8t, i16t, false));
        assert!(ast.type_promoteable_p(i16t, i32t, false));
        assert!(ast.type_promoteable_p(i8t, i32t, false));
    }

    #[test]
    fn promotion_is_reflexive_and_integral_wide() {
        let mut ast = Ast::new();
        let i8t = itype(&mut ast, 8, true);
        let u64t = itype(&mut ast, 64, false);
        let s = ast.add(NodeKind::Type(TypeKind::StrT), Loc::default());
        let any = ast.add(NodeKind::Type(TypeKind::Any), Loc::default());
        let void = ast.add(NodeKind::Type(TypeKind::Void), Loc::default());
        assert!(ast.type_promoteable_p(i8t, i8t, false));
        assert!(ast.type_promoteable_p(i8t, u64t, false));
        assert!(ast.type_promoteable_p(u64t, i8t, false));
        assert!(ast.type_promoteable_p(s, any, false));
        assert!(!ast.type_promoteable_p(void, any, false));
        assert!(!ast.type_promoteable_p(s, i8t, false));
    }

    #[test]
    fn sizeof_struct_layouts() {
        let mut ast = Ast::new();
        let i8t = itype(&mut ast, 8, false);
        let i16t = itype(&mut ast, 16, false);
        let mk_field = |ast: &mut Ast, ty, label: Option<NodeId>| {
            ast.add(
                NodeKind::StructTypeField {
                    name: Some("f".to_string()),
                    ty,
                    label,
                    optcond: None,
                    msb: None,
                },
                Loc::default(),
            )
        };
        // Ordinary struct: sizes accumulate.
        let f1 = mk_field(&mut ast, i8t, None);
        let f2 = mk_field(&mut ast, i16t, None);
        let plain = ast.add(
            NodeKind::Type(TypeKind::Struct {
                fields: vec![f1, f2],
                methods: vec![],
                pinned: false,
                union_p: false,
                itype: None,
                name: Some("S".to_string()),
            }),
            Loc::default(),
        );
        assert_eq!(ast.type_sizeof_bits(plain), Some(24));

        // Pinned struct: the max field size.
        let f1 = mk_field(&mut ast, i8t, None);
        let f2 = mk_field(&mut ast, i16t, None);
        let pinned = ast.add(
            NodeKind::Type(TypeKind::Struct {
                fields: vec![f1, f2],
                methods: vec![],
                pinned: true,
                union_p: false,
                itype: None,
                name: Some("P".to_string()),
            }),
            Loc::default(),
        );
        assert_eq!(ast.type_sizeof_bits(pinned), Some(16));

        // Labeled field: max(accum, label + size).
        let mag = ast.make_integer(Loc::default(), 4, 64, false);
        let unit = ast.make_integer(Loc::default(), 8, 64, false);
        let label = ast.add(
            NodeKind::Offset {
                magnitude: Some(mag),
                unit,
            },
            Loc::default(),
        );
        let f1 = mk_field(&mut ast, i8t, None);
        let f2 = mk_field(&mut ast, i16t, Some(label));
        let labeled = ast.add(
            NodeKind::Type(TypeKind::Struct {
                fields: vec![f1, f2],
                methods: vec![],
                pinned: false,
                union_p: false,
                itype: None,
                name: Some("L".to_string()),
            }),
            Loc::default(),
        );
        assert_eq!(ast.type_sizeof_bits(labeled), Some(48));
    }

    #[test]
    fn completeness_rules() {
        let mut ast = Ast::new();
        let i32t = itype(&mut ast, 32, true);
        let s = ast.add(NodeKind::Type(TypeKind::StrT), Loc::default());
        assert_eq!(ast.type_is_complete(i32t), Complete::Yes);
        assert_eq!(ast.type_is_complete(s), Complete::No);

        let bound = ast.make_integer(Loc::default(), 10, 64, false);
        let arr = ast.add(
            NodeKind::Type(TypeKind::Array {
                etype: i32t,
                bound: Some(bound),
            }),
            Loc::default(),
        );
        assert_eq!(ast.type_is_complete(arr), Complete::Yes);
        assert_eq!(ast.type_sizeof_bits(arr), Some(320));

        let unbounded = ast.add(
            NodeKind::Type(TypeKind::Array {
                etype: i32t,
                bound: None,
            }),
            Loc::default(),
        );
        assert_eq!(ast.type_is_complete(unbounded), Complete::No);
    }
}
