//! PVM programs
//!
//! A program is a linear sequence of instructions addressable by
//! program point. Instructions carry their operands inline: value
//! immediates, register indexes, label ids, or small constants fixed
//! at code generation time (widths, field names, lexical addresses).
//!
//! Labels are allocated while generating code and resolved to
//! program points by [`Program::make_executable`], which must run
//! before the program is handed to the VM.

use std::fmt;

use crate::value::Value;

/// A label id, local to one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// A VM register index.
pub type Reg = u8;

/// The PVM instruction set.
///
/// Stack effects are noted as `[deepest .. top] -> [..]`.
#[derive(Debug, Clone)]
pub enum Insn {
    Nop,

    /* Stack manipulation.  */
    /// `[] -> [v]`
    Push(Value),
    Drop,
    /// `[a] -> [a a]`
    Dup,
    /// `[a b] -> [b a]`
    Swap,
    /// `[a b c] -> [b c a]`
    Rot,
    /// `[a b] -> [a b a]`
    Over,
    /// `[] -> [r]`
    PushR(Reg),
    /// `[v] -> []`, stores into register
    PopR(Reg),

    /* Environment.  */
    /// Push a frame sized by the hint.
    PushF(u32),
    PopF,
    /// `[v] -> []`, binds a new slot in the current frame.
    PopVar,
    PushVar { back: u32, over: u32 },
    /// `[v] -> []`
    SetVar { back: u32, over: u32 },

    /* Control flow.  */
    Jmp(Label),
    /// `[i] -> []`, branch when zero.
    Bz(Label),
    /// `[i] -> []`, branch when non-zero.
    Bnz(Label),
    /// `[args.. cls] -> [args..]`, enters the closure.
    Call,
    /// `[ret] -> [ret]`, leaves the current invocation.
    Return,
    /// `[] -> [cls]`, closure over the current environment.
    MkCls { entry: Label },

    /* Exceptions.  */
    /// Install a handler; records stack and frame depths.
    PushE { handler: Label },
    /// Uninstall the innermost handler.
    PopE,
    /// `[exc] -> []`, unwind to the innermost handler.
    Raise,
    /// Raise a reserved exception code.
    RaiseCode(i32),

    /* Integer arithmetic. Both operands have equal integral types;
    the result keeps that type, wrapping modulo the width.  */
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Mod,
    Neg,
    Pow,
    BAnd,
    BOr,
    BXor,
    BNot,
    Shl,
    Shr,
    /// `[a b] -> [a:::b]`, bit concatenation; sign follows `a`.
    BConc,

    /* Logical operations on 32-bit booleans.  */
    And,
    Or,
    Not,

    /* Comparisons; push an int<32> boolean.  */
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    /* Strings.  */
    SConc,
    /// `[s n] -> [s repeated n times]`
    SMul,
    /// `[i] -> [s]`, rendered in the given base.
    ItoS { base: u32 },
    /// `[c] -> [s]`, a one-character string.
    CtoS,
    /// `[v] -> [s]`, rendered with the VM output parameters.
    VtoS,

    /* Arrays.  */
    /// `[e0 .. en-1 etype] -> [arr]`
    MkArr { nelem: u32 },
    /// `[arr idx] -> [elem]`
    ARef,
    /// `[arr idx v] -> []`, persists when mapped.
    ASet,
    /// `[arr from to] -> [arr[from..to)]`
    ATrim,
    AConc,
    /// `[elem arr] -> [bool]`
    AIn,

    /* Structs.  */
    /// `[f0 .. fn-1 m0 .. mm-1 ty] -> [sct]`; field and method
    /// names fixed at generation time.
    MkSct {
        fields: Vec<Option<String>>,
        methods: Vec<String>,
    },
    /// `[sct] -> [field]`
    Sref(String),
    /// `[sct v] -> []`, persists when mapped.
    SSet(String),

    /* Offsets.  */
    /// `[mag] -> [off]`, unit in bits.
    MkOff { unit: u64 },
    /// `[off] -> [mag]`
    OffMag,
    /// `[off] -> [unit as uint<64>]`
    OffUnit,

    /* Conversions.  */
    /// Integral-to-integral cast.
    IToI { size: u32, signed: bool },
    /// `[arr ty] -> [arr]`, re-checks a constant bound.
    AToA,
    /// `[sct] -> [int]`, recompose an integral struct.
    SToI,
    /// `[v ty] -> [v]`, checked cast from `any`.
    CastAny,
    /// `[v ty] -> [bool]`
    IsA,
    /// `[v] -> [ty]`
    TypOf,

    /* Attributes.  */
    Sizeof,
    ElemsOf,
    AttrOffset,
    AttrMapped,
    AttrStrict,
    AttrIos,
    /// `[v idx] -> [elem as any]`
    AttrElem,
    /// `[v idx] -> [offset]`
    AttrEOffset,
    /// `[v idx] -> [offset]`
    AttrESize,
    /// `[v idx] -> [string]`
    AttrEName,

    /* Type construction.  */
    MkTyI { size: u32, signed: bool },
    MkTyS,
    MkTyV,
    MkTyAny,
    /// `[etype bound?] -> [ty]`
    MkTyA { bounded: bool },
    /// `[base] -> [ty]`
    MkTyO { unit: u64 },
    /// `[fty0 .. ftyn-1 itype? mcls0 .. mclsm-1] -> [ty]`
    MkTySct {
        name: Option<String>,
        /// Field name and constant bit label, per field.
        fields: Vec<(Option<String>, Option<u64>)>,
        methods: Vec<String>,
        pinned: bool,
        union_p: bool,
        integral: bool,
    },
    /// `[at0 .. atn-1 rty] -> [ty]`
    MkTyF { nargs: u32 },

    /* IO.  */
    /// `[handler flags] -> [id]`
    IosOpen,
    /// `[id] -> []`
    IosClose,
    /// `[] -> [id]`
    IosCur,
    /// `[id] -> []`
    IosSetCur,
    /// `[id off] -> []`
    IosFlush,
    /// `[id] -> [size as offset in bytes]`
    IosSize,
    /// `[] -> [endian as int<32>]`, 0 little, 1 big.
    GetEndian,
    /// `[endian] -> []`
    SetEndian,
    /// `[ty ios off] -> [v]`; `ios` may be null for the current one.
    Map { strict: bool },

    /* Output.  */
    /// `[v] -> []`, printed honoring the VM output parameters.
    Print,
    /// `[s] -> []`
    Puts,
}

/// A PVM program.
#[derive(Debug, Default)]
pub struct Program {
    insns: Vec<Insn>,
    /// Label id -> program point.
    label_pcs: Vec<Option<usize>>,
    executable: bool,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    /// Append an instruction, returning its program point.
    pub fn append(&mut self, insn: Insn) -> usize {
        debug_assert!(!self.executable, "appending to an executable program");
        self.insns.push(insn);
        self.insns.len() - 1
    }

    /// Get a fresh, not yet placed label.
    pub fn fresh_label(&mut self) -> Label {
        self.label_pcs.push(None);
        Label(self.label_pcs.len() as u32 - 1)
    }

    /// Place a label at the current end of the program.
    pub fn append_label(&mut self, label: Label) {
        debug_assert!(
            self.label_pcs[label.0 as usize].is_none(),
            "label placed twice"
        );
        self.label_pcs[label.0 as usize] = Some(self.insns.len());
    }

    /// Resolve every label and freeze the program. Must be called
    /// before execution.
    pub fn make_executable(&mut self) -> Result<(), String> {
        for (id, pc) in self.label_pcs.iter().enumerate() {
            match pc {
                Some(pc) if *pc <= self.insns.len() => {}
                Some(pc) => {
                    return Err(format!("label L{} resolves past the program end ({})", id, pc))
                }
                None => return Err(format!("label L{} was never placed", id)),
            }
        }
        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Program point of a placed label.
    pub fn label_pc(&self, label: Label) -> usize {
        self.label_pcs[label.0 as usize].expect("unresolved label in executable program")
    }

    /// The program point of the beginning of the program.
    pub fn beginning(&self) -> usize {
        0
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn fetch(&self, pc: usize) -> Option<&Insn> {
        self.insns.get(pc)
    }

    /// Value immediates embedded in the program. The VM roots these
    /// during collection.
    pub fn immediates(&self) -> impl Iterator<Item = Value> + '_ {
        self.insns.iter().filter_map(|i| match i {
            Insn::Push(v) => Some(*v),
            _ => None,
        })
    }

    /// Render a disassembly listing.
    pub fn disassemble(&self) -> String {
        use fmt::Write;
        let mut out = String::new();
        for (pc, insn) in self.insns.iter().enumerate() {
            for (id, lpc) in self.label_pcs.iter().enumerate() {
                if *lpc == Some(pc) {
                    let _ = writeln!(out, "L{}:", id);
                }
            }
            let _ = writeln!(out, "  {:4} {:?}", pc, insn);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_resolve_to_program_points() {
        let mut p = Program::new();
        let l = p.fresh_label();
        p.append(Insn::Push(Value::NULL));
        p.append(Insn::Jmp(l));
        p.append_label(l);
        p.append(Insn::Drop);
        assert!(p.make_executable().is_ok());
        assert_eq!(p.label_pc(l), 2);
    }

    #[test]
    fn unplaced_labels_fail_make_executable() {
        let mut p = Program::new();
        let l = p.fresh_label();
        p.append(Insn::Jmp(l));
        assert!(p.make_executable().is_err());
    }

    #[test]
    fn immediates_are_enumerable() {
        let mut p = Program::new();
        p.append(Insn::Push(Value::NULL));
        p.append(Insn::Drop);
        assert_eq!(p.immediates().count(), 1);
    }
}
