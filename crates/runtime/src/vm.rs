//! The Poke virtual machine
//!
//! A register-based interpreter over PVM programs: an operand stack,
//! an exception handler stack, a lexical frame chain, a pointer to
//! the current IO space, and the per-VM output and IO parameters
//! (base, output mode, depth, indentation, array cutoff, map
//! display, pretty printing, endianness, negative encoding).
//!
//! Everything that used to be ambient state lives on the [`Vm`]
//! value; every function that touches it takes the VM explicitly.
//!
//! A delivered SIGINT sets a pending flag the interpreter polls
//! between instructions and raises as the `Signal` exception.

use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use poke_core::exception::ExceptionCode;
use poke_core::program::{Insn, Program};
use poke_core::value::{
    truncate, ArrayVal, ClosureVal, Heap, HeapBox, Mapping, StructField, StructVal, TypeField,
    TypeVal, Value,
};
use poke_core::{Frame, RtEnv};

use crate::ios::{Endian, IosError, IosStack, Nenc};

/// Exit code of a program run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok,
    Error,
}

/// Output mode used when printing composite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Omode {
    Flat,
    Tree,
}

/// Print flag: show the mapping attributes of mapped values.
pub const PRINT_F_MAPS: u32 = 1;
/// Print flag: use pretty-printers for struct values.
pub const PRINT_F_PPRINT: u32 = 2;

/// How many instructions run between collection checks.
const GC_PERIOD: u64 = 1 << 16;

/// Why instruction execution stopped early. `Handled` means control
/// already moved to an exception handler; `Uncaught` carries the
/// exception out of the program.
enum Interrupt {
    Handled,
    Uncaught(Value),
}

type Exec<T> = Result<T, Interrupt>;

struct CallFrameRec {
    ret_pc: usize,
    program: Rc<Program>,
    env_frame: Rc<Frame>,
}

struct HandlerRec {
    pc: usize,
    program: Rc<Program>,
    stack_depth: usize,
    call_depth: usize,
    env_frame: Rc<Frame>,
}

struct RunState {
    program: Rc<Program>,
    pc: usize,
    stack: Vec<Value>,
    calls: Vec<CallFrameRec>,
    handlers: Vec<HandlerRec>,
    insn_count: u64,
}

pub struct Vm {
    pub heap: Heap,
    env: RtEnv,
    pub ios: IosStack,
    regs: Vec<Value>,

    endian: Endian,
    nenc: Nenc,

    obase: u32,
    omode: Omode,
    omaps: bool,
    oindent: u32,
    odepth: u32,
    oacutoff: u32,
    pretty_print: bool,

    out: Box<dyn Write>,
    pending_signal: Arc<AtomicBool>,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        let pending_signal = Arc::new(AtomicBool::new(false));
        #[cfg(unix)]
        {
            // Registration fails only in exotic setups; the VM then
            // simply never sees the flag set.
            let _ = signal_hook::flag::register(
                signal_hook::consts::SIGINT,
                Arc::clone(&pending_signal),
            );
        }
        Vm {
            heap: Heap::new(),
            env: RtEnv::new(0),
            ios: IosStack::new(),
            regs: vec![Value::NULL; 16],
            endian: Endian::Lsb,
            nenc: Nenc::Two,
            obase: 10,
            omode: Omode::Flat,
            omaps: false,
            oindent: 2,
            odepth: 0,
            oacutoff: 0,
            pretty_print: false,
            out: Box::new(std::io::stdout()),
            pending_signal,
        }
    }

    /* Configuration.  */

    pub fn endian(&self) -> Endian {
        self.endian
    }
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }
    pub fn nenc(&self) -> Nenc {
        self.nenc
    }
    pub fn set_nenc(&mut self, nenc: Nenc) {
        self.nenc = nenc;
    }
    pub fn obase(&self) -> u32 {
        self.obase
    }
    pub fn set_obase(&mut self, obase: u32) {
        debug_assert!(matches!(obase, 2 | 8 | 10 | 16));
        self.obase = obase;
    }
    pub fn omode(&self) -> Omode {
        self.omode
    }
    pub fn set_omode(&mut self, omode: Omode) {
        self.omode = omode;
    }
    pub fn omaps(&self) -> bool {
        self.omaps
    }
    pub fn set_omaps(&mut self, omaps: bool) {
        self.omaps = omaps;
    }
    pub fn oindent(&self) -> u32 {
        self.oindent
    }
    pub fn set_oindent(&mut self, oindent: u32) {
        self.oindent = oindent;
    }
    pub fn odepth(&self) -> u32 {
        self.odepth
    }
    pub fn set_odepth(&mut self, odepth: u32) {
        self.odepth = odepth;
    }
    pub fn oacutoff(&self) -> u32 {
        self.oacutoff
    }
    pub fn set_oacutoff(&mut self, cutoff: u32) {
        self.oacutoff = cutoff;
    }
    pub fn pretty_print(&self) -> bool {
        self.pretty_print
    }
    pub fn set_pretty_print(&mut self, pp: bool) {
        self.pretty_print = pp;
    }

    /// Redirect printed output, mainly for tests.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn env(&self) -> &RtEnv {
        &self.env
    }

    /// Close every open IO space, in LIFO order.
    pub fn shutdown(&mut self) {
        self.ios.shutdown();
    }

    /* Execution.  */

    /// Run an executable program. Returns the value left on the
    /// operand stack, or the uncaught exception.
    pub fn run(&mut self, program: &Rc<Program>) -> Result<Value, Value> {
        assert!(
            program.is_executable(),
            "program must be made executable before running"
        );
        debug!(len = program.len(), "running program");

        let mut st = RunState {
            program: Rc::clone(program),
            pc: program.beginning(),
            stack: Vec::new(),
            calls: Vec::new(),
            handlers: Vec::new(),
            insn_count: 0,
        };

        let result = loop {
            if st.pc >= st.program.len() {
                break Ok(st.stack.pop().unwrap_or(Value::NULL));
            }

            st.insn_count += 1;
            if st.insn_count % GC_PERIOD == 0 {
                self.collect_garbage(&st);
            }

            if self.pending_signal.swap(false, Ordering::Relaxed) {
                match self.raise_code::<()>(&mut st, ExceptionCode::Signal) {
                    Err(Interrupt::Uncaught(exc)) => break Err(exc),
                    _ => continue,
                }
            }

            let insn = match st.program.fetch(st.pc) {
                Some(insn) => insn.clone(),
                None => break Ok(st.stack.pop().unwrap_or(Value::NULL)),
            };
            st.pc += 1;

            match self.step(&mut st, insn) {
                Ok(()) | Err(Interrupt::Handled) => {}
                Err(Interrupt::Uncaught(exc)) => break Err(exc),
            }
        };

        // The result must survive the final collection; the caller
        // has not seen it yet.
        match &result {
            Ok(v) | Err(v) => st.stack.push(*v),
        }
        self.collect_garbage(&st);
        result
    }

    /// Exit code corresponding to a run result.
    pub fn exit_code(result: &Result<Value, Value>) -> ExitCode {
        match result {
            Ok(_) => ExitCode::Ok,
            Err(_) => ExitCode::Error,
        }
    }

    fn step(&mut self, st: &mut RunState, insn: Insn) -> Exec<()> {
        match insn {
            Insn::Nop => {}

            /* Stack manipulation.  */
            Insn::Push(v) => st.stack.push(v),
            Insn::Drop => {
                self.pop(st)?;
            }
            Insn::Dup => {
                let a = self.pop(st)?;
                st.stack.push(a);
                st.stack.push(a);
            }
            Insn::Swap => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                st.stack.push(b);
                st.stack.push(a);
            }
            Insn::Rot => {
                let c = self.pop(st)?;
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                st.stack.push(b);
                st.stack.push(c);
                st.stack.push(a);
            }
            Insn::Over => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                st.stack.push(a);
                st.stack.push(b);
                st.stack.push(a);
            }
            Insn::PushR(r) => st.stack.push(self.regs[r as usize]),
            Insn::PopR(r) => {
                let v = self.pop(st)?;
                self.regs[r as usize] = v;
            }

            /* Environment.  */
            Insn::PushF(hint) => self.env.push_frame(hint as usize),
            Insn::PopF => self.env.pop_frame(),
            Insn::PopVar => {
                let v = self.pop(st)?;
                self.env.register(v);
            }
            Insn::PushVar { back, over } => match self.env.lookup(back, over) {
                Some(v) => st.stack.push(v),
                None => return self.raise_code(st, ExceptionCode::Generic),
            },
            Insn::SetVar { back, over } => {
                let v = self.pop(st)?;
                if !self.env.set_var(back, over, v) {
                    return self.raise_code(st, ExceptionCode::Generic);
                }
            }

            /* Control flow.  */
            Insn::Jmp(l) => st.pc = st.program.label_pc(l),
            Insn::Bz(l) => {
                if self.pop_i64(st)? == 0 {
                    st.pc = st.program.label_pc(l);
                }
            }
            Insn::Bnz(l) => {
                if self.pop_i64(st)? != 0 {
                    st.pc = st.program.label_pc(l);
                }
            }
            Insn::Call => {
                let clsv = self.pop(st)?;
                let cls = match self.heap.as_closure(clsv) {
                    Some(c) => c.clone(),
                    None => return self.raise_code(st, ExceptionCode::Inval),
                };
                st.calls.push(CallFrameRec {
                    ret_pc: st.pc,
                    program: Rc::clone(&st.program),
                    env_frame: self.env.current_frame(),
                });
                self.env.set_current_frame(cls.env.clone());
                st.program = Rc::clone(&cls.program);
                st.pc = cls.entry;
            }
            Insn::Return => match st.calls.pop() {
                Some(frame) => {
                    self.env.set_current_frame(frame.env_frame);
                    st.program = frame.program;
                    st.pc = frame.ret_pc;
                }
                None => {
                    // Returning with no caller ends the program.
                    st.pc = st.program.len();
                }
            },
            Insn::MkCls { entry } => {
                let entry = st.program.label_pc(entry);
                let cls = self.heap.alloc(HeapBox::Closure(ClosureVal {
                    program: Rc::clone(&st.program),
                    entry,
                    env: self.env.current_frame(),
                }));
                st.stack.push(cls);
            }

            /* Exceptions.  */
            Insn::PushE { handler } => {
                st.handlers.push(HandlerRec {
                    pc: st.program.label_pc(handler),
                    program: Rc::clone(&st.program),
                    stack_depth: st.stack.len(),
                    call_depth: st.calls.len(),
                    env_frame: self.env.current_frame(),
                });
            }
            Insn::PopE => {
                st.handlers.pop();
            }
            Insn::Raise => {
                let exc = self.pop(st)?;
                return Err(self.unwind(st, exc));
            }
            Insn::RaiseCode(code) => {
                let code = ExceptionCode::try_from(code).unwrap_or(ExceptionCode::Generic);
                return self.raise_code(st, code);
            }

            /* Integer arithmetic.  */
            Insn::Add => self.binop_int(st, |a, b| a.wrapping_add(b))?,
            Insn::Sub => self.binop_int(st, |a, b| a.wrapping_sub(b))?,
            Insn::Mul => self.binop_int(st, |a, b| a.wrapping_mul(b))?,
            Insn::Div => self.divop(st, false)?,
            Insn::CeilDiv => self.divop(st, true)?,
            Insn::Mod => {
                let (b, _, _) = self.pop_int_parts(st)?;
                let (a, size, signed) = self.pop_int_parts(st)?;
                if b == 0 {
                    return self.raise_code(st, ExceptionCode::DivByZero);
                }
                let r = if signed {
                    a.wrapping_rem(b)
                } else {
                    ((a as u64) % (b as u64)) as i64
                };
                let v = self.heap.make_integral(r, size, signed);
                st.stack.push(v);
            }
            Insn::Neg => {
                let (a, size, signed) = self.pop_int_parts(st)?;
                let v = self.heap.make_integral(a.wrapping_neg(), size, signed);
                st.stack.push(v);
            }
            Insn::Pow => self.binop_int(st, |a, b| {
                let mut result: i64 = 1;
                let mut base = a;
                let mut exp = b as u64;
                while exp > 0 {
                    if exp & 1 == 1 {
                        result = result.wrapping_mul(base);
                    }
                    base = base.wrapping_mul(base);
                    exp >>= 1;
                }
                result
            })?,
            Insn::BAnd => self.binop_int(st, |a, b| a & b)?,
            Insn::BOr => self.binop_int(st, |a, b| a | b)?,
            Insn::BXor => self.binop_int(st, |a, b| a ^ b)?,
            Insn::BNot => {
                let (a, size, signed) = self.pop_int_parts(st)?;
                let v = self.heap.make_integral(!a, size, signed);
                st.stack.push(v);
            }
            Insn::Shl => {
                let (b, _, _) = self.pop_int_parts(st)?;
                let (a, size, signed) = self.pop_int_parts(st)?;
                let v = self
                    .heap
                    .make_integral(a.wrapping_shl(b as u32), size, signed);
                st.stack.push(v);
            }
            Insn::Shr => {
                let (b, _, _) = self.pop_int_parts(st)?;
                let (a, size, signed) = self.pop_int_parts(st)?;
                let r = if signed {
                    a.wrapping_shr(b as u32)
                } else {
                    ((a as u64).wrapping_shr(b as u32)) as i64
                };
                let v = self.heap.make_integral(r, size, signed);
                st.stack.push(v);
            }
            Insn::BConc => {
                let (b, bsize, _) = self.pop_int_parts(st)?;
                let (a, asize, asigned) = self.pop_int_parts(st)?;
                let size = asize + bsize;
                let bmask = if bsize == 64 {
                    u64::MAX
                } else {
                    (1u64 << bsize) - 1
                };
                let raw = ((a as u64) << bsize) | (b as u64 & bmask);
                let v = self.heap.make_integral(raw as i64, size, asigned);
                st.stack.push(v);
            }

            /* Logical.  */
            Insn::And => {
                let b = self.pop_i64(st)?;
                let a = self.pop_i64(st)?;
                let v = self.heap.make_bool(a != 0 && b != 0);
                st.stack.push(v);
            }
            Insn::Or => {
                let b = self.pop_i64(st)?;
                let a = self.pop_i64(st)?;
                let v = self.heap.make_bool(a != 0 || b != 0);
                st.stack.push(v);
            }
            Insn::Not => {
                let a = self.pop_i64(st)?;
                let v = self.heap.make_bool(a == 0);
                st.stack.push(v);
            }

            /* Comparison.  */
            Insn::Eq => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                let eq = self.heap.value_equal(a, b);
                let v = self.heap.make_bool(eq);
                st.stack.push(v);
            }
            Insn::Ne => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                let ne = !self.heap.value_equal(a, b);
                let v = self.heap.make_bool(ne);
                st.stack.push(v);
            }
            Insn::Lt => self.relop(st, |o| o.is_lt())?,
            Insn::Gt => self.relop(st, |o| o.is_gt())?,
            Insn::Le => self.relop(st, |o| o.is_le())?,
            Insn::Ge => self.relop(st, |o| o.is_ge())?,

            /* Strings.  */
            Insn::SConc => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                let joined = match (self.heap.as_str(a), self.heap.as_str(b)) {
                    (Some(sa), Some(sb)) => Some(format!("{}{}", sa, sb)),
                    _ => None,
                };
                match joined {
                    Some(s) => {
                        let v = self.heap.make_string(s);
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::Inval),
                }
            }
            Insn::SMul => {
                let n = self.pop_i64(st)?;
                let sv = self.pop(st)?;
                let repeated = self.heap.as_str(sv).map(|s| s.repeat(n.max(0) as usize));
                match repeated {
                    Some(s) => {
                        let v = self.heap.make_string(s);
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::Inval),
                }
            }
            Insn::ItoS { base } => {
                let (n, _, signed) = self.pop_int_parts(st)?;
                let mut s = String::new();
                self.format_int(n, signed, base, &mut s);
                let v = self.heap.make_string(s);
                st.stack.push(v);
            }
            Insn::CtoS => {
                let (n, _, _) = self.pop_int_parts(st)?;
                let v = self.heap.make_string(((n as u8) as char).to_string());
                st.stack.push(v);
            }
            Insn::VtoS => {
                let v = self.pop(st)?;
                let flags = if self.omaps { PRINT_F_MAPS } else { 0 };
                let s = self.format_val(v, self.odepth, self.omode, self.obase, flags);
                let v = self.heap.make_string(s);
                st.stack.push(v);
            }

            /* Arrays.  */
            Insn::MkArr { nelem } => {
                let etype = self.pop(st)?;
                let mut elems = vec![Value::NULL; nelem as usize];
                for slot in elems.iter_mut().rev() {
                    *slot = self.pop(st)?;
                }
                let v = self.heap.alloc(HeapBox::Array(ArrayVal {
                    etype,
                    elems,
                    mapping: None,
                }));
                st.stack.push(v);
            }
            Insn::ARef => {
                let idx = self.pop_i64(st)? as u64;
                let container = self.pop(st)?;
                self.aref(st, container, idx)?;
            }
            Insn::ASet => {
                let value = self.pop(st)?;
                let idx = self.pop_i64(st)? as u64;
                let arrv = self.pop(st)?;
                self.aset(st, arrv, idx, value)?;
            }
            Insn::ATrim => {
                let to = self.pop_i64(st)? as u64;
                let from = self.pop_i64(st)? as u64;
                let v = self.pop(st)?;
                self.atrim(st, v, from, to)?;
            }
            Insn::AConc => {
                let b = self.pop(st)?;
                let a = self.pop(st)?;
                if !a.is_boxed() || !b.is_boxed() {
                    return self.raise_code(st, ExceptionCode::Inval);
                }
                let parts = match (self.heap.get(a), self.heap.get(b)) {
                    (HeapBox::Array(x), HeapBox::Array(y)) => Some((x.clone(), y.clone())),
                    _ => None,
                };
                match parts {
                    Some((ea, eb)) => {
                        let mut elems = ea.elems;
                        elems.extend(eb.elems);
                        let v = self.heap.alloc(HeapBox::Array(ArrayVal {
                            etype: ea.etype,
                            elems,
                            mapping: None,
                        }));
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::Inval),
                }
            }
            Insn::AIn => {
                let arr = self.pop(st)?;
                let elem = self.pop(st)?;
                if !arr.is_boxed() {
                    return self.raise_code(st, ExceptionCode::Inval);
                }
                let elems = match self.heap.get(arr) {
                    HeapBox::Array(a) => a.elems.clone(),
                    _ => Vec::new(),
                };
                let found = elems.iter().any(|e| self.heap.value_equal(elem, *e));
                let v = self.heap.make_bool(found);
                st.stack.push(v);
            }

            /* Structs.  */
            Insn::MkSct {
                fields: fnames,
                methods,
            } => {
                let ty = self.pop(st)?;
                let mut mvals = vec![Value::NULL; methods.len()];
                for slot in mvals.iter_mut().rev() {
                    *slot = self.pop(st)?;
                }
                let mut fvals = vec![Value::NULL; fnames.len()];
                for slot in fvals.iter_mut().rev() {
                    *slot = self.pop(st)?;
                }
                let (tfields, tmethods): (Vec<TypeField>, Vec<(String, Value)>) =
                    match self.heap.as_type(ty) {
                        Some(TypeVal::Struct {
                            fields, methods, ..
                        }) => (fields.clone(), methods.clone()),
                        _ => (Vec::new(), Vec::new()),
                    };
                let mut fields = Vec::with_capacity(fvals.len());
                let mut boff = 0u64;
                for (name, value) in fnames.into_iter().zip(fvals) {
                    // Constant labels recorded on the type place the
                    // field; plain fields accumulate.
                    let label = tfields
                        .iter()
                        .find(|tf| tf.name == name)
                        .and_then(|tf| tf.label);
                    let at = label.unwrap_or(boff);
                    boff = at + self.heap.sizeof_val(value);
                    fields.push(StructField {
                        name,
                        value,
                        boffset: at,
                    });
                }
                // Inline-compiled methods win; otherwise the struct
                // inherits the methods of its declared type.
                let methods = if methods.is_empty() {
                    tmethods
                } else {
                    methods.into_iter().zip(mvals).collect::<Vec<_>>()
                };
                let v = self.heap.alloc(HeapBox::Struct(StructVal {
                    ty,
                    fields,
                    methods,
                    mapping: None,
                }));
                st.stack.push(v);
            }
            Insn::Sref(name) => {
                let sct = self.pop(st)?;
                self.sref(st, sct, &name)?;
            }
            Insn::SSet(name) => {
                let value = self.pop(st)?;
                let sct = self.pop(st)?;
                self.sset(st, sct, &name, value)?;
            }

            /* Offsets.  */
            Insn::MkOff { unit } => {
                let mag = self.pop(st)?;
                let v = self.heap.make_offset(mag, unit);
                st.stack.push(v);
            }
            Insn::OffMag => {
                let off = self.pop(st)?;
                match self.heap.as_offset(off) {
                    Some(o) => st.stack.push(o.magnitude),
                    None => return self.raise_code(st, ExceptionCode::Inval),
                }
            }
            Insn::OffUnit => {
                let off = self.pop(st)?;
                let unit = self.heap.as_offset(off).map(|o| o.unit);
                match unit {
                    Some(unit) => {
                        let v = self.heap.make_ulong(unit, 64);
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::Inval),
                }
            }

            /* Conversions.  */
            Insn::IToI { size, signed } => {
                let (a, _, _) = self.pop_int_parts(st)?;
                let v = self.heap.make_integral(a, size, signed);
                st.stack.push(v);
            }
            Insn::AToA => {
                let ty = self.pop(st)?;
                let arr = self.pop(st)?;
                let nelem = self.heap.elems_of(arr);
                let bound = match self.heap.as_type(ty) {
                    Some(TypeVal::Array { bound, .. }) => *bound,
                    _ => None,
                };
                if let Some(bound) = bound {
                    if bound != nelem {
                        return self.raise_code(st, ExceptionCode::Conv);
                    }
                }
                st.stack.push(arr);
            }
            Insn::SToI => {
                let sct = self.pop(st)?;
                match self.integral_struct_value(sct) {
                    Some((raw, size, signed)) => {
                        let v = self.heap.make_integral(raw, size, signed);
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::Conv),
                }
            }
            Insn::CastAny => {
                let ty = self.pop(st)?;
                let v = self.pop(st)?;
                let vty = self.heap.typeof_val(v);
                let ok = matches!(self.heap.as_type(ty), Some(TypeVal::Any))
                    || self.heap.type_equal(vty, ty);
                if ok {
                    st.stack.push(v);
                    return Ok(());
                }
                let target = self.heap.as_type(ty).cloned();
                if let (Some((n, _, _)), Some(TypeVal::Integral { size, signed })) =
                    (self.heap.integral_parts(v), target)
                {
                    // Integral values convert across integral types.
                    let v = self.heap.make_integral(n, size, signed);
                    st.stack.push(v);
                } else {
                    return self.raise_code(st, ExceptionCode::Conv);
                }
            }
            Insn::IsA => {
                let ty = self.pop(st)?;
                let v = self.pop(st)?;
                let vty = self.heap.typeof_val(v);
                let isa = matches!(self.heap.as_type(ty), Some(TypeVal::Any))
                    || self.heap.type_equal(vty, ty);
                let v = self.heap.make_bool(isa);
                st.stack.push(v);
            }
            Insn::TypOf => {
                let v = self.pop(st)?;
                let ty = self.heap.typeof_val(v);
                st.stack.push(ty);
            }

            /* Attributes.  */
            Insn::Sizeof => {
                let v = self.pop(st)?;
                let bits = self.heap.sizeof_val(v);
                let mag = self.heap.make_ulong(bits, 64);
                let off = self.heap.make_offset(mag, 1);
                st.stack.push(off);
            }
            Insn::ElemsOf => {
                let v = self.pop(st)?;
                let n = self.heap.elems_of(v);
                let v = self.heap.make_ulong(n, 64);
                st.stack.push(v);
            }
            Insn::AttrOffset => {
                let v = self.pop(st)?;
                match self.mapping_of(v) {
                    Some(m) => {
                        let mag = self.heap.make_ulong(m.offset as u64, 64);
                        let off = self.heap.make_offset(mag, 1);
                        st.stack.push(off);
                    }
                    None => return self.raise_code(st, ExceptionCode::NoMap),
                }
            }
            Insn::AttrMapped => {
                let v = self.pop(st)?;
                let mapped = self.mapping_of(v).is_some();
                let v = self.heap.make_bool(mapped);
                st.stack.push(v);
            }
            Insn::AttrStrict => {
                let v = self.pop(st)?;
                let strict = self.mapping_of(v).map(|m| m.strict).unwrap_or(true);
                let v = self.heap.make_bool(strict);
                st.stack.push(v);
            }
            Insn::AttrIos => {
                let v = self.pop(st)?;
                match self.mapping_of(v) {
                    Some(m) => {
                        let v = self.heap.make_int(m.ios, 32);
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::NoMap),
                }
            }
            Insn::AttrElem => {
                let idx = self.pop_i64(st)? as u64;
                let v = self.pop(st)?;
                self.aref(st, v, idx)?;
            }
            Insn::AttrEOffset => {
                let idx = self.pop_i64(st)? as u64;
                let v = self.pop(st)?;
                match self.elem_boffset(v, idx) {
                    Some(bits) => {
                        let mag = self.heap.make_ulong(bits, 64);
                        let off = self.heap.make_offset(mag, 1);
                        st.stack.push(off);
                    }
                    None => return self.raise_code(st, ExceptionCode::OutOfBounds),
                }
            }
            Insn::AttrESize => {
                let idx = self.pop_i64(st)? as u64;
                let v = self.pop(st)?;
                match self.elem_value(v, idx) {
                    Some(elem) => {
                        let bits = self.heap.sizeof_val(elem);
                        let mag = self.heap.make_ulong(bits, 64);
                        let off = self.heap.make_offset(mag, 1);
                        st.stack.push(off);
                    }
                    None => return self.raise_code(st, ExceptionCode::OutOfBounds),
                }
            }
            Insn::AttrEName => {
                let idx = self.pop_i64(st)? as u64;
                let v = self.pop(st)?;
                if !v.is_boxed() {
                    return self.raise_code(st, ExceptionCode::Inval);
                }
                let name = match self.heap.get(v) {
                    HeapBox::Struct(s) => s
                        .fields
                        .get(idx as usize)
                        .map(|f| f.name.clone().unwrap_or_default()),
                    HeapBox::Array(a) => {
                        if (idx as usize) < a.elems.len() {
                            Some(String::new())
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                match name {
                    Some(name) => {
                        let v = self.heap.make_string(name);
                        st.stack.push(v);
                    }
                    None => return self.raise_code(st, ExceptionCode::OutOfBounds),
                }
            }

            /* Type construction.  */
            Insn::MkTyI { size, signed } => {
                let v = self.heap.make_integral_type(size, signed);
                st.stack.push(v);
            }
            Insn::MkTyS => {
                let v = self.heap.make_string_type();
                st.stack.push(v);
            }
            Insn::MkTyV => {
                let v = self.heap.make_void_type();
                st.stack.push(v);
            }
            Insn::MkTyAny => {
                let v = self.heap.make_any_type();
                st.stack.push(v);
            }
            Insn::MkTyA { bounded } => {
                let bound = if bounded {
                    Some(self.pop_i64(st)? as u64)
                } else {
                    None
                };
                let etype = self.pop(st)?;
                let v = self.heap.make_array_type(etype, bound);
                st.stack.push(v);
            }
            Insn::MkTyO { unit } => {
                let base = self.pop(st)?;
                let v = self.heap.make_offset_type(base, unit);
                st.stack.push(v);
            }
            Insn::MkTySct {
                name,
                fields,
                methods,
                pinned,
                union_p,
                integral,
            } => {
                let mut mvals = vec![Value::NULL; methods.len()];
                for slot in mvals.iter_mut().rev() {
                    *slot = self.pop(st)?;
                }
                let itype = if integral { Some(self.pop(st)?) } else { None };
                let mut ftys = vec![Value::NULL; fields.len()];
                for slot in ftys.iter_mut().rev() {
                    *slot = self.pop(st)?;
                }
                let tfields = fields
                    .into_iter()
                    .zip(ftys)
                    .map(|((name, label), ty)| TypeField { name, ty, label })
                    .collect();
                let methods = methods.into_iter().zip(mvals).collect();
                let v = self.heap.alloc(HeapBox::Type(TypeVal::Struct {
                    name,
                    fields: tfields,
                    methods,
                    pinned,
                    union_p,
                    itype,
                }));
                st.stack.push(v);
            }
            Insn::MkTyF { nargs } => {
                let rtype = self.pop(st)?;
                let mut atypes = vec![Value::NULL; nargs as usize];
                for slot in atypes.iter_mut().rev() {
                    *slot = self.pop(st)?;
                }
                let v = self
                    .heap
                    .alloc(HeapBox::Type(TypeVal::Function { rtype, atypes }));
                st.stack.push(v);
            }

            /* IO.  */
            Insn::IosOpen => {
                let flags = self.pop_i64(st)? as u64;
                let handlerv = self.pop(st)?;
                let handler = match self.heap.as_str(handlerv) {
                    Some(s) => s.to_string(),
                    None => return self.raise_code(st, ExceptionCode::Inval),
                };
                let flags = crate::ios::dev::IosFlags::from_bits_retain(flags);
                match self.ios.open(&handler, flags, true) {
                    Ok(id) => {
                        let v = self.heap.make_int(id, 32);
                        st.stack.push(v);
                    }
                    Err(e) => return self.raise_ios(st, e),
                }
            }
            Insn::IosClose => {
                let id = self.pop_i64(st)? as i32;
                if let Err(e) = self.ios.close(id) {
                    return self.raise_ios(st, e);
                }
            }
            Insn::IosCur => match self.ios.cur() {
                Some(id) => {
                    let v = self.heap.make_int(id, 32);
                    st.stack.push(v);
                }
                None => return self.raise_code(st, ExceptionCode::NoIos),
            },
            Insn::IosSetCur => {
                let id = self.pop_i64(st)? as i32;
                if !self.ios.set_cur(id) {
                    return self.raise_code(st, ExceptionCode::NoIos);
                }
            }
            Insn::IosFlush => {
                let off = self.pop(st)?;
                let id = self.pop_i64(st)? as i32;
                let bits = match self.heap.offset_in_bits(off) {
                    Some(bits) => bits,
                    None => return self.raise_code(st, ExceptionCode::Inval),
                };
                if let Err(e) = self.ios.flush(id, bits) {
                    return self.raise_ios(st, e);
                }
            }
            Insn::IosSize => {
                let id = self.pop_i64(st)? as i32;
                match self.ios.size(id) {
                    Ok(size) => {
                        let mag = self.heap.make_ulong(size, 64);
                        let off = self.heap.make_offset(mag, 8);
                        st.stack.push(off);
                    }
                    Err(e) => return self.raise_ios(st, e),
                }
            }
            Insn::GetEndian => {
                let v = self
                    .heap
                    .make_int(matches!(self.endian, Endian::Msb) as i32, 32);
                st.stack.push(v);
            }
            Insn::SetEndian => {
                let v = self.pop_i64(st)?;
                self.endian = if v == 0 { Endian::Lsb } else { Endian::Msb };
            }
            Insn::Map { strict } => {
                let off = self.pop(st)?;
                let iosv = self.pop(st)?;
                let ty = self.pop(st)?;
                let ios = if iosv.is_null() {
                    match self.ios.cur() {
                        Some(id) => id,
                        None => return self.raise_code(st, ExceptionCode::NoIos),
                    }
                } else {
                    match self.heap.as_i64(iosv) {
                        Some(id) => id as i32,
                        None => return self.raise_code(st, ExceptionCode::Inval),
                    }
                };
                let bits = match self.heap.offset_in_bits(off) {
                    Some(bits) => bits,
                    None => return self.raise_code(st, ExceptionCode::Inval),
                };
                match self.map_value(ty, ios, bits, strict) {
                    Ok(v) => st.stack.push(v),
                    Err(e) => return self.raise_ios(st, e),
                }
            }

            /* Output.  */
            Insn::Print => {
                let v = self.pop(st)?;
                let flags = if self.omaps { PRINT_F_MAPS } else { 0 }
                    | if self.pretty_print { PRINT_F_PPRINT } else { 0 };
                let text = self.format_val(v, self.odepth, self.omode, self.obase, flags);
                let _ = self.out.write_all(text.as_bytes());
                let _ = self.out.flush();
            }
            Insn::Puts => {
                let v = self.pop(st)?;
                let s = self.heap.as_str(v).map(str::to_string);
                if let Some(s) = s {
                    let _ = self.out.write_all(s.as_bytes());
                    let _ = self.out.flush();
                }
            }
        }
        Ok(())
    }

    /* Interpreter helpers.  */

    fn pop(&mut self, st: &mut RunState) -> Exec<Value> {
        match st.stack.pop() {
            Some(v) => Ok(v),
            // An underflow is a code generation bug; surface it as a
            // generic exception rather than crashing.
            None => self.raise_code(st, ExceptionCode::Generic),
        }
    }

    fn pop_i64(&mut self, st: &mut RunState) -> Exec<i64> {
        let v = self.pop(st)?;
        match self.heap.as_i64(v) {
            Some(n) => Ok(n),
            None => self.raise_code(st, ExceptionCode::Inval),
        }
    }

    fn pop_int_parts(&mut self, st: &mut RunState) -> Exec<(i64, u32, bool)> {
        let v = self.pop(st)?;
        match self.heap.integral_parts(v) {
            Some(parts) => Ok(parts),
            None => self.raise_code(st, ExceptionCode::Inval),
        }
    }

    fn binop_int(&mut self, st: &mut RunState, f: impl Fn(i64, i64) -> i64) -> Exec<()> {
        let (b, _, _) = self.pop_int_parts(st)?;
        let (a, size, signed) = self.pop_int_parts(st)?;
        let v = self.heap.make_integral(f(a, b), size, signed);
        st.stack.push(v);
        Ok(())
    }

    fn divop(&mut self, st: &mut RunState, ceil: bool) -> Exec<()> {
        let (b, _, _) = self.pop_int_parts(st)?;
        let (a, size, signed) = self.pop_int_parts(st)?;
        if b == 0 {
            return self.raise_code(st, ExceptionCode::DivByZero);
        }
        let r = if signed {
            let q = a.wrapping_div(b);
            if ceil && a % b != 0 && (a < 0) == (b < 0) {
                q + 1
            } else {
                q
            }
        } else {
            let (ua, ub) = (a as u64, b as u64);
            let q = ua / ub;
            (if ceil && ua % ub != 0 { q + 1 } else { q }) as i64
        };
        let v = self.heap.make_integral(r, size, signed);
        st.stack.push(v);
        Ok(())
    }

    fn relop(&mut self, st: &mut RunState, f: impl Fn(std::cmp::Ordering) -> bool) -> Exec<()> {
        let b = self.pop(st)?;
        let a = self.pop(st)?;
        let ord = if let (Some((na, _, sa)), Some((nb, _, _))) =
            (self.heap.integral_parts(a), self.heap.integral_parts(b))
        {
            if sa {
                Some(na.cmp(&nb))
            } else {
                Some((na as u64).cmp(&(nb as u64)))
            }
        } else if let (Some(oa), Some(ob)) =
            (self.heap.offset_in_bits(a), self.heap.offset_in_bits(b))
        {
            Some(oa.cmp(&ob))
        } else if let (Some(sa), Some(sb)) = (self.heap.as_str(a), self.heap.as_str(b)) {
            Some(sa.cmp(sb))
        } else {
            None
        };
        match ord {
            Some(ord) => {
                let v = self.heap.make_bool(f(ord));
                st.stack.push(v);
                Ok(())
            }
            None => self.raise_code(st, ExceptionCode::Inval),
        }
    }

    fn aref(&mut self, st: &mut RunState, container: Value, idx: u64) -> Exec<()> {
        if !container.is_boxed() {
            return self.raise_code(st, ExceptionCode::Inval);
        }
        enum Got {
            Val(Value),
            Byte(u8),
            Oob,
        }
        let got = match self.heap.get(container) {
            HeapBox::Array(a) => match a.elems.get(idx as usize) {
                Some(v) => Got::Val(*v),
                None => Got::Oob,
            },
            HeapBox::Str(s) => match s.as_bytes().get(idx as usize) {
                Some(b) => Got::Byte(*b),
                None => Got::Oob,
            },
            HeapBox::Struct(s) => match s.fields.get(idx as usize) {
                Some(f) => Got::Val(f.value),
                None => Got::Oob,
            },
            _ => return self.raise_code(st, ExceptionCode::Inval),
        };
        match got {
            Got::Val(v) => {
                st.stack.push(v);
                Ok(())
            }
            Got::Byte(b) => {
                let v = self.heap.make_uint(b as u32, 8);
                st.stack.push(v);
                Ok(())
            }
            Got::Oob => self.raise_code(st, ExceptionCode::OutOfBounds),
        }
    }

    fn aset(&mut self, st: &mut RunState, arrv: Value, idx: u64, value: Value) -> Exec<()> {
        if !arrv.is_boxed() {
            return self.raise_code(st, ExceptionCode::Inval);
        }
        enum Outcome {
            NotArray,
            Oob,
            Stored(Option<Mapping>),
        }
        let outcome = match self.heap.get_mut(arrv) {
            HeapBox::Array(a) => {
                if (idx as usize) < a.elems.len() {
                    a.elems[idx as usize] = value;
                    Outcome::Stored(a.mapping)
                } else {
                    Outcome::Oob
                }
            }
            _ => Outcome::NotArray,
        };
        match outcome {
            Outcome::NotArray => self.raise_code(st, ExceptionCode::Inval),
            Outcome::Oob => self.raise_code(st, ExceptionCode::OutOfBounds),
            Outcome::Stored(Some(m)) => {
                let esize = self.heap.sizeof_val(value);
                let off = m.offset + (idx * esize) as i64;
                if let Err(e) = self.poke_value(m.ios, off, value) {
                    return self.raise_ios(st, e);
                }
                Ok(())
            }
            Outcome::Stored(None) => Ok(()),
        }
    }

    fn atrim(&mut self, st: &mut RunState, v: Value, from: u64, to: u64) -> Exec<()> {
        if !v.is_boxed() {
            return self.raise_code(st, ExceptionCode::Inval);
        }
        enum Got {
            Arr(ArrayVal),
            Str(String),
            Oob,
            Bad,
        }
        let got = match self.heap.get(v) {
            HeapBox::Array(a) => {
                if from > to || to > a.elems.len() as u64 {
                    Got::Oob
                } else {
                    Got::Arr(a.clone())
                }
            }
            HeapBox::Str(s) => {
                if from > to || to > s.len() as u64 {
                    Got::Oob
                } else {
                    Got::Str(s[from as usize..to as usize].to_string())
                }
            }
            _ => Got::Bad,
        };
        match got {
            Got::Arr(a) => {
                let elems = a.elems[from as usize..to as usize].to_vec();
                let v = self.heap.alloc(HeapBox::Array(ArrayVal {
                    etype: a.etype,
                    elems,
                    mapping: None,
                }));
                st.stack.push(v);
                Ok(())
            }
            Got::Str(s) => {
                let v = self.heap.make_string(s);
                st.stack.push(v);
                Ok(())
            }
            Got::Oob => self.raise_code(st, ExceptionCode::OutOfBounds),
            Got::Bad => self.raise_code(st, ExceptionCode::Inval),
        }
    }

    fn sref(&mut self, st: &mut RunState, sct: Value, name: &str) -> Exec<()> {
        if !sct.is_boxed() {
            return self.raise_code(st, ExceptionCode::Inval);
        }
        enum Got {
            Val(Value),
            Code(i32),
            Msg(String),
            Missing,
        }
        let got = match self.heap.get(sct) {
            HeapBox::Struct(s) => s
                .fields
                .iter()
                .find(|f| f.name.as_deref() == Some(name))
                .map(|f| Got::Val(f.value))
                .or_else(|| {
                    s.methods
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, m)| Got::Val(*m))
                })
                .unwrap_or(Got::Missing),
            HeapBox::Exception(e) => match name {
                "code" => Got::Code(e.code),
                "msg" => Got::Msg(e.msg.clone()),
                _ => Got::Missing,
            },
            _ => Got::Missing,
        };
        match got {
            Got::Val(v) => {
                st.stack.push(v);
                Ok(())
            }
            Got::Code(code) => {
                let v = self.heap.make_int(code, 32);
                st.stack.push(v);
                Ok(())
            }
            Got::Msg(msg) => {
                let v = self.heap.make_string(msg);
                st.stack.push(v);
                Ok(())
            }
            Got::Missing => self.raise_code(st, ExceptionCode::Elem),
        }
    }

    fn sset(&mut self, st: &mut RunState, sct: Value, name: &str, value: Value) -> Exec<()> {
        if !sct.is_boxed() {
            return self.raise_code(st, ExceptionCode::Inval);
        }
        enum Outcome {
            NotStruct,
            Missing,
            Stored(Option<(Mapping, u64)>),
        }
        let outcome = match self.heap.get_mut(sct) {
            HeapBox::Struct(s) => {
                let mapping = s.mapping;
                match s
                    .fields
                    .iter_mut()
                    .find(|f| f.name.as_deref() == Some(name))
                {
                    Some(field) => {
                        field.value = value;
                        Outcome::Stored(mapping.map(|m| (m, field.boffset)))
                    }
                    None => Outcome::Missing,
                }
            }
            _ => Outcome::NotStruct,
        };
        match outcome {
            Outcome::NotStruct => self.raise_code(st, ExceptionCode::Inval),
            Outcome::Missing => self.raise_code(st, ExceptionCode::Elem),
            Outcome::Stored(Some((m, boffset))) => {
                if let Err(e) = self.poke_value(m.ios, boffset as i64, value) {
                    return self.raise_ios(st, e);
                }
                Ok(())
            }
            Outcome::Stored(None) => Ok(()),
        }
    }

    fn elem_boffset(&self, v: Value, idx: u64) -> Option<u64> {
        if !v.is_boxed() {
            return None;
        }
        match self.heap.get(v) {
            HeapBox::Struct(s) => s.fields.get(idx as usize).map(|f| f.boffset),
            HeapBox::Array(a) => {
                let elem = a.elems.get(idx as usize)?;
                let esize = self.heap.sizeof_val(*elem);
                Some(a.mapping.map(|m| m.offset as u64).unwrap_or(0) + idx * esize)
            }
            _ => None,
        }
    }

    fn elem_value(&self, v: Value, idx: u64) -> Option<Value> {
        if !v.is_boxed() {
            return None;
        }
        match self.heap.get(v) {
            HeapBox::Struct(s) => s.fields.get(idx as usize).map(|f| f.value),
            HeapBox::Array(a) => a.elems.get(idx as usize).copied(),
            _ => None,
        }
    }

    fn mapping_of(&self, v: Value) -> Option<Mapping> {
        if !v.is_boxed() {
            return None;
        }
        match self.heap.get(v) {
            HeapBox::Struct(s) => s.mapping,
            HeapBox::Array(a) => a.mapping,
            _ => None,
        }
    }

    /// Recompose the integer an integral struct amounts to.
    fn integral_struct_value(&self, sct: Value) -> Option<(i64, u32, bool)> {
        if !sct.is_boxed() {
            return None;
        }
        let s = match self.heap.get(sct) {
            HeapBox::Struct(s) => s,
            _ => return None,
        };
        let (size, signed) = match self.heap.as_type(s.ty) {
            Some(TypeVal::Struct {
                itype: Some(itype), ..
            }) => match self.heap.as_type(*itype) {
                Some(TypeVal::Integral { size, signed }) => (*size, *signed),
                _ => return None,
            },
            _ => return None,
        };
        let mut acc: u64 = 0;
        for field in &s.fields {
            let (v, fsize, _) = if let Some(parts) = self.heap.integral_parts(field.value) {
                parts
            } else {
                self.integral_struct_value(field.value)?
            };
            let mask = if fsize == 64 {
                u64::MAX
            } else {
                (1u64 << fsize) - 1
            };
            acc = (acc << fsize) | (v as u64 & mask);
        }
        Some((acc as i64, size, signed))
    }

    /* Exceptions.  */

    fn raise_code<T>(&mut self, st: &mut RunState, code: ExceptionCode) -> Exec<T> {
        let exc = self.heap.make_exception(code.into(), code.message());
        Err(self.unwind(st, exc))
    }

    fn raise_ios<T>(&mut self, st: &mut RunState, e: IosError) -> Exec<T> {
        let code = match e {
            IosError::Eof => ExceptionCode::Eof,
            IosError::InvalidFlags => ExceptionCode::IoFlags,
            IosError::InvalidArg => ExceptionCode::Inval,
            IosError::InvalidOffset => ExceptionCode::OutOfBounds,
            IosError::Perm | IosError::Open | IosError::NoMem | IosError::Error => {
                ExceptionCode::Io
            }
        };
        let exc = self.heap.make_exception(code.into(), format!("{}", e));
        Err(self.unwind(st, exc))
    }

    /// Unwind to the innermost handler: truncate the operand stack,
    /// drop call frames entered since the handler was installed,
    /// restore the lexical frame chain, and continue at the handler
    /// with the exception value on the stack.
    fn unwind(&mut self, st: &mut RunState, exc: Value) -> Interrupt {
        match st.handlers.pop() {
            Some(h) => {
                st.stack.truncate(h.stack_depth);
                st.calls.truncate(h.call_depth);
                self.env.set_current_frame(h.env_frame);
                st.program = h.program;
                st.pc = h.pc;
                st.stack.push(exc);
                Interrupt::Handled
            }
            None => Interrupt::Uncaught(exc),
        }
    }

    /// The code of an exception value, for callers inspecting an
    /// uncaught exception.
    pub fn exception_code(&self, exc: Value) -> Option<i32> {
        if !exc.is_boxed() {
            return None;
        }
        match self.heap.get(exc) {
            HeapBox::Exception(e) => Some(e.code),
            HeapBox::Struct(s) => s
                .fields
                .iter()
                .find(|f| f.name.as_deref() == Some("code"))
                .and_then(|f| self.heap.as_i64(f.value))
                .map(|n| n as i32),
            _ => None,
        }
    }

    pub fn exception_message(&self, exc: Value) -> String {
        if !exc.is_boxed() {
            return String::new();
        }
        match self.heap.get(exc) {
            HeapBox::Exception(e) => e.msg.clone(),
            HeapBox::Struct(s) => s
                .fields
                .iter()
                .find(|f| f.name.as_deref() == Some("msg"))
                .and_then(|f| self.heap.as_str(f.value))
                .unwrap_or("")
                .to_string(),
            _ => String::new(),
        }
    }

    /* Mapping.  */

    /// Materialize a value of the given type from an IO space.
    fn map_value(
        &mut self,
        ty: Value,
        ios: i32,
        offset: i64,
        strict: bool,
    ) -> Result<Value, IosError> {
        let tv = match self.heap.as_type(ty) {
            Some(tv) => tv.clone(),
            None => return Err(IosError::InvalidArg),
        };
        match tv {
            TypeVal::Integral { size, signed } => self.map_integral(ios, offset, size, signed),
            TypeVal::Offset { base, unit } => {
                let (size, signed) = match self.heap.as_type(base) {
                    Some(TypeVal::Integral { size, signed }) => (*size, *signed),
                    _ => return Err(IosError::InvalidArg),
                };
                let mag = self.map_integral(ios, offset, size, signed)?;
                Ok(self.heap.make_offset(mag, unit))
            }
            TypeVal::StringT => {
                let s = self.ios.read_string(ios, offset)?;
                Ok(self.heap.make_string(s))
            }
            TypeVal::Array { etype, bound } => {
                let mut elems = Vec::new();
                let mut at = offset;
                match bound {
                    Some(n) => {
                        for _ in 0..n {
                            let v = self.map_value(etype, ios, at, strict)?;
                            at += self.heap.sizeof_val(v) as i64;
                            elems.push(v);
                        }
                    }
                    None => loop {
                        // Unbounded arrays map until the space runs
                        // out.
                        match self.map_value(etype, ios, at, strict) {
                            Ok(v) => {
                                at += self.heap.sizeof_val(v) as i64;
                                elems.push(v);
                            }
                            Err(IosError::Eof) => break,
                            Err(e) => return Err(e),
                        }
                    },
                }
                Ok(self.heap.alloc(HeapBox::Array(ArrayVal {
                    etype,
                    elems,
                    mapping: Some(Mapping {
                        ios,
                        offset,
                        strict,
                    }),
                })))
            }
            TypeVal::Struct {
                ref fields,
                ref methods,
                pinned,
                union_p,
                itype,
                ..
            } => {
                if let Some(itype) = itype {
                    return self.map_integral_struct(ty, itype, fields, ios, offset, strict);
                }
                let mut out_fields = Vec::with_capacity(fields.len());
                let mut at = offset;
                for field in fields {
                    let foff = if pinned {
                        offset
                    } else if let Some(label) = field.label {
                        offset + label as i64
                    } else {
                        at
                    };
                    let v = self.map_value(field.ty, ios, foff, strict)?;
                    let size = self.heap.sizeof_val(v) as i64;
                    out_fields.push(StructField {
                        name: field.name.clone(),
                        value: v,
                        boffset: foff as u64,
                    });
                    if !pinned {
                        at = foff + size;
                    }
                    if union_p {
                        // A union maps as its first alternative.
                        break;
                    }
                }
                Ok(self.heap.alloc(HeapBox::Struct(StructVal {
                    ty,
                    fields: out_fields,
                    methods: methods.clone(),
                    mapping: Some(Mapping {
                        ios,
                        offset,
                        strict,
                    }),
                })))
            }
            TypeVal::Any | TypeVal::Void | TypeVal::Function { .. } => Err(IosError::InvalidArg),
        }
    }

    fn map_integral(
        &mut self,
        ios: i32,
        offset: i64,
        size: u32,
        signed: bool,
    ) -> Result<Value, IosError> {
        let v = if signed {
            self.ios
                .read_int(ios, offset, size, self.endian, self.nenc)?
        } else {
            self.ios.read_uint(ios, offset, size, self.endian)? as i64
        };
        Ok(self.heap.make_integral(v, size, signed))
    }

    /// Integral structs live in the space as one integer; the fields
    /// are carved out of it, most significant first.
    fn map_integral_struct(
        &mut self,
        ty: Value,
        itype: Value,
        fields: &[TypeField],
        ios: i32,
        offset: i64,
        strict: bool,
    ) -> Result<Value, IosError> {
        let isize = match self.heap.as_type(itype) {
            Some(TypeVal::Integral { size, .. }) => *size,
            _ => return Err(IosError::InvalidArg),
        };
        let raw = self.ios.read_uint(ios, offset, isize, self.endian)?;

        let mut out_fields = Vec::with_capacity(fields.len());
        let mut consumed = 0u32;
        for field in fields {
            let (fsize, fsigned) = match self.heap.as_type(field.ty) {
                Some(TypeVal::Integral { size, signed }) => (*size, *signed),
                _ => return Err(IosError::InvalidArg),
            };
            let shift = isize - consumed - fsize;
            let fv = truncate((raw >> shift) as i64, fsize, fsigned);
            let v = self.heap.make_integral(fv, fsize, fsigned);
            out_fields.push(StructField {
                name: field.name.clone(),
                value: v,
                boffset: (offset + consumed as i64) as u64,
            });
            consumed += fsize;
        }
        Ok(self.heap.alloc(HeapBox::Struct(StructVal {
            ty,
            fields: out_fields,
            methods: Vec::new(),
            mapping: Some(Mapping {
                ios,
                offset,
                strict,
            }),
        })))
    }

    /// Write a value back through the IO space it shadows.
    fn poke_value(&mut self, ios: i32, offset: i64, v: Value) -> Result<(), IosError> {
        if let Some((n, size, signed)) = self.heap.integral_parts(v) {
            return if signed {
                self.ios
                    .write_int(ios, offset, size, self.endian, self.nenc, n)
            } else {
                self.ios
                    .write_uint(ios, offset, size, self.endian, n as u64)
            };
        }
        if v.is_boxed() {
            match self.heap.get(v).clone() {
                HeapBox::Str(s) => return self.ios.write_string(ios, offset, &s),
                HeapBox::Offset(o) => return self.poke_value(ios, offset, o.magnitude),
                HeapBox::Struct(s) => {
                    for field in &s.fields {
                        self.poke_value(ios, field.boffset as i64, field.value)?;
                    }
                    return Ok(());
                }
                HeapBox::Array(a) => {
                    let mut at = offset;
                    for elem in &a.elems {
                        self.poke_value(ios, at, *elem)?;
                        at += self.heap.sizeof_val(*elem) as i64;
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(IosError::InvalidArg)
    }

    /* Collection.  */

    fn collect_garbage(&mut self, st: &RunState) {
        let mut roots: Vec<Value> = Vec::new();
        roots.extend(&st.stack);
        roots.extend(&self.regs);
        roots.extend(st.program.immediates());
        for frame in &st.calls {
            roots.extend(frame.program.immediates());
        }
        for h in &st.handlers {
            roots.extend(h.program.immediates());
        }
        let mut frames: Vec<Rc<Frame>> = vec![self.env.current_frame()];
        frames.extend(st.calls.iter().map(|f| f.env_frame.clone()));
        frames.extend(st.handlers.iter().map(|h| h.env_frame.clone()));
        self.heap.collect(&roots, &frames);
    }

    /* Printing.  */

    /// Render a value honoring the given output parameters.
    pub fn format_val(&self, v: Value, depth: u32, mode: Omode, base: u32, flags: u32) -> String {
        let mut out = String::new();
        self.format_val_rec(v, 0, depth, mode, base, flags, &mut out);
        out
    }

    fn format_int(&self, n: i64, signed: bool, base: u32, out: &mut String) {
        let (sign, mag) = if signed && n < 0 {
            ("-", (n as i128).unsigned_abs() as u64)
        } else {
            ("", n as u64)
        };
        let body = match base {
            2 => format!("0b{:b}", mag),
            8 => format!("0o{:o}", mag),
            16 => format!("0x{:x}", mag),
            _ => format!("{}", mag),
        };
        out.push_str(sign);
        out.push_str(&body);
    }

    #[allow(clippy::too_many_arguments)]
    fn format_val_rec(
        &self,
        v: Value,
        level: u32,
        depth: u32,
        mode: Omode,
        base: u32,
        flags: u32,
        out: &mut String,
    ) {
        if v.is_null() {
            out.push_str("null");
            return;
        }
        if let Some((n, _, signed)) = self.heap.integral_parts(v) {
            self.format_int(n, signed, base, out);
            return;
        }
        match self.heap.get(v) {
            HeapBox::Str(s) => {
                out.push('"');
                out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
                out.push('"');
            }
            HeapBox::Offset(o) => {
                let mag = self.heap.as_i64(o.magnitude).unwrap_or(0);
                let (_, _, signed) = self
                    .heap
                    .integral_parts(o.magnitude)
                    .unwrap_or((0, 64, false));
                self.format_int(mag, signed, base, out);
                match o.unit {
                    1 => out.push_str("#b"),
                    8 => out.push_str("#B"),
                    u => out.push_str(&format!("#{}", u)),
                }
            }
            HeapBox::Array(a) => {
                if depth != 0 && level >= depth {
                    out.push_str("[...]");
                    return;
                }
                out.push('[');
                let cutoff = if self.oacutoff == 0 {
                    a.elems.len()
                } else {
                    self.oacutoff as usize
                };
                for (i, elem) in a.elems.iter().take(cutoff).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.format_val_rec(*elem, level + 1, depth, mode, base, flags, out);
                }
                if a.elems.len() > cutoff {
                    out.push_str(",...");
                }
                out.push(']');
                if flags & PRINT_F_MAPS != 0 {
                    if let Some(m) = a.mapping {
                        out.push_str(&format!(" @ {}#b", m.offset));
                    }
                }
            }
            HeapBox::Struct(s) => {
                if depth != 0 && level >= depth {
                    out.push_str("{...}");
                    return;
                }
                if let Some(TypeVal::Struct { name: Some(n), .. }) = self.heap.as_type(s.ty) {
                    out.push_str(n);
                    out.push(' ');
                }
                out.push('{');
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    if mode == Omode::Tree {
                        out.push('\n');
                        for _ in 0..(self.oindent * (level + 1)) {
                            out.push(' ');
                        }
                    }
                    if let Some(name) = &field.name {
                        out.push_str(name);
                        out.push('=');
                    }
                    self.format_val_rec(field.value, level + 1, depth, mode, base, flags, out);
                }
                if mode == Omode::Tree {
                    out.push('\n');
                    for _ in 0..(self.oindent * level) {
                        out.push(' ');
                    }
                }
                out.push('}');
                if flags & PRINT_F_MAPS != 0 {
                    if let Some(m) = s.mapping {
                        out.push_str(&format!(" @ {}#b", m.offset));
                    }
                }
            }
            HeapBox::Closure(_) => out.push_str("#<closure>"),
            HeapBox::Type(_) => out.push_str("#<type>"),
            HeapBox::Exception(e) => {
                out.push_str(&format!("Exception {{code={},msg=\"{}\"}}", e.code, e.msg));
            }
            HeapBox::Long(..) | HeapBox::ULong(..) => unreachable!("handled as integral"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poke_core::program::Label;
    use poke_core::value::OffsetVal;

    fn run_insns(vm: &mut Vm, build: impl FnOnce(&mut Vm, &mut Program)) -> Result<Value, Value> {
        let mut p = Program::new();
        build(vm, &mut p);
        p.make_executable().unwrap();
        vm.run(&Rc::new(p))
    }

    #[test]
    fn arithmetic_keeps_the_operand_type() {
        let mut vm = Vm::new();
        let r = run_insns(&mut vm, |vm, p| {
            let a = vm.heap.make_int(1, 32);
            let b = vm.heap.make_int(2, 32);
            p.append(Insn::Push(a));
            p.append(Insn::Push(b));
            p.append(Insn::Add);
        })
        .unwrap();
        assert_eq!(vm.heap.integral_parts(r), Some((3, 32, true)));
    }

    #[test]
    fn narrow_arithmetic_wraps_to_width() {
        let mut vm = Vm::new();
        let r = run_insns(&mut vm, |vm, p| {
            let a = vm.heap.make_uint(255, 8);
            let b = vm.heap.make_uint(2, 8);
            p.append(Insn::Push(a));
            p.append(Insn::Push(b));
            p.append(Insn::Add);
        })
        .unwrap();
        assert_eq!(vm.heap.integral_parts(r), Some((1, 8, false)));
    }

    #[test]
    fn division_by_zero_raises() {
        let mut vm = Vm::new();
        let r = run_insns(&mut vm, |vm, p| {
            let a = vm.heap.make_int(1, 32);
            let b = vm.heap.make_int(0, 32);
            p.append(Insn::Push(a));
            p.append(Insn::Push(b));
            p.append(Insn::Div);
        });
        let exc = r.unwrap_err();
        assert_eq!(
            vm.exception_code(exc),
            Some(i32::from(ExceptionCode::DivByZero))
        );
    }

    #[test]
    fn try_catch_recovers_and_rebinds() {
        let mut vm = Vm::new();
        let r = run_insns(&mut vm, |vm, p| {
            let handler: Label = p.fresh_label();
            let done: Label = p.fresh_label();
            p.append(Insn::PushE { handler });
            let a = vm.heap.make_int(1, 32);
            let b = vm.heap.make_int(0, 32);
            p.append(Insn::Push(a));
            p.append(Insn::Push(b));
            p.append(Insn::Div);
            p.append(Insn::PopE);
            p.append(Insn::Jmp(done));
            p.append_label(handler);
            // The handler receives the exception; bind it into a
            // fresh frame slot and read its code.
            p.append(Insn::PushF(1));
            p.append(Insn::PopVar);
            p.append(Insn::PushVar { back: 0, over: 0 });
            p.append(Insn::Sref("code".to_string()));
            p.append(Insn::PopF);
            p.append_label(done);
        })
        .unwrap();
        assert_eq!(
            vm.heap.as_i64(r),
            Some(i64::from(ExceptionCode::DivByZero as i32))
        );
    }

    #[test]
    fn closures_capture_their_frame() {
        let mut vm = Vm::new();
        // var x = 5; fun f = x; f()
        let r = run_insns(&mut vm, |vm, p| {
            let body = p.fresh_label();
            let after = p.fresh_label();
            let x = vm.heap.make_int(5, 32);
            p.append(Insn::Push(x));
            p.append(Insn::PopVar);
            p.append(Insn::Jmp(after));
            p.append_label(body);
            p.append(Insn::PushVar { back: 0, over: 0 });
            p.append(Insn::Return);
            p.append_label(after);
            p.append(Insn::MkCls { entry: body });
            p.append(Insn::Call);
        })
        .unwrap();
        assert_eq!(vm.heap.as_i64(r), Some(5));
    }

    #[test]
    fn bit_concatenation() {
        let mut vm = Vm::new();
        let r = run_insns(&mut vm, |vm, p| {
            let a = vm.heap.make_uint(0xa, 4);
            let b = vm.heap.make_uint(0xbc, 8);
            p.append(Insn::Push(a));
            p.append(Insn::Push(b));
            p.append(Insn::BConc);
        })
        .unwrap();
        assert_eq!(vm.heap.integral_parts(r), Some((0xabc, 12, false)));
    }

    #[test]
    fn map_and_write_back_a_struct() {
        let mut vm = Vm::new();
        let id = vm
            .ios
            .open("*m*", crate::ios::dev::IosFlags::empty(), true)
            .unwrap();
        vm.ios.dev_pwrite(id, &[0; 8], 0).unwrap();

        // Map `struct { int<32> x; int<32> y; }` at offset 0 of the
        // current space, then set x = 7 through the mapping.
        let mut p = Program::new();
        p.append(Insn::MkTyI {
            size: 32,
            signed: true,
        });
        p.append(Insn::MkTyI {
            size: 32,
            signed: true,
        });
        p.append(Insn::MkTySct {
            name: Some("Point".to_string()),
            fields: vec![(Some("x".to_string()), None), (Some("y".to_string()), None)],
            methods: vec![],
            pinned: false,
            union_p: false,
            integral: false,
        });
        p.append(Insn::Push(Value::NULL));
        let mag = vm.heap.alloc_perm(HeapBox::ULong(0, 64));
        let off = vm.heap.alloc_perm(HeapBox::Offset(OffsetVal {
            magnitude: mag,
            unit: 8,
        }));
        p.append(Insn::Push(off));
        p.append(Insn::Map { strict: true });
        p.append(Insn::Dup);
        let seven = vm.heap.make_int(7, 32);
        p.append(Insn::Push(seven));
        p.append(Insn::SSet("x".to_string()));
        p.make_executable().unwrap();
        let sct = vm.run(&Rc::new(p)).unwrap();

        // The write persisted in the space.
        let x = vm.ios.read_int(id, 0, 32, vm.endian(), vm.nenc()).unwrap();
        assert_eq!(x, 7);

        // A value mapped afresh sees the write.
        vm.regs[15] = sct;
        let mut p2 = Program::new();
        p2.append(Insn::PushR(15));
        p2.append(Insn::Sref("x".to_string()));
        p2.make_executable().unwrap();
        let x = vm.run(&Rc::new(p2)).unwrap();
        assert_eq!(vm.heap.as_i64(x), Some(7));
    }

    #[test]
    fn sizeof_attribute_is_an_offset_in_bits() {
        let mut vm = Vm::new();
        let r = run_insns(&mut vm, |vm, p| {
            let v = vm.heap.make_uint(1, 16);
            p.append(Insn::Push(v));
            p.append(Insn::Sizeof);
        })
        .unwrap();
        assert_eq!(vm.heap.offset_in_bits(r), Some(16));
    }

    #[test]
    fn formatting_respects_base_and_cutoffs() {
        let mut vm = Vm::new();
        let i8t = vm.heap.make_integral_type(8, false);
        let elems: Vec<Value> = (1..=4).map(|n| vm.heap.make_uint(n, 8)).collect();
        let arr = vm.heap.alloc(HeapBox::Array(ArrayVal {
            etype: i8t,
            elems,
            mapping: None,
        }));
        assert_eq!(vm.format_val(arr, 0, Omode::Flat, 10, 0), "[1,2,3,4]");
        vm.set_oacutoff(2);
        assert_eq!(vm.format_val(arr, 0, Omode::Flat, 16, 0), "[0x1,0x2,...]");
    }
}
