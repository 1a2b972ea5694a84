//! Code descriptors: the read-only per-function metadata and bytecode that interpretation and
//! translation consume.
//!
//! Raw bytecode is a sequence of fixed-width instructions: an opcode byte followed by a
//! little-endian `u32` operand. Instruction offsets are instruction indices, not byte offsets.

use crate::{
    compile::CompilationError,
    runtime::{BinaryOp, CompareOp, ObjId, Runtime, UnaryOp},
};
use byteorder::{ByteOrder, LittleEndian};
use deku::prelude::*;
use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
};
use strum::{Display, EnumString, FromRepr};

/// The size, in bytes, of one encoded instruction.
pub const INSTR_SIZE: usize = 5;

/// Opcodes at or above this value use their operand.
const HAVE_ARGUMENT: u8 = 90;

/// The closed set of bytecode operations.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    RotFour = 5,
    Nop = 9,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryConvert = 13,
    UnaryInvert = 15,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryDivide = 21,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,
    #[strum(serialize = "SLICE+0")]
    Slice0 = 30,
    #[strum(serialize = "SLICE+1")]
    Slice1 = 31,
    #[strum(serialize = "SLICE+2")]
    Slice2 = 32,
    #[strum(serialize = "SLICE+3")]
    Slice3 = 33,
    #[strum(serialize = "STORE_SLICE+0")]
    StoreSlice0 = 40,
    #[strum(serialize = "STORE_SLICE+1")]
    StoreSlice1 = 41,
    #[strum(serialize = "STORE_SLICE+2")]
    StoreSlice2 = 42,
    #[strum(serialize = "STORE_SLICE+3")]
    StoreSlice3 = 43,
    #[strum(serialize = "DELETE_SLICE+0")]
    DeleteSlice0 = 50,
    #[strum(serialize = "DELETE_SLICE+1")]
    DeleteSlice1 = 51,
    #[strum(serialize = "DELETE_SLICE+2")]
    DeleteSlice2 = 52,
    #[strum(serialize = "DELETE_SLICE+3")]
    DeleteSlice3 = 53,
    StoreMap = 54,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceDivide = 58,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,
    BreakLoop = 80,
    WithCleanup = 81,
    ReturnValue = 83,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    ListAppend = 94,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    DupTopx = 99,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    MakeClosure = 134,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
}

impl Opcode {
    /// Does this opcode use its operand?
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// The operator of a `BINARY_*` opcode (other than `BINARY_SUBSCR`).
    pub fn binary_op(self) -> Option<BinaryOp> {
        Some(match self {
            Opcode::BinaryPower => BinaryOp::Power,
            Opcode::BinaryMultiply => BinaryOp::Multiply,
            Opcode::BinaryDivide => BinaryOp::Divide,
            Opcode::BinaryTrueDivide => BinaryOp::TrueDivide,
            Opcode::BinaryFloorDivide => BinaryOp::FloorDivide,
            Opcode::BinaryModulo => BinaryOp::Modulo,
            Opcode::BinaryAdd => BinaryOp::Add,
            Opcode::BinarySubtract => BinaryOp::Subtract,
            Opcode::BinaryLshift => BinaryOp::LShift,
            Opcode::BinaryRshift => BinaryOp::RShift,
            Opcode::BinaryAnd => BinaryOp::And,
            Opcode::BinaryXor => BinaryOp::Xor,
            Opcode::BinaryOr => BinaryOp::Or,
            _ => return None,
        })
    }

    /// The operator of an `INPLACE_*` opcode.
    pub fn inplace_op(self) -> Option<BinaryOp> {
        Some(match self {
            Opcode::InplacePower => BinaryOp::Power,
            Opcode::InplaceMultiply => BinaryOp::Multiply,
            Opcode::InplaceDivide => BinaryOp::Divide,
            Opcode::InplaceTrueDivide => BinaryOp::TrueDivide,
            Opcode::InplaceFloorDivide => BinaryOp::FloorDivide,
            Opcode::InplaceModulo => BinaryOp::Modulo,
            Opcode::InplaceAdd => BinaryOp::Add,
            Opcode::InplaceSubtract => BinaryOp::Subtract,
            Opcode::InplaceLshift => BinaryOp::LShift,
            Opcode::InplaceRshift => BinaryOp::RShift,
            Opcode::InplaceAnd => BinaryOp::And,
            Opcode::InplaceXor => BinaryOp::Xor,
            Opcode::InplaceOr => BinaryOp::Or,
            _ => return None,
        })
    }

    /// The operator of a `UNARY_*` opcode.
    pub fn unary_op(self) -> Option<UnaryOp> {
        Some(match self {
            Opcode::UnaryPositive => UnaryOp::Positive,
            Opcode::UnaryNegative => UnaryOp::Negative,
            Opcode::UnaryNot => UnaryOp::Not,
            Opcode::UnaryConvert => UnaryOp::Convert,
            Opcode::UnaryInvert => UnaryOp::Invert,
            _ => return None,
        })
    }
}

/// The kind of a block-stack entry. The values are those of the opcodes that push them.
pub const BLOCK_LOOP: i32 = Opcode::SetupLoop as i32;
pub const BLOCK_EXCEPT: i32 = Opcode::SetupExcept as i32;
pub const BLOCK_FINALLY: i32 = Opcode::SetupFinally as i32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub arg: u32,
}

impl Instr {
    /// If this instruction can transfer control to somewhere other than the next instruction,
    /// return that target. `idx` is this instruction's offset.
    pub fn jump_target(self, idx: usize) -> Option<usize> {
        match self.op {
            Opcode::JumpForward
            | Opcode::ForIter
            | Opcode::SetupLoop
            | Opcode::SetupExcept
            | Opcode::SetupFinally => Some(idx + 1 + self.arg as usize),
            Opcode::JumpAbsolute
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::ContinueLoop => Some(self.arg as usize),
            _ => None,
        }
    }

    /// The `(positional, keyword)` argument counts of a call instruction.
    pub fn call_counts(self) -> (usize, usize) {
        ((self.arg & 0xff) as usize, ((self.arg >> 8) & 0xff) as usize)
    }
}

#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(endian = "little")]
struct RawInstr {
    opcode: u8,
    arg: u32,
}

/// Decode raw bytecode.
pub fn decode(raw: &[u8]) -> Result<Vec<Instr>, CompilationError> {
    if raw.len() % INSTR_SIZE != 0 {
        return Err(CompilationError::General(format!(
            "bytecode length {} is not a multiple of {INSTR_SIZE}",
            raw.len()
        )));
    }
    let mut instrs = Vec::with_capacity(raw.len() / INSTR_SIZE);
    let mut rest = (raw, 0);
    while !rest.0.is_empty() {
        let (next, ri) =
            RawInstr::from_bytes(rest).map_err(|e| CompilationError::General(e.to_string()))?;
        let op = Opcode::from_repr(ri.opcode).ok_or_else(|| {
            CompilationError::General(format!(
                "unknown opcode {} at offset {}",
                ri.opcode,
                instrs.len()
            ))
        })?;
        instrs.push(Instr { op, arg: ri.arg });
        rest = next;
    }
    Ok(instrs)
}

/// Encode instructions as raw bytecode.
pub fn encode(instrs: &[Instr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(instrs.len() * INSTR_SIZE);
    for i in instrs {
        let mut arg = [0; 4];
        LittleEndian::write_u32(&mut arg, i.arg);
        buf.push(i.op as u8);
        buf.extend_from_slice(&arg);
    }
    buf
}

/// A process-unique identifier for a code descriptor.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CodeId(u64);

impl CodeId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        CodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CodeFlags {
    /// Does the function suspend at `YIELD_VALUE`s?
    pub generator: bool,
    /// Are locals held in fast slots? If not, name operations use a locals dictionary.
    pub optimized: bool,
}

/// The static state on entry to an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowState {
    /// The operand stack depth.
    pub stack: usize,
    /// The block stack depth.
    pub blocks: usize,
}

#[derive(Debug)]
pub struct CodeDescriptor {
    id: CodeId,
    pub name: String,
    pub argcount: usize,
    pub flags: CodeFlags,
    /// The maximum operand stack depth.
    pub stacksize: usize,
    /// Owned references.
    pub consts: Vec<ObjId>,
    pub names: Vec<String>,
    /// Local variable names; the first `argcount` are the arguments.
    pub varnames: Vec<String>,
    /// Locals captured by inner functions.
    pub cellvars: Vec<String>,
    /// Variables captured from enclosing functions.
    pub freevars: Vec<String>,
    pub firstlineno: i32,
    /// `(offset, line)` pairs in ascending offset order: each marks the first instruction of a
    /// source line.
    pub lines: Vec<(usize, i32)>,
    raw: Vec<u8>,
    instrs: Vec<Instr>,
}

impl CodeDescriptor {
    /// Create a descriptor for the raw bytecode `raw`. The remaining metadata starts empty and is
    /// filled in by the caller before [CodeDescriptor::validate] is called.
    pub fn new(name: &str, raw: Vec<u8>) -> Result<Self, CompilationError> {
        let instrs = decode(&raw)?;
        Ok(CodeDescriptor {
            id: CodeId::fresh(),
            name: name.to_owned(),
            argcount: 0,
            flags: CodeFlags {
                generator: false,
                optimized: true,
            },
            stacksize: 0,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            firstlineno: 1,
            lines: Vec::new(),
            raw,
            instrs,
        })
    }

    pub fn id(&self) -> CodeId {
        self.id
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// How many fast slots do frames of this code need (locals, then cells, then free
    /// variables)?
    pub fn nfast(&self) -> usize {
        self.varnames.len() + self.cellvars.len() + self.freevars.len()
    }

    /// The source line containing instruction `idx`.
    pub fn line_at(&self, idx: usize) -> i32 {
        match self.lines.partition_point(|(off, _)| *off <= idx) {
            0 => self.firstlineno,
            n => self.lines[n - 1].1,
        }
    }

    /// If instruction `idx` starts a source line, return that line.
    pub fn line_start(&self, idx: usize) -> Option<i32> {
        self.lines
            .binary_search_by_key(&idx, |(off, _)| *off)
            .ok()
            .map(|i| self.lines[i].1)
    }

    /// The name of the local, cell or free variable in fast slot `i`.
    pub fn fast_name(&self, i: usize) -> &str {
        let (nv, nc) = (self.varnames.len(), self.cellvars.len());
        if i < nv {
            &self.varnames[i]
        } else if i < nv + nc {
            &self.cellvars[i - nv]
        } else {
            &self.freevars[i - nv - nc]
        }
    }

    pub(crate) fn referents(&self, out: &mut Vec<ObjId>) {
        out.extend(self.consts.iter().copied());
    }

    /// Check that every operand is in range and that the stack discipline is consistent,
    /// updating `stacksize`.
    pub fn validate(&mut self) -> Result<(), CompilationError> {
        self.check_operands()?;
        let states = self.flow_states()?;
        for (idx, (i, st)) in self.instrs.iter().zip(&states).enumerate() {
            if let (Opcode::BreakLoop | Opcode::ContinueLoop, Some(st)) = (i.op, st) {
                if st.blocks == 0 {
                    return Err(CompilationError::General(format!(
                        "{}: {} outside a loop at offset {idx}",
                        self.name, i.op
                    )));
                }
            }
        }
        self.stacksize = states
            .iter()
            .flatten()
            .map(|s| s.stack + 1)
            .max()
            .unwrap_or(0);
        Ok(())
    }

    /// Check that every operand indexes into its table, every jump lands inside the bytecode
    /// and control cannot fall off the end.
    pub fn check_operands(&self) -> Result<(), CompilationError> {
        if self.argcount > self.varnames.len() {
            return Err(CompilationError::General(format!(
                "{}: {} arguments but only {} locals",
                self.name,
                self.argcount,
                self.varnames.len()
            )));
        }
        let n = self.instrs.len();
        for (idx, i) in self.instrs.iter().enumerate() {
            let arg = i.arg as usize;
            let limit = match i.op {
                Opcode::LoadConst => Some(self.consts.len()),
                Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::ImportName => Some(self.names.len()),
                Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                    Some(self.varnames.len())
                }
                Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref => {
                    Some(self.cellvars.len() + self.freevars.len())
                }
                Opcode::CompareOp => Some(CompareOp::ExcMatch as usize + 1),
                Opcode::RaiseVarargs => Some(4),
                Opcode::DupTopx => Some(4),
                Opcode::BuildSlice => Some(4),
                _ => None,
            };
            if let Some(limit) = limit {
                if arg >= limit || (i.op == Opcode::DupTopx && arg < 2) {
                    return Err(CompilationError::General(format!(
                        "{}: operand {arg} of {} at offset {idx} out of range",
                        self.name, i.op
                    )));
                }
            }
            if i.op == Opcode::BuildSlice && arg < 2 {
                return Err(CompilationError::General(format!(
                    "{}: BUILD_SLICE {arg} at offset {idx}",
                    self.name
                )));
            }
            if let Some(t) = i.jump_target(idx) {
                if t >= n {
                    return Err(CompilationError::General(format!(
                        "{}: jump target {t} of {} at offset {idx} out of range",
                        self.name, i.op
                    )));
                }
            }
        }
        if matches!(self.instrs.last(), Some(i) if !i.op.is_terminator()) || n == 0 {
            return Err(CompilationError::General(format!(
                "{}: control falls off the end of the bytecode",
                self.name
            )));
        }
        Ok(())
    }

    /// Compute the stack and block-stack depths on entry to each instruction (`None` for
    /// unreachable instructions).
    ///
    /// `finally` handlers are entered with three extra values on the stack when unwinding, but
    /// fewer on a normal fall-through: only their handler edge determines their depth. At every
    /// other merge point the incoming depths must agree.
    pub fn flow_states(&self) -> Result<Vec<Option<FlowState>>, CompilationError> {
        let n = self.instrs.len();
        let mut states: Vec<Option<FlowState>> = vec![None; n];
        let finally_handlers = self
            .instrs
            .iter()
            .enumerate()
            .filter(|(_, i)| i.op == Opcode::SetupFinally)
            .filter_map(|(idx, i)| i.jump_target(idx))
            .collect::<Vec<_>>();
        let mut work = vec![(0, FlowState { stack: 0, blocks: 0 }, false)];
        while let Some((idx, st, handler_edge)) = work.pop() {
            if idx >= n {
                return Err(CompilationError::InternalError(format!(
                    "{}: control falls off the end of the bytecode",
                    self.name
                )));
            }
            match states[idx] {
                Some(old) if old == st => continue,
                Some(old) => {
                    if finally_handlers.contains(&idx) && !handler_edge {
                        if st.stack <= old.stack && st.blocks == old.blocks {
                            continue;
                        }
                    }
                    return Err(CompilationError::InternalError(format!(
                        "{}: unbalanced stack at offset {idx}: depth {}/{} meets {}/{}",
                        self.name, old.stack, old.blocks, st.stack, st.blocks
                    )));
                }
                None if finally_handlers.contains(&idx) && !handler_edge => {
                    // Reached by fall-through before the handler edge was seen: the handler
                    // edge will set the depth.
                    continue;
                }
                None => states[idx] = Some(st),
            }
            let instr = self.instrs[idx];
            let (pops, pushes) = instr.stack_effect();
            if st.stack < pops {
                return Err(CompilationError::InternalError(format!(
                    "{}: {} at offset {idx} pops {pops} values from a stack of depth {}",
                    self.name, instr.op, st.stack
                )));
            }
            let after = FlowState {
                stack: st.stack - pops + pushes,
                blocks: st.blocks,
            };
            match instr.op {
                Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                    let handler = instr.arg as usize + idx + 1;
                    let extra = if instr.op == Opcode::SetupLoop { 0 } else { 3 };
                    work.push((
                        handler,
                        FlowState {
                            stack: st.stack + extra,
                            blocks: st.blocks,
                        },
                        true,
                    ));
                    work.push((
                        idx + 1,
                        FlowState {
                            stack: st.stack,
                            blocks: st.blocks + 1,
                        },
                        false,
                    ));
                }
                Opcode::PopBlock => {
                    if st.blocks == 0 {
                        return Err(CompilationError::InternalError(format!(
                            "{}: POP_BLOCK at offset {idx} with an empty block stack",
                            self.name
                        )));
                    }
                    work.push((
                        idx + 1,
                        FlowState {
                            stack: st.stack,
                            blocks: st.blocks - 1,
                        },
                        false,
                    ));
                }
                Opcode::ForIter => {
                    let t = instr.arg as usize + idx + 1;
                    work.push((
                        t,
                        FlowState {
                            stack: st.stack - 1,
                            blocks: st.blocks,
                        },
                        false,
                    ));
                    work.push((idx + 1, after, false));
                }
                Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                    work.push((instr.arg as usize, st, false));
                    work.push((idx + 1, after, false));
                }
                // Control reaches the target through the unwinder, at the loop's own depth.
                Opcode::ContinueLoop => (),
                Opcode::JumpForward | Opcode::JumpAbsolute => {
                    if let Some(t) = instr.jump_target(idx) {
                        work.push((t, after, false));
                    }
                }
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    work.push((instr.arg as usize, after, false));
                    work.push((idx + 1, after, false));
                }
                op if op.is_terminator() => (),
                _ => work.push((idx + 1, after, false)),
            }
        }
        Ok(states)
    }

    /// Render this code's instructions, one per line.
    pub fn disassemble(&self, rt: &Runtime) -> String {
        let mut out = String::new();
        for (idx, i) in self.instrs.iter().enumerate() {
            let line = match self.line_start(idx) {
                Some(l) => format!("{l:>4}"),
                None => "    ".to_owned(),
            };
            write!(out, "{line} {idx:>5} {}", i.op).ok();
            if i.op.has_arg() {
                let arg = i.arg as usize;
                write!(out, " {arg}").ok();
                let note = match i.op {
                    Opcode::LoadConst => self.consts.get(arg).map(|c| rt.repr(*c)),
                    Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                        self.varnames.get(arg).cloned()
                    }
                    Opcode::LoadClosure | Opcode::LoadDeref | Opcode::StoreDeref => {
                        (arg < self.cellvars.len() + self.freevars.len())
                            .then(|| self.fast_name(self.varnames.len() + arg).to_owned())
                    }
                    Opcode::CompareOp => {
                        CompareOp::from_repr(arg as u8).map(|op| op.to_string())
                    }
                    _ if i.jump_target(idx).is_some() => {
                        i.jump_target(idx).map(|t| format!("to {t}"))
                    }
                    _ => self.names.get(arg).cloned().filter(|_| i.op.uses_name()),
                };
                if let Some(note) = note {
                    write!(out, " ({note})").ok();
                }
            }
            out.push('\n');
        }
        out
    }
}

impl Opcode {
    /// Does control never fall through to the next instruction?
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue
                | Opcode::RaiseVarargs
                | Opcode::BreakLoop
                | Opcode::ContinueLoop
                | Opcode::JumpForward
                | Opcode::JumpAbsolute
        )
    }

    fn uses_name(self) -> bool {
        matches!(
            self,
            Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::ImportName
        )
    }
}

impl Instr {
    /// How many values does this instruction pop, and then push, on its fall-through path?
    pub fn stack_effect(self) -> (usize, usize) {
        let arg = self.arg as usize;
        match self.op {
            Opcode::PopTop => (1, 0),
            Opcode::RotTwo => (2, 2),
            Opcode::RotThree => (3, 3),
            Opcode::RotFour => (4, 4),
            Opcode::DupTop => (1, 2),
            Opcode::DupTopx => (arg, 2 * arg),
            Opcode::Nop
            | Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::SetupLoop
            | Opcode::SetupExcept
            | Opcode::SetupFinally
            | Opcode::PopBlock
            | Opcode::BreakLoop
            | Opcode::ContinueLoop
            | Opcode::DeleteFast
            | Opcode::DeleteName
            | Opcode::DeleteGlobal => (0, 0),
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert
            | Opcode::GetIter
            | Opcode::LoadAttr
            | Opcode::YieldValue => (1, 1),
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceDivide
            | Opcode::InplaceModulo
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplacePower
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr
            | Opcode::CompareOp
            | Opcode::ImportName => (2, 1),
            Opcode::Slice0 => (1, 1),
            Opcode::Slice1 | Opcode::Slice2 => (2, 1),
            Opcode::Slice3 => (3, 1),
            Opcode::StoreSlice0 => (2, 0),
            Opcode::StoreSlice1 | Opcode::StoreSlice2 => (3, 0),
            Opcode::StoreSlice3 => (4, 0),
            Opcode::DeleteSlice0 => (1, 0),
            Opcode::DeleteSlice1 | Opcode::DeleteSlice2 => (2, 0),
            Opcode::DeleteSlice3 => (3, 0),
            Opcode::StoreMap => (3, 1),
            Opcode::StoreSubscr => (3, 0),
            Opcode::DeleteSubscr => (2, 0),
            Opcode::ReturnValue => (1, 0),
            Opcode::EndFinally => (3, 0),
            Opcode::StoreName | Opcode::StoreGlobal | Opcode::StoreFast | Opcode::StoreDeref => {
                (1, 0)
            }
            Opcode::UnpackSequence => (1, arg),
            Opcode::ForIter => (1, 2),
            // Pops the value; the list stays `arg` slots below.
            Opcode::ListAppend => (1, 0),
            Opcode::StoreAttr => (2, 0),
            // Pops the exit function. A suppressed exception also collapses to a single `None`,
            // which `END_FINALLY` then pops.
            Opcode::WithCleanup | Opcode::DeleteAttr => (1, 0),
            Opcode::LoadConst
            | Opcode::LoadName
            | Opcode::LoadGlobal
            | Opcode::LoadFast
            | Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::BuildMap => (0, 1),
            Opcode::BuildTuple | Opcode::BuildList => (arg, 1),
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => (1, 0),
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => (1, 0),
            Opcode::RaiseVarargs => (arg, 0),
            Opcode::CallFunction => {
                let (na, nk) = self.call_counts();
                (na + 2 * nk + 1, 1)
            }
            Opcode::CallFunctionVar | Opcode::CallFunctionKw => {
                let (na, nk) = self.call_counts();
                (na + 2 * nk + 2, 1)
            }
            Opcode::CallFunctionVarKw => {
                let (na, nk) = self.call_counts();
                (na + 2 * nk + 3, 1)
            }
            Opcode::MakeFunction => (arg + 1, 1),
            Opcode::MakeClosure => (arg + 2, 1),
            Opcode::BuildSlice => (arg, 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn code(instrs: &[(Opcode, u32)]) -> CodeDescriptor {
        let instrs = instrs
            .iter()
            .map(|(op, arg)| Instr { op: *op, arg: *arg })
            .collect::<Vec<_>>();
        CodeDescriptor::new("f", encode(&instrs)).unwrap()
    }

    #[test]
    fn decode_roundtrip() {
        let raw = [100, 1, 0, 0, 0, 83, 0, 0, 0, 0];
        let instrs = decode(&raw).unwrap();
        assert_eq!(
            instrs,
            vec![
                Instr {
                    op: Opcode::LoadConst,
                    arg: 1
                },
                Instr {
                    op: Opcode::ReturnValue,
                    arg: 0
                }
            ]
        );
        assert_eq!(encode(&instrs), raw);
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            decode(&[100, 0, 0]),
            Err(CompilationError::General(_))
        ));
        match decode(&[0xff, 0, 0, 0, 0]) {
            Err(CompilationError::General(m)) => assert_eq!(m, "unknown opcode 255 at offset 0"),
            _ => panic!(),
        }
    }

    #[test]
    fn opcode_names() {
        assert_eq!(Opcode::Slice2.to_string(), "SLICE+2");
        assert_eq!(Opcode::CallFunctionVarKw.to_string(), "CALL_FUNCTION_VAR_KW");
        assert_eq!("BINARY_LSHIFT".parse::<Opcode>(), Ok(Opcode::BinaryLshift));
        assert_eq!("DUP_TOPX".parse::<Opcode>(), Ok(Opcode::DupTopx));
        assert!(!Opcode::ReturnValue.has_arg());
        assert!(Opcode::StoreName.has_arg());
    }

    #[test]
    fn jump_targets() {
        let i = Instr {
            op: Opcode::JumpForward,
            arg: 2,
        };
        assert_eq!(i.jump_target(3), Some(6));
        let i = Instr {
            op: Opcode::PopJumpIfTrue,
            arg: 2,
        };
        assert_eq!(i.jump_target(3), Some(2));
    }

    #[test]
    fn stack_depths_try_finally() {
        // try: x = 1 finally: pass ; return None
        let mut c = code(&[
            (Opcode::SetupFinally, 4),
            (Opcode::LoadConst, 0),
            (Opcode::StoreFast, 0),
            (Opcode::PopBlock, 0),
            (Opcode::LoadConst, 0),
            (Opcode::EndFinally, 0),
            (Opcode::LoadConst, 0),
            (Opcode::ReturnValue, 0),
        ]);
        c.varnames = vec!["x".to_owned()];
        // The constant table is empty, so validation fails before the stack analysis.
        assert!(c.validate().is_err());
        let states = c.flow_states().unwrap();
        assert_eq!(states[1], Some(FlowState { stack: 0, blocks: 1 }));
        assert_eq!(states[5], Some(FlowState { stack: 3, blocks: 0 }));
        assert_eq!(states[6], Some(FlowState { stack: 0, blocks: 0 }));
    }

    #[test]
    fn unbalanced_merge() {
        // The two arms of the branch leave different depths at offset 4.
        let c = code(&[
            (Opcode::LoadConst, 0),
            (Opcode::PopJumpIfFalse, 3),
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 0),
            (Opcode::ReturnValue, 0),
        ]);
        assert!(matches!(
            c.flow_states(),
            Err(CompilationError::InternalError(_))
        ));
    }

    #[test]
    fn break_outside_loop() {
        let mut c = code(&[(Opcode::BreakLoop, 0)]);
        match c.validate() {
            Err(CompilationError::General(m)) => {
                assert_eq!(m, "f: BREAK_LOOP outside a loop at offset 0")
            }
            _ => panic!(),
        }
    }

    #[test]
    fn lines() {
        let mut c = code(&[(Opcode::LoadConst, 0), (Opcode::ReturnValue, 0)]);
        c.firstlineno = 3;
        c.lines = vec![(0, 4), (1, 6)];
        assert_eq!(c.line_at(0), 4);
        assert_eq!(c.line_at(1), 6);
        assert_eq!(c.line_start(1), Some(6));
        assert_eq!(c.line_start(2), None);
    }
}
