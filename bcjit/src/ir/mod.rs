//! The IR that translated functions are expressed in.
//!
//! A [Func] is a control-flow graph of basic blocks. Each block is a sequence of [Inst]s ending
//! in exactly one terminator. Instructions are numbered in creation order and an instruction's
//! result is referred to as `%N`, where `N` is its [InstIdx]. There are no phi nodes: values
//! that must survive across merge points live in memory allocated by [Inst::Alloca]s in the
//! entry block.
//!
//! The IR is deliberately low-level. Pointers address *slots* (not bytes) either in allocas or
//! in a field of the [crate::frame::Frame] the function was called with, and everything the
//! language runtime does is a [Inst::Call] to a [RuntimeFn].
//!
//! Functions are built with a [FuncBuilder] and run with [eval].

use crate::{
    compile::CompilationError,
    runtime::{BinaryOp, Builtin, CompareOp, ObjId, UnaryOp},
};
use std::fmt;
use strum::Display;
use typed_index_collections::TiVec;

mod eval;
#[cfg(any(debug_assertions, test))]
mod well_formed;

pub use eval::{eval, EvalResult};

fn index_overflow(typename: &str) -> CompilationError {
    CompilationError::LimitExceeded(format!("Index overflow: {typename}"))
}

/// A packed 24-bit unsigned integer.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
struct U24([u8; 3]);

impl U24 {
    /// Create a [U24] from a `usize`. Returns `None` if it won't fit.
    fn from_usize(v: usize) -> Option<Self> {
        if v >= 1 << 24 {
            None
        } else {
            let b0 = (v & 0xff) as u8;
            let b1 = ((v & 0xff00) >> 8) as u8;
            let b2 = ((v & 0xff0000) >> 16) as u8;
            Some(Self([b2, b1, b0]))
        }
    }

    fn to_usize(self) -> usize {
        static_assertions::const_assert!(std::mem::size_of::<usize>() >= 3);
        (usize::from(self.0[0]) << 16) | (usize::from(self.0[1]) << 8) | usize::from(self.0[2])
    }
}

// Generate common methods for 24-bit index types.
macro_rules! index_24bit {
    ($struct:ident) => {
        impl $struct {
            pub fn new(v: usize) -> Result<Self, CompilationError> {
                U24::from_usize(v)
                    .ok_or(index_overflow(stringify!($struct)))
                    .map(|u| Self(u))
            }

            pub fn to_usize(self) -> usize {
                self.0.to_usize()
            }
        }

        impl From<usize> for $struct {
            /// Required for TiVec. **DO NOT USE INTERNALLY** as this can `panic`! Instead, use
            /// [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            // Required for TiVec.
            fn from(v: $struct) -> Self {
                v.to_usize()
            }
        }
    };
}

// Generate common methods for 16-bit index types.
macro_rules! index_16bit {
    ($struct:ident) => {
        impl $struct {
            pub fn new(v: usize) -> Result<Self, CompilationError> {
                u16::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(|u| Self(u))
            }

            pub fn to_u16(self) -> u16 {
                self.0
            }
        }

        impl From<usize> for $struct {
            /// Required for TiVec. **DO NOT USE INTERNALLY** as this can `panic`! Instead, use
            /// [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                s.0.into()
            }
        }
    };
}

/// An instruction index: one of these identifies an [Inst] in a [Func] and the value it
/// produces.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct InstIdx(U24);
index_24bit!(InstIdx);

impl fmt::Display for InstIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.to_usize())
    }
}

/// A basic block index.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct BlockIdx(u16);
index_16bit!(BlockIdx);

impl fmt::Display for BlockIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// The types of IR values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ty {
    Void,
    /// An integer of the given bit width (1, 32 or 64).
    Int(u8),
    /// A pointer to a slot.
    Ptr,
    /// A (possibly NULL) object reference. Ownership is a property of how the value is used, not
    /// of its type.
    Obj,
}

pub const I1: Ty = Ty::Int(1);
pub const I32: Ty = Ty::Int(32);
pub const I64: Ty = Ty::Int(64);

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int(bits) => write!(f, "i{bits}"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Obj => write!(f, "obj"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Const {
    /// An integer of the given bit width.
    Int(u8, i64),
    /// The NULL object reference.
    Null,
    /// A borrowed reference to an object kept alive by something other than the IR (a code
    /// descriptor's constants, a type's dictionary, ...).
    Obj(ObjId),
    /// The value a function returns to request that the interpreter resume its frame.
    Sentinel,
}

impl Const {
    pub fn ty(&self) -> Ty {
        match self {
            Const::Int(bits, _) => Ty::Int(*bits),
            Const::Null | Const::Obj(_) | Const::Sentinel => Ty::Obj,
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Int(bits, v) => write!(f, "{v}i{bits}"),
            Const::Null => write!(f, "null"),
            Const::Obj(id) => write!(f, "{id}"),
            Const::Sentinel => write!(f, "sentinel"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    Local(InstIdx),
    Const(Const),
}

impl Operand {
    pub fn i1(v: bool) -> Self {
        Operand::Const(Const::Int(1, i64::from(v)))
    }

    pub fn i32(v: i32) -> Self {
        Operand::Const(Const::Int(32, i64::from(v)))
    }

    pub fn i64(v: i64) -> Self {
        Operand::Const(Const::Int(64, v))
    }

    pub fn null() -> Self {
        Operand::Const(Const::Null)
    }

    pub fn obj(id: ObjId) -> Self {
        Operand::Const(Const::Obj(id))
    }

    pub fn ty(&self, f: &Func) -> Ty {
        match self {
            Operand::Local(iidx) => f.inst(*iidx).ty(f),
            Operand::Const(c) => c.ty(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Local(iidx) => write!(f, "{iidx}"),
            Operand::Const(c) => write!(f, "{c}"),
        }
    }
}

/// The fields of a [crate::frame::Frame] that IR code can address.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FrameField {
    Lasti,
    Lineno,
    Iblock,
    /// The block stack, flattened into `kind, handler, level` triples.
    BlockStack,
    FastLocals,
    ValueStack,
    StackTop,
    BailReason,
    Globals,
    Builtins,
    Locals,
}

impl FrameField {
    /// The type of each slot of this field.
    pub fn slot_ty(self) -> Ty {
        match self {
            FrameField::Lasti
            | FrameField::Lineno
            | FrameField::Iblock
            | FrameField::BlockStack
            | FrameField::StackTop
            | FrameField::BailReason => I32,
            FrameField::FastLocals
            | FrameField::ValueStack
            | FrameField::Globals
            | FrameField::Builtins
            | FrameField::Locals => Ty::Obj,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
}

/// An integer, pointer or object comparison. Signed comparisons only apply to integers and
/// pointers into the same region.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Pred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

/// The runtime operations that IR code can call. Unless documented otherwise, object arguments
/// are borrowed; object results are new references, or NULL if an exception was raised; `i32`
/// results are 0 on success and -1 if an exception was raised. Name arguments are indices into
/// the code descriptor's `names`; fast-slot arguments are indices into its fast locals.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuntimeFn {
    IncRef,
    DecRef,
    /// Decrement a possibly NULL reference.
    XDecRef,
    Binary(BinaryOp),
    InPlace(BinaryOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    /// 1 if the object is true, else 0.
    IsTrue,
    GetItem,
    SetItem,
    DelItem,
    /// `(seq, start, stop)`: NULL bounds are absent.
    ApplySlice,
    /// `(seq, start, stop, value)`: a NULL value deletes the slice.
    AssignSlice,
    /// `(start, stop, step)`: a NULL step is absent.
    BuildSlice,
    /// `(items, n)`: steals the `n` references at `items`.
    BuildTuple,
    BuildList,
    DictNew,
    DictSetItem,
    ListAppend,
    /// `(seq, dst, n)`: writes new references to `seq`'s items to `dst`, last item first.
    UnpackSequence,
    GetIter,
    /// The next item, or NULL on exhaustion or error (see [RuntimeFn::ErrClearStopIteration]).
    IterNext,
    /// 0 if no exception, or only `StopIteration`, is pending (which is cleared); -1 otherwise.
    ErrClearStopIteration,
    /// `(base, oparg)`: the callable is at `base`, followed by positional arguments and then
    /// keyword `(name, value)` pairs. All borrowed.
    CallFunction,
    /// `(base, oparg, flags)`: as [RuntimeFn::CallFunction], followed by `*args` if bit 0 of
    /// `flags` is set and `**kwargs` if bit 1 is set.
    CallFunctionVarKw,
    /// `(args, n)`: call the builtin directly with `n` borrowed positional arguments.
    CallBuiltin(Builtin),
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadName,
    StoreName,
    DeleteName,
    GetAttr,
    SetAttr,
    DelAttr,
    /// A borrowed reference to the object's type.
    TypeOf,
    /// `(obj, name, descr)`: attribute lookup with a pre-resolved (possibly NULL) non-data
    /// descriptor.
    GetAttrCached,
    /// `(obj, slot, name)`.
    SlotGet,
    /// `(obj, slot, name, value)`.
    SlotSet,
    /// `(obj, name, value)`: store in the instance dictionary.
    SetAttrDict,
    /// 1 if the calling function's guard dependencies are intact.
    GuardsValid,
    DictVersion,
    /// `(cell, slot)`: the cell's contents, raising if it is empty.
    Deref,
    CellSet,
    /// `(code, globals, defaults, n, closure)`: `closure` may be NULL.
    MakeFunction,
    /// `(type, value, traceback)`, any of which may be NULL. Always leaves an exception set:
    /// returns 1 for a new exception and 0 for a re-raise.
    DoRaise,
    /// `(type, value, traceback)`: steals all three.
    ErrRestore,
    /// `(lineno)`.
    TracebackHere,
    /// `(dst, handling)`: moves the current exception's traceback, value and type to `dst`.
    FetchForHandler,
    /// A [crate::runtime::FinallyDisposition].
    FinallyDisposition,
    RaiseBadFinally,
    /// `(exit, type, value, traceback)`: call a context manager's exit function.
    CallExit,
    /// `(slot)`.
    RaiseUnboundLocal,
    IntFromLong,
    IntAsLong,
    /// The number of ticks left before pending calls must be handled.
    DecrementTicker,
    HandlePendingCalls,
    TracingActive,
    ProfilingActive,
    /// `(name, fromlist, level)`.
    ImportName,
}

impl RuntimeFn {
    /// The parameter and return types.
    pub fn sig(self) -> (&'static [Ty], Ty) {
        use Ty::{Obj, Ptr, Void};
        match self {
            RuntimeFn::IncRef | RuntimeFn::DecRef | RuntimeFn::XDecRef => (&[Obj], Void),
            RuntimeFn::Binary(_) | RuntimeFn::InPlace(_) | RuntimeFn::Compare(_) => {
                (&[Obj, Obj], Obj)
            }
            RuntimeFn::Unary(_) | RuntimeFn::GetIter | RuntimeFn::IterNext | RuntimeFn::TypeOf => {
                (&[Obj], Obj)
            }
            RuntimeFn::IsTrue | RuntimeFn::FinallyDisposition => (&[Obj], I32),
            RuntimeFn::GetItem => (&[Obj, Obj], Obj),
            RuntimeFn::SetItem | RuntimeFn::DictSetItem => (&[Obj, Obj, Obj], I32),
            RuntimeFn::DelItem | RuntimeFn::ListAppend => (&[Obj, Obj], I32),
            RuntimeFn::ApplySlice => (&[Obj, Obj, Obj], Obj),
            RuntimeFn::AssignSlice => (&[Obj, Obj, Obj, Obj], I32),
            RuntimeFn::BuildSlice => (&[Obj, Obj, Obj], Obj),
            RuntimeFn::BuildTuple | RuntimeFn::BuildList => (&[Ptr, I64], Obj),
            RuntimeFn::DictNew => (&[], Obj),
            RuntimeFn::UnpackSequence => (&[Obj, Ptr, I64], I32),
            RuntimeFn::ErrClearStopIteration
            | RuntimeFn::DecrementTicker
            | RuntimeFn::HandlePendingCalls => (&[], I32),
            RuntimeFn::CallFunction => (&[Ptr, I32], Obj),
            RuntimeFn::CallFunctionVarKw => (&[Ptr, I32, I32], Obj),
            RuntimeFn::CallBuiltin(_) => (&[Ptr, I64], Obj),
            RuntimeFn::LoadGlobal => (&[Obj, Obj, I32], Obj),
            RuntimeFn::StoreGlobal | RuntimeFn::StoreName | RuntimeFn::SetAttr => {
                (&[Obj, I32, Obj], I32)
            }
            RuntimeFn::SetAttrDict => (&[Obj, I32, Obj], I32),
            RuntimeFn::DeleteGlobal | RuntimeFn::DeleteName | RuntimeFn::DelAttr => {
                (&[Obj, I32], I32)
            }
            RuntimeFn::LoadName => (&[Obj, Obj, Obj, I32], Obj),
            RuntimeFn::GetAttr => (&[Obj, I32], Obj),
            RuntimeFn::GetAttrCached => (&[Obj, I32, Obj], Obj),
            RuntimeFn::SlotGet => (&[Obj, I32, I32], Obj),
            RuntimeFn::SlotSet => (&[Obj, I32, I32, Obj], I32),
            RuntimeFn::GuardsValid | RuntimeFn::TracingActive | RuntimeFn::ProfilingActive => {
                (&[], I1)
            }
            RuntimeFn::DictVersion | RuntimeFn::IntAsLong => (&[Obj], I64),
            RuntimeFn::Deref => (&[Obj, I32], Obj),
            RuntimeFn::CellSet => (&[Obj, Obj], Void),
            RuntimeFn::MakeFunction => (&[Obj, Obj, Ptr, I64, Obj], Obj),
            RuntimeFn::DoRaise => (&[Obj, Obj, Obj], I32),
            RuntimeFn::ErrRestore => (&[Obj, Obj, Obj], Void),
            RuntimeFn::TracebackHere | RuntimeFn::RaiseUnboundLocal => (&[I32], Void),
            RuntimeFn::FetchForHandler => (&[Ptr, I32], Void),
            RuntimeFn::RaiseBadFinally => (&[], Void),
            RuntimeFn::CallExit => (&[Obj, Obj, Obj, Obj], Obj),
            RuntimeFn::IntFromLong => (&[I64], Obj),
            RuntimeFn::ImportName => (&[I32, Obj, Obj], Obj),
        }
    }
}

impl fmt::Display for RuntimeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFn::Binary(op) => write!(f, "binary_{op}"),
            RuntimeFn::InPlace(op) => write!(f, "inplace_{op}"),
            RuntimeFn::Unary(op) => write!(f, "unary_{op}"),
            RuntimeFn::Compare(op) => write!(f, "compare[{op}]"),
            RuntimeFn::CallBuiltin(b) => write!(f, "call_builtin[{}]", b.name()),
            x => {
                // The remaining variants print as their names in snake case.
                let name = format!("{x:?}");
                let mut out = String::new();
                for (i, c) in name.chars().enumerate() {
                    if c.is_ascii_uppercase() {
                        if i > 0 {
                            out.push('_');
                        }
                        out.push(c.to_ascii_lowercase());
                    } else {
                        out.push(c);
                    }
                }
                write!(f, "{out}")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Inst {
    /// The frame pointer the function was called with.
    Arg,
    /// `count` fresh, uninitialised, slots of type `ty`. Only allowed in the entry block.
    Alloca { ty: Ty, count: u32 },
    /// A pointer to the first slot of `field` in `frame`.
    FrameAddr { frame: Operand, field: FrameField },
    /// `ptr` offset by `off` slots.
    PtrAdd { ptr: Operand, off: Operand },
    /// The distance, in slots, from `rhs` to `lhs`, which must point into the same region.
    PtrDiff { lhs: Operand, rhs: Operand },
    Load { ptr: Operand, ty: Ty },
    Store { ptr: Operand, val: Operand },
    /// Copy `count` slots from `src` to `dst`. Ownership of any references copied is up to the
    /// surrounding code.
    MemCpy {
        dst: Operand,
        src: Operand,
        count: Operand,
    },
    BinOp { op: BinOp, lhs: Operand, rhs: Operand },
    Icmp { pred: Pred, lhs: Operand, rhs: Operand },
    Select {
        cond: Operand,
        trueval: Operand,
        falseval: Operand,
    },
    Call { target: RuntimeFn, args: Vec<Operand> },
    Br(BlockIdx),
    CondBr {
        cond: Operand,
        trueblk: BlockIdx,
        falseblk: BlockIdx,
    },
    Switch {
        val: Operand,
        default: BlockIdx,
        cases: Vec<(i64, BlockIdx)>,
    },
    Ret(Operand),
    Unreachable,
}

impl Inst {
    /// The type of the value this instruction produces.
    pub fn ty(&self, f: &Func) -> Ty {
        match self {
            Inst::Arg | Inst::Alloca { .. } | Inst::FrameAddr { .. } | Inst::PtrAdd { .. } => {
                Ty::Ptr
            }
            Inst::PtrDiff { .. } => I64,
            Inst::Load { ty, .. } => *ty,
            Inst::BinOp { lhs, .. } => lhs.ty(f),
            Inst::Icmp { .. } => I1,
            Inst::Select { trueval, .. } => trueval.ty(f),
            Inst::Call { target, .. } => target.sig().1,
            Inst::Store { .. }
            | Inst::MemCpy { .. }
            | Inst::Br(_)
            | Inst::CondBr { .. }
            | Inst::Switch { .. }
            | Inst::Ret(_)
            | Inst::Unreachable => Ty::Void,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Br(_)
                | Inst::CondBr { .. }
                | Inst::Switch { .. }
                | Inst::Ret(_)
                | Inst::Unreachable
        )
    }

    /// The blocks control may transfer to after this instruction.
    pub fn successors(&self) -> Vec<BlockIdx> {
        match self {
            Inst::Br(b) => vec![*b],
            Inst::CondBr {
                trueblk, falseblk, ..
            } => vec![*trueblk, *falseblk],
            Inst::Switch { default, cases, .. } => {
                let mut v = vec![*default];
                v.extend(cases.iter().map(|(_, b)| *b));
                v
            }
            _ => Vec::new(),
        }
    }

    pub fn operands(&self) -> Vec<Operand> {
        match self {
            Inst::Arg | Inst::Alloca { .. } | Inst::Br(_) | Inst::Unreachable => Vec::new(),
            Inst::FrameAddr { frame, .. } => vec![*frame],
            Inst::PtrAdd { ptr, off } => vec![*ptr, *off],
            Inst::PtrDiff { lhs, rhs } | Inst::BinOp { lhs, rhs, .. } | Inst::Icmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            Inst::Load { ptr, .. } => vec![*ptr],
            Inst::Store { ptr, val } => vec![*ptr, *val],
            Inst::MemCpy { dst, src, count } => vec![*dst, *src, *count],
            Inst::Select {
                cond,
                trueval,
                falseval,
            } => vec![*cond, *trueval, *falseval],
            Inst::Call { args, .. } => args.clone(),
            Inst::CondBr { cond, .. } => vec![*cond],
            Inst::Switch { val, .. } => vec![*val],
            Inst::Ret(v) => vec![*v],
        }
    }

    pub fn display<'a>(&'a self, iidx: InstIdx, f: &'a Func) -> DisplayableInst<'a> {
        DisplayableInst {
            inst: self,
            iidx,
            f,
        }
    }
}

pub struct DisplayableInst<'a> {
    inst: &'a Inst,
    iidx: InstIdx,
    f: &'a Func,
}

impl fmt::Display for DisplayableInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = self.inst.ty(self.f);
        if ty != Ty::Void {
            write!(f, "{}: {ty} = ", self.iidx)?;
        }
        match self.inst {
            Inst::Arg => write!(f, "arg"),
            Inst::Alloca { ty, count } => write!(f, "alloca {ty}, {count}"),
            Inst::FrameAddr { frame, field } => write!(f, "frame_addr {frame}, {field}"),
            Inst::PtrAdd { ptr, off } => write!(f, "ptr_add {ptr}, {off}"),
            Inst::PtrDiff { lhs, rhs } => write!(f, "ptr_diff {lhs}, {rhs}"),
            Inst::Load { ptr, .. } => write!(f, "load {ptr}"),
            Inst::Store { ptr, val } => write!(f, "store {ptr}, {val}"),
            Inst::MemCpy { dst, src, count } => write!(f, "memcpy {dst}, {src}, {count}"),
            Inst::BinOp { op, lhs, rhs } => write!(f, "{op} {lhs}, {rhs}"),
            Inst::Icmp { pred, lhs, rhs } => write!(f, "icmp {pred} {lhs}, {rhs}"),
            Inst::Select {
                cond,
                trueval,
                falseval,
            } => write!(f, "select {cond}, {trueval}, {falseval}"),
            Inst::Call { target, args } => write!(
                f,
                "call @{target}({})",
                args.iter()
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Inst::Br(b) => write!(f, "br {b}"),
            Inst::CondBr {
                cond,
                trueblk,
                falseblk,
            } => write!(f, "condbr {cond}, {trueblk}, {falseblk}"),
            Inst::Switch {
                val,
                default,
                cases,
            } => write!(
                f,
                "switch {val}, {default} [{}]",
                cases
                    .iter()
                    .map(|(v, b)| format!("{v}: {b}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Inst::Ret(v) => write!(f, "ret {v}"),
            Inst::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug)]
pub struct Block {
    /// A human readable label, printed as a comment.
    pub label: String,
    insts: Vec<InstIdx>,
}

impl Block {
    pub fn insts(&self) -> &[InstIdx] {
        &self.insts
    }
}

/// A finished IR function. Its entry block is `bb0`, which begins with an [Inst::Arg].
#[derive(Debug)]
pub struct Func {
    name: String,
    insts: TiVec<InstIdx, Inst>,
    blocks: TiVec<BlockIdx, Block>,
}

impl Func {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inst(&self, iidx: InstIdx) -> &Inst {
        &self.insts[iidx]
    }

    pub fn block(&self, bidx: BlockIdx) -> &Block {
        &self.blocks[bidx]
    }

    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_idxs(&self) -> impl Iterator<Item = BlockIdx> + '_ {
        self.blocks.keys()
    }

    /// Iterate over every call this function makes.
    pub fn calls(&self) -> impl Iterator<Item = RuntimeFn> + '_ {
        self.insts.iter().filter_map(|i| match i {
            Inst::Call { target, .. } => Some(*target),
            _ => None,
        })
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func {}(%0: ptr) {{", self.name)?;
        for (bidx, b) in self.blocks.iter_enumerated() {
            write!(f, "\n{bidx}:")?;
            if !b.label.is_empty() {
                write!(f, " ; {}", b.label)?;
            }
            for iidx in &b.insts {
                write!(f, "\n    {}", self.insts[*iidx].display(*iidx, self))?;
            }
        }
        write!(f, "\n}}")
    }
}

/// Builds a [Func]: create blocks, append instructions to the current block, finalize.
pub struct FuncBuilder {
    func: Func,
    cur: BlockIdx,
    /// How many allocas have been placed at the start of the entry block.
    num_allocas: usize,
}

impl FuncBuilder {
    /// Start a function whose entry block holds only the frame argument.
    pub fn new(name: &str) -> Self {
        let mut func = Func {
            name: name.to_owned(),
            insts: TiVec::new(),
            blocks: TiVec::new(),
        };
        let entry = func.blocks.push_and_get_key(Block {
            label: "entry".to_owned(),
            insts: Vec::new(),
        });
        let arg = func.insts.push_and_get_key(Inst::Arg);
        func.blocks[entry].insts.push(arg);
        Self {
            func,
            cur: entry,
            num_allocas: 0,
        }
    }

    /// The frame argument.
    pub fn frame(&self) -> Operand {
        Operand::Local(InstIdx(U24([0, 0, 0])))
    }

    pub fn entry(&self) -> BlockIdx {
        BlockIdx(0)
    }

    pub fn new_block(&mut self, label: &str) -> Result<BlockIdx, CompilationError> {
        let bidx = BlockIdx::new(self.func.blocks.len())?;
        self.func.blocks.push(Block {
            label: label.to_owned(),
            insts: Vec::new(),
        });
        Ok(bidx)
    }

    /// Append subsequent instructions to `bidx`.
    pub fn position_at_end(&mut self, bidx: BlockIdx) {
        self.cur = bidx;
    }

    pub fn cur_block(&self) -> BlockIdx {
        self.cur
    }

    /// Does `bidx` already end in a terminator?
    pub fn is_terminated(&self, bidx: BlockIdx) -> bool {
        self.func.blocks[bidx]
            .insts
            .last()
            .is_some_and(|i| self.func.insts[*i].is_terminator())
    }

    fn add_inst(&mut self, inst: Inst) -> Result<InstIdx, CompilationError> {
        let iidx = InstIdx::new(self.func.insts.len())?;
        self.func.insts.push(inst);
        Ok(iidx)
    }

    /// Append `inst` to the current block, returning its value.
    pub fn push(&mut self, inst: Inst) -> Result<Operand, CompilationError> {
        if self.is_terminated(self.cur) {
            return Err(CompilationError::InternalError(format!(
                "appending to terminated block {} of {}",
                self.cur, self.func.name
            )));
        }
        if matches!(inst, Inst::Alloca { .. } | Inst::Arg) {
            return Err(CompilationError::InternalError(
                "allocas must be created with FuncBuilder::alloca".to_owned(),
            ));
        }
        let iidx = self.add_inst(inst)?;
        self.func.blocks[self.cur].insts.push(iidx);
        Ok(Operand::Local(iidx))
    }

    /// Allocate `count` slots of type `ty` at the start of the entry block, wherever the
    /// builder is currently positioned.
    pub fn alloca(&mut self, ty: Ty, count: u32) -> Result<Operand, CompilationError> {
        let iidx = self.add_inst(Inst::Alloca { ty, count })?;
        self.num_allocas += 1;
        // After the frame argument.
        self.func.blocks[BlockIdx(0)]
            .insts
            .insert(self.num_allocas, iidx);
        Ok(Operand::Local(iidx))
    }

    /// The function built so far.
    pub fn func(&self) -> &Func {
        &self.func
    }

    pub fn finalize(self) -> Func {
        #[cfg(any(debug_assertions, test))]
        self.func.assert_well_formed();
        self.func
    }

    // Convenience emitters.

    pub fn load(&mut self, ptr: Operand, ty: Ty) -> Result<Operand, CompilationError> {
        self.push(Inst::Load { ptr, ty })
    }

    pub fn store(&mut self, ptr: Operand, val: Operand) -> Result<(), CompilationError> {
        self.push(Inst::Store { ptr, val }).map(|_| ())
    }

    pub fn ptr_add(&mut self, ptr: Operand, off: Operand) -> Result<Operand, CompilationError> {
        match off {
            Operand::Const(Const::Int(_, 0)) => Ok(ptr),
            _ => self.push(Inst::PtrAdd { ptr, off }),
        }
    }

    pub fn frame_addr(&mut self, field: FrameField) -> Result<Operand, CompilationError> {
        let frame = self.frame();
        self.push(Inst::FrameAddr { frame, field })
    }

    pub fn binop(
        &mut self,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Operand, CompilationError> {
        self.push(Inst::BinOp { op, lhs, rhs })
    }

    pub fn icmp(
        &mut self,
        pred: Pred,
        lhs: Operand,
        rhs: Operand,
    ) -> Result<Operand, CompilationError> {
        self.push(Inst::Icmp { pred, lhs, rhs })
    }

    pub fn call(
        &mut self,
        target: RuntimeFn,
        args: &[Operand],
    ) -> Result<Operand, CompilationError> {
        self.push(Inst::Call {
            target,
            args: args.to_vec(),
        })
    }

    pub fn br(&mut self, bidx: BlockIdx) -> Result<(), CompilationError> {
        self.push(Inst::Br(bidx)).map(|_| ())
    }

    pub fn cond_br(
        &mut self,
        cond: Operand,
        trueblk: BlockIdx,
        falseblk: BlockIdx,
    ) -> Result<(), CompilationError> {
        self.push(Inst::CondBr {
            cond,
            trueblk,
            falseblk,
        })
        .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn u24() {
        for v in [0, 1, 0x1234, 0xabcdef, (1 << 24) - 1] {
            assert_eq!(U24::from_usize(v).unwrap().to_usize(), v);
        }
        assert!(U24::from_usize(1 << 24).is_none());
        assert!(matches!(
            BlockIdx::new(1 << 16),
            Err(CompilationError::LimitExceeded(_))
        ));
    }

    #[test]
    fn runtime_fn_names() {
        assert_eq!(RuntimeFn::Binary(BinaryOp::Add).to_string(), "binary_add");
        assert_eq!(RuntimeFn::CallFunctionVarKw.to_string(), "call_function_var_kw");
        assert_eq!(RuntimeFn::XDecRef.to_string(), "x_dec_ref");
        assert_eq!(RuntimeFn::Compare(CompareOp::Le).to_string(), "compare[<=]");
    }

    #[test]
    fn build_and_print() {
        let mut b = FuncBuilder::new("f");
        let slot = b.alloca(Ty::Obj, 1).unwrap();
        let exit = b.new_block("exit").unwrap();
        let c = b.icmp(Pred::Eq, Operand::i64(1), Operand::i64(2)).unwrap();
        b.store(slot, Operand::null()).unwrap();
        b.cond_br(c, exit, exit).unwrap();
        assert!(b.is_terminated(b.entry()));
        assert!(b.br(exit).is_err());
        b.position_at_end(exit);
        let v = b.load(slot, Ty::Obj).unwrap();
        b.push(Inst::Ret(v)).unwrap();
        let f = b.finalize();
        assert_eq!(
            f.to_string(),
            "func f(%0: ptr) {
bb0: ; entry
    %0: ptr = arg
    %1: ptr = alloca obj, 1
    %2: i1 = icmp eq 1i64, 2i64
    store %1, null
    condbr %2, bb1, bb1
bb1: ; exit
    %3: obj = load %1
    ret %3
}"
        );
    }
}
