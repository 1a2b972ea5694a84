//! The frame record: the authoritative per-activation state shared by the interpreter and
//! translated code.
//!
//! Translated code keeps "shadow" copies of most of these fields while it runs and writes them
//! back here whenever control may return to the interpreter.

use crate::{
    code::CodeDescriptor,
    runtime::{ObjId, Runtime},
};
use std::rc::Rc;
use strum::{Display, FromRepr};

/// The maximum depth of the block stack.
pub const MAX_BLOCKS: usize = 20;

/// A block-stack entry: a `SETUP_*` that has not yet been popped.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TryBlock {
    /// One of [crate::code::BLOCK_LOOP], [crate::code::BLOCK_EXCEPT] or
    /// [crate::code::BLOCK_FINALLY].
    pub kind: i32,
    /// The handler's instruction offset.
    pub handler: i32,
    /// The operand stack depth when the block was set up.
    pub level: i32,
}

/// Why translated code handed a frame back to the interpreter.
#[derive(Clone, Copy, Debug, Default, Display, Eq, FromRepr, Hash, PartialEq)]
#[repr(i32)]
pub enum BailReason {
    #[default]
    None = 0,
    /// A tracing hook was active on entry.
    TraceOnEntry,
    /// A tracing hook became active before a new source line.
    LineTrace,
    /// A tracing hook became active before a loop back edge.
    BackedgeTrace,
    /// A profiling hook was active at a call.
    CallProfile,
    /// A branch that feedback said was never taken was taken.
    GuardFail,
    /// The function's guard dependencies were invalidated while it was running.
    FatalGuard,
    /// The instruction has no translation.
    NoNativePath,
}

/// Why the block stack is being unwound. A `finally` handler entered for any reason other than an
/// exception finds the reason on the stack as an int, and `END_FINALLY` resumes unwinding with it.
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[repr(i64)]
pub enum UnwindReason {
    /// Not unwinding.
    None = 1,
    Raise = 2,
    Return = 8,
    Break = 0x10,
    /// `continue` inside a `try`: the loop's continuation offset travels in the return value
    /// slot.
    Continue = 0x20,
    Yield = 0x40,
}

impl UnwindReason {
    /// The reason a `finally` handler saved as the int `v`, if `END_FINALLY` can resume it.
    pub fn saved_by_finally(v: i64) -> Option<Self> {
        match Self::from_repr(v)? {
            r @ (UnwindReason::Return | UnwindReason::Break | UnwindReason::Continue) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Frame {
    pub code: Rc<CodeDescriptor>,
    pub globals: ObjId,
    pub builtins: ObjId,
    /// The locals dictionary of unoptimized code.
    pub locals: Option<ObjId>,
    /// Locals, then cells, then free variables.
    pub fastlocals: Vec<Option<ObjId>>,
    pub valuestack: Vec<Option<ObjId>>,
    /// The operand stack depth, or -1 once the frame has finished.
    pub stacktop: i32,
    pub blockstack: [TryBlock; MAX_BLOCKS],
    pub iblock: i32,
    /// The offset of the last instruction started. For a suspended generator this is its
    /// `YIELD_VALUE`; after a bailout it is the next instruction to execute.
    pub lasti: i32,
    pub lineno: i32,
    pub bail_reason: BailReason,
}

impl Frame {
    /// Create a frame for `code`. `globals` and `locals` are borrowed.
    pub fn new(
        rt: &mut Runtime,
        code: Rc<CodeDescriptor>,
        globals: ObjId,
        locals: Option<ObjId>,
    ) -> Self {
        rt.incref(globals);
        let builtins = rt.new_ref(rt.builtins());
        if let Some(l) = locals {
            rt.incref(l);
        }
        Frame {
            fastlocals: vec![None; code.nfast()],
            valuestack: vec![None; code.stacksize],
            lineno: code.firstlineno,
            code,
            globals,
            builtins,
            locals,
            stacktop: 0,
            blockstack: [TryBlock::default(); MAX_BLOCKS],
            iblock: 0,
            lasti: -1,
            bail_reason: BailReason::None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.stacktop < 0
    }

    /// Push an owned reference.
    pub fn push(&mut self, v: ObjId) {
        self.valuestack[self.stacktop as usize] = Some(v);
        self.stacktop += 1;
    }

    /// Pop an owned reference.
    pub fn pop(&mut self) -> ObjId {
        self.stacktop -= 1;
        match self.valuestack[self.stacktop as usize].take() {
            Some(v) => v,
            None => panic!("empty stack slot {} in {}", self.stacktop, self.code.name),
        }
    }

    /// A borrowed reference to the value `n` slots below the top of the stack.
    pub fn peek(&self, n: usize) -> ObjId {
        match self.valuestack[self.stacktop as usize - 1 - n] {
            Some(v) => v,
            None => panic!("empty stack slot in {}", self.code.name),
        }
    }

    /// Push a block-stack entry, returning `false` if the block stack is full.
    pub fn push_block(&mut self, kind: i32, handler: i32, level: i32) -> bool {
        match self.blockstack.get_mut(self.iblock as usize) {
            Some(b) => {
                *b = TryBlock {
                    kind,
                    handler,
                    level,
                };
                self.iblock += 1;
                true
            }
            None => false,
        }
    }

    pub fn pop_block(&mut self) -> TryBlock {
        assert!(self.iblock > 0, "block stack underflow in {}", self.code.name);
        self.iblock -= 1;
        self.blockstack[self.iblock as usize]
    }

    /// Push every reference this frame owns onto `out`.
    pub(crate) fn referents(&self, out: &mut Vec<ObjId>) {
        out.push(self.globals);
        out.push(self.builtins);
        out.extend(self.locals.iter().copied());
        out.extend(self.fastlocals.iter().flatten().copied());
        if self.stacktop > 0 {
            out.extend(
                self.valuestack[..self.stacktop as usize]
                    .iter()
                    .flatten()
                    .copied(),
            );
        }
    }

    /// Release every reference this frame owns.
    pub fn clear(self, rt: &mut Runtime) {
        let mut refs = Vec::new();
        self.referents(&mut refs);
        for r in refs {
            rt.decref(r);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::code::{encode, Instr, Opcode};

    fn frame(rt: &mut Runtime) -> Frame {
        let raw = encode(&[Instr {
            op: Opcode::ReturnValue,
            arg: 0,
        }]);
        let mut code = CodeDescriptor::new("f", raw).unwrap();
        code.varnames = vec!["a".to_owned()];
        code.stacksize = 2;
        let g = rt.new_dict();
        let f = Frame::new(rt, Rc::new(code), g, None);
        rt.decref(g);
        f
    }

    #[test]
    fn clear_releases_everything() {
        let mut rt = Runtime::new();
        let before = rt.live_objects();
        let mut f = frame(&mut rt);
        let x = rt.new_int(1);
        f.push(x);
        f.fastlocals[0] = Some(rt.new_ref(x));
        assert_eq!(rt.refcount(x), 2);
        f.clear(&mut rt);
        assert_eq!(rt.live_objects(), before);
    }

    #[test]
    fn block_stack_limit() {
        let mut rt = Runtime::new();
        let mut f = frame(&mut rt);
        for i in 0..MAX_BLOCKS {
            assert!(f.push_block(120, i as i32, 0));
        }
        assert!(!f.push_block(120, 0, 0));
        assert_eq!(f.pop_block().handler, MAX_BLOCKS as i32 - 1);
        f.clear(&mut rt);
    }

    #[test]
    fn bail_reasons_roundtrip_through_i32() {
        for r in [BailReason::None, BailReason::GuardFail, BailReason::NoNativePath] {
            assert_eq!(BailReason::from_repr(r as i32), Some(r));
        }
    }
}
