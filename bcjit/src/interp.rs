//! The bytecode interpreter.
//!
//! This is the baseline execution engine: translated code hands frames back to it on a bailout,
//! and it records the [FeedbackMap] observations the translator specialises on. A frame whose
//! `bail_reason` is set resumes at `lasti`; any other frame resumes after `lasti` (a fresh frame
//! has `lasti == -1`, a suspended generator's `lasti` is its `YIELD_VALUE`).

use crate::{
    code::{CodeDescriptor, Instr, Opcode, BLOCK_EXCEPT, BLOCK_FINALLY, BLOCK_LOOP},
    feedback::FeedbackMap,
    frame::{BailReason, Frame, UnwindReason},
    runtime::{
        CompareOp, FinallyDisposition, FrameEvaluator, FrameResult, ObjId, Raised, RtResult,
        Runtime,
    },
};
use std::rc::Rc;

/// A [FrameEvaluator] that only interprets.
#[derive(Debug, Default)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Interpreter
    }
}

impl FrameEvaluator for Interpreter {
    fn eval_frame(&self, rt: &mut Runtime, frame: &mut Frame) -> FrameResult {
        interpret(rt, frame, None)
    }
}

/// Run `frame` until it returns, raises or yields, recording feedback into `feedback` if given.
pub fn interpret(
    rt: &mut Runtime,
    frame: &mut Frame,
    feedback: Option<&mut FeedbackMap>,
) -> FrameResult {
    let pc = if frame.bail_reason != BailReason::None {
        frame.bail_reason = BailReason::None;
        frame.lasti
    } else {
        frame.lasti + 1
    };
    let code = Rc::clone(&frame.code);
    let mut st = Interp {
        rt,
        f: frame,
        code,
        feedback,
        pc: usize::try_from(pc).unwrap_or(0),
        retval: None,
    };
    st.run()
}

/// What to do after an instruction.
enum Step {
    /// Carry on at `pc`.
    Next,
    Unwind(UnwindReason),
}

struct Interp<'a> {
    rt: &'a mut Runtime,
    f: &'a mut Frame,
    code: Rc<CodeDescriptor>,
    feedback: Option<&'a mut FeedbackMap>,
    pc: usize,
    /// The value being returned or yielded, or a `continue` target.
    retval: Option<ObjId>,
}

impl Interp<'_> {
    fn run(&mut self) -> FrameResult {
        loop {
            let why = match self.step() {
                Ok(Step::Next) => continue,
                Ok(Step::Unwind(why)) => why,
                Err(Raised) => {
                    self.rt.traceback_here(self.f.lineno);
                    UnwindReason::Raise
                }
            };
            if let Some(r) = self.unwind(why) {
                return r;
            }
        }
    }

    fn push(&mut self, v: ObjId) {
        self.f.push(v);
    }

    fn pop(&mut self) -> ObjId {
        self.f.pop()
    }

    fn push_result(&mut self, r: RtResult<ObjId>) -> RtResult<Step> {
        self.push(r?);
        Ok(Step::Next)
    }

    fn drain_to(&mut self, level: i32) {
        while self.f.stacktop > level {
            let v = self.pop();
            self.rt.decref(v);
        }
    }

    /// The cell in cell-or-free slot `i`.
    fn cell(&self, i: usize) -> ObjId {
        let slot = self.code.varnames.len() + i;
        match self.f.fastlocals[slot] {
            Some(c) => c,
            None => panic!("{}: fast slot {slot} holds no cell", self.code.name),
        }
    }

    fn record_type(&mut self, off: usize, obj: ObjId) {
        let ty = self.rt.type_of(obj);
        if let Some(fb) = self.feedback.as_deref_mut() {
            fb.record_type(off, 0, ty);
        }
    }

    fn record_branch(&mut self, off: usize, taken: bool) {
        if let Some(fb) = self.feedback.as_deref_mut() {
            fb.record_branch(off, taken);
        }
    }

    fn record_call(&mut self, off: usize, instr: Instr) {
        let (npop, _) = instr.stack_effect();
        let callee = self.f.peek(npop - 1);
        if let Some(fb) = self.feedback.as_deref_mut() {
            fb.record_call(off, callee, instr.arg);
        }
    }

    /// The checks translated code makes on a loop back edge.
    fn back_edge(&mut self) -> RtResult<()> {
        if self.rt.decrement_ticker() < 0 {
            self.rt.handle_pending_calls()?;
        }
        Ok(())
    }

    fn binary(&mut self, f: impl FnOnce(&mut Runtime, ObjId, ObjId) -> RtResult<ObjId>) -> RtResult<Step> {
        let w = self.pop();
        let v = self.pop();
        let r = f(self.rt, v, w);
        self.rt.decref(v);
        self.rt.decref(w);
        self.push_result(r)
    }

    /// Pop the bounds of a `SLICE+n`-style instruction: bit 1 of `variant` means a start is
    /// present, bit 2 a stop.
    fn pop_slice_bounds(&mut self, variant: u8) -> (Option<ObjId>, Option<ObjId>) {
        let stop = (variant & 2 != 0).then(|| self.pop());
        let start = (variant & 1 != 0).then(|| self.pop());
        (start, stop)
    }

    fn release(&mut self, vs: impl IntoIterator<Item = Option<ObjId>>) {
        for v in vs {
            self.rt.xdecref(v);
        }
    }

    fn step(&mut self) -> RtResult<Step> {
        let off = self.pc;
        let instr = self.code.instrs()[off];
        self.f.lasti = off as i32;
        self.f.lineno = self.code.line_at(off);
        self.pc += 1;
        let arg = instr.arg as usize;

        if let Some(op) = instr.op.binary_op() {
            return self.binary(|rt, v, w| rt.binary_op(op, v, w));
        }
        if let Some(op) = instr.op.inplace_op() {
            return self.binary(|rt, v, w| rt.inplace_op(op, v, w));
        }
        match instr.op {
            Opcode::Nop => (),
            Opcode::PopTop => {
                let v = self.pop();
                self.rt.decref(v);
            }
            Opcode::RotTwo => {
                let (a, b) = (self.pop(), self.pop());
                self.push(a);
                self.push(b);
            }
            Opcode::RotThree => {
                let (a, b, c) = (self.pop(), self.pop(), self.pop());
                self.push(a);
                self.push(c);
                self.push(b);
            }
            Opcode::RotFour => {
                let (a, b, c, d) = (self.pop(), self.pop(), self.pop(), self.pop());
                self.push(a);
                self.push(d);
                self.push(c);
                self.push(b);
            }
            Opcode::DupTop => {
                let v = self.rt.new_ref(self.f.peek(0));
                self.push(v);
            }
            Opcode::DupTopx => {
                for _ in 0..arg {
                    let v = self.rt.new_ref(self.f.peek(arg - 1));
                    self.push(v);
                }
            }
            Opcode::LoadConst => {
                let c = self.rt.new_ref(self.code.consts[arg]);
                self.push(c);
            }
            Opcode::LoadFast => match self.f.fastlocals[arg] {
                Some(v) => {
                    let v = self.rt.new_ref(v);
                    self.push(v);
                }
                None => return Err(self.rt.raise_unbound_local(self.code.fast_name(arg))),
            },
            Opcode::StoreFast => {
                let v = self.pop();
                let old = self.f.fastlocals[arg].replace(v);
                self.rt.xdecref(old);
            }
            Opcode::DeleteFast => match self.f.fastlocals[arg].take() {
                Some(v) => self.rt.decref(v),
                None => return Err(self.rt.raise_unbound_local(self.code.fast_name(arg))),
            },
            Opcode::LoadClosure => {
                let c = self.rt.new_ref(self.cell(arg));
                self.push(c);
            }
            Opcode::LoadDeref => {
                let cell = self.cell(arg);
                let slot = self.code.varnames.len() + arg;
                let is_free = arg >= self.code.cellvars.len();
                let r = self.rt.deref(cell, self.code.fast_name(slot), is_free);
                return self.push_result(r);
            }
            Opcode::StoreDeref => {
                let cell = self.cell(arg);
                let v = self.pop();
                self.rt.cell_set(cell, Some(v));
                self.rt.decref(v);
            }
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert => {
                let Some(op) = instr.op.unary_op() else {
                    unreachable!()
                };
                let v = self.pop();
                let r = self.rt.unary_op(op, v);
                self.rt.decref(v);
                return self.push_result(r);
            }
            Opcode::CompareOp => {
                let Some(op) = CompareOp::from_repr(arg as u8) else {
                    panic!("{}: bad comparison {arg}", self.code.name)
                };
                return self.binary(|rt, v, w| rt.compare_op(op, v, w));
            }
            Opcode::BinarySubscr => return self.binary(|rt, v, w| rt.getitem(v, w)),
            Opcode::StoreSubscr => {
                let (key, container, v) = (self.pop(), self.pop(), self.pop());
                let r = self.rt.setitem(container, key, v);
                self.release([Some(key), Some(container), Some(v)]);
                r?;
            }
            Opcode::DeleteSubscr => {
                let (key, container) = (self.pop(), self.pop());
                let r = self.rt.delitem(container, key);
                self.release([Some(key), Some(container)]);
                r?;
            }
            Opcode::Slice0 | Opcode::Slice1 | Opcode::Slice2 | Opcode::Slice3 => {
                let (start, stop) = self.pop_slice_bounds(instr.op as u8 - Opcode::Slice0 as u8);
                let seq = self.pop();
                let r = self.rt.apply_slice(seq, start, stop);
                self.release([Some(seq), start, stop]);
                return self.push_result(r);
            }
            Opcode::StoreSlice0
            | Opcode::StoreSlice1
            | Opcode::StoreSlice2
            | Opcode::StoreSlice3 => {
                let variant = instr.op as u8 - Opcode::StoreSlice0 as u8;
                let (start, stop) = self.pop_slice_bounds(variant);
                let seq = self.pop();
                let v = self.pop();
                let r = self.rt.assign_slice(seq, start, stop, Some(v));
                self.release([Some(seq), start, stop, Some(v)]);
                r?;
            }
            Opcode::DeleteSlice0
            | Opcode::DeleteSlice1
            | Opcode::DeleteSlice2
            | Opcode::DeleteSlice3 => {
                let variant = instr.op as u8 - Opcode::DeleteSlice0 as u8;
                let (start, stop) = self.pop_slice_bounds(variant);
                let seq = self.pop();
                let r = self.rt.assign_slice(seq, start, stop, None);
                self.release([Some(seq), start, stop]);
                r?;
            }
            Opcode::BuildSlice => {
                let step = (arg == 3).then(|| self.pop());
                let (stop, start) = (self.pop(), self.pop());
                let s = self.rt.build_slice(start, stop, step);
                self.release([Some(start), Some(stop), step]);
                self.push(s);
            }
            Opcode::BuildTuple | Opcode::BuildList => {
                let mut items = (0..arg).map(|_| self.pop()).collect::<Vec<_>>();
                items.reverse();
                let r = if instr.op == Opcode::BuildTuple {
                    self.rt.new_tuple(items)
                } else {
                    self.rt.new_list(items)
                };
                self.push(r);
            }
            Opcode::BuildMap => {
                let d = self.rt.new_dict();
                self.push(d);
            }
            Opcode::StoreMap => {
                let (key, v) = (self.pop(), self.pop());
                let r = self.rt.dict_set(self.f.peek(0), key, v);
                self.release([Some(key), Some(v)]);
                r?;
            }
            Opcode::ListAppend => {
                let v = self.pop();
                self.rt.list_append(self.f.peek(arg - 1), v);
                self.rt.decref(v);
            }
            Opcode::UnpackSequence => {
                let seq = self.pop();
                let r = self.rt.unpack_sequence(seq, arg);
                self.rt.decref(seq);
                for v in r?.into_iter().rev() {
                    self.push(v);
                }
            }
            Opcode::GetIter => {
                let v = self.pop();
                let r = self.rt.get_iter(v);
                self.rt.decref(v);
                return self.push_result(r);
            }
            Opcode::ForIter => match self.rt.iter_next(self.f.peek(0)) {
                Ok(Some(v)) => self.push(v),
                r => {
                    if r.is_err() && !self.rt.err_clear_stop_iteration() {
                        return Err(Raised);
                    }
                    let it = self.pop();
                    self.rt.decref(it);
                    self.pc = off + 1 + arg;
                }
            },
            Opcode::LoadName => {
                let (l, g, b) = (self.f.locals, self.f.globals, self.f.builtins);
                let r = self.rt.load_name(l, g, b, &self.code.names[arg]);
                return self.push_result(r);
            }
            Opcode::StoreName => {
                let v = self.pop();
                let r = self.rt.store_name(self.f.locals, &self.code.names[arg], v);
                self.rt.decref(v);
                r?;
            }
            Opcode::DeleteName => {
                self.rt
                    .delete_name(self.f.locals, &self.code.names[arg], false)?;
            }
            Opcode::LoadGlobal => {
                let (g, b) = (self.f.globals, self.f.builtins);
                let r = self.rt.load_global(g, b, &self.code.names[arg]);
                return self.push_result(r);
            }
            Opcode::StoreGlobal => {
                let v = self.pop();
                self.rt.dict_set_str(self.f.globals, &self.code.names[arg], v);
                self.rt.decref(v);
            }
            Opcode::DeleteGlobal => {
                self.rt
                    .delete_name(Some(self.f.globals), &self.code.names[arg], true)?;
            }
            Opcode::LoadAttr => {
                let obj = self.pop();
                self.record_type(off, obj);
                let r = self.rt.getattr_str(obj, &self.code.names[arg]);
                self.rt.decref(obj);
                return self.push_result(r);
            }
            Opcode::StoreAttr => {
                let obj = self.pop();
                let v = self.pop();
                self.record_type(off, obj);
                let r = self.rt.setattr_str(obj, &self.code.names[arg], Some(v));
                self.release([Some(v), Some(obj)]);
                r?;
            }
            Opcode::DeleteAttr => {
                let obj = self.pop();
                let r = self.rt.setattr_str(obj, &self.code.names[arg], None);
                self.rt.decref(obj);
                r?;
            }
            Opcode::ImportName => {
                let (fromlist, level) = (self.pop(), self.pop());
                let r = self.rt.import_name(&self.code.names[arg]);
                self.release([Some(fromlist), Some(level)]);
                return self.push_result(r);
            }
            Opcode::CallFunction
            | Opcode::CallFunctionVar
            | Opcode::CallFunctionKw
            | Opcode::CallFunctionVarKw => {
                self.record_call(off, instr);
                return self.call(instr.op, instr.call_counts());
            }
            Opcode::MakeFunction | Opcode::MakeClosure => {
                let code = self.pop();
                let closure = (instr.op == Opcode::MakeClosure).then(|| self.pop());
                let mut defaults = (0..arg).map(|_| self.pop()).collect::<Vec<_>>();
                defaults.reverse();
                let f = self
                    .rt
                    .make_function(code, self.f.globals, defaults, closure);
                self.rt.decref(code);
                self.push(f);
            }
            Opcode::JumpForward => self.pc = off + 1 + arg,
            Opcode::JumpAbsolute => {
                if arg <= off {
                    self.back_edge()?;
                }
                self.pc = arg;
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let v = self.pop();
                let t = self.rt.is_true(v);
                self.rt.decref(v);
                let jump = t == (instr.op == Opcode::PopJumpIfTrue);
                self.record_branch(off, jump);
                if jump {
                    if arg <= off {
                        self.back_edge()?;
                    }
                    self.pc = arg;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let t = self.rt.is_true(self.f.peek(0));
                let jump = t == (instr.op == Opcode::JumpIfTrueOrPop);
                self.record_branch(off, jump);
                if jump {
                    if arg <= off {
                        self.back_edge()?;
                    }
                    self.pc = arg;
                } else {
                    let v = self.pop();
                    self.rt.decref(v);
                }
            }
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let (handler, level) = ((off + 1 + arg) as i32, self.f.stacktop);
                if !self.f.push_block(instr.op as i32, handler, level) {
                    let se = self.rt.types.system_error;
                    return Err(self.rt.raise_new(se, "block stack overflow"));
                }
            }
            Opcode::PopBlock => {
                let b = self.f.pop_block();
                self.drain_to(b.level);
            }
            Opcode::ReturnValue => {
                self.retval = Some(self.pop());
                return Ok(Step::Unwind(UnwindReason::Return));
            }
            Opcode::YieldValue => {
                self.retval = Some(self.pop());
                return Ok(Step::Unwind(UnwindReason::Yield));
            }
            Opcode::RaiseVarargs => {
                let mut args = [None; 3];
                for slot in args.iter_mut().take(arg.min(3)).rev() {
                    *slot = Some(self.pop());
                }
                let fresh = self.rt.do_raise(args[0], args[1], args[2]);
                self.release(args);
                return if fresh {
                    Err(Raised)
                } else {
                    Ok(Step::Unwind(UnwindReason::Raise))
                };
            }
            Opcode::EndFinally => return self.end_finally(),
            Opcode::WithCleanup => return self.with_cleanup(),
            Opcode::BreakLoop => return Ok(Step::Unwind(UnwindReason::Break)),
            Opcode::ContinueLoop => {
                self.back_edge()?;
                self.retval = Some(self.rt.new_int(arg as i64));
                return Ok(Step::Unwind(UnwindReason::Continue));
            }
            // Dispatched above via `binary_op` / `inplace_op`.
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplacePower
            | Opcode::InplaceMultiply
            | Opcode::InplaceDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceModulo
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => unreachable!(),
        }
        Ok(Step::Next)
    }

    fn call(&mut self, op: Opcode, (na, nk): (usize, usize)) -> RtResult<Step> {
        let (star, starstar) = match op {
            Opcode::CallFunctionVar => (true, false),
            Opcode::CallFunctionKw => (false, true),
            Opcode::CallFunctionVarKw => (true, true),
            _ => (false, false),
        };
        let n = 1 + na + 2 * nk + usize::from(star) + usize::from(starstar);
        let mut slots = (0..n).map(|_| self.pop()).collect::<Vec<_>>();
        slots.reverse();
        let kwargs = slots[1 + na..1 + na + 2 * nk]
            .chunks(2)
            .map(|kv| (kv[0], kv[1]))
            .collect::<Vec<_>>();
        let mut extra = slots[1 + na + 2 * nk..].iter().copied();
        let r = if star || starstar {
            let s = if star { extra.next() } else { None };
            let ss = if starstar { extra.next() } else { None };
            self.rt
                .call_extended(slots[0], &slots[1..=na], &kwargs, s, ss)
        } else {
            self.rt.call(slots[0], &slots[1..=na], &kwargs)
        };
        self.release(slots.into_iter().map(Some));
        self.push_result(r)
    }

    fn end_finally(&mut self) -> RtResult<Step> {
        let v = self.pop();
        match self.rt.finally_disposition(v) {
            FinallyDisposition::Normal => {
                self.rt.decref(v);
                Ok(Step::Next)
            }
            FinallyDisposition::Reason => {
                let why = self.rt.int_value(v).and_then(UnwindReason::saved_by_finally);
                self.rt.decref(v);
                let Some(why) = why else {
                    return Err(self.rt.raise_bad_finally());
                };
                if matches!(why, UnwindReason::Return | UnwindReason::Continue) {
                    self.retval = Some(self.pop());
                }
                Ok(Step::Unwind(why))
            }
            FinallyDisposition::Exception => {
                let value = self.pop();
                let tb = self.pop();
                self.rt.err_restore(v, value, tb);
                Ok(Step::Unwind(UnwindReason::Raise))
            }
            FinallyDisposition::Bad => {
                self.rt.decref(v);
                Err(self.rt.raise_bad_finally())
            }
        }
    }

    /// Call the exit function on top of the stack with the exception below it, or with three
    /// `None`s if the `finally` block was not entered for an exception. A true result
    /// suppresses the exception: the three values make way for a `None`.
    fn with_cleanup(&mut self) -> RtResult<Step> {
        let exit = self.f.peek(0);
        let u = self.f.peek(1);
        let exc = self.rt.finally_disposition(u) == FinallyDisposition::Exception;
        let args = if exc {
            [u, self.f.peek(2), self.f.peek(3)]
        } else {
            [self.rt.none(); 3]
        };
        let r = self.rt.call(exit, &args, &[])?;
        let suppress = exc && self.rt.is_true(r);
        self.rt.decref(r);
        for _ in 0..if suppress { 4 } else { 1 } {
            let v = self.pop();
            self.rt.decref(v);
        }
        if suppress {
            let none = self.rt.none();
            self.rt.incref(none);
            self.push(none);
        }
        Ok(Step::Next)
    }

    /// Unwind the block stack for `why`. Returns `None` if a handler takes over, or the
    /// frame's result if it is finished or suspended.
    fn unwind(&mut self, why: UnwindReason) -> Option<FrameResult> {
        if why == UnwindReason::Yield {
            return Some(FrameResult::Yield(self.take_retval()));
        }
        while self.f.iblock > 0 {
            let b = self.f.blockstack[self.f.iblock as usize - 1];
            if b.kind == BLOCK_LOOP && why == UnwindReason::Continue {
                let t = self.take_retval();
                self.pc = self.rt.int_value(t).unwrap_or(0) as usize;
                self.rt.decref(t);
                return None;
            }
            self.f.pop_block();
            self.drain_to(b.level);
            let handler = b.handler as usize;
            if b.kind == BLOCK_LOOP && why == UnwindReason::Break {
                self.pc = handler;
                return None;
            }
            if why == UnwindReason::Raise && (b.kind == BLOCK_EXCEPT || b.kind == BLOCK_FINALLY) {
                for v in self.rt.fetch_for_handler(b.kind == BLOCK_EXCEPT) {
                    self.push(v);
                }
                self.pc = handler;
                return None;
            }
            if b.kind == BLOCK_FINALLY {
                if matches!(why, UnwindReason::Return | UnwindReason::Continue) {
                    let v = self.take_retval();
                    self.push(v);
                }
                let w = self.rt.new_int(why as i64);
                self.push(w);
                self.pc = handler;
                return None;
            }
        }
        self.drain_to(0);
        self.f.stacktop = -1;
        Some(match why {
            UnwindReason::Return => FrameResult::Return(self.take_retval()),
            UnwindReason::Raise => FrameResult::Raise,
            _ => {
                let v = self.retval.take();
                self.rt.xdecref(v);
                let se = self.rt.types.system_error;
                let msg = match why {
                    UnwindReason::Continue => "'continue' not properly in loop",
                    _ => "'break' outside loop",
                };
                self.rt.raise_new(se, msg);
                FrameResult::Raise
            }
        })
    }

    fn take_retval(&mut self) -> ObjId {
        match self.retval.take() {
            Some(v) => v,
            None => panic!("{}: unwinding without a return value", self.code.name),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        asm::assemble,
        feedback::{BranchFeedback, CallFeedback},
    };

    /// Run the module `src` and return its globals.
    fn run(rt: &mut Runtime, src: &str) -> ObjId {
        let code = assemble(rt, src).unwrap();
        let g = rt.new_dict();
        let r = rt.run_code(Rc::new(code), g).unwrap();
        rt.decref(r);
        g
    }

    fn call(rt: &mut Runtime, g: ObjId, name: &str, args: &[ObjId]) -> RtResult<ObjId> {
        let f = rt.dict_get_str(g, name).unwrap();
        rt.call(f, args, &[])
    }

    #[test]
    fn arithmetic() {
        let mut rt = Runtime::new();
        let g = run(
            &mut rt,
            "
def f(a, b):
  load_fast a
  load_fast b
  binary_multiply
  load_const 1
  binary_add
  return_value
end
make_function f 0
store_name f
load_const None
return_value
",
        );
        let (a, b) = (rt.new_int(6), rt.new_int(7));
        let r = call(&mut rt, g, "f", &[a, b]).unwrap();
        assert_eq!(rt.int_value(r), Some(43));
        for o in [r, a, b, g] {
            rt.decref(o);
        }
    }

    #[test]
    fn finally_runs_on_return() {
        let mut rt = Runtime::new();
        let g = run(
            &mut rt,
            "
def f():
  setup_finally fin
  load_const 1
  return_value
fin:
  load_global print
  load_const 'cleanup'
  call_function 1
  pop_top
  end_finally
  load_const None
  return_value
end
make_function f 0
store_name f
load_const None
return_value
",
        );
        let r = call(&mut rt, g, "f", &[]).unwrap();
        assert_eq!(rt.int_value(r), Some(1));
        assert_eq!(rt.take_stdout(), "cleanup\n");
        rt.decref(r);
        rt.decref(g);
    }

    const LOOKUP: &str = "
def lookup(d):
  setup_except handler
  load_fast d
  load_const 'k'
  binary_subscr
  pop_block
  return_value
handler:
  dup_top
  load_global KeyError
  compare_op exception match
  pop_jump_if_false reraise
  pop_top
  pop_top
  pop_top
  load_const 'caught'
  return_value
reraise:
  end_finally
  load_const None
  return_value
end
make_function lookup 0
store_name lookup
load_const None
return_value
";

    #[test]
    fn except_handler_catches() {
        let mut rt = Runtime::new();
        let g = run(&mut rt, LOOKUP);
        let d = rt.new_dict();
        let r = call(&mut rt, g, "lookup", &[d]).unwrap();
        assert_eq!(rt.str_of(r), "caught");
        assert!(!rt.err_occurred());
        rt.decref(r);
        // Anything other than a `KeyError` propagates.
        let i = rt.new_int(3);
        assert!(call(&mut rt, g, "lookup", &[i]).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.type_name(info.ty), "TypeError");
        // The re-raise does not add a second entry for line 6.
        assert_eq!(rt.traceback_lines(info.tb), vec![6]);
        rt.release_exc(info);
        for o in [i, d, g] {
            rt.decref(o);
        }
    }

    #[test]
    fn traceback_spans_frames() {
        let mut rt = Runtime::new();
        let code = assemble(
            &mut rt,
            "
def boom():
  load_const 1
  load_const 0
  binary_divide
  return_value
end
make_function boom 0
store_name boom
load_name boom
call_function 0
return_value
",
        )
        .unwrap();
        let g = rt.new_dict();
        assert!(rt.run_code(Rc::new(code), g).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.type_name(info.ty), "ZeroDivisionError");
        assert_eq!(rt.traceback_lines(info.tb), vec![11, 5]);
        rt.release_exc(info);
        rt.decref(g);
    }

    #[test]
    fn call_shape_is_recorded() {
        let mut rt = Runtime::new();
        let code = assemble(
            &mut rt,
            "
load_name len
load_name s
call_function 1
load_name f
load_const 1
load_const 2
call_function 2
binary_add
return_value
",
        )
        .unwrap();
        let g = rt.new_dict();
        let s = rt.new_str("abc");
        rt.dict_set_str(g, "s", s);
        let len = rt.dict_get_str(rt.builtins(), "len").unwrap();
        let max = rt.dict_get_str(rt.builtins(), "max").unwrap();
        rt.dict_set_str(g, "f", max);
        let mut fb = FeedbackMap::new();
        let mut frame = Frame::new(&mut rt, Rc::new(code), g, Some(g));
        let r = interpret(&mut rt, &mut frame, Some(&mut fb));
        assert!(matches!(r, FrameResult::Return(v) if rt.int_value(v) == Some(5)));
        assert_eq!(
            fb.call(2),
            Some(CallFeedback::Monomorphic {
                callee: len,
                oparg: 1
            })
        );
        assert_eq!(
            fb.call(6),
            Some(CallFeedback::Monomorphic {
                callee: max,
                oparg: 2
            })
        );
        if let FrameResult::Return(v) = r {
            rt.decref(v);
        }
        frame.clear(&mut rt);
        rt.decref(s);
        rt.decref(g);
    }

    #[test]
    fn end_finally_rejects_unknown_reason() {
        let mut rt = Runtime::new();
        let g = run(
            &mut rt,
            "
def f():
  setup_finally fin
  pop_block
  load_const 99
fin:
  end_finally
  load_const None
  return_value
end
make_function f 0
store_name f
load_const None
return_value
",
        );
        assert!(call(&mut rt, g, "f", &[]).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(
            rt.format_exception(&info),
            "SystemError: 'finally' pops bad exception"
        );
        rt.release_exc(info);
        rt.decref(g);
    }

    const WITH: &str = "
def swallow(t, v, tb):
  load_global print
  load_const 'exit'
  call_function 1
  pop_top
  load_fast t
  return_value
end
def keep(t, v, tb):
  load_global print
  load_const 'exit'
  call_function 1
  pop_top
  load_const None
  return_value
end
def f(mgr, x):
  setup_finally fin
  load_const 1
  load_fast x
  binary_divide
  pop_top
  pop_block
  load_const None
fin:
  load_fast mgr
  with_cleanup
  end_finally
  load_const 'after'
  return_value
end
make_function swallow 0
store_name swallow
make_function keep 0
store_name keep
make_function f 0
store_name f
load_const None
return_value
";

    #[test]
    fn with_cleanup_calls_exit() {
        let mut rt = Runtime::new();
        let g = run(&mut rt, WITH);
        let swallow = rt.dict_get_str(g, "swallow").unwrap();
        let keep = rt.dict_get_str(g, "keep").unwrap();
        let (zero, one) = (rt.new_int(0), rt.new_int(1));

        // Without an exception the exit function still runs.
        let r = call(&mut rt, g, "f", &[keep, one]).unwrap();
        assert_eq!(rt.str_of(r), "after");
        assert_eq!(rt.take_stdout(), "exit\n");
        rt.decref(r);

        // A true result from the exit function swallows the exception.
        let r = call(&mut rt, g, "f", &[swallow, zero]).unwrap();
        assert_eq!(rt.str_of(r), "after");
        assert_eq!(rt.take_stdout(), "exit\n");
        assert!(!rt.err_occurred());
        rt.decref(r);

        assert!(call(&mut rt, g, "f", &[keep, zero]).is_err());
        assert_eq!(rt.take_stdout(), "exit\n");
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.type_name(info.ty), "ZeroDivisionError");
        rt.release_exc(info);
        for o in [zero, one, g] {
            rt.decref(o);
        }
    }

    const SPIN: &str = "
def spin(n):
top:
  load_fast n
  load_const 1
  binary_subtract
  store_fast n
  load_fast n
  pop_jump_if_true top
  load_const None
  return_value
end
make_function spin 0
store_name spin
load_const None
return_value
";

    #[test]
    fn conditional_back_edge_delivers_pending_signal() {
        let mut rt = Runtime::new();
        let g = run(&mut rt, SPIN);
        let n = rt.new_int(10);
        let r = call(&mut rt, g, "spin", &[n]).unwrap();
        rt.decref(r);

        rt.set_check_interval(1);
        rt.signal_pending();
        assert!(call(&mut rt, g, "spin", &[n]).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.type_name(info.ty), "KeyboardInterrupt");
        rt.release_exc(info);
        // The signal is delivered once.
        let r = call(&mut rt, g, "spin", &[n]).unwrap();
        rt.decref(r);
        rt.decref(n);
        rt.decref(g);
    }

    #[test]
    fn generator_yields_and_finishes() {
        let mut rt = Runtime::new();
        let g = run(
            &mut rt,
            "
def gen(n):
  .generator
  setup_loop done
  load_global range
  load_fast n
  call_function 1
  get_iter
top:
  for_iter out
  yield_value
  pop_top
  jump_absolute top
out:
  pop_block
done:
  load_const None
  return_value
end
make_function gen 0
store_name gen
load_const None
return_value
",
        );
        let n = rt.new_int(3);
        let gen = call(&mut rt, g, "gen", &[n]).unwrap();
        let items = rt.collect_iter(gen).unwrap();
        assert_eq!(
            items.iter().map(|x| rt.int_value(*x)).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );
        for o in items.into_iter().chain([gen, n, g]) {
            rt.decref(o);
        }
    }

    #[test]
    fn feedback_is_recorded() {
        let mut rt = Runtime::new();
        let code = assemble(
            &mut rt,
            "
load_name o
load_attr real
pop_top
load_const 0
pop_jump_if_false no
load_const 1
return_value
no:
load_const 2
return_value
",
        )
        .unwrap();
        let g = rt.new_dict();
        let c = rt.new_class("C", None, &[], true);
        let o = rt.new_instance(c);
        rt.setattr_str(o, "real", Some(o)).unwrap();
        rt.dict_set_str(g, "o", o);
        let mut fb = FeedbackMap::new();
        let mut frame = Frame::new(&mut rt, Rc::new(code), g, Some(g));
        let r = interpret(&mut rt, &mut frame, Some(&mut fb));
        assert!(matches!(r, FrameResult::Return(v) if rt.int_value(v) == Some(2)));
        assert_eq!(fb.types(1, 0).and_then(|t| t.monomorphic()), Some(c));
        assert_eq!(
            fb.branch(4),
            Some(BranchFeedback {
                taken: 1,
                not_taken: 0
            })
        );
        if let FrameResult::Return(v) = r {
            rt.decref(v);
        }
        frame.clear(&mut rt);
        rt.setattr_str(o, "real", None).unwrap();
        assert!(fb.call(1).is_none());
        for x in [o, c, g] {
            rt.decref(x);
        }
    }
}
