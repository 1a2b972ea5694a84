//! Leaving blocks: returns, yields, raises, `break`, `continue` and `finally`.
//!
//! Everything that leaves a block sets the shadow unwind reason and branches to the shared
//! `unwind` block. That pops block-stack entries at run time until one accepts the reason, then
//! sets the shadow `target` and branches to `dispatch`, a switch over every offset the unwinder
//! can reach. With the block stack empty it goes to `return`.
//!
//!   * A loop entry accepts `continue` (without being popped) and `break`.
//!   * An except entry accepts an exception: the handler is entered with the traceback, value
//!     and type pushed.
//!   * A finally entry accepts every reason. For an exception the three values are pushed;
//!     otherwise the return value (for `return` and `continue`) and then the reason as an int.

use super::{
    stack::{Borrowed, Owned},
    Translator,
};
use crate::{
    code::{BLOCK_EXCEPT, BLOCK_FINALLY, BLOCK_LOOP},
    compile::CompilationError,
    frame::UnwindReason,
    ir::{BinOp, FrameField, Inst, Operand, Pred, RuntimeFn, Ty, I32, I64},
    runtime::FinallyDisposition,
};

impl Translator<'_> {
    fn set_why(&mut self, why: UnwindReason) -> Result<(), CompilationError> {
        self.b.store(self.sh.why, Operand::i64(why as i64))
    }

    /// An `i1` that is true iff the `i64` reason `why` is `return` or `continue`: the reasons
    /// that carry a value in the return value slot.
    fn carries_retval(&mut self, why: Operand) -> Result<Operand, CompilationError> {
        let ret = self
            .b
            .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Return as i64))?;
        let cont = self
            .b
            .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Continue as i64))?;
        self.b.binop(BinOp::Or, ret, cont)
    }

    pub(super) fn return_value(&mut self) -> Result<(), CompilationError> {
        let v = self.pop()?;
        self.b.store(self.sh.retval, v.into_operand())?;
        self.set_why(UnwindReason::Return)?;
        self.b.br(self.shared.unwind)
    }

    /// Suspend the generator: the frame gets everything back, with `lasti` at this instruction.
    pub(super) fn yield_value(&mut self) -> Result<(), CompilationError> {
        let v = self.pop()?;
        self.b.store(self.sh.retval, v.into_operand())?;
        self.write_back_frame()?;
        let p = self.b.frame_addr(FrameField::Lasti)?;
        self.b.store(p, self.off_operand())?;
        let line = self.code.line_at(self.off);
        let p = self.b.frame_addr(FrameField::Lineno)?;
        self.b.store(p, Operand::i32(line))?;
        self.set_why(UnwindReason::Yield)?;
        self.b.br(self.shared.do_return)
    }

    pub(super) fn raise_varargs(&mut self, n: usize) -> Result<(), CompilationError> {
        let mut args = [Operand::null(); 3];
        // The operands are pushed type first.
        for i in (0..n.min(3)).rev() {
            args[i] = self.pop()?.into_operand();
        }
        let fresh = self.b.call(RuntimeFn::DoRaise, &args)?;
        for a in args {
            self.xdecref(a)?;
        }
        self.set_why(UnwindReason::Raise)?;
        // A bare `raise` re-raises without adding a traceback entry.
        let fresh = self.truthy(fresh)?;
        self.mark_lasti()?;
        self.b
            .cond_br(fresh, self.shared.propagate, self.shared.unwind)
    }

    pub(super) fn end_finally(&mut self) -> Result<(), CompilationError> {
        let v = self.pop()?.into_operand();
        let d = self.b.call(RuntimeFn::FinallyDisposition, &[v])?;
        let normal = self.sub_block("finally none")?;
        let reason = self.sub_block("finally reason")?;
        let exc = self.sub_block("finally exception")?;
        let bad = self.sub_block("finally bad")?;
        self.b.push(Inst::Switch {
            val: d,
            default: bad,
            cases: vec![
                (FinallyDisposition::Normal as i64, normal),
                (FinallyDisposition::Reason as i64, reason),
                (FinallyDisposition::Exception as i64, exc),
            ],
        })?;

        // Resume unwinding for the saved reason.
        self.b.position_at_end(reason);
        let why = self.b.call(RuntimeFn::IntAsLong, &[v])?;
        self.decref(Owned::new(v))?;
        self.b.store(self.sh.why, why)?;
        let carries = self.carries_retval(why)?;
        let restore = self.sub_block("restore retval")?;
        self.b.cond_br(carries, restore, self.shared.unwind)?;
        self.b.position_at_end(restore);
        let rv = self.pop()?;
        self.b.store(self.sh.retval, rv.into_operand())?;
        self.b.br(self.shared.unwind)?;

        // Re-raise the saved exception.
        self.b.position_at_end(exc);
        let value = self.pop()?;
        let tb = self.pop()?;
        self.b.call(
            RuntimeFn::ErrRestore,
            &[v, value.into_operand(), tb.into_operand()],
        )?;
        self.set_why(UnwindReason::Raise)?;
        self.b.br(self.shared.unwind)?;

        self.b.position_at_end(bad);
        self.decref(Owned::new(v))?;
        self.b.call(RuntimeFn::RaiseBadFinally, &[])?;
        self.mark_lasti()?;
        self.b.br(self.shared.propagate)?;

        self.b.position_at_end(normal);
        self.decref(Owned::new(v))
    }

    /// `WITH_CLEANUP`: the exit function is on top, and below it whatever the `finally` handler
    /// was entered with.
    pub(super) fn with_cleanup(&mut self) -> Result<(), CompilationError> {
        let exit = self.peek(0)?.operand();
        let u = self.peek(1)?.operand();
        let d = self.b.call(RuntimeFn::FinallyDisposition, &[u])?;
        let is_exc = self.b.icmp(
            Pred::Eq,
            d,
            Operand::i32(FinallyDisposition::Exception as i32),
        )?;
        let exc = self.sub_block("with exception")?;
        let normal = self.sub_block("with no exception")?;
        let keep = self.sub_block("with keep")?;
        let done = self.sub_block("with done")?;
        self.b.cond_br(is_exc, exc, normal)?;

        self.b.position_at_end(exc);
        let value = self.peek(2)?.operand();
        let tb = self.peek(3)?.operand();
        let r = self.b.call(RuntimeFn::CallExit, &[exit, u, value, tb])?;
        let r = self.check_obj(r)?;
        let t = self.b.call(RuntimeFn::IsTrue, &[r.borrow().operand()])?;
        self.decref(r)?;
        let suppress = self.sub_block("with suppress")?;
        let t = self.truthy(t)?;
        self.b.cond_br(t, suppress, keep)?;

        // The exception is swallowed: `END_FINALLY` finds `None`.
        self.b.position_at_end(suppress);
        self.drop_n(4)?;
        let none = self.incref(Borrowed::new(Operand::obj(self.rt.none())))?;
        self.push(none)?;
        self.b.br(done)?;

        self.b.position_at_end(normal);
        let none = Operand::obj(self.rt.none());
        let r = self.b.call(RuntimeFn::CallExit, &[exit, none, none, none])?;
        let r = self.check_obj(r)?;
        self.decref(r)?;
        self.b.br(keep)?;

        self.b.position_at_end(keep);
        self.drop_n(1)?;
        self.b.br(done)?;
        self.b.position_at_end(done);
        Ok(())
    }

    pub(super) fn break_loop(&mut self) -> Result<(), CompilationError> {
        self.set_why(UnwindReason::Break)?;
        self.b.br(self.shared.unwind)
    }

    pub(super) fn continue_loop(&mut self, target: usize) -> Result<(), CompilationError> {
        // If tracing starts, re-run this instruction in the interpreter.
        self.back_edge(self.off)?;
        self.dispatch_targets.push(target);
        let t = self
            .b
            .call(RuntimeFn::IntFromLong, &[Operand::i64(target as i64)])?;
        self.b.store(self.sh.retval, t)?;
        self.set_why(UnwindReason::Continue)?;
        self.b.br(self.shared.unwind)
    }

    pub(super) fn build_propagate(&mut self) -> Result<(), CompilationError> {
        self.b.position_at_end(self.shared.propagate);
        self.set_why(UnwindReason::Raise)?;
        let line = self.b.load(self.sh.lineno, I32)?;
        self.b.call(RuntimeFn::TracebackHere, &[line])?;
        let lasti = self.b.load(self.sh.lasti, I64)?;
        let p = self.b.frame_addr(FrameField::Lasti)?;
        self.b.store(p, lasti)?;
        let p = self.b.frame_addr(FrameField::Lineno)?;
        self.b.store(p, line)?;
        self.b.br(self.shared.unwind)
    }

    pub(super) fn build_unwind(&mut self) -> Result<(), CompilationError> {
        self.b.position_at_end(self.shared.unwind);
        let why = self.b.load(self.sh.why, I64)?;
        let ib = self.b.load(self.sh.iblock, I64)?;
        let empty = self.b.icmp(Pred::Sle, ib, Operand::i64(0))?;
        let top = self.b.new_block("unwind block")?;
        self.b.cond_br(empty, self.shared.do_return, top)?;

        self.b.position_at_end(top);
        let ib = self.b.binop(BinOp::Sub, ib, Operand::i64(1))?;
        let mut fields = Vec::with_capacity(3);
        for i in 0..3 {
            let p = self.block_field_addr(ib, i)?;
            fields.push(self.b.load(p, I64)?);
        }
        let (kind, handler, level) = (fields[0], fields[1], fields[2]);
        let is_loop = self
            .b
            .icmp(Pred::Eq, kind, Operand::i64(i64::from(BLOCK_LOOP)))?;
        let in_loop = self.b.new_block("unwind loop")?;
        let in_try = self.b.new_block("unwind try")?;
        self.b.cond_br(is_loop, in_loop, in_try)?;

        // Loops.
        self.b.position_at_end(in_loop);
        let is_continue =
            self.b
                .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Continue as i64))?;
        let cont = self.b.new_block("unwind continue")?;
        let leave = self.b.new_block("unwind leave loop")?;
        self.b.cond_br(is_continue, cont, leave)?;

        self.b.position_at_end(cont);
        let rv = self.b.load(self.sh.retval, Ty::Obj)?;
        let target = self.b.call(RuntimeFn::IntAsLong, &[rv])?;
        self.decref(Owned::new(rv))?;
        self.dispatch_to(target)?;

        self.b.position_at_end(leave);
        self.b.store(self.sh.iblock, ib)?;
        self.drain_to(level)?;
        let is_break = self
            .b
            .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Break as i64))?;
        let brk = self.b.new_block("unwind break")?;
        self.b.cond_br(is_break, brk, self.shared.unwind)?;
        self.b.position_at_end(brk);
        self.dispatch_to(handler)?;

        // Except and finally blocks.
        self.b.position_at_end(in_try);
        self.b.store(self.sh.iblock, ib)?;
        self.drain_to(level)?;
        let is_raise = self
            .b
            .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Raise as i64))?;
        let caught = self.b.new_block("unwind caught")?;
        let not_raise = self.b.new_block("unwind not raising")?;
        self.b.cond_br(is_raise, caught, not_raise)?;

        self.b.position_at_end(caught);
        let is_except = self
            .b
            .icmp(Pred::Eq, kind, Operand::i64(i64::from(BLOCK_EXCEPT)))?;
        let handling = self.b.push(Inst::Select {
            cond: is_except,
            trueval: Operand::i32(1),
            falseval: Operand::i32(0),
        })?;
        let dst = self.stack_addr(0)?;
        self.b
            .call(RuntimeFn::FetchForHandler, &[dst, handling])?;
        self.adopt(3)?;
        self.dispatch_to(handler)?;

        self.b.position_at_end(not_raise);
        let is_finally = self
            .b
            .icmp(Pred::Eq, kind, Operand::i64(i64::from(BLOCK_FINALLY)))?;
        let fin = self.b.new_block("unwind finally")?;
        self.b.cond_br(is_finally, fin, self.shared.unwind)?;

        self.b.position_at_end(fin);
        let carries = self.carries_retval(why)?;
        let push_rv = self.b.new_block("unwind push retval")?;
        let push_why = self.b.new_block("unwind push reason")?;
        self.b.cond_br(carries, push_rv, push_why)?;
        self.b.position_at_end(push_rv);
        let rv = self.b.load(self.sh.retval, Ty::Obj)?;
        self.push(Owned::new(rv))?;
        self.b.br(push_why)?;
        self.b.position_at_end(push_why);
        let w = self.b.call(RuntimeFn::IntFromLong, &[why])?;
        self.push(Owned::new(w))?;
        self.dispatch_to(handler)
    }

    /// Stop unwinding and continue at the `i64` offset `target`.
    fn dispatch_to(&mut self, target: Operand) -> Result<(), CompilationError> {
        self.set_why(UnwindReason::None)?;
        self.b.store(self.sh.target, target)?;
        self.b.br(self.shared.dispatch)
    }

    pub(super) fn build_dispatch(&mut self) -> Result<(), CompilationError> {
        self.b.position_at_end(self.shared.dispatch);
        let target = self.b.load(self.sh.target, I64)?;
        let mut offs = self.dispatch_targets.clone();
        offs.sort_unstable();
        offs.dedup();
        let cases = offs
            .into_iter()
            .map(|off| Ok((off as i64, self.instr_block(off)?)))
            .collect::<Result<Vec<_>, CompilationError>>()?;
        let bad = self.b.new_block("dispatch unknown")?;
        self.b.push(Inst::Switch {
            val: target,
            default: bad,
            cases,
        })?;
        self.b.position_at_end(bad);
        self.b.push(Inst::Unreachable)?;
        Ok(())
    }

    pub(super) fn build_do_return(&mut self) -> Result<(), CompilationError> {
        self.b.position_at_end(self.shared.do_return);
        let why = self.b.load(self.sh.why, I64)?;
        let is_yield = self
            .b
            .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Yield as i64))?;
        let cleanup = self.b.new_block("return cleanup")?;
        let exit = self.b.new_block("exit")?;
        self.b.cond_br(is_yield, exit, cleanup)?;

        // The frame is finished: release everything it holds.
        self.b.position_at_end(cleanup);
        self.drain_to(Operand::i64(0))?;
        for i in 0..self.code.nfast() {
            let v = self.load_local(i)?;
            self.xdecref(v)?;
        }
        let p = self.b.frame_addr(FrameField::StackTop)?;
        self.b.store(p, Operand::i64(-1))?;
        self.b.br(exit)?;

        self.b.position_at_end(exit);
        let why = self.b.load(self.sh.why, I64)?;
        let rv = self.b.load(self.sh.retval, Ty::Obj)?;
        let raised = self
            .b
            .icmp(Pred::Eq, why, Operand::i64(UnwindReason::Raise as i64))?;
        let r = self.b.push(Inst::Select {
            cond: raised,
            trueval: Operand::null(),
            falseval: rv,
        })?;
        self.b.push(Inst::Ret(r))?;
        Ok(())
    }

    /// The entry point proper: a fresh frame starts at offset 0, a suspended generator resumes
    /// after the `YIELD_VALUE` it stopped at.
    pub(super) fn build_resume(&mut self) -> Result<(), CompilationError> {
        self.b.position_at_end(self.shared.resume);
        let start = self.instr_block(0)?;
        if self.yields.is_empty() {
            return self.b.br(start);
        }
        let lasti = self.b.load(self.sh.lasti, I64)?;
        let mut cases = vec![(-1, start)];
        for y in self.yields.clone() {
            cases.push((y as i64, self.instr_block(y + 1)?));
        }
        let bad = self.b.new_block("resume unknown")?;
        self.b.push(Inst::Switch {
            val: lasti,
            default: bad,
            cases,
        })?;
        self.b.position_at_end(bad);
        self.b.push(Inst::Unreachable)?;
        Ok(())
    }
}
