//! Jumps, conditional branches, loops and the block stack.

use super::{stack::Owned, Translator};
use crate::{
    code::{Instr, Opcode},
    compile::CompilationError,
    frame::BailReason,
    ir::{BinOp, BlockIdx, Operand, Pred, RuntimeFn, I64},
};

/// Which arms of a conditional branch feedback says are live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Arms {
    Both,
    /// The jump was always taken.
    TakenOnly,
    /// The jump was never taken.
    FallthroughOnly,
}

impl Translator<'_> {
    /// Decide whether an arm of the branch at the current offset can be replaced by a bailout.
    /// An arm is only elided if it was never seen after enough observations.
    fn live_arms(&self) -> Arms {
        match self.feedback.branch(self.off) {
            Some(fb) if fb.total() >= self.config.branch_min_samples => {
                if fb.not_taken == 0 {
                    Arms::TakenOnly
                } else if fb.taken == 0 {
                    Arms::FallthroughOnly
                } else {
                    Arms::Both
                }
            }
            _ => Arms::Both,
        }
    }

    /// `target`, or a bailout resuming at `target` if the arm is dead.
    fn arm(&mut self, target: usize, live: bool) -> Result<BlockIdx, CompilationError> {
        if live {
            self.instr_block(target)
        } else {
            self.bail_site(target, BailReason::GuardFail)
        }
    }

    pub(super) fn cond_branch(&mut self, instr: Instr) -> Result<(), CompilationError> {
        let target = instr.arg as usize;
        let next = self.off + 1;
        let jump_if_true = matches!(instr.op, Opcode::PopJumpIfTrue | Opcode::JumpIfTrueOrPop);
        let arms = self.live_arms();
        if arms != Arms::Both {
            self.elided += 1;
        }
        // A taken backward jump closes a loop: it goes through the back edge checks first.
        let back_edge = target <= self.off && arms != Arms::FallthroughOnly;
        let taken = if back_edge {
            self.sub_block("back edge")?
        } else {
            self.arm(target, arms != Arms::FallthroughOnly)?
        };
        let pred = if jump_if_true { Pred::Ne } else { Pred::Eq };
        match instr.op {
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let v = self.pop()?;
                let r = self.b.call(RuntimeFn::IsTrue, &[v.borrow().operand()])?;
                self.decref(v)?;
                let jump = self.b.icmp(pred, r, Operand::i32(0))?;
                let fall = self.arm(next, arms != Arms::TakenOnly)?;
                self.b.cond_br(jump, taken, fall)?;
            }
            _ => {
                // The value stays on the stack if the jump is taken.
                let v = self.peek(0)?;
                let r = self.b.call(RuntimeFn::IsTrue, &[v.operand()])?;
                let jump = self.b.icmp(pred, r, Operand::i32(0))?;
                let pop = self.sub_block("pop")?;
                self.b.cond_br(jump, taken, pop)?;
                self.b.position_at_end(pop);
                self.drop_n(1)?;
                let fall = self.arm(next, arms != Arms::TakenOnly)?;
                self.b.br(fall)?;
            }
        }
        if back_edge {
            self.b.position_at_end(taken);
            self.back_edge(target)?;
            let t = self.instr_block(target)?;
            self.b.br(t)?;
        }
        Ok(())
    }

    pub(super) fn jump(&mut self, target: usize) -> Result<(), CompilationError> {
        if target <= self.off {
            self.back_edge(target)?;
        }
        let t = self.instr_block(target)?;
        self.b.br(t)
    }

    /// The checks on a loop back edge: count down the ticker, delivering pending asynchronous
    /// events when it expires, and hand over to the interpreter, resuming at `resume`, if
    /// tracing has started.
    pub(super) fn back_edge(&mut self, resume: usize) -> Result<(), CompilationError> {
        let ticks = self.b.call(RuntimeFn::DecrementTicker, &[])?;
        let expired = self.b.icmp(Pred::Slt, ticks, Operand::i32(0))?;
        let pending = self.sub_block("pending calls")?;
        let cont = self.sub_block("ticked")?;
        self.b.cond_br(expired, pending, cont)?;
        self.b.position_at_end(pending);
        let r = self.b.call(RuntimeFn::HandlePendingCalls, &[])?;
        let failed = self.b.icmp(Pred::Ne, r, Operand::i32(0))?;
        self.mark_lasti()?;
        self.b.cond_br(failed, self.shared.propagate, cont)?;
        self.b.position_at_end(cont);
        if self.config.line_trace_checks {
            self.trace_check(resume, BailReason::BackedgeTrace)?;
        }
        Ok(())
    }

    /// If a tracing hook is active, bail out to resume at `resume`.
    pub(super) fn trace_check(
        &mut self,
        resume: usize,
        reason: BailReason,
    ) -> Result<(), CompilationError> {
        let tracing = self.b.call(RuntimeFn::TracingActive, &[])?;
        let site = self.bail_site(resume, reason)?;
        let cont = self.sub_block("untraced")?;
        self.b.cond_br(tracing, site, cont)?;
        self.b.position_at_end(cont);
        Ok(())
    }

    pub(super) fn for_iter(&mut self, exhausted_target: usize) -> Result<(), CompilationError> {
        let it = self.peek(0)?;
        let v = self.b.call(RuntimeFn::IterNext, &[it.operand()])?;
        let got = self.sub_block("next")?;
        let stopped = self.sub_block("stopped")?;
        let is_null = self.b.icmp(Pred::Eq, v, Operand::null())?;
        self.b.cond_br(is_null, stopped, got)?;

        self.b.position_at_end(stopped);
        // NULL means either exhaustion (StopIteration, or nothing raised) or an error.
        let r = self.b.call(RuntimeFn::ErrClearStopIteration, &[])?;
        self.check_status(r)?;
        self.drop_n(1)?;
        let done = self.instr_block(exhausted_target)?;
        self.b.br(done)?;

        self.b.position_at_end(got);
        self.push(Owned::new(v))
    }

    pub(super) fn setup_block(&mut self, kind: i64, handler: usize) -> Result<(), CompilationError> {
        // Handlers (and a loop's exit, for `break`) are reached through the unwinder.
        self.dispatch_targets.push(handler);
        let level = self.depth()?;
        let ib = self.b.load(self.sh.iblock, I64)?;
        for (i, v) in [
            Operand::i64(kind),
            Operand::i64(handler as i64),
            level,
        ]
        .into_iter()
        .enumerate()
        {
            let p = self.block_field_addr(ib, i as i64)?;
            self.b.store(p, v)?;
        }
        let ib = self.b.binop(BinOp::Add, ib, Operand::i64(1))?;
        self.b.store(self.sh.iblock, ib)
    }

    pub(super) fn pop_block(&mut self) -> Result<(), CompilationError> {
        let ib = self.b.load(self.sh.iblock, I64)?;
        let ib = self.b.binop(BinOp::Sub, ib, Operand::i64(1))?;
        self.b.store(self.sh.iblock, ib)?;
        let p = self.block_field_addr(ib, 2)?;
        let level = self.b.load(p, I64)?;
        self.drain_to(level)
    }

    /// The address of field `field` (0: kind, 1: handler, 2: level) of shadow block-stack entry
    /// `ib` (an `i64`).
    pub(super) fn block_field_addr(
        &mut self,
        ib: Operand,
        field: i64,
    ) -> Result<Operand, CompilationError> {
        let off = self.b.binop(BinOp::Mul, ib, Operand::i64(3))?;
        let off = self.b.binop(BinOp::Add, off, Operand::i64(field))?;
        self.b.ptr_add(self.sh.blockstack, off)
    }
}
