//! Translate a code descriptor into an IR function.
//!
//! Every reachable instruction gets its own block, labelled with its offset and opcode. The
//! operand stack lives in the frame's value stack, addressed through a shadow stack pointer. The
//! locals, the block stack and the interpreter's other registers live in allocas (the "shadow
//! frame") while translated code runs: the frame's fast locals are moved into the shadow on
//! entry, and the shadow is written back whenever control may pass to the interpreter (on a
//! bailout, or when a generator suspends).
//!
//! Errors follow one pattern: call the runtime, release the operands, then test the result and
//! branch to the shared `propagate` block, which records a traceback entry and starts unwinding.

use super::{CompilationError, CompiledFunction, GuardSet, TranslatorConfig};
use crate::{
    code::{CodeDescriptor, FlowState, Instr, Opcode},
    feedback::FeedbackMap,
    frame::{BailReason, UnwindReason, MAX_BLOCKS},
    ir::{BlockIdx, FrameField, FuncBuilder, Inst, Operand, Ty, I32, I64},
    runtime::{ObjId, Runtime},
};
use std::rc::Rc;

mod bail;
mod control;
mod opcodes;
mod speculate;
mod stack;
mod unwind;

/// The allocas holding the shadow frame.
struct Shadow {
    /// The stack pointer: the address of the first free value-stack slot.
    sp: Operand,
    /// One slot per fast local (locals, then cells, then free variables).
    locals: Operand,
    /// `MAX_BLOCKS` entries of `(kind, handler, level)`.
    blockstack: Operand,
    iblock: Operand,
    lasti: Operand,
    lineno: Operand,
    /// The value being returned or yielded. While a `continue` unwinds, the loop's
    /// continuation offset as an int.
    retval: Operand,
    /// The [UnwindReason].
    why: Operand,
    /// Where the unwinder's dispatch switch goes next.
    target: Operand,
    bail_reason: Operand,
}

/// The blocks shared by every instruction.
struct Shared {
    resume: BlockIdx,
    propagate: BlockIdx,
    unwind: BlockIdx,
    dispatch: BlockIdx,
    do_return: BlockIdx,
    bail: BlockIdx,
}

pub(super) struct Translator<'a> {
    rt: &'a Runtime,
    code: &'a CodeDescriptor,
    feedback: &'a FeedbackMap,
    config: &'a TranslatorConfig,
    /// The globals dictionary the function is expected to run with, if known.
    globals: Option<ObjId>,
    b: FuncBuilder,
    sh: Shadow,
    shared: Shared,
    /// The frame's value stack.
    stack_base: Operand,
    /// The frame's globals, builtins and (possibly NULL) locals dictionary.
    frame_globals: Operand,
    frame_builtins: Operand,
    frame_locals: Operand,
    instr_blocks: Vec<Option<BlockIdx>>,
    /// Offsets the unwinder may transfer control to.
    dispatch_targets: Vec<usize>,
    /// The `YIELD_VALUE`s a suspended generator may resume after.
    yields: Vec<usize>,
    guards: GuardSet,
    elided: usize,
    /// The offset of the instruction being translated.
    off: usize,
}

/// Translate `code`. `globals`, if known, is the globals dictionary the function will most
/// likely run with; it is only used to decide what to speculate on.
pub(crate) fn translate(
    rt: &Runtime,
    code: &Rc<CodeDescriptor>,
    globals: Option<ObjId>,
    feedback: &FeedbackMap,
    config: &TranslatorConfig,
) -> Result<CompiledFunction, CompilationError> {
    code.check_operands()?;
    let flow = code.flow_states()?;
    if let Some(s) = flow.iter().flatten().find(|s| s.blocks > MAX_BLOCKS) {
        return Err(CompilationError::LimitExceeded(format!(
            "{}: block stack depth {} exceeds {MAX_BLOCKS}",
            code.name, s.blocks
        )));
    }
    let mut t = Translator::new(rt, code, globals, feedback, config, flow)?;
    t.translate_instrs()?;
    t.build_shared()?;
    let Translator {
        b, guards, elided, ..
    } = t;
    Ok(CompiledFunction {
        code: Rc::clone(code),
        func: b.finalize(),
        guards: Rc::new(guards),
        elided_branches: elided,
    })
}

impl<'a> Translator<'a> {
    fn new(
        rt: &'a Runtime,
        code: &'a CodeDescriptor,
        globals: Option<ObjId>,
        feedback: &'a FeedbackMap,
        config: &'a TranslatorConfig,
        flow: Vec<Option<FlowState>>,
    ) -> Result<Self, CompilationError> {
        let mut b = FuncBuilder::new(&code.name);
        let nfast = u32::try_from(code.nfast())
            .map_err(|_| CompilationError::LimitExceeded("too many locals".to_owned()))?;
        let sh = Shadow {
            sp: b.alloca(Ty::Ptr, 1)?,
            locals: b.alloca(Ty::Obj, nfast)?,
            blockstack: b.alloca(I64, (MAX_BLOCKS * 3) as u32)?,
            iblock: b.alloca(I64, 1)?,
            lasti: b.alloca(I64, 1)?,
            lineno: b.alloca(I32, 1)?,
            retval: b.alloca(Ty::Obj, 1)?,
            why: b.alloca(I64, 1)?,
            target: b.alloca(I64, 1)?,
            bail_reason: b.alloca(I64, 1)?,
        };

        // Take ownership of the frame's locals.
        let fl = b.frame_addr(FrameField::FastLocals)?;
        b.push(Inst::MemCpy {
            dst: sh.locals,
            src: fl,
            count: Operand::i64(i64::from(nfast)),
        })?;
        for i in 0..i64::from(nfast) {
            let p = b.ptr_add(fl, Operand::i64(i))?;
            b.store(p, Operand::null())?;
        }
        let fbs = b.frame_addr(FrameField::BlockStack)?;
        b.push(Inst::MemCpy {
            dst: sh.blockstack,
            src: fbs,
            count: Operand::i64((MAX_BLOCKS * 3) as i64),
        })?;
        for (field, slot, ty) in [
            (FrameField::Iblock, sh.iblock, I64),
            (FrameField::Lasti, sh.lasti, I64),
            (FrameField::Lineno, sh.lineno, I32),
        ] {
            let p = b.frame_addr(field)?;
            let v = b.load(p, ty)?;
            b.store(slot, v)?;
        }
        let stack_base = b.frame_addr(FrameField::ValueStack)?;
        let p = b.frame_addr(FrameField::StackTop)?;
        let st = b.load(p, I64)?;
        let sp = b.ptr_add(stack_base, st)?;
        b.store(sh.sp, sp)?;
        b.store(sh.retval, Operand::null())?;
        b.store(sh.why, Operand::i64(UnwindReason::None as i64))?;
        let mut dicts = Vec::new();
        for field in [FrameField::Globals, FrameField::Builtins, FrameField::Locals] {
            let p = b.frame_addr(field)?;
            dicts.push(b.load(p, Ty::Obj)?);
        }

        let mut instr_blocks = Vec::with_capacity(flow.len());
        let mut yields = Vec::new();
        for (off, (instr, st)) in code.instrs().iter().zip(&flow).enumerate() {
            if st.is_some() {
                instr_blocks.push(Some(b.new_block(&format!("{off} {}", instr.op))?));
                if instr.op == Opcode::YieldValue {
                    yields.push(off);
                }
            } else {
                instr_blocks.push(None);
            }
        }
        if !yields.is_empty() && !code.flags.generator {
            return Err(CompilationError::General(format!(
                "{}: YIELD_VALUE outside a generator",
                code.name
            )));
        }
        let shared = Shared {
            resume: b.new_block("resume")?,
            propagate: b.new_block("propagate")?,
            unwind: b.new_block("unwind")?,
            dispatch: b.new_block("dispatch")?,
            do_return: b.new_block("return")?,
            bail: b.new_block("bail")?,
        };

        let mut t = Translator {
            rt,
            code,
            feedback,
            config,
            globals,
            b,
            sh,
            shared,
            stack_base,
            frame_globals: dicts[0],
            frame_builtins: dicts[1],
            frame_locals: dicts[2],
            instr_blocks,
            dispatch_targets: Vec::new(),
            yields,
            guards: GuardSet::new(),
            elided: 0,
            off: 0,
        };

        // A hook installed before the call started means every line must be traced.
        let tracing = t.b.call(crate::ir::RuntimeFn::TracingActive, &[])?;
        let on_entry = t.b.new_block("bail on entry")?;
        t.b.cond_br(tracing, on_entry, t.shared.resume)?;
        t.b.position_at_end(on_entry);
        let p = t.b.frame_addr(FrameField::Lasti)?;
        let lasti = t.b.load(p, I64)?;
        let next = t.b.binop(crate::ir::BinOp::Add, lasti, Operand::i64(1))?;
        t.b.store(t.sh.lasti, next)?;
        t.b.store(
            t.sh.bail_reason,
            Operand::i64(BailReason::TraceOnEntry as i64),
        )?;
        t.b.br(t.shared.bail)?;
        Ok(t)
    }

    fn translate_instrs(&mut self) -> Result<(), CompilationError> {
        for off in 0..self.code.instrs().len() {
            let Some(bidx) = self.instr_blocks[off] else {
                continue;
            };
            self.off = off;
            self.b.position_at_end(bidx);
            if self.config.force_bail.contains(&off) {
                let site = self.bail_site(off, BailReason::NoNativePath)?;
                self.b.br(site)?;
                continue;
            }
            if self.config.line_trace_checks && self.code.line_start(off).is_some() {
                self.trace_check(off, BailReason::LineTrace)?;
            }
            let instr = self.code.instrs()[off];
            self.instr(instr)?;
            if !self.b.is_terminated(self.b.cur_block()) {
                let next = self.instr_block(off + 1)?;
                self.b.br(next)?;
            }
        }
        Ok(())
    }

    /// Emit the body of `instr`, leaving the builder positioned in a block that falls through
    /// to the next instruction (or in a terminated block).
    fn instr(&mut self, instr: Instr) -> Result<(), CompilationError> {
        let arg = instr.arg as usize;
        match instr.op {
            Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop => self.cond_branch(instr),
            Opcode::JumpForward | Opcode::JumpAbsolute => {
                let target = instr.jump_target(self.off).unwrap_or(arg);
                self.jump(target)
            }
            Opcode::ForIter => self.for_iter(instr.jump_target(self.off).unwrap_or(arg)),
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let handler = instr.jump_target(self.off).unwrap_or(arg);
                self.setup_block(instr.op as i64, handler)
            }
            Opcode::PopBlock => self.pop_block(),
            Opcode::ReturnValue => self.return_value(),
            Opcode::YieldValue => self.yield_value(),
            Opcode::RaiseVarargs => self.raise_varargs(arg),
            Opcode::EndFinally => self.end_finally(),
            Opcode::WithCleanup => self.with_cleanup(),
            Opcode::BreakLoop => self.break_loop(),
            Opcode::ContinueLoop => self.continue_loop(arg),
            Opcode::LoadAttr if self.config.speculate_attrs => self.load_attr(arg),
            Opcode::StoreAttr if self.config.speculate_attrs => self.store_attr(arg),
            Opcode::LoadGlobal if self.config.speculate_globals => self.load_global(arg),
            _ => self.simple_instr(instr),
        }
    }

    /// The block of the instruction at `off`.
    fn instr_block(&self, off: usize) -> Result<BlockIdx, CompilationError> {
        self.instr_blocks
            .get(off)
            .copied()
            .flatten()
            .ok_or_else(|| {
                CompilationError::InternalError(format!(
                    "{}: control reaches unreachable offset {off}",
                    self.code.name
                ))
            })
    }

    /// Create a new block labelled after the current instruction.
    fn sub_block(&mut self, what: &str) -> Result<BlockIdx, CompilationError> {
        let label = format!("{} {what}", self.off);
        self.b.new_block(&label)
    }

    /// The offset of the instruction being translated, as an IR constant.
    fn off_operand(&self) -> Operand {
        Operand::i64(self.off as i64)
    }

    /// Record the current instruction as the one that raised, in case the next branch goes to
    /// `propagate`.
    fn mark_lasti(&mut self) -> Result<(), CompilationError> {
        let off = self.off_operand();
        self.b.store(self.sh.lasti, off)?;
        let line = self.code.line_at(self.off);
        self.b.store(self.sh.lineno, Operand::i32(line))
    }

    /// If `cond` holds, an exception has been raised: go to `propagate`. Otherwise carry on in a
    /// new block.
    fn propagate_if(&mut self, cond: Operand) -> Result<(), CompilationError> {
        self.mark_lasti()?;
        let ok = self.sub_block("ok")?;
        self.b.cond_br(cond, self.shared.propagate, ok)?;
        self.b.position_at_end(ok);
        Ok(())
    }

    /// Emit the blocks every instruction shares. Must run after every instruction has been
    /// translated, since the dispatch and resume switches need all their targets.
    fn build_shared(&mut self) -> Result<(), CompilationError> {
        self.build_resume()?;
        self.build_propagate()?;
        self.build_unwind()?;
        self.build_dispatch()?;
        self.build_do_return()?;
        self.build_bail()
    }
}

#[cfg(test)]
mod test;
