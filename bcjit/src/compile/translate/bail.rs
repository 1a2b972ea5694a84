//! Bailouts: handing a frame back to the interpreter part-way through a function.
//!
//! A bail site records where the interpreter should resume and why, then branches to the shared
//! `bail` block, which writes the shadow frame back to the frame and returns the sentinel. The
//! operand stack needs no writing back (it already lives in the frame) beyond its depth.

use super::Translator;
use crate::{
    compile::CompilationError,
    frame::{BailReason, MAX_BLOCKS},
    ir::{BlockIdx, Const, FrameField, Inst, Operand, I32, I64},
};

impl Translator<'_> {
    /// A new block which bails out, for `reason`, to resume at `resume`. The builder's position
    /// is unchanged.
    pub(super) fn bail_site(
        &mut self,
        resume: usize,
        reason: BailReason,
    ) -> Result<BlockIdx, CompilationError> {
        let cur = self.b.cur_block();
        let blk = self.sub_block(&format!("bail {reason} to {resume}"))?;
        self.b.position_at_end(blk);
        self.b.store(self.sh.lasti, Operand::i64(resume as i64))?;
        let line = self.code.line_at(resume);
        self.b.store(self.sh.lineno, Operand::i32(line))?;
        self.b
            .store(self.sh.bail_reason, Operand::i64(reason as i64))?;
        self.b.br(self.shared.bail)?;
        self.b.position_at_end(cur);
        Ok(blk)
    }

    /// Copy the shadow locals and block stack back to the frame, which owns the locals again
    /// afterwards.
    pub(super) fn write_back_frame(&mut self) -> Result<(), CompilationError> {
        let fl = self.b.frame_addr(FrameField::FastLocals)?;
        self.b.push(Inst::MemCpy {
            dst: fl,
            src: self.sh.locals,
            count: Operand::i64(self.code.nfast() as i64),
        })?;
        let fbs = self.b.frame_addr(FrameField::BlockStack)?;
        self.b.push(Inst::MemCpy {
            dst: fbs,
            src: self.sh.blockstack,
            count: Operand::i64((MAX_BLOCKS * 3) as i64),
        })?;
        let ib = self.b.load(self.sh.iblock, I64)?;
        let p = self.b.frame_addr(FrameField::Iblock)?;
        self.b.store(p, ib)?;
        let st = self.depth()?;
        let p = self.b.frame_addr(FrameField::StackTop)?;
        self.b.store(p, st)
    }

    pub(super) fn build_bail(&mut self) -> Result<(), CompilationError> {
        self.b.position_at_end(self.shared.bail);
        self.write_back_frame()?;
        for (field, slot, ty) in [
            (FrameField::Lasti, self.sh.lasti, I64),
            (FrameField::Lineno, self.sh.lineno, I32),
            (FrameField::BailReason, self.sh.bail_reason, I64),
        ] {
            let v = self.b.load(slot, ty)?;
            let p = self.b.frame_addr(field)?;
            self.b.store(p, v)?;
        }
        self.b.push(Inst::Ret(Operand::Const(Const::Sentinel)))?;
        Ok(())
    }
}
