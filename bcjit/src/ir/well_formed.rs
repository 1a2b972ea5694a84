//! Check that an IR function is well-formed.
//!
//! The translator is expected to produce well-formed functions: a failure here is a bug in the
//! translator, not in the bytecode, so we panic rather than returning an error. The checks are:
//!
//!   * every block ends in exactly one terminator, and branch targets exist;
//!   * allocas and the argument only appear in the entry block;
//!   * operands have the types their instructions require, including the parameter types of
//!     runtime calls;
//!   * every use of a local is dominated by its definition.

use super::{BlockIdx, Func, Inst, InstIdx, Operand, Ty, I1};
use std::collections::HashMap;
use typed_index_collections::TiVec;

impl Func {
    pub(crate) fn assert_well_formed(&self) {
        let mut def_block = HashMap::new();
        for bidx in self.block_idxs() {
            let insts = self.block(bidx).insts();
            match insts.last() {
                Some(iidx) if self.inst(*iidx).is_terminator() => (),
                _ => panic!("Block {bidx} in {} is not terminated", self.name()),
            }
            for (i, iidx) in insts.iter().enumerate() {
                def_block.insert(*iidx, (bidx, i));
                let inst = self.inst(*iidx);
                if inst.is_terminator() && i + 1 != insts.len() {
                    self.fail(*iidx, "is a terminator in the middle of a block");
                }
                if matches!(inst, Inst::Alloca { .. } | Inst::Arg) && bidx != BlockIdx(0) {
                    self.fail(*iidx, "must be in the entry block");
                }
                for s in inst.successors() {
                    if usize::from(s) >= self.num_blocks() {
                        self.fail(*iidx, &format!("branches to non-existent block {s}"));
                    }
                }
                self.check_types(*iidx, inst);
            }
        }

        let idom = self.dominators();
        for bidx in self.block_idxs() {
            if idom[bidx].is_none() {
                // Unreachable.
                continue;
            }
            for (i, iidx) in self.block(bidx).insts().iter().enumerate() {
                for op in self.inst(*iidx).operands() {
                    let Operand::Local(def) = op else { continue };
                    let Some(&(dblk, di)) = def_block.get(&def) else {
                        self.fail(*iidx, &format!("uses {def}, which is in no block"));
                    };
                    let ok = if dblk == bidx {
                        di < i
                    } else {
                        dominates(&idom, dblk, bidx)
                    };
                    if !ok {
                        self.fail(*iidx, &format!("uses {def}, which does not dominate it"));
                    }
                }
            }
        }
    }

    fn fail(&self, iidx: InstIdx, msg: &str) -> ! {
        panic!(
            "Instruction at position {iidx} in {} {msg}\n  {}",
            self.name(),
            self.inst(iidx).display(iidx, self)
        )
    }

    fn check_types(&self, iidx: InstIdx, inst: &Inst) {
        let expect = |op: &Operand, ty: Ty, what: &str| {
            let got = op.ty(self);
            if got != ty {
                self.fail(iidx, &format!("{what} has type {got}, expected {ty}"));
            }
        };
        let int = |op: &Operand, what: &str| {
            if !matches!(op.ty(self), Ty::Int(_)) {
                self.fail(iidx, &format!("{what} is not an integer"));
            }
        };
        match inst {
            Inst::Arg | Inst::Alloca { .. } | Inst::Br(_) | Inst::Unreachable => (),
            Inst::FrameAddr { frame, .. } => expect(frame, Ty::Ptr, "frame"),
            Inst::PtrAdd { ptr, off } => {
                expect(ptr, Ty::Ptr, "pointer");
                int(off, "offset");
            }
            Inst::PtrDiff { lhs, rhs } => {
                expect(lhs, Ty::Ptr, "lhs");
                expect(rhs, Ty::Ptr, "rhs");
            }
            Inst::Load { ptr, ty } => {
                expect(ptr, Ty::Ptr, "pointer");
                if *ty == Ty::Void {
                    self.fail(iidx, "loads void");
                }
            }
            Inst::Store { ptr, val } => {
                expect(ptr, Ty::Ptr, "pointer");
                if val.ty(self) == Ty::Void {
                    self.fail(iidx, "stores void");
                }
            }
            Inst::MemCpy { dst, src, count } => {
                expect(dst, Ty::Ptr, "dst");
                expect(src, Ty::Ptr, "src");
                int(count, "count");
            }
            Inst::BinOp { lhs, rhs, .. } => {
                int(lhs, "lhs");
                expect(rhs, lhs.ty(self), "rhs");
            }
            Inst::Icmp { lhs, rhs, .. } => {
                if lhs.ty(self) == Ty::Void {
                    self.fail(iidx, "compares void");
                }
                expect(rhs, lhs.ty(self), "rhs");
            }
            Inst::Select {
                cond,
                trueval,
                falseval,
            } => {
                expect(cond, I1, "condition");
                expect(falseval, trueval.ty(self), "false value");
            }
            Inst::Call { target, args } => {
                let (params, _) = target.sig();
                if params.len() != args.len() {
                    self.fail(
                        iidx,
                        &format!("passes {} arguments, expected {}", args.len(), params.len()),
                    );
                }
                for (i, (a, p)) in args.iter().zip(params).enumerate() {
                    expect(a, *p, &format!("argument {i}"));
                }
            }
            Inst::CondBr { cond, .. } => expect(cond, I1, "condition"),
            Inst::Switch { val, cases, .. } => {
                int(val, "value");
                for (i, (v, _)) in cases.iter().enumerate() {
                    if cases[..i].iter().any(|(w, _)| w == v) {
                        self.fail(iidx, &format!("has duplicate case {v}"));
                    }
                }
            }
            Inst::Ret(v) => expect(v, Ty::Obj, "return value"),
        }
    }

    /// The immediate dominator of each block: `None` for unreachable blocks, and the entry block
    /// is its own dominator. Uses the iterative algorithm of Cooper, Harvey and Kennedy.
    fn dominators(&self) -> TiVec<BlockIdx, Option<BlockIdx>> {
        // Reverse postorder.
        let mut order = Vec::new();
        let mut seen = vec![false; self.num_blocks()];
        let mut stack = vec![(BlockIdx(0), 0)];
        seen[0] = true;
        while let Some((b, i)) = stack.pop() {
            let succs = self.block_succs(b);
            if i < succs.len() {
                stack.push((b, i + 1));
                let s = succs[i];
                if !seen[usize::from(s)] {
                    seen[usize::from(s)] = true;
                    stack.push((s, 0));
                }
            } else {
                order.push(b);
            }
        }
        order.reverse();
        let mut rpo_num = vec![usize::MAX; self.num_blocks()];
        for (i, b) in order.iter().enumerate() {
            rpo_num[usize::from(*b)] = i;
        }
        let mut preds: TiVec<BlockIdx, Vec<BlockIdx>> =
            TiVec::from(vec![Vec::new(); self.num_blocks()]);
        for b in &order {
            for s in self.block_succs(*b) {
                preds[s].push(*b);
            }
        }

        let mut idom: TiVec<BlockIdx, Option<BlockIdx>> =
            TiVec::from(vec![None; self.num_blocks()]);
        idom[BlockIdx(0)] = Some(BlockIdx(0));
        let mut changed = true;
        while changed {
            changed = false;
            for b in order.iter().skip(1) {
                let mut new = None;
                for p in &preds[*b] {
                    if idom[*p].is_none() {
                        continue;
                    }
                    new = Some(match new {
                        None => *p,
                        Some(n) => intersect(&idom, &rpo_num, *p, n),
                    });
                }
                if new.is_some() && idom[*b] != new {
                    idom[*b] = new;
                    changed = true;
                }
            }
        }
        idom
    }

    fn block_succs(&self, b: BlockIdx) -> Vec<BlockIdx> {
        match self.block(b).insts().last() {
            Some(iidx) => self.inst(*iidx).successors(),
            None => Vec::new(),
        }
    }
}

fn intersect(
    idom: &TiVec<BlockIdx, Option<BlockIdx>>,
    rpo_num: &[usize],
    mut a: BlockIdx,
    mut b: BlockIdx,
) -> BlockIdx {
    while a != b {
        while rpo_num[usize::from(a)] > rpo_num[usize::from(b)] {
            a = idom[a].unwrap();
        }
        while rpo_num[usize::from(b)] > rpo_num[usize::from(a)] {
            b = idom[b].unwrap();
        }
    }
    a
}

/// Does `a` dominate `b`? Both must be reachable.
fn dominates(idom: &TiVec<BlockIdx, Option<BlockIdx>>, a: BlockIdx, mut b: BlockIdx) -> bool {
    loop {
        if a == b {
            return true;
        }
        match idom[b] {
            Some(d) if d != b => b = d,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{FuncBuilder, Pred, RuntimeFn};
    use super::*;

    #[test]
    fn well_formed_diamond() {
        let mut b = FuncBuilder::new("f");
        let slot = b.alloca(Ty::Obj, 1).unwrap();
        let (l, r, join) = (
            b.new_block("l").unwrap(),
            b.new_block("r").unwrap(),
            b.new_block("join").unwrap(),
        );
        let c = b.call(RuntimeFn::TracingActive, &[]).unwrap();
        b.cond_br(c, l, r).unwrap();
        for x in [l, r] {
            b.position_at_end(x);
            b.store(slot, Operand::null()).unwrap();
            b.br(join).unwrap();
        }
        b.position_at_end(join);
        let v = b.load(slot, Ty::Obj).unwrap();
        b.push(Inst::Ret(v)).unwrap();
        b.finalize();
    }

    #[test]
    #[should_panic(expected = "does not dominate")]
    fn use_not_dominated() {
        let mut b = FuncBuilder::new("f");
        let (l, r, join) = (
            b.new_block("l").unwrap(),
            b.new_block("r").unwrap(),
            b.new_block("join").unwrap(),
        );
        let c = b.call(RuntimeFn::TracingActive, &[]).unwrap();
        b.cond_br(c, l, r).unwrap();
        b.position_at_end(l);
        let v = b.call(RuntimeFn::DictNew, &[]).unwrap();
        b.br(join).unwrap();
        b.position_at_end(r);
        b.br(join).unwrap();
        b.position_at_end(join);
        b.push(Inst::Ret(v)).unwrap();
        b.finalize();
    }

    #[test]
    #[should_panic(expected = "argument 0 has type i64, expected obj")]
    fn call_argument_types() {
        let mut b = FuncBuilder::new("f");
        b.call(RuntimeFn::IncRef, &[Operand::i64(3)]).unwrap();
        b.push(Inst::Ret(Operand::null())).unwrap();
        b.finalize();
    }

    #[test]
    #[should_panic(expected = "is not terminated")]
    fn unterminated() {
        let mut b = FuncBuilder::new("f");
        b.icmp(Pred::Eq, Operand::i32(0), Operand::i32(1)).unwrap();
        b.finalize();
    }
}
