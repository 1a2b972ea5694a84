//! The operand stack and reference counting.
//!
//! Every object value the translator handles is either [Owned] (the translated code holds a
//! reference it must release or hand on) or [Borrowed]. `Owned` is `#[must_use]`, so dropping
//! one on the floor without emitting a decref, a push or a steal is a compile-time warning.

use super::Translator;
use crate::{
    compile::CompilationError,
    ir::{BlockIdx, Operand, Pred, RuntimeFn, Ty, I32},
};

/// A reference the translated code owns.
#[must_use]
#[derive(Debug)]
pub(super) struct Owned(Operand);

impl Owned {
    /// Take ownership of the new reference `v`.
    pub(super) fn new(v: Operand) -> Self {
        Owned(v)
    }

    pub(super) fn borrow(&self) -> Borrowed {
        Borrowed(self.0)
    }

    /// Give the reference away: whatever `self` is passed to steals it.
    pub(super) fn into_operand(self) -> Operand {
        self.0
    }
}

/// A reference owned by someone else.
#[derive(Clone, Copy, Debug)]
pub(super) struct Borrowed(Operand);

impl Borrowed {
    pub(super) fn operand(self) -> Operand {
        self.0
    }

    pub(super) fn new(v: Operand) -> Self {
        Borrowed(v)
    }
}

impl Translator<'_> {
    fn sp(&mut self) -> Result<Operand, CompilationError> {
        self.b.load(self.sh.sp, Ty::Ptr)
    }

    fn set_sp(&mut self, sp: Operand) -> Result<(), CompilationError> {
        self.b.store(self.sh.sp, sp)
    }

    pub(super) fn push(&mut self, v: Owned) -> Result<(), CompilationError> {
        let sp = self.sp()?;
        self.b.store(sp, v.into_operand())?;
        let sp = self.b.ptr_add(sp, Operand::i64(1))?;
        self.set_sp(sp)
    }

    pub(super) fn pop(&mut self) -> Result<Owned, CompilationError> {
        let sp = self.sp()?;
        let sp = self.b.ptr_add(sp, Operand::i64(-1))?;
        self.set_sp(sp)?;
        Ok(Owned(self.b.load(sp, Ty::Obj)?))
    }

    /// The value `n` slots below the top of the stack.
    pub(super) fn peek(&mut self, n: usize) -> Result<Borrowed, CompilationError> {
        let p = self.stack_addr(n + 1)?;
        Ok(Borrowed(self.b.load(p, Ty::Obj)?))
    }

    /// The address of the `n`th value from the top: `stack_addr(1)` is the top of the stack.
    pub(super) fn stack_addr(&mut self, n: usize) -> Result<Operand, CompilationError> {
        let sp = self.sp()?;
        self.b.ptr_add(sp, Operand::i64(-(n as i64)))
    }

    /// Forget the top `n` values without releasing them: their references have been stolen.
    pub(super) fn discard(&mut self, n: usize) -> Result<(), CompilationError> {
        let sp = self.stack_addr(n)?;
        self.set_sp(sp)
    }

    /// Push `n` values that a runtime function has already written above the stack pointer.
    pub(super) fn adopt(&mut self, n: usize) -> Result<(), CompilationError> {
        let sp = self.sp()?;
        let sp = self.b.ptr_add(sp, Operand::i64(n as i64))?;
        self.set_sp(sp)
    }

    /// Pop and release the top `n` values.
    pub(super) fn drop_n(&mut self, n: usize) -> Result<(), CompilationError> {
        for _ in 0..n {
            let v = self.pop()?;
            self.decref(v)?;
        }
        Ok(())
    }

    /// The current stack depth, as an `i64`.
    pub(super) fn depth(&mut self) -> Result<Operand, CompilationError> {
        let sp = self.sp()?;
        self.b.push(crate::ir::Inst::PtrDiff {
            lhs: sp,
            rhs: self.stack_base,
        })
    }

    /// Pop and release values until the stack depth is `level` (an `i64`), which is only known
    /// at run time.
    pub(super) fn drain_to(&mut self, level: Operand) -> Result<(), CompilationError> {
        let head = self.b.new_block("drain")?;
        let body = self.b.new_block("drain pop")?;
        let done = self.b.new_block("drained")?;
        self.b.br(head)?;
        self.b.position_at_end(head);
        let d = self.depth()?;
        let more = self.b.icmp(Pred::Sgt, d, level)?;
        self.b.cond_br(more, body, done)?;
        self.b.position_at_end(body);
        let v = self.pop()?;
        self.decref(v)?;
        self.b.br(head)?;
        self.b.position_at_end(done);
        Ok(())
    }

    pub(super) fn incref(&mut self, v: Borrowed) -> Result<Owned, CompilationError> {
        self.b.call(RuntimeFn::IncRef, &[v.0])?;
        Ok(Owned(v.0))
    }

    pub(super) fn decref(&mut self, v: Owned) -> Result<(), CompilationError> {
        self.b.call(RuntimeFn::DecRef, &[v.0]).map(|_| ())
    }

    /// Release a reference that may be NULL.
    pub(super) fn xdecref(&mut self, v: Operand) -> Result<(), CompilationError> {
        self.b.call(RuntimeFn::XDecRef, &[v]).map(|_| ())
    }

    /// Wrap a reference returned by `f` that the caller now owns (and which is never NULL).
    pub(super) fn new_ref(
        &mut self,
        f: RuntimeFn,
        args: &[Operand],
    ) -> Result<Owned, CompilationError> {
        Ok(Owned(self.b.call(f, args)?))
    }

    /// `v` is a new reference, or NULL if an exception was raised.
    pub(super) fn check_obj(&mut self, v: Operand) -> Result<Owned, CompilationError> {
        let failed = self.b.icmp(Pred::Eq, v, Operand::null())?;
        self.propagate_if(failed)?;
        Ok(Owned(v))
    }

    /// `r` is an `i32` status: zero for success, non-zero if an exception was raised.
    pub(super) fn check_status(&mut self, r: Operand) -> Result<(), CompilationError> {
        let failed = self.b.icmp(Pred::Ne, r, Operand::i32(0))?;
        self.propagate_if(failed)
    }

    /// The address of fast local `i` in the shadow frame.
    pub(super) fn local_addr(&mut self, i: usize) -> Result<Operand, CompilationError> {
        self.b.ptr_add(self.sh.locals, Operand::i64(i as i64))
    }

    /// Load fast local `i`, which may be NULL.
    pub(super) fn load_local(&mut self, i: usize) -> Result<Operand, CompilationError> {
        let p = self.local_addr(i)?;
        self.b.load(p, Ty::Obj)
    }

    /// Store `v` in fast local `i`, then release the old value. The order matters: releasing
    /// the old value may run arbitrary code that reads the local.
    pub(super) fn store_local(&mut self, i: usize, v: Operand) -> Result<(), CompilationError> {
        let p = self.local_addr(i)?;
        let old = self.b.load(p, Ty::Obj)?;
        self.b.store(p, v)?;
        self.xdecref(old)
    }

    /// Branch to `unbound` if `v` is NULL, otherwise carry on in a new block.
    pub(super) fn branch_if_null(
        &mut self,
        v: Operand,
        unbound: BlockIdx,
    ) -> Result<(), CompilationError> {
        let is_null = self.b.icmp(Pred::Eq, v, Operand::null())?;
        let ok = self.sub_block("bound")?;
        self.b.cond_br(is_null, unbound, ok)?;
        self.b.position_at_end(ok);
        Ok(())
    }

    /// A name index as the `i32` operand runtime functions take.
    pub(super) fn name_operand(&self, i: usize) -> Operand {
        debug_assert!(i <= i32::MAX as usize);
        Operand::i32(i as i32)
    }

    /// Is the `i32` result `r` non-zero?
    pub(super) fn truthy(&mut self, r: Operand) -> Result<Operand, CompilationError> {
        debug_assert_eq!(r.ty(self.b.func()), I32);
        self.b.icmp(Pred::Ne, r, Operand::i32(0))
    }
}
