//! Instructions with no control flow of their own: they either fall through to the next
//! instruction or raise.

use super::{
    stack::{Borrowed, Owned},
    Translator,
};
use crate::{
    code::{Instr, Opcode},
    compile::CompilationError,
    frame::BailReason,
    ir::{BlockIdx, Inst, Operand, Pred, RuntimeFn},
    runtime::CompareOp,
};

impl Translator<'_> {
    pub(super) fn simple_instr(&mut self, instr: Instr) -> Result<(), CompilationError> {
        let arg = instr.arg as usize;
        if let Some(op) = instr.op.binary_op() {
            return self.binary(RuntimeFn::Binary(op));
        }
        if let Some(op) = instr.op.inplace_op() {
            return self.binary(RuntimeFn::InPlace(op));
        }
        match instr.op {
            Opcode::Nop => Ok(()),
            Opcode::PopTop => self.drop_n(1),
            Opcode::RotTwo => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a)?;
                self.push(b)
            }
            Opcode::RotThree => {
                let a = self.pop()?;
                let b = self.pop()?;
                let c = self.pop()?;
                self.push(a)?;
                self.push(c)?;
                self.push(b)
            }
            Opcode::RotFour => {
                let a = self.pop()?;
                let b = self.pop()?;
                let c = self.pop()?;
                let d = self.pop()?;
                self.push(a)?;
                self.push(d)?;
                self.push(c)?;
                self.push(b)
            }
            Opcode::DupTop => {
                let v = self.peek(0)?;
                let v = self.incref(v)?;
                self.push(v)
            }
            Opcode::DupTopx => {
                for _ in 0..arg {
                    let v = self.peek(arg - 1)?;
                    let v = self.incref(v)?;
                    self.push(v)?;
                }
                Ok(())
            }
            Opcode::LoadConst => {
                let c = Borrowed::new(Operand::obj(self.code.consts[arg]));
                let c = self.incref(c)?;
                self.push(c)
            }
            Opcode::LoadFast => self.load_fast(arg),
            Opcode::StoreFast => {
                let v = self.pop()?;
                self.store_local(arg, v.into_operand())
            }
            Opcode::DeleteFast => {
                let v = self.load_local(arg)?;
                let unbound = self.unbound_local(arg)?;
                self.branch_if_null(v, unbound)?;
                self.store_local(arg, Operand::null())
            }
            Opcode::LoadClosure => {
                let cell = self.load_local(self.code.varnames.len() + arg)?;
                let cell = self.incref(Borrowed::new(cell))?;
                self.push(cell)
            }
            Opcode::LoadDeref => {
                let slot = self.code.varnames.len() + arg;
                let cell = self.load_local(slot)?;
                let v = self
                    .b
                    .call(RuntimeFn::Deref, &[cell, Operand::i32(slot as i32)])?;
                let v = self.check_obj(v)?;
                self.push(v)
            }
            Opcode::StoreDeref => {
                let cell = self.load_local(self.code.varnames.len() + arg)?;
                let v = self.pop()?;
                self.b
                    .call(RuntimeFn::CellSet, &[cell, v.borrow().operand()])?;
                self.decref(v)
            }
            Opcode::UnaryNot => {
                let v = self.pop()?;
                let r = self.b.call(RuntimeFn::IsTrue, &[v.borrow().operand()])?;
                self.decref(v)?;
                let t = self.truthy(r)?;
                let (tru, fals) = (self.rt.bool_obj(true), self.rt.bool_obj(false));
                let b = self.b.push(Inst::Select {
                    cond: t,
                    trueval: Operand::obj(fals),
                    falseval: Operand::obj(tru),
                })?;
                let b = self.incref(Borrowed::new(b))?;
                self.push(b)
            }
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert => {
                let op = instr.op.unary_op().ok_or_else(|| {
                    CompilationError::InternalError(format!("{} is not unary", instr.op))
                })?;
                let v = self.pop()?;
                let r = self.b.call(RuntimeFn::Unary(op), &[v.borrow().operand()])?;
                self.decref(v)?;
                let r = self.check_obj(r)?;
                self.push(r)
            }
            Opcode::CompareOp => self.compare(arg),
            Opcode::BinarySubscr => self.binary(RuntimeFn::GetItem),
            Opcode::StoreSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let v = self.pop()?;
                let r = self.b.call(
                    RuntimeFn::SetItem,
                    &[
                        container.borrow().operand(),
                        key.borrow().operand(),
                        v.borrow().operand(),
                    ],
                )?;
                self.decref(v)?;
                self.decref(container)?;
                self.decref(key)?;
                self.check_status(r)
            }
            Opcode::DeleteSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let r = self.b.call(
                    RuntimeFn::DelItem,
                    &[container.borrow().operand(), key.borrow().operand()],
                )?;
                self.decref(container)?;
                self.decref(key)?;
                self.check_status(r)
            }
            Opcode::Slice0 | Opcode::Slice1 | Opcode::Slice2 | Opcode::Slice3 => {
                let (start, stop) = self.pop_slice_bounds(instr.op as u8 - Opcode::Slice0 as u8)?;
                let seq = self.pop()?;
                let r = self.b.call(
                    RuntimeFn::ApplySlice,
                    &[seq.borrow().operand(), start, stop],
                )?;
                self.decref(seq)?;
                self.xdecref(start)?;
                self.xdecref(stop)?;
                let r = self.check_obj(r)?;
                self.push(r)
            }
            Opcode::StoreSlice0
            | Opcode::StoreSlice1
            | Opcode::StoreSlice2
            | Opcode::StoreSlice3 => {
                let (start, stop) =
                    self.pop_slice_bounds(instr.op as u8 - Opcode::StoreSlice0 as u8)?;
                let seq = self.pop()?;
                let v = self.pop()?;
                let r = self.b.call(
                    RuntimeFn::AssignSlice,
                    &[seq.borrow().operand(), start, stop, v.borrow().operand()],
                )?;
                self.decref(v)?;
                self.decref(seq)?;
                self.xdecref(start)?;
                self.xdecref(stop)?;
                self.check_status(r)
            }
            Opcode::DeleteSlice0
            | Opcode::DeleteSlice1
            | Opcode::DeleteSlice2
            | Opcode::DeleteSlice3 => {
                let (start, stop) =
                    self.pop_slice_bounds(instr.op as u8 - Opcode::DeleteSlice0 as u8)?;
                let seq = self.pop()?;
                let r = self.b.call(
                    RuntimeFn::AssignSlice,
                    &[seq.borrow().operand(), start, stop, Operand::null()],
                )?;
                self.decref(seq)?;
                self.xdecref(start)?;
                self.xdecref(stop)?;
                self.check_status(r)
            }
            Opcode::BuildSlice => {
                let step = if arg == 3 {
                    self.pop()?.into_operand()
                } else {
                    Operand::null()
                };
                let stop = self.pop()?;
                let start = self.pop()?;
                let r = self.new_ref(
                    RuntimeFn::BuildSlice,
                    &[start.borrow().operand(), stop.borrow().operand(), step],
                )?;
                self.decref(start)?;
                self.decref(stop)?;
                self.xdecref(step)?;
                self.push(r)
            }
            Opcode::BuildTuple | Opcode::BuildList => {
                let f = if instr.op == Opcode::BuildTuple {
                    RuntimeFn::BuildTuple
                } else {
                    RuntimeFn::BuildList
                };
                // The items are stolen from the stack.
                let base = self.stack_addr(arg)?;
                let r = self.new_ref(f, &[base, Operand::i64(arg as i64)])?;
                self.discard(arg)?;
                self.push(r)
            }
            Opcode::BuildMap => {
                let d = self.new_ref(RuntimeFn::DictNew, &[])?;
                self.push(d)
            }
            Opcode::StoreMap => {
                let key = self.pop()?;
                let v = self.pop()?;
                let d = self.peek(0)?;
                let r = self.b.call(
                    RuntimeFn::DictSetItem,
                    &[d.operand(), key.borrow().operand(), v.borrow().operand()],
                )?;
                self.decref(v)?;
                self.decref(key)?;
                self.check_status(r)
            }
            Opcode::ListAppend => {
                let depth = arg.checked_sub(1).ok_or_else(|| {
                    CompilationError::General(format!(
                        "{}: LIST_APPEND 0 at offset {}",
                        self.code.name, self.off
                    ))
                })?;
                let v = self.pop()?;
                let list = self.peek(depth)?;
                let r = self.b.call(
                    RuntimeFn::ListAppend,
                    &[list.operand(), v.borrow().operand()],
                )?;
                self.decref(v)?;
                self.check_status(r)
            }
            Opcode::UnpackSequence => {
                let seq = self.pop()?;
                let base = self.stack_addr(0)?;
                let r = self.b.call(
                    RuntimeFn::UnpackSequence,
                    &[seq.borrow().operand(), base, Operand::i64(arg as i64)],
                )?;
                self.decref(seq)?;
                self.check_status(r)?;
                self.adopt(arg)
            }
            Opcode::GetIter => {
                let v = self.pop()?;
                let r = self.b.call(RuntimeFn::GetIter, &[v.borrow().operand()])?;
                self.decref(v)?;
                let r = self.check_obj(r)?;
                self.push(r)
            }
            Opcode::LoadName => {
                let args = [
                    self.frame_locals,
                    self.frame_globals,
                    self.frame_builtins,
                    self.name_operand(arg),
                ];
                let r = self.b.call(RuntimeFn::LoadName, &args)?;
                let r = self.check_obj(r)?;
                self.push(r)
            }
            Opcode::StoreName => {
                let v = self.pop()?;
                let args = [self.frame_locals, self.name_operand(arg), v.borrow().operand()];
                let r = self.b.call(RuntimeFn::StoreName, &args)?;
                self.decref(v)?;
                self.check_status(r)
            }
            Opcode::DeleteName => {
                let args = [self.frame_locals, self.name_operand(arg)];
                let r = self.b.call(RuntimeFn::DeleteName, &args)?;
                self.check_status(r)
            }
            Opcode::LoadGlobal => self.load_global_generic(arg),
            Opcode::StoreGlobal => {
                let v = self.pop()?;
                let args = [self.frame_globals, self.name_operand(arg), v.borrow().operand()];
                let r = self.b.call(RuntimeFn::StoreGlobal, &args)?;
                self.decref(v)?;
                self.check_status(r)
            }
            Opcode::DeleteGlobal => {
                let args = [self.frame_globals, self.name_operand(arg)];
                let r = self.b.call(RuntimeFn::DeleteGlobal, &args)?;
                self.check_status(r)
            }
            Opcode::LoadAttr => {
                let obj = self.pop()?;
                self.load_attr_generic(obj, arg)
            }
            Opcode::StoreAttr => {
                let obj = self.pop()?;
                let v = self.pop()?;
                self.store_attr_generic(obj, v, arg)
            }
            Opcode::DeleteAttr => {
                let obj = self.pop()?;
                let args = [obj.borrow().operand(), self.name_operand(arg)];
                let r = self.b.call(RuntimeFn::DelAttr, &args)?;
                self.decref(obj)?;
                self.check_status(r)
            }
            Opcode::ImportName => {
                let fromlist = self.pop()?;
                let level = self.pop()?;
                let args = [
                    self.name_operand(arg),
                    fromlist.borrow().operand(),
                    level.borrow().operand(),
                ];
                let r = self.b.call(RuntimeFn::ImportName, &args)?;
                self.decref(fromlist)?;
                self.decref(level)?;
                let r = self.check_obj(r)?;
                self.push(r)
            }
            Opcode::CallFunction
            | Opcode::CallFunctionVar
            | Opcode::CallFunctionKw
            | Opcode::CallFunctionVarKw => self.call_function(instr),
            Opcode::MakeFunction | Opcode::MakeClosure => {
                let code = self.pop()?;
                let closure = if instr.op == Opcode::MakeClosure {
                    Some(self.pop()?)
                } else {
                    None
                };
                let defaults = self.stack_addr(arg)?;
                let closure_op = closure
                    .as_ref()
                    .map(|c| c.borrow().operand())
                    .unwrap_or_else(Operand::null);
                let f = self.new_ref(
                    RuntimeFn::MakeFunction,
                    &[
                        code.borrow().operand(),
                        self.frame_globals,
                        defaults,
                        Operand::i64(arg as i64),
                        closure_op,
                    ],
                )?;
                self.decref(code)?;
                if let Some(c) = closure {
                    self.decref(c)?;
                }
                self.drop_n(arg)?;
                self.push(f)
            }
            op => Err(CompilationError::InternalError(format!(
                "{}: no translation for {op} at offset {}",
                self.code.name, self.off
            ))),
        }
    }

    /// Pop two operands, call the binary runtime function `f` on them, push the result.
    fn binary(&mut self, f: RuntimeFn) -> Result<(), CompilationError> {
        let w = self.pop()?;
        let v = self.pop()?;
        let r = self
            .b
            .call(f, &[v.borrow().operand(), w.borrow().operand()])?;
        self.decref(v)?;
        self.decref(w)?;
        let r = self.check_obj(r)?;
        self.push(r)
    }

    fn compare(&mut self, arg: usize) -> Result<(), CompilationError> {
        let op = CompareOp::from_repr(arg as u8).ok_or_else(|| {
            CompilationError::General(format!(
                "{}: bad comparison {arg} at offset {}",
                self.code.name, self.off
            ))
        })?;
        if !matches!(op, CompareOp::Is | CompareOp::IsNot) {
            return self.binary(RuntimeFn::Compare(op));
        }
        // Identity needs no help from the runtime.
        let w = self.pop()?;
        let v = self.pop()?;
        let pred = if op == CompareOp::Is {
            Pred::Eq
        } else {
            Pred::Ne
        };
        let same = self
            .b
            .icmp(pred, v.borrow().operand(), w.borrow().operand())?;
        let (tru, fals) = (self.rt.bool_obj(true), self.rt.bool_obj(false));
        let r = self.b.push(Inst::Select {
            cond: same,
            trueval: Operand::obj(tru),
            falseval: Operand::obj(fals),
        })?;
        let r = self.incref(Borrowed::new(r))?;
        self.decref(v)?;
        self.decref(w)?;
        self.push(r)
    }

    /// Pop the bounds of a `SLICE+n`-style instruction, returning `(start, stop)` as owned,
    /// possibly NULL, references.
    fn pop_slice_bounds(&mut self, variant: u8) -> Result<(Operand, Operand), CompilationError> {
        let stop = if variant & 2 != 0 {
            self.pop()?.into_operand()
        } else {
            Operand::null()
        };
        let start = if variant & 1 != 0 {
            self.pop()?.into_operand()
        } else {
            Operand::null()
        };
        Ok((start, stop))
    }

    fn load_fast(&mut self, i: usize) -> Result<(), CompilationError> {
        let v = self.load_local(i)?;
        if !self.always_bound(i) {
            let unbound = self.unbound_local(i)?;
            self.branch_if_null(v, unbound)?;
        }
        let v = self.incref(Borrowed::new(v))?;
        self.push(v)
    }

    /// Is fast local `i` an argument that nothing deletes? Arguments are bound on entry, and
    /// `STORE_FAST` never stores NULL, so such a local can't be unbound.
    fn always_bound(&self, i: usize) -> bool {
        i < self.code.argcount
            && !self
                .code
                .instrs()
                .iter()
                .any(|x| x.op == Opcode::DeleteFast && x.arg as usize == i)
    }

    /// A block that raises `UnboundLocalError` for fast local `i`.
    fn unbound_local(&mut self, i: usize) -> Result<BlockIdx, CompilationError> {
        let cur = self.b.cur_block();
        let blk = self.sub_block("unbound")?;
        self.b.position_at_end(blk);
        self.mark_lasti()?;
        self.b
            .call(RuntimeFn::RaiseUnboundLocal, &[Operand::i32(i as i32)])?;
        self.b.br(self.shared.propagate)?;
        self.b.position_at_end(cur);
        Ok(blk)
    }

    fn call_function(&mut self, instr: Instr) -> Result<(), CompilationError> {
        // A profiling hook sees every call, so it needs the interpreter.
        let profiling = self.b.call(RuntimeFn::ProfilingActive, &[])?;
        let site = self.bail_site(self.off, BailReason::CallProfile)?;
        let go = self.sub_block("call")?;
        self.b.cond_br(profiling, site, go)?;
        self.b.position_at_end(go);

        match self.speculated_callee(instr) {
            Some((callee, b)) => self.call_builtin(callee, b, instr),
            None => self.call_generic(instr),
        }
    }

    /// Call through the runtime's generic call machinery.
    pub(super) fn call_generic(&mut self, instr: Instr) -> Result<(), CompilationError> {
        let (na, nk) = instr.call_counts();
        let flags = match instr.op {
            Opcode::CallFunctionVar => 1,
            Opcode::CallFunctionKw => 2,
            Opcode::CallFunctionVarKw => 3,
            _ => 0,
        };
        let nextra = usize::from(flags & 1 != 0) + usize::from(flags & 2 != 0);
        let n = 1 + na + 2 * nk + nextra;
        let base = self.stack_addr(n)?;
        let oparg = Operand::i32(instr.arg as i32);
        let r = if flags == 0 {
            self.b.call(RuntimeFn::CallFunction, &[base, oparg])?
        } else {
            self.b.call(
                RuntimeFn::CallFunctionVarKw,
                &[base, oparg, Operand::i32(flags)],
            )?
        };
        // The callee and its arguments were borrowed from the stack.
        self.drop_n(n)?;
        let r = self.check_obj(r)?;
        self.push(r)
    }

    /// The fallback for `LOAD_ATTR`: `obj` has already been popped.
    pub(super) fn load_attr_generic(
        &mut self,
        obj: Owned,
        name: usize,
    ) -> Result<(), CompilationError> {
        let args = [obj.borrow().operand(), self.name_operand(name)];
        let r = self.b.call(RuntimeFn::GetAttr, &args)?;
        self.decref(obj)?;
        let r = self.check_obj(r)?;
        self.push(r)
    }

    /// The fallback for `STORE_ATTR`: `obj` and `v` have already been popped.
    pub(super) fn store_attr_generic(
        &mut self,
        obj: Owned,
        v: Owned,
        name: usize,
    ) -> Result<(), CompilationError> {
        let args = [
            obj.borrow().operand(),
            self.name_operand(name),
            v.borrow().operand(),
        ];
        let r = self.b.call(RuntimeFn::SetAttr, &args)?;
        self.decref(v)?;
        self.decref(obj)?;
        self.check_status(r)
    }

    pub(super) fn load_global_generic(&mut self, name: usize) -> Result<(), CompilationError> {
        let args = [
            self.frame_globals,
            self.frame_builtins,
            self.name_operand(name),
        ];
        let r = self.b.call(RuntimeFn::LoadGlobal, &args)?;
        let r = self.check_obj(r)?;
        self.push(r)
    }
}
