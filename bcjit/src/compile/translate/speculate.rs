//! Guarded fast paths for attribute and global lookups.
//!
//! An attribute fast path applies when type feedback says the owner only ever had one type, and
//! that type is a class: the type-level lookup is then done at translation time, and the
//! translated code only checks that the owner still has that type. The translated function
//! depends on the type (and, through the runtime's subtype notifications, its bases) not being
//! mutated; if it is, `GuardsValid` fails and the function bails out.
//!
//! A global fast path embeds the value found at translation time, guarded by the versions of the
//! dictionaries it was looked up in.
//!
//! A call fast path applies when call feedback says a `CALL_FUNCTION` site only ever called one
//! free builtin, with one operand: the callee's identity is checked and the builtin is called
//! directly. The builtins dictionary keeps such a callee alive, so its identity is never reused.

use super::Translator;
use crate::{
    code::{Instr, Opcode},
    compile::CompilationError,
    feedback::CallFeedback,
    frame::BailReason,
    ir::{BinOp, BlockIdx, Operand, Pred, RuntimeFn},
    runtime::{Builtin, Object, ObjId, TypeKind},
};

#[derive(Clone, Copy, Debug, PartialEq)]
enum LoadPlan {
    /// Read an instance slot.
    Slot(usize),
    /// The instance dictionary, then the (possibly absent) non-data descriptor.
    Cached(Option<ObjId>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum StorePlan {
    Slot(usize),
    InstanceDict,
}

impl Translator<'_> {
    fn name_str(&self, name: usize) -> Result<&str, CompilationError> {
        self.code
            .names
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| {
                CompilationError::General(format!(
                    "{}: name index {name} out of range at offset {}",
                    self.code.name, self.off
                ))
            })
    }

    /// The class the owner at this offset has always had, if feedback says there was exactly
    /// one.
    fn speculated_class(&self) -> Option<ObjId> {
        let ty = self.feedback.types(self.off, 0)?.monomorphic()?;
        // Feedback holds no references: the type may have died since.
        if !self.rt.is_live(ty) {
            return None;
        }
        match self.rt.get(ty) {
            Object::Type(t) if t.kind == TypeKind::Class => Some(ty),
            _ => None,
        }
    }

    fn load_plan(&self, ty: ObjId, name: usize) -> Result<Option<LoadPlan>, CompilationError> {
        let n = self.name_str(name)?;
        Ok(match self.rt.type_lookup(ty, n) {
            Some(d) => match self.rt.get(d) {
                Object::SlotDescr(s) => Some(LoadPlan::Slot(s.index)),
                // Properties run arbitrary code.
                _ if self.rt.is_data_descriptor(d) => None,
                _ => Some(LoadPlan::Cached(Some(d))),
            },
            None => Some(LoadPlan::Cached(None)),
        })
    }

    fn store_plan(&self, ty: ObjId, name: usize) -> Result<Option<StorePlan>, CompilationError> {
        let n = self.name_str(name)?;
        let has_dict = matches!(self.rt.get(ty), Object::Type(t) if t.has_dict);
        Ok(match self.rt.type_lookup(ty, n) {
            Some(d) => match self.rt.get(d) {
                Object::SlotDescr(s) => Some(StorePlan::Slot(s.index)),
                _ if self.rt.is_data_descriptor(d) => None,
                _ if has_dict => Some(StorePlan::InstanceDict),
                _ => None,
            },
            None if has_dict => Some(StorePlan::InstanceDict),
            None => None,
        })
    }

    /// Check that the guard dependencies still hold (bailing out if not) and that the value on
    /// top of the stack has type `ty`. Returns the `(fast, slow)` blocks.
    fn type_guard(&mut self, ty: ObjId) -> Result<(BlockIdx, BlockIdx), CompilationError> {
        let valid = self.b.call(RuntimeFn::GuardsValid, &[])?;
        let invalid = self.bail_site(self.off, BailReason::FatalGuard)?;
        let check = self.sub_block("guards valid")?;
        self.b.cond_br(valid, check, invalid)?;
        self.b.position_at_end(check);
        let owner = self.peek(0)?;
        let t = self.b.call(RuntimeFn::TypeOf, &[owner.operand()])?;
        let same = self.b.icmp(Pred::Eq, t, Operand::obj(ty))?;
        let fast = self.sub_block("fast")?;
        let slow = self.sub_block("slow")?;
        self.b.cond_br(same, fast, slow)?;
        self.guards.depend_on(ty);
        Ok((fast, slow))
    }

    fn br_next(&mut self) -> Result<(), CompilationError> {
        let next = self.instr_block(self.off + 1)?;
        self.b.br(next)
    }

    pub(super) fn load_attr(&mut self, name: usize) -> Result<(), CompilationError> {
        let plan = match self.speculated_class() {
            Some(ty) => self.load_plan(ty, name)?.map(|p| (ty, p)),
            None => None,
        };
        let Some((ty, plan)) = plan else {
            let obj = self.pop()?;
            return self.load_attr_generic(obj, name);
        };
        let (fast, slow) = self.type_guard(ty)?;

        self.b.position_at_end(fast);
        let obj = self.pop()?;
        let r = match plan {
            LoadPlan::Slot(idx) => {
                let args = [
                    obj.borrow().operand(),
                    Operand::i32(idx as i32),
                    self.name_operand(name),
                ];
                self.b.call(RuntimeFn::SlotGet, &args)?
            }
            LoadPlan::Cached(d) => {
                let d = d.map(Operand::obj).unwrap_or_else(Operand::null);
                let args = [obj.borrow().operand(), self.name_operand(name), d];
                self.b.call(RuntimeFn::GetAttrCached, &args)?
            }
        };
        self.decref(obj)?;
        let r = self.check_obj(r)?;
        self.push(r)?;
        self.br_next()?;

        self.b.position_at_end(slow);
        let obj = self.pop()?;
        self.load_attr_generic(obj, name)?;
        self.br_next()
    }

    pub(super) fn store_attr(&mut self, name: usize) -> Result<(), CompilationError> {
        let plan = match self.speculated_class() {
            Some(ty) => self.store_plan(ty, name)?.map(|p| (ty, p)),
            None => None,
        };
        let Some((ty, plan)) = plan else {
            let obj = self.pop()?;
            let v = self.pop()?;
            return self.store_attr_generic(obj, v, name);
        };
        let (fast, slow) = self.type_guard(ty)?;

        self.b.position_at_end(fast);
        let obj = self.pop()?;
        let v = self.pop()?;
        let r = match plan {
            StorePlan::Slot(idx) => {
                let args = [
                    obj.borrow().operand(),
                    Operand::i32(idx as i32),
                    self.name_operand(name),
                    v.borrow().operand(),
                ];
                self.b.call(RuntimeFn::SlotSet, &args)?
            }
            StorePlan::InstanceDict => {
                let args = [
                    obj.borrow().operand(),
                    self.name_operand(name),
                    v.borrow().operand(),
                ];
                self.b.call(RuntimeFn::SetAttrDict, &args)?
            }
        };
        self.decref(v)?;
        self.decref(obj)?;
        self.check_status(r)?;
        self.br_next()?;

        self.b.position_at_end(slow);
        let obj = self.pop()?;
        let v = self.pop()?;
        self.store_attr_generic(obj, v, name)?;
        self.br_next()
    }

    pub(super) fn load_global(&mut self, name: usize) -> Result<(), CompilationError> {
        let n = self.name_str(name)?;
        let builtins = self.rt.builtins();
        let found = self
            .globals
            .and_then(|g| Some((g, self.rt.global_lookup(g, builtins, n)?)));
        let Some((g, (v, from_builtins))) = found else {
            return self.load_global_generic(name);
        };

        let mut expected = vec![(self.frame_globals, self.rt.dict_version(g))];
        if from_builtins {
            // The name must also still be absent from the globals.
            expected.push((self.frame_builtins, self.rt.dict_version(builtins)));
        }
        let mut ok = None;
        for (dict, version) in expected {
            let cur = self.b.call(RuntimeFn::DictVersion, &[dict])?;
            let same = self.b.icmp(Pred::Eq, cur, Operand::i64(version as i64))?;
            ok = Some(match ok {
                None => same,
                Some(prev) => self.b.binop(BinOp::And, prev, same)?,
            });
        }
        let fast = self.sub_block("fast")?;
        let slow = self.sub_block("slow")?;
        let ok = ok.unwrap_or_else(|| Operand::i1(true));
        self.b.cond_br(ok, fast, slow)?;

        self.b.position_at_end(fast);
        let v = self.incref(super::stack::Borrowed::new(Operand::obj(v)))?;
        self.push(v)?;
        self.br_next()?;

        self.b.position_at_end(slow);
        self.load_global_generic(name)?;
        self.br_next()
    }

    /// The free builtin every call at this offset has gone to, if feedback says there was
    /// exactly one and the call passes only positional arguments.
    pub(super) fn speculated_callee(&self, instr: Instr) -> Option<(ObjId, Builtin)> {
        if !self.config.speculate_calls || instr.op != Opcode::CallFunction {
            return None;
        }
        let (_, nk) = instr.call_counts();
        let CallFeedback::Monomorphic { callee, oparg } = self.feedback.call(self.off)? else {
            return None;
        };
        if nk != 0 || oparg != instr.arg || !self.rt.is_live(callee) {
            return None;
        }
        match self.rt.get(callee) {
            Object::Builtin(b)
                if !b.is_method()
                    && self.rt.dict_get_str(self.rt.builtins(), b.name()) == Some(callee) =>
            {
                Some((callee, *b))
            }
            _ => None,
        }
    }

    /// `CALL_FUNCTION` of `callee`, the builtin `b`, with a generic call if the callee turns out
    /// to be something else.
    pub(super) fn call_builtin(
        &mut self,
        callee: ObjId,
        b: Builtin,
        instr: Instr,
    ) -> Result<(), CompilationError> {
        let (na, _) = instr.call_counts();
        let f = self.peek(na)?;
        let same = self.b.icmp(Pred::Eq, f.operand(), Operand::obj(callee))?;
        let fast = self.sub_block("fast")?;
        let slow = self.sub_block("slow")?;
        self.b.cond_br(same, fast, slow)?;

        self.b.position_at_end(fast);
        let args = self.stack_addr(na)?;
        let r = self
            .b
            .call(RuntimeFn::CallBuiltin(b), &[args, Operand::i64(na as i64)])?;
        // The callee and its arguments were borrowed from the stack.
        self.drop_n(na + 1)?;
        let r = self.check_obj(r)?;
        self.push(r)?;
        self.br_next()?;

        self.b.position_at_end(slow);
        self.call_generic(instr)?;
        self.br_next()
    }
}
