//! An evaluator for IR functions.
//!
//! This stands in for native code generation: it runs a [Func] directly against a [Runtime] and
//! the [Frame] the function was called with. It is strict about memory: loading from a slot
//! that has never been stored to is a translator bug and panics, as does addressing outside a
//! region.

use super::{BinOp, Const, FrameField, Func, Inst, InstIdx, Operand, Pred, RuntimeFn};
use crate::{
    compile::GuardSet,
    frame::{BailReason, Frame},
    runtime::{ObjId, RtResult, Runtime},
};
use std::{collections::HashMap, rc::Rc};
use typed_index_collections::TiVec;

/// How a call to an IR function ended.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EvalResult {
    /// The function returned: an owned reference, or `None` if an exception is pending.
    Return(Option<ObjId>),
    /// The function returned the sentinel: the frame must be resumed by the interpreter.
    Bail,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Region {
    Alloca(InstIdx),
    Frame(FrameField),
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Addr {
    region: Region,
    off: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Val {
    Int(i64),
    Obj(Option<ObjId>),
    Ptr(Addr),
    Sentinel,
    Void,
}

/// Run `f` on `frame`.
pub fn eval(f: &Func, rt: &mut Runtime, frame: &mut Frame, guards: &GuardSet) -> EvalResult {
    let mut ev = Evaluator {
        f,
        rt,
        frame,
        guards,
        vals: TiVec::from(vec![Val::Void; f.num_insts()]),
        mem: HashMap::new(),
    };
    ev.run()
}

struct Evaluator<'a> {
    f: &'a Func,
    rt: &'a mut Runtime,
    frame: &'a mut Frame,
    guards: &'a GuardSet,
    vals: TiVec<InstIdx, Val>,
    /// The contents of each alloca. `None` slots are uninitialised.
    mem: HashMap<InstIdx, Vec<Option<Val>>>,
}

impl Evaluator<'_> {
    fn run(&mut self) -> EvalResult {
        let f = self.f;
        let mut bidx = f.block_idxs().next().unwrap();
        loop {
            for iidx in f.block(bidx).insts() {
                let inst = f.inst(*iidx);
                match inst {
                    Inst::Br(b) => {
                        bidx = *b;
                        break;
                    }
                    Inst::CondBr {
                        cond,
                        trueblk,
                        falseblk,
                    } => {
                        bidx = if self.int(cond) != 0 {
                            *trueblk
                        } else {
                            *falseblk
                        };
                        break;
                    }
                    Inst::Switch {
                        val,
                        default,
                        cases,
                    } => {
                        let v = self.int(val);
                        bidx = cases
                            .iter()
                            .find(|(c, _)| *c == v)
                            .map(|(_, b)| *b)
                            .unwrap_or(*default);
                        break;
                    }
                    Inst::Ret(v) => {
                        return match self.operand(v) {
                            Val::Sentinel => EvalResult::Bail,
                            Val::Obj(o) => EvalResult::Return(o),
                            x => panic!("{}: returned non-object {x:?}", f.name()),
                        };
                    }
                    Inst::Unreachable => {
                        panic!("{}: reached unreachable at {iidx}", f.name())
                    }
                    _ => {
                        let v = self.exec(*iidx, inst);
                        self.vals[*iidx] = v;
                    }
                }
            }
        }
    }

    fn exec(&mut self, iidx: InstIdx, inst: &Inst) -> Val {
        match inst {
            Inst::Arg => Val::Void,
            Inst::Alloca { count, .. } => {
                self.mem.insert(iidx, vec![None; *count as usize]);
                Val::Ptr(Addr {
                    region: Region::Alloca(iidx),
                    off: 0,
                })
            }
            Inst::FrameAddr { field, .. } => Val::Ptr(Addr {
                region: Region::Frame(*field),
                off: 0,
            }),
            Inst::PtrAdd { ptr, off } => {
                let mut a = self.ptr(ptr);
                a.off += self.int(off);
                Val::Ptr(a)
            }
            Inst::PtrDiff { lhs, rhs } => {
                let (l, r) = (self.ptr(lhs), self.ptr(rhs));
                assert_eq!(l.region, r.region, "ptr_diff across regions");
                Val::Int(l.off - r.off)
            }
            Inst::Load { ptr, .. } => {
                let a = self.ptr(ptr);
                match self.read(a) {
                    Some(v) => v,
                    None => panic!(
                        "{}: {iidx} loads uninitialised slot {} of {:?}",
                        self.f.name(),
                        a.off,
                        a.region
                    ),
                }
            }
            Inst::Store { ptr, val } => {
                let (a, v) = (self.ptr(ptr), self.operand(val));
                self.write(a, Some(v));
                Val::Void
            }
            Inst::MemCpy { dst, src, count } => {
                let (d, s) = (self.ptr(dst), self.ptr(src));
                for i in 0..self.int(count) {
                    let v = self.read(Addr {
                        region: s.region,
                        off: s.off + i,
                    });
                    self.write(
                        Addr {
                            region: d.region,
                            off: d.off + i,
                        },
                        v,
                    );
                }
                Val::Void
            }
            Inst::BinOp { op, lhs, rhs } => {
                let (l, r) = (self.int(lhs), self.int(rhs));
                Val::Int(match op {
                    BinOp::Add => l.wrapping_add(r),
                    BinOp::Sub => l.wrapping_sub(r),
                    BinOp::Mul => l.wrapping_mul(r),
                    BinOp::And => l & r,
                    BinOp::Or => l | r,
                })
            }
            Inst::Icmp { pred, lhs, rhs } => {
                let b = match (self.operand(lhs), self.operand(rhs)) {
                    (Val::Int(l), Val::Int(r)) => cmp(*pred, l, r),
                    (Val::Ptr(l), Val::Ptr(r)) if l.region == r.region => {
                        cmp(*pred, l.off, r.off)
                    }
                    (l, r) => match pred {
                        Pred::Eq => l == r,
                        Pred::Ne => l != r,
                        _ => panic!("{}: ordered comparison of {l:?} and {r:?}", self.f.name()),
                    },
                };
                Val::Int(i64::from(b))
            }
            Inst::Select {
                cond,
                trueval,
                falseval,
            } => {
                if self.int(cond) != 0 {
                    self.operand(trueval)
                } else {
                    self.operand(falseval)
                }
            }
            Inst::Call { target, args } => self.call(*target, args),
            Inst::Br(_)
            | Inst::CondBr { .. }
            | Inst::Switch { .. }
            | Inst::Ret(_)
            | Inst::Unreachable => unreachable!(),
        }
    }

    fn operand(&self, o: &Operand) -> Val {
        match o {
            Operand::Local(iidx) => self.vals[*iidx],
            Operand::Const(Const::Int(_, v)) => Val::Int(*v),
            Operand::Const(Const::Null) => Val::Obj(None),
            Operand::Const(Const::Obj(id)) => Val::Obj(Some(*id)),
            Operand::Const(Const::Sentinel) => Val::Sentinel,
        }
    }

    fn int(&self, o: &Operand) -> i64 {
        match self.operand(o) {
            Val::Int(v) => v,
            x => panic!("{}: expected an integer, got {x:?}", self.f.name()),
        }
    }

    fn ptr(&self, o: &Operand) -> Addr {
        match self.operand(o) {
            Val::Ptr(a) => a,
            x => panic!("{}: expected a pointer, got {x:?}", self.f.name()),
        }
    }

    fn read(&self, a: Addr) -> Option<Val> {
        let off = usize::try_from(a.off)
            .unwrap_or_else(|_| panic!("{}: negative offset {}", self.f.name(), a.off));
        match a.region {
            Region::Alloca(iidx) => self.mem[&iidx][off],
            Region::Frame(field) => {
                let fr = &self.frame;
                let scalar = |v: i32| {
                    assert_eq!(off, 0, "offset into scalar frame field {field}");
                    Some(Val::Int(i64::from(v)))
                };
                match field {
                    FrameField::Lasti => scalar(fr.lasti),
                    FrameField::Lineno => scalar(fr.lineno),
                    FrameField::Iblock => scalar(fr.iblock),
                    FrameField::StackTop => scalar(fr.stacktop),
                    FrameField::BailReason => scalar(fr.bail_reason as i32),
                    FrameField::BlockStack => {
                        let b = fr.blockstack[off / 3];
                        let v = [b.kind, b.handler, b.level][off % 3];
                        Some(Val::Int(i64::from(v)))
                    }
                    FrameField::FastLocals => Some(Val::Obj(fr.fastlocals[off])),
                    FrameField::ValueStack => Some(Val::Obj(fr.valuestack[off])),
                    FrameField::Globals => Some(Val::Obj(Some(fr.globals))),
                    FrameField::Builtins => Some(Val::Obj(Some(fr.builtins))),
                    FrameField::Locals => Some(Val::Obj(fr.locals)),
                }
            }
        }
    }

    fn write(&mut self, a: Addr, v: Option<Val>) {
        let off = usize::try_from(a.off)
            .unwrap_or_else(|_| panic!("{}: negative offset {}", self.f.name(), a.off));
        let name = self.f.name();
        match a.region {
            Region::Alloca(iidx) => match self.mem.get_mut(&iidx) {
                Some(m) => m[off] = v,
                None => panic!("{name}: store to unallocated {iidx}"),
            },
            Region::Frame(field) => {
                let fr = &mut self.frame;
                let int = |v: Option<Val>| match v {
                    Some(Val::Int(i)) => i as i32,
                    x => panic!("{name}: storing {x:?} to {field}"),
                };
                let obj = |v: Option<Val>| match v {
                    Some(Val::Obj(o)) => o,
                    x => panic!("{name}: storing {x:?} to {field}"),
                };
                if field.slot_ty() == super::I32 && field != FrameField::BlockStack {
                    assert_eq!(off, 0, "offset into scalar frame field {field}");
                }
                match field {
                    FrameField::Lasti => fr.lasti = int(v),
                    FrameField::Lineno => fr.lineno = int(v),
                    FrameField::Iblock => fr.iblock = int(v),
                    FrameField::StackTop => fr.stacktop = int(v),
                    FrameField::BailReason => {
                        let r = int(v);
                        fr.bail_reason = BailReason::from_repr(r)
                            .unwrap_or_else(|| panic!("{name}: bad bail reason {r}"));
                    }
                    FrameField::BlockStack => {
                        let b = &mut fr.blockstack[off / 3];
                        let v = int(v);
                        match off % 3 {
                            0 => b.kind = v,
                            1 => b.handler = v,
                            _ => b.level = v,
                        }
                    }
                    FrameField::FastLocals => fr.fastlocals[off] = obj(v),
                    FrameField::ValueStack => fr.valuestack[off] = obj(v),
                    FrameField::Globals | FrameField::Builtins | FrameField::Locals => {
                        panic!("{name}: {field} is read-only")
                    }
                }
            }
        }
    }

    /// Read `n` non-NULL objects starting at `base`.
    fn read_objs(&self, base: Addr, n: usize) -> Vec<ObjId> {
        (0..n)
            .map(|i| {
                let a = Addr {
                    region: base.region,
                    off: base.off + i as i64,
                };
                match self.read(a) {
                    Some(Val::Obj(Some(o))) => o,
                    x => panic!("{}: expected an object in {a:?}, got {x:?}", self.f.name()),
                }
            })
            .collect()
    }

    /// Write `vals` to consecutive slots starting at `base`.
    fn write_objs(&mut self, base: Addr, vals: impl IntoIterator<Item = ObjId>) {
        for (i, v) in vals.into_iter().enumerate() {
            let a = Addr {
                region: base.region,
                off: base.off + i as i64,
            };
            self.write(a, Some(Val::Obj(Some(v))));
        }
    }

    fn name(&self, v: Val) -> String {
        self.frame.code.names[int(v) as usize].clone()
    }

    fn call(&mut self, target: RuntimeFn, args: &[Operand]) -> Val {
        let a = args.iter().map(|x| self.operand(x)).collect::<Vec<_>>();
        match target {
            RuntimeFn::IncRef => {
                self.rt.incref(obj(a[0]));
                Val::Void
            }
            RuntimeFn::DecRef => {
                self.rt.decref(obj(a[0]));
                Val::Void
            }
            RuntimeFn::XDecRef => {
                self.rt.xdecref(xobj(a[0]));
                Val::Void
            }
            RuntimeFn::Binary(op) => obj_result(self.rt.binary_op(op, obj(a[0]), obj(a[1]))),
            RuntimeFn::InPlace(op) => obj_result(self.rt.inplace_op(op, obj(a[0]), obj(a[1]))),
            RuntimeFn::Unary(op) => obj_result(self.rt.unary_op(op, obj(a[0]))),
            RuntimeFn::Compare(op) => obj_result(self.rt.compare_op(op, obj(a[0]), obj(a[1]))),
            RuntimeFn::IsTrue => Val::Int(i64::from(self.rt.is_true(obj(a[0])))),
            RuntimeFn::GetItem => obj_result(self.rt.getitem(obj(a[0]), obj(a[1]))),
            RuntimeFn::SetItem => status(self.rt.setitem(obj(a[0]), obj(a[1]), obj(a[2]))),
            RuntimeFn::DelItem => status(self.rt.delitem(obj(a[0]), obj(a[1]))),
            RuntimeFn::ApplySlice => {
                obj_result(self.rt.apply_slice(obj(a[0]), xobj(a[1]), xobj(a[2])))
            }
            RuntimeFn::AssignSlice => status(self.rt.assign_slice(
                obj(a[0]),
                xobj(a[1]),
                xobj(a[2]),
                xobj(a[3]),
            )),
            RuntimeFn::BuildSlice => {
                Val::Obj(Some(self.rt.build_slice(obj(a[0]), obj(a[1]), xobj(a[2]))))
            }
            RuntimeFn::BuildTuple => {
                let items = self.read_objs(ptr(a[0]), int(a[1]) as usize);
                Val::Obj(Some(self.rt.new_tuple(items)))
            }
            RuntimeFn::BuildList => {
                let items = self.read_objs(ptr(a[0]), int(a[1]) as usize);
                Val::Obj(Some(self.rt.new_list(items)))
            }
            RuntimeFn::DictNew => Val::Obj(Some(self.rt.new_dict())),
            RuntimeFn::DictSetItem => status(self.rt.dict_set(obj(a[0]), obj(a[1]), obj(a[2]))),
            RuntimeFn::ListAppend => {
                self.rt.list_append(obj(a[0]), obj(a[1]));
                Val::Int(0)
            }
            RuntimeFn::UnpackSequence => {
                match self.rt.unpack_sequence(obj(a[0]), int(a[2]) as usize) {
                    Ok(items) => {
                        self.write_objs(ptr(a[1]), items.into_iter().rev());
                        Val::Int(0)
                    }
                    Err(_) => Val::Int(-1),
                }
            }
            RuntimeFn::GetIter => obj_result(self.rt.get_iter(obj(a[0]))),
            RuntimeFn::IterNext => Val::Obj(self.rt.iter_next(obj(a[0])).ok().flatten()),
            RuntimeFn::ErrClearStopIteration => {
                Val::Int(if self.rt.err_clear_stop_iteration() { 0 } else { -1 })
            }
            RuntimeFn::CallFunction | RuntimeFn::CallFunctionVarKw => {
                let oparg = int(a[1]);
                let (na, nk) = ((oparg & 0xff) as usize, ((oparg >> 8) & 0xff) as usize);
                let flags = a.get(2).map(|f| int(*f)).unwrap_or(0);
                let nextra = usize::from(flags & 1 != 0) + usize::from(flags & 2 != 0);
                let slots = self.read_objs(ptr(a[0]), 1 + na + 2 * nk + nextra);
                let kwargs = slots[1 + na..1 + na + 2 * nk]
                    .chunks(2)
                    .map(|kv| (kv[0], kv[1]))
                    .collect::<Vec<_>>();
                let mut extra = slots[1 + na + 2 * nk..].iter().copied();
                let star = if flags & 1 != 0 { extra.next() } else { None };
                let starstar = if flags & 2 != 0 { extra.next() } else { None };
                obj_result(if flags == 0 {
                    self.rt.call(slots[0], &slots[1..=na], &kwargs)
                } else {
                    self.rt
                        .call_extended(slots[0], &slots[1..=na], &kwargs, star, starstar)
                })
            }
            RuntimeFn::CallBuiltin(b) => {
                let args = self.read_objs(ptr(a[0]), int(a[1]) as usize);
                obj_result(self.rt.call_builtin(b, &args))
            }
            RuntimeFn::LoadGlobal => {
                let name = self.name(a[2]);
                obj_result(self.rt.load_global(obj(a[0]), obj(a[1]), &name))
            }
            RuntimeFn::StoreGlobal => {
                let name = self.name(a[1]);
                self.rt.dict_set_str(obj(a[0]), &name, obj(a[2]));
                Val::Int(0)
            }
            RuntimeFn::DeleteGlobal => {
                let name = self.name(a[1]);
                status(self.rt.delete_name(Some(obj(a[0])), &name, true))
            }
            RuntimeFn::LoadName => {
                let name = self.name(a[3]);
                obj_result(self.rt.load_name(xobj(a[0]), obj(a[1]), obj(a[2]), &name))
            }
            RuntimeFn::StoreName => {
                let name = self.name(a[1]);
                status(self.rt.store_name(xobj(a[0]), &name, obj(a[2])))
            }
            RuntimeFn::DeleteName => {
                let name = self.name(a[1]);
                status(self.rt.delete_name(xobj(a[0]), &name, false))
            }
            RuntimeFn::GetAttr => {
                let name = self.name(a[1]);
                obj_result(self.rt.getattr_str(obj(a[0]), &name))
            }
            RuntimeFn::SetAttr => {
                let name = self.name(a[1]);
                status(self.rt.setattr_str(obj(a[0]), &name, Some(obj(a[2]))))
            }
            RuntimeFn::DelAttr => {
                let name = self.name(a[1]);
                status(self.rt.setattr_str(obj(a[0]), &name, None))
            }
            RuntimeFn::TypeOf => Val::Obj(Some(self.rt.type_of(obj(a[0])))),
            RuntimeFn::GetAttrCached => {
                let name = self.name(a[1]);
                obj_result(self.rt.getattr_with_descr(obj(a[0]), &name, xobj(a[2])))
            }
            RuntimeFn::SlotGet => {
                let name = self.name(a[2]);
                obj_result(self.rt.slot_get(obj(a[0]), int(a[1]) as usize, &name))
            }
            RuntimeFn::SlotSet => {
                let name = self.name(a[2]);
                status(
                    self.rt
                        .slot_set(obj(a[0]), int(a[1]) as usize, Some(obj(a[3])), &name),
                )
            }
            RuntimeFn::SetAttrDict => {
                let name = self.name(a[1]);
                status(
                    self.rt
                        .setattr_instance_dict(obj(a[0]), &name, Some(obj(a[2]))),
                )
            }
            RuntimeFn::GuardsValid => Val::Int(i64::from(self.guards.is_valid())),
            RuntimeFn::DictVersion => Val::Int(self.rt.dict_version(obj(a[0])) as i64),
            RuntimeFn::Deref => {
                let code = Rc::clone(&self.frame.code);
                let slot = int(a[1]) as usize;
                let is_free = slot >= code.varnames.len() + code.cellvars.len();
                obj_result(self.rt.deref(obj(a[0]), code.fast_name(slot), is_free))
            }
            RuntimeFn::CellSet => {
                self.rt.cell_set(obj(a[0]), xobj(a[1]));
                Val::Void
            }
            RuntimeFn::MakeFunction => {
                let defaults = self.read_objs(ptr(a[2]), int(a[3]) as usize);
                for d in &defaults {
                    self.rt.incref(*d);
                }
                let closure = xobj(a[4]).map(|c| self.rt.new_ref(c));
                Val::Obj(Some(self.rt.make_function(
                    obj(a[0]),
                    obj(a[1]),
                    defaults,
                    closure,
                )))
            }
            RuntimeFn::DoRaise => Val::Int(i64::from(self.rt.do_raise(
                xobj(a[0]),
                xobj(a[1]),
                xobj(a[2]),
            ))),
            RuntimeFn::ErrRestore => {
                self.rt.err_restore(obj(a[0]), obj(a[1]), obj(a[2]));
                Val::Void
            }
            RuntimeFn::TracebackHere => {
                self.rt.traceback_here(int(a[0]) as i32);
                Val::Void
            }
            RuntimeFn::FetchForHandler => {
                let exc = self.rt.fetch_for_handler(int(a[1]) != 0);
                self.write_objs(ptr(a[0]), exc);
                Val::Void
            }
            RuntimeFn::FinallyDisposition => {
                Val::Int(self.rt.finally_disposition(obj(a[0])) as i64)
            }
            RuntimeFn::RaiseBadFinally => {
                self.rt.raise_bad_finally();
                Val::Void
            }
            RuntimeFn::CallExit => {
                obj_result(self.rt.call(obj(a[0]), &[obj(a[1]), obj(a[2]), obj(a[3])], &[]))
            }
            RuntimeFn::RaiseUnboundLocal => {
                let code = Rc::clone(&self.frame.code);
                self.rt.raise_unbound_local(code.fast_name(int(a[0]) as usize));
                Val::Void
            }
            RuntimeFn::IntFromLong => Val::Obj(Some(self.rt.new_int(int(a[0])))),
            RuntimeFn::IntAsLong => {
                let o = obj(a[0]);
                match self.rt.int_value(o) {
                    Some(v) => Val::Int(v),
                    None => panic!("{}: {o} is not an int", self.f.name()),
                }
            }
            RuntimeFn::DecrementTicker => Val::Int(i64::from(self.rt.decrement_ticker())),
            RuntimeFn::HandlePendingCalls => status(self.rt.handle_pending_calls()),
            RuntimeFn::TracingActive => Val::Int(i64::from(self.rt.tracing())),
            RuntimeFn::ProfilingActive => Val::Int(i64::from(self.rt.profiling())),
            RuntimeFn::ImportName => {
                let name = self.name(a[0]);
                obj_result(self.rt.import_name(&name))
            }
        }
    }
}

fn int(v: Val) -> i64 {
    match v {
        Val::Int(v) => v,
        x => panic!("expected an integer, got {x:?}"),
    }
}

fn ptr(v: Val) -> Addr {
    match v {
        Val::Ptr(a) => a,
        x => panic!("expected a pointer, got {x:?}"),
    }
}

/// A possibly NULL object.
fn xobj(v: Val) -> Option<ObjId> {
    match v {
        Val::Obj(o) => o,
        x => panic!("expected an object, got {x:?}"),
    }
}

fn obj(v: Val) -> ObjId {
    match xobj(v) {
        Some(o) => o,
        None => panic!("unexpected NULL"),
    }
}

fn cmp(pred: Pred, l: i64, r: i64) -> bool {
    match pred {
        Pred::Eq => l == r,
        Pred::Ne => l != r,
        Pred::Slt => l < r,
        Pred::Sle => l <= r,
        Pred::Sgt => l > r,
        Pred::Sge => l >= r,
    }
}

fn obj_result(r: RtResult<ObjId>) -> Val {
    Val::Obj(r.ok())
}

fn status(r: RtResult<()>) -> Val {
    Val::Int(if r.is_ok() { 0 } else { -1 })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        code::{encode, CodeDescriptor, Instr, Opcode},
        ir::{FuncBuilder, Ty},
        runtime::BinaryOp,
    };

    fn frame(rt: &mut Runtime) -> Frame {
        let raw = encode(&[Instr {
            op: Opcode::ReturnValue,
            arg: 0,
        }]);
        let mut code = CodeDescriptor::new("f", raw).unwrap();
        code.varnames = vec!["x".to_owned()];
        code.stacksize = 4;
        let g = rt.new_dict();
        let f = Frame::new(rt, Rc::new(code), g, None);
        rt.decref(g);
        f
    }

    #[test]
    fn add_locals() {
        let mut rt = Runtime::new();
        let mut fr = frame(&mut rt);
        let x = rt.new_int(20);
        fr.fastlocals[0] = Some(x);
        let mut b = FuncBuilder::new("f");
        let fl = b.frame_addr(FrameField::FastLocals).unwrap();
        let v = b.load(fl, Ty::Obj).unwrap();
        let r = b
            .call(RuntimeFn::Binary(BinaryOp::Add), &[v, v])
            .unwrap();
        b.push(Inst::Ret(r)).unwrap();
        let f = b.finalize();
        let gs = GuardSet::new();
        let EvalResult::Return(Some(r)) = eval(&f, &mut rt, &mut fr, &gs) else {
            panic!()
        };
        assert_eq!(rt.int_value(r), Some(40));
        rt.decref(r);
        fr.clear(&mut rt);
    }

    #[test]
    fn sentinel_bails() {
        let mut rt = Runtime::new();
        let mut fr = frame(&mut rt);
        let mut b = FuncBuilder::new("f");
        let br = b.frame_addr(FrameField::BailReason).unwrap();
        b.store(br, Operand::i32(BailReason::GuardFail as i32))
            .unwrap();
        b.push(Inst::Ret(Operand::Const(Const::Sentinel))).unwrap();
        let f = b.finalize();
        assert_eq!(
            eval(&f, &mut rt, &mut fr, &GuardSet::new()),
            EvalResult::Bail
        );
        assert_eq!(fr.bail_reason, BailReason::GuardFail);
        fr.clear(&mut rt);
    }

    #[test]
    #[should_panic(expected = "uninitialised")]
    fn uninitialised_load() {
        let mut rt = Runtime::new();
        let mut fr = frame(&mut rt);
        let mut b = FuncBuilder::new("f");
        let a = b.alloca(Ty::Obj, 2).unwrap();
        let p = b.ptr_add(a, Operand::i64(1)).unwrap();
        b.store(a, Operand::null()).unwrap();
        let v = b.load(p, Ty::Obj).unwrap();
        b.push(Inst::Ret(v)).unwrap();
        let f = b.finalize();
        eval(&f, &mut rt, &mut fr, &GuardSet::new());
    }
}
