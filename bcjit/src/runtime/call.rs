//! Calls, frames, generators, names, cells and raising.

use super::{
    Builtin, ExcInfo, FrameResult, Function, ModuleObj, Object, ObjId, Raised, RtResult,
    Runtime, TypeKind,
};
use crate::{
    code::CodeDescriptor,
    frame::{Frame, UnwindReason},
};
use std::rc::Rc;

/// What `END_FINALLY` found on top of the stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum FinallyDisposition {
    /// `None`: the `finally` block was entered normally.
    Normal = 0,
    /// An integer: a saved unwind reason. Any other integer is [FinallyDisposition::Bad].
    Reason = 1,
    /// An exception class: a saved exception to re-raise.
    Exception = 2,
    Bad = 3,
}

impl Runtime {
    // Functions and modules.

    /// Wrap `code` in a code object.
    pub fn new_code(&mut self, code: Rc<CodeDescriptor>) -> ObjId {
        self.alloc(Object::Code(code))
    }

    /// Create a function from the code object `code`. `globals` is borrowed; `defaults` and
    /// `closure` are stolen.
    pub fn make_function(
        &mut self,
        code: ObjId,
        globals: ObjId,
        defaults: Vec<ObjId>,
        closure: Option<ObjId>,
    ) -> ObjId {
        let f = Function {
            code: self.new_ref(code),
            globals: self.new_ref(globals),
            defaults,
            closure,
        };
        self.alloc(Object::Function(f))
    }

    /// Create a function directly from a code descriptor.
    pub fn new_function(&mut self, code: Rc<CodeDescriptor>, globals: ObjId) -> ObjId {
        let c = self.new_code(code);
        let f = self.make_function(c, globals, Vec::new(), None);
        self.decref(c);
        f
    }

    /// Register a module named `name` whose attributes live in `dict` (borrowed), returning a
    /// new reference to it.
    pub fn register_module(&mut self, name: &str, dict: ObjId) -> ObjId {
        let m = ModuleObj {
            name: name.to_owned(),
            dict: self.new_ref(dict),
        };
        let m = self.alloc(Object::Module(m));
        let modules = self.modules;
        self.dict_set_str(modules, name, m);
        m
    }

    pub fn import_name(&mut self, name: &str) -> RtResult<ObjId> {
        match self.dict_get_str(self.modules, name) {
            Some(m) => Ok(self.new_ref(m)),
            None => {
                let ie = self.types.import_error;
                Err(self.raise_new(ie, &format!("No module named {name}")))
            }
        }
    }

    /// Run the module-level `code` with `globals` as both its globals and its locals.
    pub fn run_code(&mut self, code: Rc<CodeDescriptor>, globals: ObjId) -> RtResult<ObjId> {
        let locals = (!code.flags.optimized).then_some(globals);
        let mut frame = Frame::new(self, code, globals, locals);
        let r = self.eval_frame(&mut frame);
        self.finish_frame(frame, r)
    }

    fn finish_frame(&mut self, frame: Frame, r: FrameResult) -> RtResult<ObjId> {
        frame.clear(self);
        match r {
            FrameResult::Return(v) => Ok(v),
            FrameResult::Raise => Err(Raised),
            FrameResult::Yield(_) => unreachable!("a non-generator frame yielded"),
        }
    }

    // Names.

    /// Look `name` up in `globals` and then `builtins`, returning a borrowed reference and
    /// whether it was found in `builtins`.
    pub fn global_lookup(
        &self,
        globals: ObjId,
        builtins: ObjId,
        name: &str,
    ) -> Option<(ObjId, bool)> {
        self.dict_get_str(globals, name)
            .map(|v| (v, false))
            .or_else(|| self.dict_get_str(builtins, name).map(|v| (v, true)))
    }

    pub fn load_global(&mut self, globals: ObjId, builtins: ObjId, name: &str) -> RtResult<ObjId> {
        match self.global_lookup(globals, builtins, name) {
            Some((v, _)) => Ok(self.new_ref(v)),
            None => {
                let ne = self.types.name_error;
                Err(self.raise_new(ne, &format!("global name '{name}' is not defined")))
            }
        }
    }

    pub fn load_name(
        &mut self,
        locals: Option<ObjId>,
        globals: ObjId,
        builtins: ObjId,
        name: &str,
    ) -> RtResult<ObjId> {
        if let Some(v) = locals.and_then(|l| self.dict_get_str(l, name)) {
            return Ok(self.new_ref(v));
        }
        match self.global_lookup(globals, builtins, name) {
            Some((v, _)) => Ok(self.new_ref(v)),
            None => {
                let ne = self.types.name_error;
                Err(self.raise_new(ne, &format!("name '{name}' is not defined")))
            }
        }
    }

    /// Store `v` (borrowed) in the namespace `dict`.
    pub fn store_name(&mut self, dict: Option<ObjId>, name: &str, v: ObjId) -> RtResult<()> {
        match dict {
            Some(d) => {
                self.dict_set_str(d, name, v);
                Ok(())
            }
            None => {
                let se = self.types.system_error;
                Err(self.raise_new(se, &format!("no locals found when storing '{name}'")))
            }
        }
    }

    /// Delete `name` from the namespace `dict`. `global` selects the error message.
    pub fn delete_name(&mut self, dict: Option<ObjId>, name: &str, global: bool) -> RtResult<()> {
        if let Some(d) = dict {
            if self.dict_del_str(d, name) {
                return Ok(());
            }
        }
        let ne = self.types.name_error;
        let msg = if global {
            format!("global name '{name}' is not defined")
        } else {
            format!("name '{name}' is not defined")
        };
        Err(self.raise_new(ne, &msg))
    }

    // Cells.

    /// A borrowed reference to `cell`'s contents.
    pub fn cell_contents(&self, cell: ObjId) -> Option<ObjId> {
        match self.get(cell) {
            Object::Cell(c) => *c,
            _ => panic!("{cell} is not a cell"),
        }
    }

    /// Set (`v` borrowed) or clear `cell`'s contents.
    pub fn cell_set(&mut self, cell: ObjId, v: Option<ObjId>) {
        if let Some(v) = v {
            self.incref(v);
        }
        let old = match self.get_mut(cell) {
            Object::Cell(c) => std::mem::replace(c, v),
            _ => panic!("{cell} is not a cell"),
        };
        self.xdecref(old);
    }

    pub fn raise_unbound_local(&mut self, name: &str) -> Raised {
        let ule = self.types.unbound_local_error;
        self.raise_new(
            ule,
            &format!("local variable '{name}' referenced before assignment"),
        )
    }

    pub fn raise_unbound_free(&mut self, name: &str) -> Raised {
        let ne = self.types.name_error;
        self.raise_new(
            ne,
            &format!("free variable '{name}' referenced before assignment in enclosing scope"),
        )
    }

    /// Read a cell or free variable, raising the appropriate error if it is empty. `is_free`
    /// says whether the cell came from an enclosing scope.
    pub fn deref(&mut self, cell: ObjId, name: &str, is_free: bool) -> RtResult<ObjId> {
        match self.cell_contents(cell) {
            Some(v) => Ok(self.new_ref(v)),
            None if is_free => Err(self.raise_unbound_free(name)),
            None => Err(self.raise_unbound_local(name)),
        }
    }

    // Raising.

    /// Raise per `RAISE_VARARGS`. All arguments are borrowed. Returns `true` for a fresh raise
    /// and `false` for a re-raise (`raise` with no arguments), which must not extend the
    /// traceback. Either way the current exception is set.
    pub fn do_raise(
        &mut self,
        ty: Option<ObjId>,
        value: Option<ObjId>,
        tb: Option<ObjId>,
    ) -> bool {
        let Some(ty) = ty else {
            return match self.exc_info {
                Some(info) => {
                    self.incref(info.ty);
                    self.incref(info.value);
                    if let Some(tb) = info.tb {
                        self.incref(tb);
                    }
                    self.set_exc(info);
                    false
                }
                None => {
                    let te = self.types.type_error;
                    self.raise_new(te, "exceptions must derive from BaseException, not NoneType");
                    true
                }
            };
        };
        let tb = tb.filter(|tb| *tb != self.none);
        if let Some(tb) = tb {
            if !matches!(self.get(tb), Object::Traceback(_)) {
                let te = self.types.type_error;
                self.raise_new(te, "raise: arg 3 must be a traceback or None");
                return true;
            }
        }
        let value = value.filter(|v| *v != self.none);
        let base = self.types.base_exception;
        let (ty, value) = if matches!(self.get(ty), Object::Type(_)) && self.is_subtype(ty, base) {
            let value = match value {
                Some(v) if self.is_instance(v, ty) => Ok(self.new_ref(v)),
                Some(v) => {
                    let args = match self.get(v) {
                        Object::Tuple(xs) => xs.clone(),
                        _ => vec![v],
                    };
                    self.call(ty, &args, &[])
                }
                None => self.call(ty, &[], &[]),
            };
            match value {
                Ok(v) => (self.new_ref(ty), v),
                Err(_) => return true,
            }
        } else if self.is_instance(ty, base) {
            if value.is_some() {
                let te = self.types.type_error;
                self.raise_new(te, "instance exception may not have a separate value");
                return true;
            }
            let t = self.type_of(ty);
            (self.new_ref(t), self.new_ref(ty))
        } else {
            let te = self.types.type_error;
            let msg = format!(
                "exceptions must derive from BaseException, not {}",
                self.type_name(self.type_of(ty))
            );
            self.raise_new(te, &msg);
            return true;
        };
        let tb = tb.map(|tb| self.new_ref(tb));
        self.set_exc(ExcInfo { ty, value, tb });
        true
    }

    /// Make `(ty, value, tb)` the current exception again, stealing all three. `tb` may be
    /// `None`.
    pub fn err_restore(&mut self, ty: ObjId, value: ObjId, tb: ObjId) {
        let tb = if tb == self.none {
            self.decref(tb);
            None
        } else {
            Some(tb)
        };
        self.set_exc(ExcInfo { ty, value, tb });
    }

    /// Take the current exception for delivery to a handler, returning new references to its
    /// traceback (or `None`), value and type, in that order. If `handling` is set the
    /// exception also becomes the one being handled, for a bare `raise`.
    pub fn fetch_for_handler(&mut self, handling: bool) -> [ObjId; 3] {
        let info = match self.curexc.take() {
            Some(info) => info,
            None => {
                // A handler was entered without a pending exception: deliver a SystemError.
                let se = self.types.system_error;
                self.raise_new(se, "error return without exception set");
                self.curexc.take().unwrap_or_else(|| unreachable!())
            }
        };
        let tb = match info.tb {
            Some(tb) => tb,
            None => self.new_ref(self.none),
        };
        if handling {
            let saved = ExcInfo {
                ty: self.new_ref(info.ty),
                value: self.new_ref(info.value),
                tb: info.tb.map(|tb| self.new_ref(tb)),
            };
            self.set_exc_info(saved);
        }
        [tb, info.value, info.ty]
    }

    /// Classify the value `END_FINALLY` popped.
    pub fn finally_disposition(&self, v: ObjId) -> FinallyDisposition {
        match self.get(v) {
            Object::None => FinallyDisposition::Normal,
            Object::Int(i) if UnwindReason::saved_by_finally(*i).is_some() => {
                FinallyDisposition::Reason
            }
            Object::Type(_) if self.is_subtype(v, self.types.base_exception) => {
                FinallyDisposition::Exception
            }
            _ => FinallyDisposition::Bad,
        }
    }

    pub fn raise_bad_finally(&mut self) -> Raised {
        let se = self.types.system_error;
        self.raise_new(se, "'finally' pops bad exception")
    }

    // Calls.

    /// Call `func` with positional `args` and keyword `kwargs` (all borrowed).
    pub fn call(
        &mut self,
        func: ObjId,
        args: &[ObjId],
        kwargs: &[(ObjId, ObjId)],
    ) -> RtResult<ObjId> {
        match self.get(func) {
            Object::Function(_) => self.call_function_obj(func, args, kwargs),
            Object::Builtin(b) => {
                let b = *b;
                if !kwargs.is_empty() {
                    let te = self.types.type_error;
                    let msg = format!("{}() takes no keyword arguments", b.name());
                    return Err(self.raise_new(te, &msg));
                }
                self.call_builtin(b, args)
            }
            Object::Method(m) => {
                let (f, s) = (m.func, m.self_);
                let mut all = Vec::with_capacity(args.len() + 1);
                all.push(s);
                all.extend_from_slice(args);
                self.call(f, &all, kwargs)
            }
            Object::Type(_) => self.instantiate(func, args, kwargs),
            _ => {
                let te = self.types.type_error;
                let msg = format!("'{}' object is not callable", self.type_name_of_obj(func));
                Err(self.raise_new(te, &msg))
            }
        }
    }

    fn type_name_of_obj(&self, o: ObjId) -> String {
        self.type_name(self.type_of(o))
    }

    /// Call `func` with `args` extended by the sequence `star` and `kwargs` extended by the
    /// dictionary `starstar`, as `CALL_FUNCTION_VAR_KW` does.
    pub fn call_extended(
        &mut self,
        func: ObjId,
        args: &[ObjId],
        kwargs: &[(ObjId, ObjId)],
        star: Option<ObjId>,
        starstar: Option<ObjId>,
    ) -> RtResult<ObjId> {
        let mut args = args.to_vec();
        if let Some(s) = star {
            match self.get(s) {
                Object::Tuple(xs) | Object::List(xs) => args.extend_from_slice(xs),
                _ => {
                    let te = self.types.type_error;
                    let msg = format!(
                        "argument after * must be a sequence, not {}",
                        self.type_name_of_obj(s)
                    );
                    return Err(self.raise_new(te, &msg));
                }
            }
        }
        let mut kwargs = kwargs.to_vec();
        if let Some(d) = starstar {
            match self.get(d) {
                Object::Dict(d) => kwargs.extend(d.entries.values().copied()),
                _ => {
                    let te = self.types.type_error;
                    let msg = format!(
                        "argument after ** must be a mapping, not {}",
                        self.type_name_of_obj(d)
                    );
                    return Err(self.raise_new(te, &msg));
                }
            }
        }
        self.call(func, &args, &kwargs)
    }

    fn call_function_obj(
        &mut self,
        func: ObjId,
        args: &[ObjId],
        kwargs: &[(ObjId, ObjId)],
    ) -> RtResult<ObjId> {
        let (code, globals, defaults, closure) = match self.get(func) {
            Object::Function(f) => (f.code, f.globals, f.defaults.clone(), f.closure),
            _ => unreachable!(),
        };
        let code = match self.get(code) {
            Object::Code(c) => Rc::clone(c),
            _ => panic!("function {func} has no code"),
        };
        let locals = if code.flags.optimized {
            None
        } else {
            Some(self.new_dict())
        };
        let mut frame = Frame::new(self, Rc::clone(&code), globals, locals);
        if let Some(l) = locals {
            self.decref(l);
        }
        if let Err(e) = self.bind_arguments(&mut frame, &code, args, kwargs, &defaults) {
            frame.clear(self);
            return Err(e);
        }
        let nv = code.varnames.len();
        for (i, name) in code.cellvars.iter().enumerate() {
            // A cell for an argument starts out holding the argument.
            let init = code
                .varnames
                .iter()
                .position(|v| v == name)
                .and_then(|j| frame.fastlocals[j]);
            frame.fastlocals[nv + i] = Some(self.new_cell(init));
        }
        if let Some(closure) = closure {
            let cells = match self.get(closure) {
                Object::Tuple(xs) => xs.clone(),
                _ => panic!("closure of {func} is not a tuple"),
            };
            let base = nv + code.cellvars.len();
            for (i, c) in cells.into_iter().enumerate().take(code.freevars.len()) {
                frame.fastlocals[base + i] = Some(self.new_ref(c));
            }
        }
        if code.flags.generator {
            let g = super::Generator {
                frame: Some(Box::new(frame)),
                running: false,
            };
            return Ok(self.alloc(Object::Generator(g)));
        }
        let r = self.eval_frame(&mut frame);
        self.finish_frame(frame, r)
    }

    fn bind_arguments(
        &mut self,
        frame: &mut Frame,
        code: &CodeDescriptor,
        args: &[ObjId],
        kwargs: &[(ObjId, ObjId)],
        defaults: &[ObjId],
    ) -> RtResult<()> {
        let argcount = code.argcount;
        let te = self.types.type_error;
        let plural = |n: usize| if n == 1 { "" } else { "s" };
        if args.len() > argcount {
            let msg = format!(
                "{}() takes at most {argcount} argument{} ({} given)",
                code.name,
                plural(argcount),
                args.len() + kwargs.len()
            );
            return Err(self.raise_new(te, &msg));
        }
        for (i, a) in args.iter().enumerate() {
            frame.fastlocals[i] = Some(self.new_ref(*a));
        }
        for (k, v) in kwargs {
            let k = self.expect_str(*k, "keywords")?;
            match code.varnames[..argcount].iter().position(|n| *n == k) {
                Some(i) if frame.fastlocals[i].is_some() => {
                    let msg = format!(
                        "{}() got multiple values for keyword argument '{k}'",
                        code.name
                    );
                    return Err(self.raise_new(te, &msg));
                }
                Some(i) => frame.fastlocals[i] = Some(self.new_ref(*v)),
                None => {
                    let msg = format!("{}() got an unexpected keyword argument '{k}'", code.name);
                    return Err(self.raise_new(te, &msg));
                }
            }
        }
        let first_default = argcount.saturating_sub(defaults.len());
        for i in 0..argcount {
            if frame.fastlocals[i].is_some() {
                continue;
            }
            if i >= first_default {
                frame.fastlocals[i] = Some(self.new_ref(defaults[i - first_default]));
            } else {
                let qualifier = if defaults.is_empty() { "exactly" } else { "at least" };
                let n = first_default;
                let msg = format!(
                    "{}() takes {qualifier} {n} argument{} ({} given)",
                    code.name,
                    plural(n),
                    args.len() + kwargs.len()
                );
                return Err(self.raise_new(te, &msg));
            }
        }
        Ok(())
    }

    /// Resume generator `gen`, sending it `value` (borrowed). Returns `Ok(None)` once the
    /// generator has finished.
    pub fn gen_send(&mut self, gen: ObjId, value: ObjId) -> RtResult<Option<ObjId>> {
        let frame = match self.get_mut(gen) {
            Object::Generator(g) if g.running => None,
            Object::Generator(g) => match g.frame.take() {
                Some(f) => Some(f),
                None => return Ok(None),
            },
            _ => panic!("{gen} is not a generator"),
        };
        let Some(mut frame) = frame else {
            let ve = self.types.value_error;
            return Err(self.raise_new(ve, "generator already executing"));
        };
        if frame.lasti == -1 {
            if value != self.none {
                if let Object::Generator(g) = self.get_mut(gen) {
                    g.frame = Some(frame);
                }
                let te = self.types.type_error;
                return Err(
                    self.raise_new(te, "can't send non-None value to a just-started generator")
                );
            }
        } else {
            frame.push(self.new_ref(value));
        }
        self.set_running(gen, true);
        let r = self.eval_frame(&mut frame);
        self.set_running(gen, false);
        match r {
            FrameResult::Yield(v) => {
                if let Object::Generator(g) = self.get_mut(gen) {
                    g.frame = Some(frame);
                }
                Ok(Some(v))
            }
            FrameResult::Return(v) => {
                self.decref(v);
                (*frame).clear(self);
                Ok(None)
            }
            FrameResult::Raise => {
                (*frame).clear(self);
                Err(Raised)
            }
        }
    }

    fn set_running(&mut self, gen: ObjId, running: bool) {
        if let Object::Generator(g) = self.get_mut(gen) {
            g.running = running;
        }
    }

    fn instantiate(
        &mut self,
        ty: ObjId,
        args: &[ObjId],
        kwargs: &[(ObjId, ObjId)],
    ) -> RtResult<ObjId> {
        let kind = match self.get(ty) {
            Object::Type(t) => t.kind,
            _ => unreachable!(),
        };
        let name = self.type_name(ty);
        if kind == TypeKind::Builtin {
            if !kwargs.is_empty() {
                let te = self.types.type_error;
                let msg = format!("{name}() takes no keyword arguments");
                return Err(self.raise_new(te, &msg));
            }
            return self.instantiate_builtin(ty, &name, args);
        }
        let inst = if self.is_subtype(ty, self.types.base_exception) {
            let items = args.iter().map(|a| self.new_ref(*a)).collect::<Vec<_>>();
            let args = self.new_tuple(items);
            self.new_exception(ty, args)
        } else {
            self.new_instance(ty)
        };
        match self.type_lookup(ty, "__init__") {
            Some(init) => {
                let mut all = Vec::with_capacity(args.len() + 1);
                all.push(inst);
                all.extend_from_slice(args);
                match self.call(init, &all, kwargs) {
                    Ok(r) if r == self.none => {
                        self.decref(r);
                        Ok(inst)
                    }
                    Ok(r) => {
                        self.decref(r);
                        self.decref(inst);
                        let te = self.types.type_error;
                        Err(self.raise_new(te, "__init__() should return None"))
                    }
                    Err(e) => {
                        self.decref(inst);
                        Err(e)
                    }
                }
            }
            None if (!args.is_empty() || !kwargs.is_empty())
                && !self.is_subtype(ty, self.types.base_exception) =>
            {
                self.decref(inst);
                let te = self.types.type_error;
                Err(self.raise_new(te, &format!("{name}() takes no arguments")))
            }
            None => Ok(inst),
        }
    }

    fn instantiate_builtin(&mut self, ty: ObjId, name: &str, args: &[ObjId]) -> RtResult<ObjId> {
        if ty == self.types.object {
            self.check_arity(name, args, 0, 0)?;
            Ok(self.new_instance(ty))
        } else if ty == self.types.type_ {
            self.check_arity(name, args, 1, 1)?;
            Ok(self.new_ref(self.type_of(args[0])))
        } else if ty == self.types.property {
            self.check_arity(name, args, 1, 1)?;
            Ok(self.new_property(args[0]))
        } else if ty == self.types.dict {
            self.check_arity(name, args, 0, 0)?;
            Ok(self.new_dict())
        } else if ty == self.types.list || ty == self.types.tuple {
            self.check_arity(name, args, 0, 1)?;
            let items = match args.first() {
                Some(a) => self.collect_iter(*a)?,
                None => Vec::new(),
            };
            if ty == self.types.list {
                Ok(self.new_list(items))
            } else {
                Ok(self.new_tuple(items))
            }
        } else if ty == self.types.str_ {
            self.check_arity(name, args, 0, 1)?;
            let s = args.first().map(|a| self.str_of(*a)).unwrap_or_default();
            Ok(self.new_str(&s))
        } else if ty == self.types.bool_ {
            self.check_arity(name, args, 0, 1)?;
            let b = args.first().is_some_and(|a| self.is_true(*a));
            Ok(self.new_ref(self.bool_obj(b)))
        } else if ty == self.types.int || ty == self.types.float {
            let is_int = ty == self.types.int;
            self.check_arity(name, args, 0, 1)?;
            let Some(a) = args.first().copied() else {
                return Ok(if is_int {
                    self.new_int(0)
                } else {
                    self.new_float(0.0)
                });
            };
            let parsed = match self.get(a) {
                Object::Int(i) => Some((*i, *i as f64)),
                Object::Bool(b) => Some((i64::from(*b), f64::from(u8::from(*b)))),
                Object::Float(f) => Some((*f as i64, *f)),
                Object::Str(s) if is_int => s.trim().parse::<i64>().ok().map(|i| (i, i as f64)),
                Object::Str(s) => s.trim().parse::<f64>().ok().map(|f| (f as i64, f)),
                _ => None,
            };
            match parsed {
                Some((i, _)) if is_int => Ok(self.new_int(i)),
                Some((_, f)) => Ok(self.new_float(f)),
                None => {
                    let ve = self.types.value_error;
                    let msg = format!("invalid literal for {name}(): {}", self.repr(a));
                    Err(self.raise_new(ve, &msg))
                }
            }
        } else {
            let te = self.types.type_error;
            Err(self.raise_new(te, &format!("cannot create '{name}' instances")))
        }
    }

    fn check_arity(&mut self, name: &str, args: &[ObjId], min: usize, max: usize) -> RtResult<()> {
        if (min..=max).contains(&args.len()) {
            return Ok(());
        }
        let (qualifier, n) = if min == max {
            ("exactly", min)
        } else if args.len() < min {
            ("at least", min)
        } else {
            ("at most", max)
        };
        let te = self.types.type_error;
        let msg = format!(
            "{name}() takes {qualifier} {n} argument{} ({} given)",
            if n == 1 { "" } else { "s" },
            args.len()
        );
        Err(self.raise_new(te, &msg))
    }

    /// Iterate over `o`, returning new references to its items.
    pub fn collect_iter(&mut self, o: ObjId) -> RtResult<Vec<ObjId>> {
        let it = self.get_iter(o)?;
        let mut items = Vec::new();
        loop {
            match self.iter_next(it) {
                Ok(Some(x)) => items.push(x),
                Ok(None) => break,
                Err(e) => {
                    for x in items {
                        self.decref(x);
                    }
                    self.decref(it);
                    return Err(e);
                }
            }
        }
        self.decref(it);
        Ok(items)
    }

    fn expect_self(&mut self, b: Builtin, obj: ObjId, ty: ObjId) -> RtResult<()> {
        if self.is_instance(obj, ty) {
            return Ok(());
        }
        let te = self.types.type_error;
        let msg = format!(
            "descriptor '{}' requires a '{}' object but received a '{}'",
            b.name(),
            self.type_name(ty),
            self.type_name_of_obj(obj)
        );
        Err(self.raise_new(te, &msg))
    }

    fn is_attribute_error(&self) -> bool {
        self.curexc
            .is_some_and(|info| self.is_subtype(info.ty, self.types.attribute_error))
    }

    pub(crate) fn call_builtin(&mut self, b: Builtin, args: &[ObjId]) -> RtResult<ObjId> {
        let name = b.name();
        match b {
            Builtin::Abs => {
                self.check_arity(name, args, 1, 1)?;
                match self.get(args[0]) {
                    Object::Int(i) => match i.checked_abs() {
                        Some(i) => Ok(self.new_int(i)),
                        None => {
                            let rte = self.types.runtime_error;
                            Err(self.raise_new(rte, "integer overflow"))
                        }
                    },
                    Object::Bool(x) => Ok(self.new_int(i64::from(*x))),
                    Object::Float(f) => Ok(self.new_float(f.abs())),
                    _ => {
                        let te = self.types.type_error;
                        let msg = format!(
                            "bad operand type for abs(): '{}'",
                            self.type_name_of_obj(args[0])
                        );
                        Err(self.raise_new(te, &msg))
                    }
                }
            }
            Builtin::Getattr => {
                self.check_arity(name, args, 2, 3)?;
                match self.getattr(args[0], args[1]) {
                    Err(_) if args.len() == 3 && self.is_attribute_error() => {
                        self.err_clear();
                        Ok(self.new_ref(args[2]))
                    }
                    r => r,
                }
            }
            Builtin::Hasattr => {
                self.check_arity(name, args, 2, 2)?;
                let found = match self.getattr(args[0], args[1]) {
                    Ok(v) => {
                        self.decref(v);
                        true
                    }
                    Err(_) if self.is_attribute_error() => {
                        self.err_clear();
                        false
                    }
                    Err(e) => return Err(e),
                };
                Ok(self.new_ref(self.bool_obj(found)))
            }
            Builtin::Isinstance => {
                self.check_arity(name, args, 2, 2)?;
                let tys = match self.get(args[1]) {
                    Object::Type(_) => vec![args[1]],
                    Object::Tuple(xs) => xs.clone(),
                    _ => {
                        let te = self.types.type_error;
                        return Err(self.raise_new(
                            te,
                            "isinstance() arg 2 must be a class, type, or tuple of classes and types",
                        ));
                    }
                };
                let r = tys.iter().any(|t| self.is_instance(args[0], *t));
                Ok(self.new_ref(self.bool_obj(r)))
            }
            Builtin::Iter => {
                self.check_arity(name, args, 1, 1)?;
                self.get_iter(args[0])
            }
            Builtin::Len => {
                self.check_arity(name, args, 1, 1)?;
                let n = match self.get(args[0]) {
                    Object::Str(s) => s.chars().count(),
                    Object::Tuple(xs) | Object::List(xs) => xs.len(),
                    Object::Dict(d) => d.len(),
                    _ => {
                        let te = self.types.type_error;
                        let msg = format!(
                            "object of type '{}' has no len()",
                            self.type_name_of_obj(args[0])
                        );
                        return Err(self.raise_new(te, &msg));
                    }
                };
                Ok(self.new_int(n as i64))
            }
            Builtin::Max | Builtin::Min => {
                self.check_arity(name, args, 1, usize::MAX)?;
                let items = if args.len() == 1 {
                    self.collect_iter(args[0])?
                } else {
                    args.iter().map(|a| self.new_ref(*a)).collect()
                };
                let op = if b == Builtin::Max {
                    super::CompareOp::Gt
                } else {
                    super::CompareOp::Lt
                };
                let mut best: Option<ObjId> = None;
                let mut err = None;
                for x in &items {
                    match best {
                        None => best = Some(*x),
                        Some(cur) => match self.compare(op, *x, cur) {
                            Ok(true) => best = Some(*x),
                            Ok(false) => (),
                            Err(e) => {
                                err = Some(e);
                                break;
                            }
                        },
                    }
                }
                let r = match (err, best) {
                    (Some(e), _) => Err(e),
                    (None, Some(v)) => Ok(self.new_ref(v)),
                    (None, None) => {
                        let ve = self.types.value_error;
                        Err(self.raise_new(ve, &format!("{name}() arg is an empty sequence")))
                    }
                };
                for x in items {
                    self.decref(x);
                }
                r
            }
            Builtin::Next => {
                self.check_arity(name, args, 1, 2)?;
                match self.iter_next(args[0])? {
                    Some(v) => Ok(v),
                    None if args.len() == 2 => Ok(self.new_ref(args[1])),
                    None => {
                        let si = self.types.stop_iteration;
                        Err(self.raise_new(si, ""))
                    }
                }
            }
            Builtin::Print => {
                let line = args
                    .iter()
                    .map(|a| self.str_of(*a))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.write_stdout(&line);
                self.write_stdout("\n");
                Ok(self.new_ref(self.none))
            }
            Builtin::Range => {
                self.check_arity(name, args, 1, 3)?;
                let mut bounds = Vec::with_capacity(3);
                for a in args {
                    match self.int_value(*a) {
                        Some(i) => bounds.push(i),
                        None => {
                            let te = self.types.type_error;
                            return Err(
                                self.raise_new(te, "range() integer end argument expected")
                            );
                        }
                    }
                }
                let (start, stop, step) = match bounds[..] {
                    [stop] => (0, stop, 1),
                    [start, stop] => (start, stop, 1),
                    [start, stop, step] => (start, stop, step),
                    _ => unreachable!(),
                };
                if step == 0 {
                    let ve = self.types.value_error;
                    return Err(self.raise_new(ve, "range() step argument must not be zero"));
                }
                let mut items = Vec::new();
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    items.push(self.new_int(i));
                    i += step;
                }
                Ok(self.new_list(items))
            }
            Builtin::Repr => {
                self.check_arity(name, args, 1, 1)?;
                let s = self.repr(args[0]);
                Ok(self.new_str(&s))
            }
            Builtin::ListAppend => {
                self.check_arity(name, args, 2, 2)?;
                self.expect_self(b, args[0], self.types.list)?;
                self.list_append(args[0], args[1]);
                Ok(self.new_ref(self.none))
            }
            Builtin::ListPop => {
                self.check_arity(name, args, 1, 2)?;
                self.expect_self(b, args[0], self.types.list)?;
                let idx = match args.get(1) {
                    Some(i) => match self.int_value(*i) {
                        Some(i) => i,
                        None => {
                            let te = self.types.type_error;
                            return Err(self.raise_new(te, "an integer is required"));
                        }
                    },
                    None => -1,
                };
                let len = match self.get(args[0]) {
                    Object::List(xs) => xs.len() as i64,
                    _ => unreachable!(),
                };
                let ie = self.types.index_error;
                if len == 0 {
                    return Err(self.raise_new(ie, "pop from empty list"));
                }
                let j = if idx < 0 { idx + len } else { idx };
                if j < 0 || j >= len {
                    return Err(self.raise_new(ie, "pop index out of range"));
                }
                match self.get_mut(args[0]) {
                    Object::List(xs) => Ok(xs.remove(j as usize)),
                    _ => unreachable!(),
                }
            }
            Builtin::DictGet => {
                self.check_arity(name, args, 2, 3)?;
                self.expect_self(b, args[0], self.types.dict)?;
                let v = self
                    .dict_get(args[0], args[1])?
                    .or(args.get(2).copied())
                    .unwrap_or(self.none);
                Ok(self.new_ref(v))
            }
            Builtin::DictKeys => {
                self.check_arity(name, args, 1, 1)?;
                self.expect_self(b, args[0], self.types.dict)?;
                let keys = match self.get(args[0]) {
                    Object::Dict(d) => d.entries.values().map(|(k, _)| *k).collect::<Vec<_>>(),
                    _ => unreachable!(),
                };
                for k in &keys {
                    self.incref(*k);
                }
                Ok(self.new_list(keys))
            }
            Builtin::StrJoin => {
                self.check_arity(name, args, 2, 2)?;
                self.expect_self(b, args[0], self.types.str_)?;
                let sep = self.str_of(args[0]);
                let items = self.collect_iter(args[1])?;
                let mut parts = Vec::with_capacity(items.len());
                let mut bad = None;
                for (i, x) in items.iter().enumerate() {
                    match self.get(*x) {
                        Object::Str(s) => parts.push(s.clone()),
                        _ => {
                            bad = Some(format!(
                                "sequence item {i}: expected string, {} found",
                                self.type_name_of_obj(*x)
                            ));
                            break;
                        }
                    }
                }
                for x in items {
                    self.decref(x);
                }
                match bad {
                    Some(msg) => {
                        let te = self.types.type_error;
                        Err(self.raise_new(te, &msg))
                    }
                    None => Ok(self.new_str(&parts.join(&sep))),
                }
            }
            Builtin::StrUpper => {
                self.check_arity(name, args, 1, 1)?;
                self.expect_self(b, args[0], self.types.str_)?;
                let s = self.str_of(args[0]).to_uppercase();
                Ok(self.new_str(&s))
            }
            Builtin::GenSend => {
                self.check_arity(name, args, 2, 2)?;
                self.expect_self(b, args[0], self.types.generator)?;
                match self.gen_send(args[0], args[1])? {
                    Some(v) => Ok(v),
                    None => {
                        let si = self.types.stop_iteration;
                        Err(self.raise_new(si, ""))
                    }
                }
            }
        }
    }

    /// Append `v` (borrowed) to the list `list`.
    pub fn list_append(&mut self, list: ObjId, v: ObjId) {
        self.incref(v);
        match self.get_mut(list) {
            Object::List(xs) => xs.push(v),
            _ => panic!("{list} is not a list"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::assemble;

    fn module(rt: &mut Runtime, src: &str) -> ObjId {
        let code = assemble(rt, src).unwrap();
        let g = rt.new_dict();
        let r = rt.run_code(Rc::new(code), g).unwrap();
        rt.decref(r);
        g
    }

    #[test]
    fn call_with_defaults_and_keywords() {
        let mut rt = Runtime::new();
        let g = module(
            &mut rt,
            "
def f(a, b):
  load_fast a
  load_fast b
  binary_subtract
  return_value
end

load_const 10
make_function f 1
store_name f
load_const None
return_value
",
        );
        let f = rt.dict_get_str(g, "f").unwrap();
        let a = rt.new_int(3);
        let r = rt.call(f, &[a], &[]).unwrap();
        assert_eq!(rt.int_value(r), Some(-7));
        rt.decref(r);
        let k = rt.new_str("a");
        let r = rt.call(f, &[], &[(k, a)]).unwrap();
        assert_eq!(rt.int_value(r), Some(-7));
        rt.decref(r);
        assert!(rt.call(f, &[a, a, a], &[]).is_err());
        let info = rt.err_fetch().unwrap();
        assert_eq!(
            rt.format_exception(&info),
            "TypeError: f() takes at most 2 arguments (3 given)"
        );
        rt.release_exc(info);
        assert!(rt.call(f, &[a], &[(k, a)]).is_err());
        rt.err_clear();
        for o in [a, k, g] {
            rt.decref(o);
        }
    }

    #[test]
    fn raise_forms() {
        let mut rt = Runtime::new();
        let te = rt.types.type_error;
        let msg = rt.new_str("m");
        assert!(rt.do_raise(Some(te), Some(msg), None));
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.format_exception(&info), "TypeError: m");
        // Re-raising an instance.
        assert!(rt.do_raise(Some(info.value), None, None));
        let again = rt.err_fetch().unwrap();
        assert_eq!(again.value, info.value);
        rt.release_exc(again);
        // A bare raise with nothing being handled.
        assert!(rt.do_raise(None, None, None));
        rt.err_clear();
        rt.set_exc_info(info);
        assert!(!rt.do_raise(None, None, None));
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.format_exception(&info), "TypeError: m");
        rt.release_exc(info);
        rt.decref(msg);
    }

    #[test]
    fn handler_delivery() {
        let mut rt = Runtime::new();
        let ke = rt.types.key_error;
        rt.raise_new(ke, "k");
        rt.traceback_here(3);
        let [tb, value, ty] = rt.fetch_for_handler(true);
        assert!(!rt.err_occurred());
        assert_eq!(ty, ke);
        assert_eq!(rt.traceback_lines(Some(tb)), vec![3]);
        assert_eq!(rt.finally_disposition(ty), FinallyDisposition::Exception);
        rt.err_restore(ty, value, tb);
        let info = rt.err_fetch().unwrap();
        assert_eq!(rt.format_exception(&info), "KeyError: k");
        rt.release_exc(info);
    }

    #[test]
    fn builtins() {
        let mut rt = Runtime::new();
        let b = rt.builtins();
        let range = rt.dict_get_str(b, "range").unwrap();
        let n = rt.new_int(4);
        let l = rt.call(range, &[n], &[]).unwrap();
        assert_eq!(rt.repr(l), "[0, 1, 2, 3]");
        let max = rt.dict_get_str(b, "max").unwrap();
        let m = rt.call(max, &[l], &[]).unwrap();
        assert_eq!(rt.int_value(m), Some(3));
        let pop = rt.getattr_str(l, "pop").unwrap();
        let p = rt.call(pop, &[], &[]).unwrap();
        assert_eq!(rt.repr(l), "[0, 1, 2]");
        let print = rt.dict_get_str(b, "print").unwrap();
        let r = rt.call(print, &[l, p], &[]).unwrap();
        assert_eq!(rt.take_stdout(), "[0, 1, 2] 3\n");
        for o in [n, l, m, pop, p, r] {
            rt.decref(o);
        }
    }

    #[test]
    fn user_exception_class() {
        let mut rt = Runtime::new();
        let exc = rt.types.exception;
        let c = rt.new_class("Oops", Some(exc), &[], false);
        let a = rt.new_int(1);
        let e = rt.call(c, &[a], &[]).unwrap();
        assert_eq!(rt.repr(e), "Oops(1,)");
        assert!(rt.exception_matches(e, exc));
        for o in [a, e, c] {
            rt.decref(o);
        }
    }
}
